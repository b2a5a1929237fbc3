use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::types::{AuditEntry, DongleRecord, PairingSession, SecurityHold};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(String),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence for pairing sessions, dongle ownership, holds and the audit log.
pub trait PairingStore: Send + Sync {
    fn get_session(&self, id: Uuid) -> StoreFuture<'_, Option<PairingSession>>;
    fn save_session(&self, session: PairingSession) -> StoreFuture<'_, ()>;

    fn get_dongle<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, Option<DongleRecord>>;
    fn save_dongle(&self, record: DongleRecord) -> StoreFuture<'_, ()>;

    fn get_hold<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, Option<SecurityHold>>;
    fn put_hold(&self, hold: SecurityHold) -> StoreFuture<'_, ()>;
    fn remove_hold<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, ()>;

    fn append_audit(&self, entry: AuditEntry) -> StoreFuture<'_, ()>;
}

/// Encrypted-at-rest storage for device-scoped secrets.
pub trait SecretStore: Send + Sync {
    fn put_secret<'a>(&'a self, dongle_id: &'a str, secret: Vec<u8>) -> StoreFuture<'a, ()>;
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, PairingSession>,
    dongles: HashMap<String, DongleRecord>,
    holds: HashMap<String, SecurityHold>,
    audit: Vec<AuditEntry>,
    secrets: HashMap<String, Vec<u8>>,
}

/// Process-local store, used when no external database is configured.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sessions_for(&self, dongle_id: &str) -> Vec<PairingSession> {
        let mut out: Vec<_> = self
            .tables()
            .sessions
            .values()
            .filter(|s| s.dongle_id == dongle_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn dongle(&self, dongle_id: &str) -> Option<DongleRecord> {
        self.tables().dongles.get(dongle_id).cloned()
    }

    pub fn secret(&self, dongle_id: &str) -> Option<Vec<u8>> {
        self.tables().secrets.get(dongle_id).cloned()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.tables().audit.clone()
    }

    /// Inserts or replaces a dongle record synchronously.
    pub fn upsert_dongle(&self, record: DongleRecord) {
        self.tables()
            .dongles
            .insert(record.dongle_id.clone(), record);
    }
}

impl PairingStore for MemoryStore {
    fn get_session(&self, id: Uuid) -> StoreFuture<'_, Option<PairingSession>> {
        let found = self.tables().sessions.get(&id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save_session(&self, session: PairingSession) -> StoreFuture<'_, ()> {
        self.tables().sessions.insert(session.id, session);
        Box::pin(async { Ok(()) })
    }

    fn get_dongle<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, Option<DongleRecord>> {
        let found = self.tables().dongles.get(dongle_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save_dongle(&self, record: DongleRecord) -> StoreFuture<'_, ()> {
        self.upsert_dongle(record);
        Box::pin(async { Ok(()) })
    }

    fn get_hold<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, Option<SecurityHold>> {
        let found = self.tables().holds.get(dongle_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn put_hold(&self, hold: SecurityHold) -> StoreFuture<'_, ()> {
        self.tables().holds.insert(hold.dongle_id.clone(), hold);
        Box::pin(async { Ok(()) })
    }

    fn remove_hold<'a>(&'a self, dongle_id: &'a str) -> StoreFuture<'a, ()> {
        self.tables().holds.remove(dongle_id);
        Box::pin(async { Ok(()) })
    }

    fn append_audit(&self, entry: AuditEntry) -> StoreFuture<'_, ()> {
        self.tables().audit.push(entry);
        Box::pin(async { Ok(()) })
    }
}

impl SecretStore for MemoryStore {
    fn put_secret<'a>(&'a self, dongle_id: &'a str, secret: Vec<u8>) -> StoreFuture<'a, ()> {
        self.tables().secrets.insert(dongle_id.to_string(), secret);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{HoldReason, Ownership};

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let store = MemoryStore::new();
        store.upsert_dongle(DongleRecord::unclaimed("d1", Some("a1".into())));
        let rec = store.get_dongle("d1").await.unwrap().unwrap();
        assert_eq!(rec.ownership, Ownership::Unclaimed);
        assert_eq!(rec.agent_id.as_deref(), Some("a1"));

        let hold = SecurityHold {
            dongle_id: "d1".into(),
            until: Utc::now(),
            reason: HoldReason::DeviceCooldown,
            session_id: None,
        };
        store.put_hold(hold.clone()).await.unwrap();
        assert_eq!(store.get_hold("d1").await.unwrap(), Some(hold));
        store.remove_hold("d1").await.unwrap();
        assert_eq!(store.get_hold("d1").await.unwrap(), None);

        store.put_secret("d1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.secret("d1"), Some(vec![1, 2, 3]));
    }
}
