//! Which agent serves which dongle.
//!
//! Assignments come from configuration at startup and from agent sighting
//! reports afterwards. Every change is pushed to the relay engine and the
//! dongle records pairing works from.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use canbridge_pairing::{DongleRecord, MemoryStore};
use canbridge_relay::RelayEngine;
use tracing::info;

pub struct DongleDirectory {
    agents: RwLock<HashMap<String, String>>,
    relay: Arc<RelayEngine>,
    store: Arc<MemoryStore>,
}

impl DongleDirectory {
    pub fn new(relay: Arc<RelayEngine>, store: Arc<MemoryStore>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            relay,
            store,
        }
    }

    /// Records that `agent_id` serves `dongle_id`. Returns `false` when that
    /// was already known.
    pub fn assign(&self, dongle_id: &str, agent_id: &str) -> bool {
        let dongle_id = dongle_id.trim().to_ascii_lowercase();
        let previous = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dongle_id.clone(), agent_id.to_string());
        if previous.as_deref() == Some(agent_id) {
            return false;
        }
        match previous {
            Some(prev) => info!(dongle = %dongle_id, from = %prev, to = agent_id, "dongle moved"),
            None => info!(dongle = %dongle_id, agent = agent_id, "dongle assigned"),
        }

        let record = match self.store.dongle(&dongle_id) {
            Some(mut rec) => {
                rec.agent_id = Some(agent_id.to_string());
                rec
            }
            None => DongleRecord::unclaimed(dongle_id.clone(), Some(agent_id.to_string())),
        };
        self.store.upsert_dongle(record);
        self.relay.assign_dongle(&dongle_id, agent_id);
        true
    }

    pub fn agent_for(&self, dongle_id: &str) -> Option<String> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dongle_id.trim().to_ascii_lowercase())
            .cloned()
    }

    /// Sorted `(dongle, agent)` pairs.
    pub fn assignments(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(d, a)| (d.clone(), a.clone()))
            .collect();
        all.sort();
        all
    }
}
