use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Success,
    Failed,
    Expired,
    Hold,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSession {
    pub id: Uuid,
    pub dongle_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub attempts: u8,
    #[serde(skip)]
    pub pairing_nonce: Option<[u8; 16]>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<HoldReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl PairingSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    TooManyAttempts,
    DeviceCooldown,
}

/// Temporary lockout of pairing on one dongle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHold {
    pub dongle_id: String,
    pub until: DateTime<Utc>,
    pub reason: HoldReason,
    /// Session that caused the hold, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl SecurityHold {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Unclaimed,
    Owned,
    Held,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DongleRecord {
    pub dongle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    pub ownership: Ownership,
}

impl DongleRecord {
    pub fn unclaimed(dongle_id: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            dongle_id: dongle_id.into(),
            agent_id,
            owner_user_id: None,
            ownership: Ownership::Unclaimed,
        }
    }

    /// Ownership to fall back to once a hold is lifted.
    pub fn settled_ownership(&self) -> Ownership {
        if self.owner_user_id.is_some() {
            Ownership::Owned
        } else {
            Ownership::Unclaimed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    PairingStarted,
    PairingSucceeded,
    PairingFailed,
    HoldPlaced,
    HoldCleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub dongle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Hold.is_terminal());
        assert!(SessionStatus::Success.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }

    #[test]
    fn settled_ownership_follows_owner() {
        let mut rec = DongleRecord::unclaimed("d1", None);
        rec.ownership = Ownership::Held;
        assert_eq!(rec.settled_ownership(), Ownership::Unclaimed);
        rec.owner_user_id = Some("u1".into());
        assert_eq!(rec.settled_ownership(), Ownership::Owned);
    }

    #[test]
    fn hold_serializes_reason() {
        let hold = SecurityHold {
            dongle_id: "d1".into(),
            until: DateTime::from_timestamp(0, 0).unwrap(),
            reason: HoldReason::TooManyAttempts,
            session_id: None,
        };
        let json = serde_json::to_value(&hold).unwrap();
        assert_eq!(json["reason"], "too_many_attempts");
        assert!(json.get("session_id").is_none());
    }
}
