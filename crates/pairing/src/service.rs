use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use canbridge_remp::is_valid_pin;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::PairingError;
use crate::clock::{Clock, add};
use crate::link::{DeviceReply, PairingLink};
use crate::store::{PairingStore, SecretStore};
use crate::types::{
    AuditAction, AuditEntry, DongleRecord, HoldReason, Ownership, PairingSession, SecurityHold,
    SessionStatus,
};

/// Secret length in random bytes.
const SECRET_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 16;

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub session_ttl: Duration,
    pub max_attempts: u8,
    pub lockout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(120),
            max_attempts: 5,
            lockout: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Pairing mode is armed; the user may submit the PIN.
    Armed(PairingSession),
    /// Pairing is locked for this dongle. `session` is set when this start
    /// created the hold.
    Held {
        hold: SecurityHold,
        session: Option<PairingSession>,
    },
    /// The device refused; the session is terminal.
    Failed(PairingSession),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Paired(PairingSession),
    InvalidPin { attempts_remaining: u8 },
    Hold {
        hold: SecurityHold,
        attempts_remaining: u8,
    },
    Expired(PairingSession),
    Failed(PairingSession),
}

/// Drives pairing sessions against the collaborators it is given.
pub struct PairingService {
    link: Arc<dyn PairingLink>,
    store: Arc<dyn PairingStore>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    config: PairingConfig,
    /// Serializes operations per dongle so attempt counting cannot race.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PairingService {
    pub fn new(
        link: Arc<dyn PairingLink>,
        store: Arc<dyn PairingStore>,
        secrets: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
        config: PairingConfig,
    ) -> Self {
        Self {
            link,
            store,
            secrets,
            clock,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn dongle_lock(&self, dongle_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dongle_id.to_string())
            .or_default()
            .clone()
    }

    /// Opens a session and asks the device to arm pairing mode.
    pub async fn start(&self, dongle_id: &str, user_id: &str) -> Result<StartOutcome, PairingError> {
        let lock = self.dongle_lock(dongle_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let record = self
            .store
            .get_dongle(dongle_id)
            .await?
            .ok_or_else(|| PairingError::UnknownDongle(dongle_id.to_string()))?;
        if let Some(hold) = self.live_hold(dongle_id, now).await? {
            return Ok(StartOutcome::Held {
                hold,
                session: None,
            });
        }
        if let Some(owner) = &record.owner_user_id
            && owner != user_id
        {
            return Err(PairingError::AlreadyOwned(dongle_id.to_string()));
        }

        let mut session = PairingSession {
            id: Uuid::new_v4(),
            dongle_id: dongle_id.to_string(),
            user_id: user_id.to_string(),
            status: SessionStatus::Active,
            attempts: 0,
            pairing_nonce: None,
            created_at: now,
            expires_at: add(now, self.config.session_ttl),
            hold_until: None,
            hold_reason: None,
            failure: None,
        };
        self.store.save_session(session.clone()).await?;
        self.audit(
            now,
            AuditAction::PairingStarted,
            dongle_id,
            Some(user_id),
            format!("session {}", session.id),
        )
        .await?;

        let reply = match self.link.start(dongle_id).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(dongle = dongle_id, error = %e, "pairing start: agent unreachable");
                self.fail(&mut session, now, format!("agent unreachable: {e}"))
                    .await?;
                return Err(PairingError::AgentUnreachable(e.0));
            }
        };

        match reply {
            DeviceReply::Ok { seconds, nonce } => {
                let Ok(nonce) = <[u8; NONCE_LENGTH]>::try_from(nonce.as_slice()) else {
                    self.fail(
                        &mut session,
                        now,
                        format!("device returned a {}-byte nonce", nonce.len()),
                    )
                    .await?;
                    return Ok(StartOutcome::Failed(session));
                };
                session.pairing_nonce = Some(nonce);
                if seconds > 0 {
                    let device_expiry = add(now, Duration::from_secs(seconds.into()));
                    session.expires_at = session.expires_at.min(device_expiry);
                }
                self.store.save_session(session.clone()).await?;
                info!(dongle = dongle_id, session = %session.id, "pairing armed");
                Ok(StartOutcome::Armed(session))
            }
            DeviceReply::Cooldown { seconds } => {
                let hold = self
                    .place_hold(
                        &mut session,
                        record,
                        now,
                        Duration::from_secs(seconds.into()),
                        HoldReason::DeviceCooldown,
                    )
                    .await?;
                Ok(StartOutcome::Held {
                    hold,
                    session: Some(session),
                })
            }
            DeviceReply::Expired => {
                self.fail(&mut session, now, "device reported expired".into())
                    .await?;
                Ok(StartOutcome::Failed(session))
            }
            DeviceReply::InvalidPin => {
                self.fail(&mut session, now, "unexpected invalid_pin on start".into())
                    .await?;
                Ok(StartOutcome::Failed(session))
            }
            DeviceReply::Rejected(status) => {
                self.fail(&mut session, now, format!("device refused: {status}"))
                    .await?;
                Ok(StartOutcome::Failed(session))
            }
        }
    }

    /// Forwards a PIN for an active session to the device.
    pub async fn submit(
        &self,
        session_id: Uuid,
        user_id: &str,
        pin: &str,
    ) -> Result<SubmitOutcome, PairingError> {
        if !is_valid_pin(pin) {
            return Err(PairingError::MalformedPin);
        }

        let dongle_id = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(PairingError::SessionNotFound(session_id))?
            .dongle_id;
        let lock = self.dongle_lock(&dongle_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        // Re-read under the lock: a concurrent submit may have moved it on.
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(PairingError::SessionNotFound(session_id))?;
        if session.user_id != user_id {
            return Err(PairingError::NotSessionOwner);
        }
        if self.expire_if_due(&mut session, now).await? {
            return Ok(SubmitOutcome::Expired(session));
        }
        if session.status != SessionStatus::Active {
            return Err(PairingError::SessionNotActive(session.status));
        }
        if let Some(hold) = self.live_hold(&dongle_id, now).await? {
            session.status = SessionStatus::Hold;
            session.hold_until = Some(hold.until);
            session.hold_reason = Some(hold.reason);
            self.store.save_session(session.clone()).await?;
            return Ok(SubmitOutcome::Hold {
                hold,
                attempts_remaining: self.remaining(&session),
            });
        }
        let nonce = session.pairing_nonce.ok_or(PairingError::NotArmed)?;

        let mut secret = vec![0u8; SECRET_LENGTH];
        rand::thread_rng().fill_bytes(&mut secret);

        let reply = self
            .link
            .submit(&dongle_id, pin, nonce, &secret)
            .await
            .map_err(|e| {
                warn!(dongle = %dongle_id, error = %e, "pairing submit: agent unreachable");
                PairingError::AgentUnreachable(e.0)
            })?;

        match reply {
            DeviceReply::Ok { .. } => {
                self.secrets.put_secret(&dongle_id, secret).await?;
                let mut record = self
                    .store
                    .get_dongle(&dongle_id)
                    .await?
                    .unwrap_or_else(|| DongleRecord::unclaimed(&dongle_id, None));
                record.owner_user_id = Some(user_id.to_string());
                record.ownership = Ownership::Owned;
                self.store.save_dongle(record).await?;

                session.status = SessionStatus::Success;
                self.store.save_session(session.clone()).await?;
                self.audit(
                    now,
                    AuditAction::PairingSucceeded,
                    &dongle_id,
                    Some(user_id),
                    format!("session {}", session.id),
                )
                .await?;
                info!(dongle = %dongle_id, user = user_id, "dongle paired");
                Ok(SubmitOutcome::Paired(session))
            }
            DeviceReply::InvalidPin => {
                session.attempts = session.attempts.saturating_add(1);
                if session.attempts >= self.config.max_attempts {
                    let record = self.record_or_default(&dongle_id).await?;
                    let hold = self
                        .place_hold(
                            &mut session,
                            record,
                            now,
                            self.config.lockout,
                            HoldReason::TooManyAttempts,
                        )
                        .await?;
                    return Ok(SubmitOutcome::Hold {
                        hold,
                        attempts_remaining: 0,
                    });
                }
                self.store.save_session(session.clone()).await?;
                Ok(SubmitOutcome::InvalidPin {
                    attempts_remaining: self.remaining(&session),
                })
            }
            DeviceReply::Cooldown { seconds } => {
                let record = self.record_or_default(&dongle_id).await?;
                let hold = self
                    .place_hold(
                        &mut session,
                        record,
                        now,
                        Duration::from_secs(seconds.into()),
                        HoldReason::DeviceCooldown,
                    )
                    .await?;
                Ok(SubmitOutcome::Hold {
                    hold,
                    attempts_remaining: self.remaining(&session),
                })
            }
            DeviceReply::Expired => {
                session.status = SessionStatus::Expired;
                self.store.save_session(session.clone()).await?;
                Ok(SubmitOutcome::Expired(session))
            }
            DeviceReply::Rejected(status) => {
                self.fail(&mut session, now, format!("device refused: {status}"))
                    .await?;
                Ok(SubmitOutcome::Failed(session))
            }
        }
    }

    /// Returns a session, flipping it to expired if its TTL has passed.
    pub async fn session(&self, session_id: Uuid) -> Result<Option<PairingSession>, PairingError> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        self.expire_if_due(&mut session, self.clock.now()).await?;
        Ok(Some(session))
    }

    /// The dongle's hold, if one is still in force.
    pub async fn active_hold(&self, dongle_id: &str) -> Result<Option<SecurityHold>, PairingError> {
        let lock = self.dongle_lock(dongle_id);
        let _guard = lock.lock().await;
        self.live_hold(dongle_id, self.clock.now()).await
    }

    /// Lifts a hold on operator request. Returns whether one was in force.
    pub async fn clear_hold(&self, dongle_id: &str, operator_id: &str) -> Result<bool, PairingError> {
        let lock = self.dongle_lock(dongle_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let Some(hold) = self.live_hold(dongle_id, now).await? else {
            return Ok(false);
        };
        self.lift_hold(dongle_id).await?;
        self.audit(
            now,
            AuditAction::HoldCleared,
            dongle_id,
            Some(operator_id),
            format!("{:?} hold until {} cleared by operator", hold.reason, hold.until),
        )
        .await?;
        info!(dongle = dongle_id, operator = operator_id, "security hold cleared");
        Ok(true)
    }

    fn remaining(&self, session: &PairingSession) -> u8 {
        self.config.max_attempts.saturating_sub(session.attempts)
    }

    async fn record_or_default(&self, dongle_id: &str) -> Result<DongleRecord, PairingError> {
        Ok(self
            .store
            .get_dongle(dongle_id)
            .await?
            .unwrap_or_else(|| DongleRecord::unclaimed(dongle_id, None)))
    }

    /// Loads the hold for a dongle, removing it if it has run out.
    async fn live_hold(
        &self,
        dongle_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SecurityHold>, PairingError> {
        match self.store.get_hold(dongle_id).await? {
            Some(hold) if hold.is_active(now) => Ok(Some(hold)),
            Some(_) => {
                self.lift_hold(dongle_id).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn lift_hold(&self, dongle_id: &str) -> Result<(), PairingError> {
        self.store.remove_hold(dongle_id).await?;
        if let Some(mut record) = self.store.get_dongle(dongle_id).await?
            && record.ownership == Ownership::Held
        {
            record.ownership = record.settled_ownership();
            self.store.save_dongle(record).await?;
        }
        Ok(())
    }

    async fn place_hold(
        &self,
        session: &mut PairingSession,
        mut record: DongleRecord,
        now: DateTime<Utc>,
        window: Duration,
        reason: HoldReason,
    ) -> Result<SecurityHold, PairingError> {
        let hold = SecurityHold {
            dongle_id: session.dongle_id.clone(),
            until: add(now, window),
            reason,
            session_id: Some(session.id),
        };
        self.store.put_hold(hold.clone()).await?;

        record.ownership = Ownership::Held;
        self.store.save_dongle(record).await?;

        session.status = SessionStatus::Hold;
        session.hold_until = Some(hold.until);
        session.hold_reason = Some(reason);
        self.store.save_session(session.clone()).await?;

        self.audit(
            now,
            AuditAction::HoldPlaced,
            &session.dongle_id,
            Some(&session.user_id),
            format!("{reason:?} until {}", hold.until),
        )
        .await?;
        warn!(dongle = %session.dongle_id, ?reason, until = %hold.until, "security hold placed");
        Ok(hold)
    }

    async fn fail(
        &self,
        session: &mut PairingSession,
        now: DateTime<Utc>,
        reason: String,
    ) -> Result<(), PairingError> {
        session.status = SessionStatus::Failed;
        session.failure = Some(reason.clone());
        self.store.save_session(session.clone()).await?;
        self.audit(
            now,
            AuditAction::PairingFailed,
            &session.dongle_id,
            Some(&session.user_id),
            reason,
        )
        .await
    }

    async fn expire_if_due(
        &self,
        session: &mut PairingSession,
        now: DateTime<Utc>,
    ) -> Result<bool, PairingError> {
        if session.status == SessionStatus::Active && session.is_expired(now) {
            session.status = SessionStatus::Expired;
            self.store.save_session(session.clone()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn audit(
        &self,
        at: DateTime<Utc>,
        action: AuditAction,
        dongle_id: &str,
        actor: Option<&str>,
        detail: String,
    ) -> Result<(), PairingError> {
        self.store
            .append_audit(AuditEntry {
                at,
                action,
                dongle_id: dongle_id.to_string(),
                actor: actor.map(str::to_string),
                detail,
            })
            .await?;
        Ok(())
    }
}
