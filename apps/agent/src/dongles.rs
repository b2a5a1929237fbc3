//! Dongles this agent currently serves, as seen by the discovery scanner.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use canbridge_discovery::{DiscoveryEvent, EventType, Sighting};
use canbridge_protocol::messages::{DongleLostReport, DongleSightingReport};
use canbridge_protocol::{ControlMessage, MessageType};
use canbridge_remp::device_id_hex;
use canbridge_transport::{DongleClient, DongleTransport};
use tracing::{debug, info};

struct Entry {
    sighting: Sighting,
    client: DongleClient,
}

pub struct DongleRegistry {
    transport: Arc<DongleTransport>,
    request_timeout: Duration,
    dongles: RwLock<HashMap<String, Entry>>,
    /// Header tokens learned from successful pairings. Kept across
    /// rediscovery.
    tokens: RwLock<HashMap<String, Vec<u8>>>,
}

impl DongleRegistry {
    pub fn new(transport: Arc<DongleTransport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
            dongles: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn make_client(&self, sighting: &Sighting) -> DongleClient {
        let id = sighting.device_hex();
        let token = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default();
        DongleClient::new(
            Arc::clone(&self.transport),
            sighting.device_id,
            sighting.endpoint(),
        )
        .with_token(token)
        .with_timeout(self.request_timeout)
    }

    /// Applies a scanner event. Returns the report to send upstream, if the
    /// backend's view changes.
    pub fn apply(&self, event: &DiscoveryEvent) -> Option<ControlMessage> {
        let sighting = &event.sighting;
        let id = sighting.device_hex();
        let mut dongles = self.dongles.write().unwrap_or_else(PoisonError::into_inner);

        match event.event_type {
            EventType::Discovered | EventType::Updated => {
                let changed = dongles.get(&id).is_none_or(|e| {
                    e.client.addr() != sighting.endpoint()
                        || e.sighting.announce.pairing_state != sighting.announce.pairing_state
                });
                let client = self.make_client(sighting);
                dongles.insert(
                    id.clone(),
                    Entry {
                        sighting: sighting.clone(),
                        client,
                    },
                );
                if !changed {
                    return None;
                }
                debug!(dongle = %id, endpoint = %sighting.endpoint(), "reporting sighting");
                ControlMessage::new(MessageType::DongleSighting, Some(&report(sighting))).ok()
            }
            EventType::Lost => {
                dongles.remove(&id)?;
                info!(dongle = %id, "dongle lost");
                ControlMessage::new(
                    MessageType::DongleLost,
                    Some(&DongleLostReport { dongle_id: id }),
                )
                .ok()
            }
        }
    }

    /// Client for a dongle by hex id, if it is currently visible.
    pub fn client(&self, dongle_id: &str) -> Option<DongleClient> {
        self.dongles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dongle_id.trim().to_ascii_lowercase())
            .map(|e| e.client.clone())
    }

    /// Remembers the header token for a dongle and applies it to its client.
    pub fn set_token(&self, dongle_id: &str, token: Vec<u8>) {
        let id = dongle_id.trim().to_ascii_lowercase();
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), token.clone());
        if let Some(entry) = self
            .dongles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            entry.client = entry.client.clone().with_token(token);
        }
    }

    /// Sorted ids of every visible dongle.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dongles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Sighting reports for every visible dongle, for resync after reconnect.
    pub fn reports(&self) -> Vec<DongleSightingReport> {
        let mut reports: Vec<DongleSightingReport> = self
            .dongles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| report(&e.sighting))
            .collect();
        reports.sort_by(|a, b| a.dongle_id.cmp(&b.dongle_id));
        reports
    }
}

fn report(s: &Sighting) -> DongleSightingReport {
    DongleSightingReport {
        dongle_id: device_id_hex(&s.device_id),
        address: s.endpoint().to_string(),
        fw_build: s.announce.fw_build,
        capabilities: s.announce.capabilities,
        proto_ver: s.announce.proto_ver,
        lan_ip: s.announce.lan_ip,
        pairing_state: s.announce.pairing_state,
    }
}
