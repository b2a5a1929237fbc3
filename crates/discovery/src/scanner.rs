use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use canbridge_remp::{DeviceId, device_id_hex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::DiscoveryError;
use crate::codec::{AnnouncePayload, Packet, PacketType};
use crate::net::broadcast_targets;

/// UDP port dongles listen on for DISCOVER broadcasts.
pub const DEFAULT_PORT: u16 = 48_100;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub bind_addr: SocketAddr,
    pub port: u16,
    /// Broadcast destinations; empty means every local interface.
    pub targets: Vec<Ipv4Addr>,
    pub interval: Duration,
    pub stale_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            port: DEFAULT_PORT,
            targets: Vec::new(),
            interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(30),
        }
    }
}

/// A dongle seen on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub device_id: DeviceId,
    pub source: SocketAddr,
    pub announce: AnnouncePayload,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl Sighting {
    /// Where REMP traffic for this dongle should go: the announced LAN IP and
    /// UDP port, each falling back to the datagram source.
    pub fn endpoint(&self) -> SocketAddr {
        let ip = self
            .announce
            .lan_ip
            .map(IpAddr::V4)
            .unwrap_or_else(|| self.source.ip());
        let port = self.announce.udp_port.unwrap_or(self.source.port());
        SocketAddr::new(ip, port)
    }

    pub fn device_hex(&self) -> String {
        device_id_hex(&self.device_id)
    }

    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub event_type: EventType,
    pub sighting: Sighting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Discovered,
    Updated,
    Lost,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Discovered => write!(f, "discovered"),
            EventType::Updated => write!(f, "updated"),
            EventType::Lost => write!(f, "lost"),
        }
    }
}

/// Broadcasts DISCOVER probes and tracks the dongles that answer.
pub struct Scanner {
    socket: UdpSocket,
    config: ScannerConfig,
    sightings: RwLock<HashMap<DeviceId, Sighting>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    seq: AtomicU32,
}

impl Scanner {
    pub async fn bind(config: ScannerConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.set_broadcast(true)?;
        let (tx, rx) = mpsc::channel(64);
        Ok(Self {
            socket,
            config,
            sightings: RwLock::new(HashMap::new()),
            events_tx: tx,
            events_rx: Some(rx),
            seq: AtomicU32::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.events_rx.take()
    }

    /// Sends one DISCOVER to every configured target.
    pub async fn probe(&self) -> Result<(), DiscoveryError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let bytes = Packet::discover(seq).encode()?;
        let targets = if self.config.targets.is_empty() {
            broadcast_targets()
        } else {
            self.config.targets.clone()
        };
        for ip in targets {
            let dest = SocketAddr::from((ip, self.config.port));
            if let Err(e) = self.socket.send_to(&bytes, dest).await {
                debug!(%dest, error = %e, "discover send failed");
            }
        }
        Ok(())
    }

    /// Runs probe, receive and prune loops until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut probe_ticker = tokio::time::interval(self.config.interval);
        let prune_every = (self.config.stale_timeout / 2).max(Duration::from_secs(1));
        let mut prune_ticker = tokio::time::interval(prune_every);
        prune_ticker.tick().await;
        let mut buf = vec![0u8; 1500];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = probe_ticker.tick() => {
                    if let Err(e) = self.probe().await {
                        warn!(error = %e, "discovery probe failed");
                    }
                }
                _ = prune_ticker.tick() => self.prune_stale(Instant::now()),
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => {
                        self.handle_datagram(&buf[..n], from, Instant::now());
                    }
                    Err(e) => warn!(error = %e, "discovery socket error"),
                },
            }
        }
    }

    /// Decodes one datagram and updates the sighting table.
    ///
    /// Returns the emitted event, if the datagram was a new or changed ANNOUNCE.
    pub fn handle_datagram(
        &self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<DiscoveryEvent> {
        let packet = match Packet::decode(buf) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed discovery datagram");
                return None;
            }
        };
        if packet.packet_type != PacketType::Announce {
            return None;
        }
        let Some(device_id) = packet.announce.device_id else {
            debug!(%from, "announce without device id");
            return None;
        };

        let mut sightings = self.sightings.write().unwrap_or_else(PoisonError::into_inner);
        let event = match sightings.get_mut(&device_id) {
            Some(existing) => {
                existing.last_seen = now;
                if existing.source == from && existing.announce == packet.announce {
                    return None;
                }
                existing.source = from;
                existing.announce = packet.announce;
                DiscoveryEvent {
                    event_type: EventType::Updated,
                    sighting: existing.clone(),
                }
            }
            None => {
                let sighting = Sighting {
                    device_id,
                    source: from,
                    announce: packet.announce,
                    first_seen: now,
                    last_seen: now,
                };
                info!(device = %sighting.device_hex(), endpoint = %sighting.endpoint(), "dongle discovered");
                sightings.insert(device_id, sighting.clone());
                DiscoveryEvent {
                    event_type: EventType::Discovered,
                    sighting,
                }
            }
        };
        drop(sightings);

        let _ = self.events_tx.try_send(event.clone());
        Some(event)
    }

    /// Removes dongles that haven't announced within the stale timeout.
    pub fn prune_stale(&self, now: Instant) {
        let mut sightings = self.sightings.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<DeviceId> = sightings
            .iter()
            .filter(|(_, s)| s.is_stale(self.config.stale_timeout, now))
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            if let Some(sighting) = sightings.remove(&id) {
                info!(device = %sighting.device_hex(), "dongle lost");
                let _ = self.events_tx.try_send(DiscoveryEvent {
                    event_type: EventType::Lost,
                    sighting,
                });
            }
        }
    }

    pub fn sightings(&self) -> Vec<Sighting> {
        self.sightings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<Sighting> {
        self.sightings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::PairingState;

    const DEV: DeviceId = [1, 2, 3, 4, 5, 6, 7, 8];

    fn announce(port: u16) -> AnnouncePayload {
        AnnouncePayload {
            device_id: Some(DEV),
            udp_port: Some(port),
            lan_ip: Some(Ipv4Addr::new(10, 0, 0, 9)),
            pairing_state: Some(PairingState::Unpaired),
            ..Default::default()
        }
    }

    async fn scanner(targets: Vec<Ipv4Addr>, port: u16) -> Scanner {
        Scanner::bind(ScannerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            port,
            targets,
            interval: Duration::from_millis(50),
            stale_timeout: Duration::from_secs(10),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn discovered_then_updated_then_silent() {
        let mut s = scanner(vec![Ipv4Addr::LOCALHOST], 1).await;
        let mut events = s.take_events().unwrap();
        let from: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let now = Instant::now();

        let bytes = Packet::announce(1, announce(9000)).encode().unwrap();
        let ev = s.handle_datagram(&bytes, from, now).unwrap();
        assert_eq!(ev.event_type, EventType::Discovered);
        assert_eq!(ev.sighting.endpoint(), "10.0.0.9:9000".parse().unwrap());
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Discovered);

        // Same announce only refreshes last_seen.
        let later = now + Duration::from_secs(1);
        assert!(s.handle_datagram(&bytes, from, later).is_none());
        assert_eq!(s.get(&DEV).unwrap().last_seen, later);

        let bytes = Packet::announce(2, announce(9001)).encode().unwrap();
        let ev = s.handle_datagram(&bytes, from, later).unwrap();
        assert_eq!(ev.event_type, EventType::Updated);
        assert_eq!(ev.sighting.first_seen, now);
        assert_eq!(s.sightings().len(), 1);
    }

    #[tokio::test]
    async fn ignores_garbage_discover_and_anonymous() {
        let s = scanner(vec![], 1).await;
        let from: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let now = Instant::now();

        assert!(s.handle_datagram(b"nope", from, now).is_none());
        let discover = Packet::discover(0).encode().unwrap();
        assert!(s.handle_datagram(&discover, from, now).is_none());
        let anonymous = Packet::announce(0, AnnouncePayload::default())
            .encode()
            .unwrap();
        assert!(s.handle_datagram(&anonymous, from, now).is_none());
        assert!(s.sightings().is_empty());
    }

    #[tokio::test]
    async fn prune_emits_lost() {
        let mut s = scanner(vec![], 1).await;
        let mut events = s.take_events().unwrap();
        let from: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let now = Instant::now();
        let bytes = Packet::announce(1, announce(9000)).encode().unwrap();
        s.handle_datagram(&bytes, from, now);
        events.recv().await.unwrap();

        s.prune_stale(now + Duration::from_secs(5));
        assert_eq!(s.sightings().len(), 1);

        s.prune_stale(now + Duration::from_secs(11));
        assert!(s.sightings().is_empty());
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.event_type, EventType::Lost);
        assert_eq!(ev.sighting.device_id, DEV);
    }

    #[test]
    fn endpoint_falls_back_to_source() {
        let now = Instant::now();
        let sighting = Sighting {
            device_id: DEV,
            source: "192.168.0.4:7000".parse().unwrap(),
            announce: AnnouncePayload {
                device_id: Some(DEV),
                ..Default::default()
            },
            first_seen: now,
            last_seen: now,
        };
        assert_eq!(sighting.endpoint(), "192.168.0.4:7000".parse().unwrap());
        assert_eq!(sighting.device_hex(), "0102030405060708");
    }

    #[tokio::test]
    async fn run_probes_and_collects_announce() {
        let dongle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dongle_port = dongle.local_addr().unwrap().port();

        let mut s = scanner(vec![Ipv4Addr::LOCALHOST], dongle_port).await;
        let mut events = s.take_events().unwrap();
        let s = Arc::new(s);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let s = s.clone();
            let cancel = cancel.clone();
            async move { s.run(cancel).await }
        });

        let mut buf = [0u8; 256];
        let (n, from) = dongle.recv_from(&mut buf).await.unwrap();
        let probe = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(probe.packet_type, PacketType::Discover);

        let reply = Packet::announce(probe.seq, announce(dongle_port))
            .encode()
            .unwrap();
        dongle.send_to(&reply, from).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.event_type, EventType::Discovered);
        assert_eq!(ev.sighting.device_id, DEV);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn event_type_display() {
        assert_eq!(EventType::Discovered.to_string(), "discovered");
        assert_eq!(EventType::Updated.to_string(), "updated");
        assert_eq!(EventType::Lost.to_string(), "lost");
    }
}
