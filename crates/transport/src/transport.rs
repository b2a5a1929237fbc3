use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use canbridge_remp::{CanFrame, DeviceId, MessageType, RempMessage, device_id_hex};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::TransportError;

/// Largest datagram we expect from a dongle.
const MAX_DATAGRAM: usize = 2048;

/// Capacity of the unsolicited-frame broadcast; slow subscribers lag.
const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// Pause after the first socket error in a row; doubles up to the cap.
const ERROR_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Predicate deciding whether an inbound message answers a pending request.
pub type Matcher = Box<dyn Fn(&RempMessage, SocketAddr) -> bool + Send + Sync>;

/// A decoded datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: RempMessage,
    pub from: SocketAddr,
}

/// An unsolicited CAN frame received from a dongle.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub device_id: DeviceId,
    pub from: SocketAddr,
    pub timestamp_us: u64,
    pub frame: CanFrame,
}

struct PendingEntry {
    matcher: Matcher,
    tx: oneshot::Sender<Result<Inbound, TransportError>>,
}

type PendingMap = Arc<Mutex<BTreeMap<u64, PendingEntry>>>;

/// One UDP socket shared by every dongle an agent serves.
pub struct DongleTransport {
    socket: Arc<UdpSocket>,
    pending: PendingMap,
    next_id: AtomicU64,
    frames_tx: broadcast::Sender<InboundFrame>,
    cancel: CancellationToken,
}

impl DongleTransport {
    /// Binds the socket and starts the receive loop.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let pending: PendingMap = Arc::new(Mutex::new(BTreeMap::new()));
        let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(recv_loop(
            socket.clone(),
            pending.clone(),
            frames_tx.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            socket,
            pending,
            next_id: AtomicU64::new(1),
            frames_tx,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Fire-and-forget send.
    pub async fn send(&self, msg: &RempMessage, to: SocketAddr) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let bytes = msg.encode()?;
        self.socket.send_to(&bytes, to).await?;
        trace!(%to, msg_type = ?msg.msg_type, seq = msg.seq, "datagram sent");
        Ok(())
    }

    /// Sends `msg` and waits for the first inbound message accepted by `matcher`.
    pub async fn request(
        &self,
        msg: &RempMessage,
        to: SocketAddr,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<Inbound, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let bytes = msg.encode()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, PendingEntry { matcher, tx });

        if let Err(e) = self.socket.send_to(&bytes, to).await {
            self.lock_pending().remove(&id);
            return Err(e.into());
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.lock_pending().remove(&id);

        match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                debug!(%to, msg_type = ?msg.msg_type, seq = msg.seq, "dongle request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    /// Receives every unsolicited CAN frame from now on. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<InboundFrame> {
        self.frames_tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Stops the receive loop and rejects every outstanding request.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        reject_all(&self.pending, || TransportError::Closed);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DongleTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reject_all(pending: &PendingMap, err: impl Fn() -> TransportError) {
    let drained = std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner));
    for (_, entry) in drained {
        let _ = entry.tx.send(Err(err()));
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    pending: PendingMap,
    frames_tx: broadcast::Sender<InboundFrame>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut errors: u32 = 0;
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(v) => v,
                Err(e) => {
                    errors = errors.saturating_add(1);
                    if errors == 1 {
                        warn!(error = %e, "dongle socket error, rejecting pending requests");
                    } else {
                        debug!(error = %e, consecutive = errors, "dongle socket error persists");
                    }
                    let msg = e.to_string();
                    reject_all(&pending, || TransportError::Socket(msg.clone()));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff(errors)) => {}
                    }
                    continue;
                }
            },
        };
        errors = 0;

        let message = match RempMessage::decode(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        dispatch(Inbound { message, from }, &pending, &frames_tx);
    }
    debug!("dongle receive loop stopped");
}

/// Delay before reading again after `consecutive` socket errors.
fn error_backoff(consecutive: u32) -> Duration {
    let shift = consecutive.saturating_sub(1).min(16);
    ERROR_BACKOFF_INITIAL
        .saturating_mul(1u32 << shift)
        .min(ERROR_BACKOFF_MAX)
}

fn dispatch(inbound: Inbound, pending: &PendingMap, frames_tx: &broadcast::Sender<InboundFrame>) {
    let waiter = {
        let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
        let id = map
            .iter()
            .find(|(_, entry)| (entry.matcher)(&inbound.message, inbound.from))
            .map(|(id, _)| *id);
        id.and_then(|id| map.remove(&id))
    };

    if let Some(entry) = waiter {
        let _ = entry.tx.send(Ok(inbound));
        return;
    }

    if inbound.message.msg_type != MessageType::CanFrame {
        debug!(
            from = %inbound.from,
            msg_type = ?inbound.message.msg_type,
            "unsolicited message ignored"
        );
        return;
    }

    match inbound.message.can_frame() {
        Ok(frame) => {
            let _ = frames_tx.send(InboundFrame {
                device_id: inbound.message.device_id,
                from: inbound.from,
                timestamp_us: inbound.message.timestamp_us,
                frame,
            });
        }
        Err(e) => debug!(
            device = %device_id_hex(&inbound.message.device_id),
            error = %e,
            "dropping malformed CAN frame"
        ),
    }
}
