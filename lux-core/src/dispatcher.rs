//! The packet dispatcher: captured frames in, routed packets out.
//!
//! One dispatcher task runs per process. It drains the capture loop's
//! frame channel, runs the visual decoder, and routes each decoded
//! packet by type:
//!
//! - HEARTBEAT, CONNECT, SYNC and SYNC_COMPLETE go to dedicated global
//!   channels (bounded; a full channel drops the packet).
//! - DATA, CONNACK and DISCONNECT are looked up by connection id in the
//!   shared [`ConnectionTable`]; packets for unknown ids are dropped.
//!
//! The dispatcher also maintains the capture-status indicator: a frame
//! that yields no packet flips the channel to "searching".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{self, Role};
use crate::error::LuxError;
use crate::packet::Packet;
use crate::rate::{FrameMeter, ProcessingMeter};
use crate::video::Frame;

/// Depth of each global control channel.
const GLOBAL_CHANNEL_DEPTH: usize = 32;
/// Depth of each per-connection channel.
const CONN_CHANNEL_DEPTH: usize = 256;

// ── CaptureStatus ────────────────────────────────────────────────

/// Whether the decoder currently sees the peer's frame.
#[derive(Debug, Default)]
pub struct CaptureStatus(AtomicBool);

impl CaptureStatus {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// `true` while frames are decoding; `false` means "searching".
    pub fn locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_locked(&self, locked: bool) {
        let was = self.0.swap(locked, Ordering::Relaxed);
        if was != locked {
            debug!(locked, "capture status changed");
        }
    }
}

// ── ConnectionTable ──────────────────────────────────────────────

/// The concurrent connection-id registry shared by the dispatcher and
/// the role runtimes. The dispatcher holds only sender halves; each
/// tunnel owns its receiver and observes shutdown via channel closure.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<HashMap<u16, mpsc::Sender<Packet>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection id, returning the receiver its tunnel
    /// drains. Fails if the id is already present.
    pub async fn register(&self, conn_id: u16) -> Result<mpsc::Receiver<Packet>, LuxError> {
        let mut map = self.inner.write().await;
        if map.contains_key(&conn_id) {
            return Err(LuxError::ProtocolViolation("connection id already in use"));
        }
        let (tx, rx) = mpsc::channel(CONN_CHANNEL_DEPTH);
        map.insert(conn_id, tx);
        Ok(rx)
    }

    /// Drop a connection; its channel closes and the tunnel's ingress
    /// half sees end-of-stream.
    pub async fn unregister(&self, conn_id: u16) {
        self.inner.write().await.remove(&conn_id);
    }

    pub async fn contains(&self, conn_id: u16) -> bool {
        self.inner.read().await.contains_key(&conn_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Pick an unused random connection id in 1..=65535.
    pub async fn allocate_id(&self) -> u16 {
        let map = self.inner.read().await;
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=u16::MAX);
            if !map.contains_key(&id) {
                return id;
            }
        }
    }

    /// Route a packet to its connection. Returns `false` when the id is
    /// unknown or the channel is saturated.
    pub async fn route(&self, packet: Packet) -> bool {
        let Some(conn_id) = packet.conn_id() else {
            return false;
        };
        let map = self.inner.read().await;
        match map.get(&conn_id) {
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(p)) => {
                    warn!(conn_id, packet = %p, "connection channel full; dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => {
                debug!(conn_id, "packet for unknown connection dropped");
                false
            }
        }
    }

    /// Copy a packet into every live connection channel (used to fan
    /// heartbeats out to the tunnels).
    pub async fn broadcast(&self, packet: &Packet) {
        let map = self.inner.read().await;
        for tx in map.values() {
            let _ = tx.try_send(packet.clone());
        }
    }

    /// Drop every connection at once (session reset). All per-tunnel
    /// channels close, which each tunnel observes as a shutdown signal.
    pub async fn reset(&self) {
        let mut map = self.inner.write().await;
        if !map.is_empty() {
            warn!(connections = map.len(), "resetting all connections");
        }
        map.clear();
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Receiver halves of the global control channels.
pub struct ControlChannels {
    pub connect: mpsc::Receiver<Packet>,
    pub heartbeat: mpsc::Receiver<Packet>,
    pub sync: mpsc::Receiver<Packet>,
    pub sync_complete: mpsc::Receiver<Packet>,
}

/// The frame-to-packet router.
pub struct Dispatcher {
    role: Role,
    margin: usize,
    table: ConnectionTable,
    status: Arc<CaptureStatus>,
    recv_meter: Arc<Mutex<FrameMeter>>,
    proc_meter: Arc<Mutex<ProcessingMeter>>,
    connect_tx: mpsc::Sender<Packet>,
    heartbeat_tx: mpsc::Sender<Packet>,
    sync_tx: mpsc::Sender<Packet>,
    sync_complete_tx: mpsc::Sender<Packet>,
}

impl Dispatcher {
    pub fn new(
        role: Role,
        margin: usize,
        table: ConnectionTable,
        status: Arc<CaptureStatus>,
        recv_meter: Arc<Mutex<FrameMeter>>,
        proc_meter: Arc<Mutex<ProcessingMeter>>,
    ) -> (Self, ControlChannels) {
        let (connect_tx, connect) = mpsc::channel(GLOBAL_CHANNEL_DEPTH);
        let (heartbeat_tx, heartbeat) = mpsc::channel(GLOBAL_CHANNEL_DEPTH);
        let (sync_tx, sync) = mpsc::channel(GLOBAL_CHANNEL_DEPTH);
        let (sync_complete_tx, sync_complete) = mpsc::channel(GLOBAL_CHANNEL_DEPTH);
        (
            Self {
                role,
                margin,
                table,
                status,
                recv_meter,
                proc_meter,
                connect_tx,
                heartbeat_tx,
                sync_tx,
                sync_complete_tx,
            },
            ControlChannels {
                connect,
                heartbeat,
                sync,
                sync_complete,
            },
        )
    }

    /// Spawn the dispatcher loop over a stream of captured frames.
    pub fn spawn(self, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };
                self.handle_frame(&frame).await;
            }
            debug!("dispatcher stopped");
        });
    }

    async fn handle_frame(&self, frame: &Frame) {
        let started = Instant::now();
        let packet = codec::decode(frame, self.margin, self.role)
            .and_then(|bytes| Packet::from_bytes(&bytes));
        self.proc_meter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(started.elapsed());

        let packet = match packet {
            Ok(p) => p,
            Err(LuxError::NoSignal) => {
                self.status.set_locked(false);
                return;
            }
            Err(e) => {
                // Fiducials were present but the payload did not
                // survive; treat like any undecodable frame.
                trace!(error = %e, "frame decode failed");
                self.status.set_locked(false);
                return;
            }
        };

        self.status.set_locked(true);
        self.recv_meter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record();
        trace!(packet = %packet, "decoded");

        match &packet {
            Packet::Heartbeat(_) => Self::offer(&self.heartbeat_tx, packet),
            Packet::Connect { .. } => Self::offer(&self.connect_tx, packet),
            Packet::Sync(_) => Self::offer(&self.sync_tx, packet),
            Packet::SyncComplete(_) => Self::offer(&self.sync_complete_tx, packet),
            Packet::Data { .. } | Packet::ConnAck { .. } | Packet::Disconnect { .. } => {
                self.table.route(packet).await;
            }
        }
    }

    /// Non-blocking push into a global channel; a saturated consumer
    /// loses the oldest traffic rather than stalling the decoder.
    fn offer(tx: &mpsc::Sender<Packet>, packet: Packet) {
        if let Err(mpsc::error::TrySendError::Full(p)) = tx.try_send(packet) {
            trace!(packet = %p, "control channel full; dropping");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BindAddr, SyncBody};

    fn test_dispatcher(role: Role) -> (Dispatcher, ControlChannels, ConnectionTable) {
        let table = ConnectionTable::new();
        let (dispatcher, channels) = Dispatcher::new(
            role,
            10,
            table.clone(),
            Arc::new(CaptureStatus::new()),
            Arc::new(Mutex::new(FrameMeter::new())),
            Arc::new(Mutex::new(ProcessingMeter::new())),
        );
        (dispatcher, channels, table)
    }

    fn frame_for(packet: &Packet, from: Role) -> Frame {
        codec::encode(&packet.to_bytes().unwrap(), 10, 4, from).unwrap()
    }

    #[tokio::test]
    async fn routes_sync_to_control_channel() {
        let (dispatcher, mut channels, _) = test_dispatcher(Role::Server);
        let packet = Packet::Sync(SyncBody {
            session_id: 42,
            random: "r".repeat(32),
            measured_fps: None,
        });
        dispatcher
            .handle_frame(&frame_for(&packet, Role::Client))
            .await;
        assert_eq!(channels.sync.try_recv().unwrap(), packet);
    }

    #[tokio::test]
    async fn routes_data_to_registered_connection() {
        let (dispatcher, _channels, table) = test_dispatcher(Role::Server);
        let mut rx = table.register(7).await.unwrap();

        let packet = Packet::Data {
            conn_id: 7,
            seq: 1,
            payload: b"hello".to_vec(),
        };
        dispatcher
            .handle_frame(&frame_for(&packet, Role::Client))
            .await;
        assert_eq!(rx.try_recv().unwrap(), packet);
    }

    #[tokio::test]
    async fn drops_data_for_unknown_connection() {
        let (dispatcher, _channels, table) = test_dispatcher(Role::Server);
        let packet = Packet::Data {
            conn_id: 9,
            seq: 1,
            payload: vec![1],
        };
        dispatcher
            .handle_frame(&frame_for(&packet, Role::Client))
            .await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn undecodable_frame_flips_status_to_searching() {
        let table = ConnectionTable::new();
        let status = Arc::new(CaptureStatus::new());
        let (dispatcher, _channels) = Dispatcher::new(
            Role::Server,
            10,
            table,
            status.clone(),
            Arc::new(Mutex::new(FrameMeter::new())),
            Arc::new(Mutex::new(ProcessingMeter::new())),
        );

        let packet = Packet::Disconnect { conn_id: 1 };
        dispatcher
            .handle_frame(&frame_for(&packet, Role::Client))
            .await;
        assert!(status.locked());

        dispatcher.handle_frame(&Frame::new(1024, 1024)).await;
        assert!(!status.locked());
    }

    #[tokio::test]
    async fn ignores_own_role_frames() {
        let (dispatcher, mut channels, _) = test_dispatcher(Role::Client);
        let packet = Packet::Sync(SyncBody {
            session_id: 1,
            random: "x".repeat(32),
            measured_fps: None,
        });
        // A client-coloured frame must not be routed by a client.
        dispatcher
            .handle_frame(&frame_for(&packet, Role::Client))
            .await;
        assert!(channels.sync.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_rejects_duplicate_ids() {
        let table = ConnectionTable::new();
        let _rx = table.register(3).await.unwrap();
        assert!(table.register(3).await.is_err());
    }

    #[tokio::test]
    async fn reset_closes_connection_channels() {
        let table = ConnectionTable::new();
        let mut rx = table.register(5).await.unwrap();
        table.reset().await;
        assert!(rx.recv().await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn allocate_id_avoids_live_connections() {
        let table = ConnectionTable::new();
        let _rx = table.register(100).await.unwrap();
        for _ in 0..50 {
            let id = table.allocate_id().await;
            assert_ne!(id, 0);
            assert_ne!(id, 100);
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connections() {
        let table = ConnectionTable::new();
        let mut rx1 = table.register(1).await.unwrap();
        let mut rx2 = table.register(2).await.unwrap();
        let packet = Packet::ConnAck {
            conn_id: 1,
            status: 0,
            bind: BindAddr::unspecified(),
        };
        table.broadcast(&packet).await;
        assert_eq!(rx1.try_recv().unwrap(), packet);
        assert_eq!(rx2.try_recv().unwrap(), packet);
    }
}
