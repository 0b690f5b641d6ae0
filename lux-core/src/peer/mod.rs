//! Role runtimes: everything a peer process runs besides the tunnels.
//!
//! Both roles share the same skeleton: capture loop, dispatcher,
//! marker tracker, camera watchdog, heartbeat ticker, and the session
//! negotiation driver. They differ in what they do once the session is
//! live: the client accepts SOCKS5 connections, the server answers
//! CONNECT requests.

pub mod client;
pub mod server;

pub use client::run_client;
pub use server::run_server;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Role;
use crate::dispatcher::{CaptureStatus, ConnectionTable, ControlChannels, Dispatcher};
use crate::error::LuxError;
use crate::packet::{HeartbeatBody, Packet, SyncBody, SyncCompleteBody};
use crate::rate::{FrameMeter, ProcessingMeter};
use crate::session::{
    self, SessionState, CALIBRATION_PERIOD, SYNC_COMPLETE_REPEATS, SYNC_TIMEOUT,
};
use crate::video::{CameraSink, FrameGrab, FramePublish, ScreenSource};

/// Pause between frames while flooding SYNC (well above 100 Hz worth).
const SYNC_EMIT_GAP: Duration = Duration::from_millis(5);
/// Gap between the client's SYNC_COMPLETE repeats.
const SYNC_COMPLETE_GAP: Duration = Duration::from_millis(100);
/// Cadence of the per-process background heartbeat.
const TICKER_INTERVAL: Duration = Duration::from_secs(5);

// ── PeerConfig ───────────────────────────────────────────────────

/// Settings shared by both role runtimes.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Margin between the frame edge and the data grid.
    pub margin: usize,
    /// Initial capture-region origin, in screen coordinates.
    pub capture_x: i32,
    pub capture_y: i32,
    /// SOCKS5 listen address. Only the client role uses it.
    pub listen: String,
    /// Tunnel heartbeat cadence.
    pub hb_interval: Duration,
}

// ── PeerRuntime ──────────────────────────────────────────────────

/// The long-lived pieces of one peer process.
pub(crate) struct PeerRuntime {
    pub role: Role,
    pub margin: usize,
    pub hb_interval: Duration,
    pub session: Mutex<SessionState>,
    pub sink: Arc<CameraSink>,
    pub source: Arc<ScreenSource>,
    pub table: ConnectionTable,
    pub status: Arc<CaptureStatus>,
    pub recv_meter: Arc<Mutex<FrameMeter>>,
    pub proc_meter: Arc<Mutex<ProcessingMeter>>,
}

impl PeerRuntime {
    /// Wire up capture loop, dispatcher, tracker, camera watchdog and
    /// heartbeat ticker. All background tasks stop with `shutdown`.
    pub fn start(
        role: Role,
        cfg: &PeerConfig,
        grabber: Arc<dyn FrameGrab>,
        publisher: Arc<dyn FramePublish>,
        shutdown: &CancellationToken,
    ) -> (Arc<Self>, ControlChannels) {
        let source = Arc::new(ScreenSource::new(grabber, cfg.capture_x, cfg.capture_y));
        let sink = Arc::new(CameraSink::new(publisher, role, cfg.margin));
        let status = Arc::new(CaptureStatus::new());
        let recv_meter = Arc::new(Mutex::new(FrameMeter::new()));
        let proc_meter = Arc::new(Mutex::new(ProcessingMeter::new()));
        let table = ConnectionTable::new();

        let (dispatcher, channels) = Dispatcher::new(
            role,
            cfg.margin,
            table.clone(),
            status.clone(),
            recv_meter.clone(),
            proc_meter.clone(),
        );
        let frames = Arc::clone(&source).spawn_capture_loop(shutdown.child_token());
        dispatcher.spawn(frames, shutdown.child_token());
        source.spawn_tracker(role, shutdown.child_token());
        sink.spawn_idle_watchdog(shutdown.child_token());

        let rt = Arc::new(Self {
            role,
            margin: cfg.margin,
            hb_interval: cfg.hb_interval,
            session: Mutex::new(SessionState::new()),
            sink,
            source,
            table,
            status,
            recv_meter,
            proc_meter,
        });
        rt.spawn_heartbeat_ticker(shutdown.child_token());

        info!(
            role = %role,
            session_id = rt.session_id(),
            margin = cfg.margin,
            "peer runtime started"
        );
        (rt, channels)
    }

    pub fn session_id(&self) -> i64 {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).id()
    }

    fn phase_name(&self) -> String {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .phase
            .to_string()
    }

    fn is_live(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .phase
            .is_live()
    }

    /// Build a heartbeat from the current meters.
    pub(crate) fn make_heartbeat(&self, hb_seq: u64) -> Packet {
        let (decode_fps, processing_ms) = self
            .proc_meter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        let received_fps = self
            .recv_meter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rate() as u32;
        let capture_delay = self.source.delay().get();
        let target_fps = if capture_delay.is_zero() {
            0
        } else {
            (1.0 / capture_delay.as_secs_f64()).round() as u32
        };
        Packet::Heartbeat(HeartbeatBody {
            fps: decode_fps,
            processing_ms,
            ts: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            target_fps,
            received_fps,
            ready: self.status.locked(),
            session_id: self.session_id(),
            seq: hb_seq,
            phase: self.phase_name(),
        })
    }

    /// One background heartbeat per process while the session is live,
    /// so the peer always has fresh rate data even on an idle link.
    fn spawn_heartbeat_ticker(self: &Arc<Self>, cancel: CancellationToken) {
        let rt = Arc::clone(self);
        tokio::spawn(async move {
            let mut hb_seq: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(TICKER_INTERVAL) => {}
                }
                if !rt.is_live() {
                    continue;
                }
                hb_seq += 1;
                if let Err(e) = rt.sink.send_packet(&rt.make_heartbeat(hb_seq)) {
                    warn!(error = %e, "background heartbeat failed");
                }
            }
        });
    }

    fn emit_sync(&self) {
        let body = SyncBody {
            session_id: self.session_id(),
            random: session::sync_token(),
            measured_fps: self
                .session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .phase
                .measured_fps(),
        };
        if let Err(e) = self.sink.send_packet(&Packet::Sync(body)) {
            warn!(error = %e, "sync emit failed");
        }
    }
}

// ── Link events ──────────────────────────────────────────────────

/// What the role loop should do after a control packet.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    Continue,
    SessionLost,
}

/// Handle a packet from the global HEARTBEAT channel: check the peer's
/// session id and fan the heartbeat out to the live tunnels.
pub(crate) async fn on_heartbeat(rt: &PeerRuntime, packet: Option<Packet>) -> LinkEvent {
    match packet {
        Some(Packet::Heartbeat(hb)) => {
            let consistent = rt
                .session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .verify_remote(hb.session_id);
            if !consistent {
                return LinkEvent::SessionLost;
            }
            rt.table.broadcast(&Packet::Heartbeat(hb)).await;
            LinkEvent::Continue
        }
        Some(_) => LinkEvent::Continue,
        None => LinkEvent::SessionLost,
    }
}

/// Handle a packet from the global SYNC channel while live. A sync
/// with a *different* session id means the peer restarted; a repeat of
/// the known id is just a stale retained frame.
pub(crate) fn on_sync_while_live(rt: &PeerRuntime, packet: Option<Packet>) -> LinkEvent {
    match packet {
        Some(Packet::Sync(body)) => {
            let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
            match session.remote_id() {
                Some(known) if known == body.session_id => LinkEvent::Continue,
                _ => {
                    warn!(sid = body.session_id, "peer is re-syncing; session lost");
                    session.phase.mark_lost();
                    LinkEvent::SessionLost
                }
            }
        }
        Some(_) => LinkEvent::Continue,
        None => LinkEvent::SessionLost,
    }
}

/// Tear down after a lost session: cancel the epoch (which stops every
/// tunnel), close all per-connection channels and return to Idle.
pub(crate) async fn teardown_epoch(rt: &PeerRuntime, epoch: &CancellationToken) {
    epoch.cancel();
    rt.table.reset().await;
    rt.session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .reset();
    info!("session torn down; returning to sync");
}

// ── Negotiation ──────────────────────────────────────────────────

/// Drive the synchronisation state machine to Live and return the
/// calibrated frame rate.
///
/// Retries from Idle after each 60-second attempt cap. Only returns an
/// error when the dispatcher has gone away (process shutdown).
pub(crate) async fn negotiate(
    rt: &PeerRuntime,
    channels: &mut ControlChannels,
    shutdown: &CancellationToken,
) -> Result<f64, LuxError> {
    'attempt: loop {
        if shutdown.is_cancelled() {
            return Err(LuxError::ChannelClosed);
        }

        {
            let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
            session.phase.begin_sync()?;
        }
        // Capture as fast as possible during bring-up.
        rt.source.delay().set(Duration::ZERO);
        let attempt_start = Instant::now();
        info!(role = %rt.role, "session sync: flooding");

        // Initiating: emit SYNC until the first peer SYNC shows up.
        loop {
            if shutdown.is_cancelled() {
                return Err(LuxError::ChannelClosed);
            }
            if attempt_start.elapsed() > SYNC_TIMEOUT {
                debug!("sync attempt timed out; retrying");
                rt.session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .reset();
                continue 'attempt;
            }
            rt.emit_sync();

            let mut peer_seen = false;
            while let Ok(packet) = channels.sync.try_recv() {
                if let Packet::Sync(body) = packet {
                    let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
                    session.learn_remote(body.session_id);
                    peer_seen = true;
                }
            }
            if peer_seen {
                break;
            }
            tokio::time::sleep(SYNC_EMIT_GAP).await;
        }

        {
            let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
            session.phase.begin_calibration()?;
        }
        info!(role = %rt.role, "session sync: calibrating");

        match rt.role {
            Role::Client => {
                // Count for exactly the calibration period.
                let started = Instant::now();
                while started.elapsed() < CALIBRATION_PERIOD {
                    if shutdown.is_cancelled() {
                        return Err(LuxError::ChannelClosed);
                    }
                    rt.emit_sync();
                    drain_syncs(rt, channels);
                    tokio::time::sleep(SYNC_EMIT_GAP).await;
                }

                let fps = {
                    let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
                    let fps = match &session.phase {
                        crate::session::SessionPhase::CalibratingPeer { sync_seen, .. } => {
                            (*sync_seen as f64 / CALIBRATION_PERIOD.as_secs_f64()).clamp(
                                session::CALIBRATED_FPS_MIN,
                                session::CALIBRATED_FPS_MAX,
                            )
                        }
                        _ => session::CALIBRATED_FPS_MIN,
                    };
                    session.phase.go_live(fps)?;
                    fps
                };

                let complete = Packet::SyncComplete(SyncCompleteBody {
                    session_id: rt.session_id(),
                    fps,
                });
                for _ in 0..SYNC_COMPLETE_REPEATS {
                    if let Err(e) = rt.sink.send_packet(&complete) {
                        warn!(error = %e, "sync-complete emit failed");
                    }
                    tokio::time::sleep(SYNC_COMPLETE_GAP).await;
                }
                rt.source.delay().set_for_fps(fps);
                info!(fps, "session live (client)");
                return Ok(fps);
            }
            Role::Server => {
                // Keep emitting SYNC; adopt the client's rate as soon
                // as its SYNC_COMPLETE arrives.
                loop {
                    if shutdown.is_cancelled() {
                        return Err(LuxError::ChannelClosed);
                    }
                    if attempt_start.elapsed() > SYNC_TIMEOUT {
                        debug!("no SYNC_COMPLETE within the attempt cap; retrying");
                        rt.session
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .reset();
                        continue 'attempt;
                    }
                    rt.emit_sync();
                    drain_syncs(rt, channels);

                    while let Ok(packet) = channels.sync_complete.try_recv() {
                        if let Packet::SyncComplete(body) = packet {
                            let remote = rt
                                .session
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .remote_id();
                            if remote != Some(body.session_id) {
                                debug!(
                                    sid = body.session_id,
                                    "SYNC_COMPLETE from unknown session ignored"
                                );
                                continue;
                            }
                            rt.session
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .phase
                                .go_live(body.fps)?;
                            rt.source.delay().set_for_fps(body.fps);
                            info!(fps = body.fps, "session live (server)");
                            return Ok(body.fps);
                        }
                    }
                    tokio::time::sleep(SYNC_EMIT_GAP).await;
                }
            }
        }
    }
}

/// Discard control packets queued up while nobody was consuming them.
///
/// Heartbeats and CONNECTs decoded during negotiation belong to the
/// previous session; replaying them into a fresh one would trigger
/// spurious session-lost detections or ghost dials.
pub(crate) fn drain_stale(channels: &mut ControlChannels) {
    while channels.heartbeat.try_recv().is_ok() {}
    while channels.connect.try_recv().is_ok() {}
    while channels.sync_complete.try_recv().is_ok() {}
}

/// Count peer SYNC frames during calibration.
fn drain_syncs(rt: &PeerRuntime, channels: &mut ControlChannels) {
    while let Ok(packet) = channels.sync.try_recv() {
        if let Packet::Sync(body) = packet {
            let mut session = rt.session.lock().unwrap_or_else(|e| e.into_inner());
            session.learn_remote(body.session_id);
            session.phase.record_sync();
        }
    }
}
