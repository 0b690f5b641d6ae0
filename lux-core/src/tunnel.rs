//! Per-connection tunnel: the task pair that glues one TCP socket to
//! the visual channel.
//!
//! The *egress* half drains the socket with a short read deadline,
//! wraps each chunk in a DATA packet and hands it to the camera sink,
//! pacing itself against the rate ladder. The *ingress* half drains
//! the per-connection packet channel and writes accepted DATA payloads
//! back to the socket, discarding duplicate sequence numbers (the
//! visual channel repeats frames by design).
//!
//! Either half ending cancels the other. On termination the tunnel
//! emits a single DISCONNECT and blanks the camera feed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::packet::{HeartbeatBody, Packet};
use crate::rate::{FrameMeter, ProcessingMeter, RateState};
use crate::video::{CameraSink, CaptureDelay};

/// Largest DATA payload per frame.
const MAX_CHUNK: usize = 490;
/// TCP read deadline per egress iteration.
const READ_DEADLINE: Duration = Duration::from_millis(10);
/// A tunnel with no DATA in either direction this long closes itself.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Heartbeat floor while the remote lags our send rate.
const HB_LAG_FLOOR: Duration = Duration::from_secs(5);
/// Default heartbeat cadence when the link is healthy.
pub const DEFAULT_HB_INTERVAL: Duration = Duration::from_secs(30);

/// Advance the one-byte sequence counter. Zero is reserved as the
/// receiver's "nothing accepted yet" value, so the counter skips it on
/// wrap-around.
fn next_seq(seq: u8) -> u8 {
    if seq == u8::MAX {
        1
    } else {
        seq + 1
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Config / stats ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub conn_id: u16,
    /// Our session id, stamped into every heartbeat.
    pub session_id: i64,
    /// Heartbeat cadence while the link keeps up.
    pub hb_interval: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ── Tunnel ───────────────────────────────────────────────────────

pub struct Tunnel {
    cfg: TunnelConfig,
    sink: Arc<CameraSink>,
    capture_delay: CaptureDelay,
    rate: Arc<Mutex<RateState>>,
    recv_meter: Arc<Mutex<FrameMeter>>,
    proc_meter: Arc<Mutex<ProcessingMeter>>,
    last_activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Build a tunnel. `parent` scopes its lifetime: cancelling the
    /// parent (session reset, shutdown) tears the tunnel down.
    pub fn new(
        cfg: TunnelConfig,
        sink: Arc<CameraSink>,
        capture_delay: CaptureDelay,
        recv_meter: Arc<Mutex<FrameMeter>>,
        proc_meter: Arc<Mutex<ProcessingMeter>>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            cfg,
            sink,
            capture_delay,
            rate: Arc::new(Mutex::new(RateState::new())),
            recv_meter,
            proc_meter,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            cancel: parent.child_token(),
        }
    }

    /// Run both halves until one ends, then tear down: one DISCONNECT,
    /// three blanking frames, stats logged.
    pub async fn run(self, stream: TcpStream, inbound: mpsc::Receiver<Packet>) -> TunnelStats {
        let conn_id = self.cfg.conn_id;
        let started = Instant::now();
        info!(conn_id, "tunnel running");

        let (reader, writer) = stream.into_split();
        let this = Arc::new(self);

        let egress = tokio::spawn({
            let t = Arc::clone(&this);
            async move { t.egress(reader).await }
        });
        let ingress = tokio::spawn({
            let t = Arc::clone(&this);
            async move { t.ingress(writer, inbound).await }
        });

        let (bytes_sent, bytes_received) = match tokio::join!(egress, ingress) {
            (Ok(sent), Ok(received)) => (sent, received),
            _ => (0, 0),
        };

        if let Err(e) = this.sink.send_packet(&Packet::Disconnect { conn_id }) {
            warn!(conn_id, error = %e, "failed to emit DISCONNECT");
        }
        this.sink.clear().await;

        let stats = TunnelStats {
            bytes_sent,
            bytes_received,
        };
        info!(
            conn_id,
            duration_ms = started.elapsed().as_millis() as u64,
            bytes_sent,
            bytes_received,
            "tunnel closed"
        );
        stats
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn current_fps(&self) -> u32 {
        self.rate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_fps()
    }

    // ── Egress ───────────────────────────────────────────────────

    async fn egress(&self, mut reader: OwnedReadHalf) -> u64 {
        let conn_id = self.cfg.conn_id;
        let mut seq: u8 = 0;
        let mut hb_seq: u64 = 0;
        let mut last_hb = Instant::now();
        let mut bytes_sent: u64 = 0;
        let mut buf = vec![0u8; MAX_CHUNK];

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let loop_start = Instant::now();
            let fps = self.current_fps();
            let interval = Duration::from_secs_f64(1.0 / fps as f64);

            // Heartbeat, early and often while the remote lags.
            let lagging = self
                .rate
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remote_lagging();
            let hb_every = if lagging {
                HB_LAG_FLOOR.min(self.cfg.hb_interval)
            } else {
                self.cfg.hb_interval
            };
            if last_hb.elapsed() >= hb_every {
                hb_seq += 1;
                if let Err(e) = self.sink.send_packet(&self.heartbeat(fps, hb_seq)) {
                    warn!(conn_id, error = %e, "heartbeat emit failed");
                }
                last_hb = Instant::now();
            }

            // The rate-limit window may have expired since the last
            // heartbeat was observed; re-check the ladder.
            let change = self
                .rate
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .adjust();
            if let Some(change) = change {
                info!(conn_id, ?change, "send rate adjusted");
                self.capture_delay.track_send_fps(self.current_fps());
            }

            // Drain the socket under a short deadline; a timeout just
            // means no data this tick.
            match tokio::time::timeout(READ_DEADLINE, reader.read(&mut buf)).await {
                Err(_) => {}
                Ok(Ok(0)) => {
                    debug!(conn_id, "local socket closed");
                    break;
                }
                Ok(Ok(n)) => {
                    seq = next_seq(seq);
                    let packet = Packet::Data {
                        conn_id,
                        seq,
                        payload: buf[..n].to_vec(),
                    };
                    if let Err(e) = self.sink.send_packet(&packet) {
                        warn!(conn_id, error = %e, "data emit failed");
                    }
                    bytes_sent += n as u64;
                    self.touch();
                }
                Ok(Err(e)) => {
                    debug!(conn_id, error = %e, "socket read error");
                    break;
                }
            }

            if self.idle_for() > INACTIVITY_TIMEOUT {
                info!(conn_id, "tunnel idle; closing");
                break;
            }

            // Hold the line rate.
            let elapsed = loop_start.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval - elapsed) => {}
                }
            }
        }

        self.cancel.cancel();
        bytes_sent
    }

    fn heartbeat(&self, target_fps: u32, hb_seq: u64) -> Packet {
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
        Packet::Heartbeat(HeartbeatBody {
            fps: decode_fps,
            processing_ms,
            ts: unix_now(),
            target_fps,
            received_fps,
            ready: true,
            session_id: self.cfg.session_id,
            seq: hb_seq,
            phase: "live".into(),
        })
    }

    // ── Ingress ──────────────────────────────────────────────────

    async fn ingress(&self, mut writer: OwnedWriteHalf, mut inbound: mpsc::Receiver<Packet>) -> u64 {
        let conn_id = self.cfg.conn_id;
        let mut last_recv_seq: u8 = 0;
        let mut remote_sid: Option<i64> = None;
        let mut bytes_received: u64 = 0;

        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break,
                p = inbound.recv() => p,
            };
            match packet {
                None => {
                    debug!(conn_id, "connection channel closed");
                    break;
                }
                Some(Packet::Data { seq, payload, .. }) => {
                    // The channel republishes frames; a repeated seq is
                    // the same packet seen again.
                    if seq == last_recv_seq {
                        continue;
                    }
                    if let Err(e) = writer.write_all(&payload).await {
                        debug!(conn_id, error = %e, "socket write error");
                        break;
                    }
                    last_recv_seq = seq;
                    bytes_received += payload.len() as u64;
                    self.touch();
                }
                Some(Packet::Heartbeat(hb)) => {
                    if let Some(sid) = remote_sid {
                        if sid != hb.session_id {
                            warn!(
                                conn_id,
                                old = sid,
                                new = hb.session_id,
                                "remote session changed; closing tunnel"
                            );
                            break;
                        }
                    }
                    remote_sid = Some(hb.session_id);

                    let change = self
                        .rate
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .observe_remote(hb.target_fps, hb.received_fps);
                    if let Some(change) = change {
                        info!(conn_id, ?change, "send rate adjusted");
                        self.capture_delay.track_send_fps(self.current_fps());
                    }
                }
                Some(Packet::Disconnect { .. }) => {
                    debug!(conn_id, "remote disconnected");
                    break;
                }
                // A late or repeated CONNACK after establishment.
                Some(other) => {
                    debug!(conn_id, packet = %other, "ignoring packet in tunnel");
                }
            }
        }

        self.cancel.cancel();
        bytes_received
    }
}

// ── Tests ────────────────────────────────────────────────────────
