//! Virtual-camera adapter: serialised frame publication, packet
//! encoding convenience, and the idle watchdog that blanks the feed.
//!
//! The camera retains whatever frame was last written and republishes
//! it to watchers indefinitely. That is what makes the channel lossy-
//! but-repeating; it also means a dead tunnel would leave its last
//! payload on screen forever, so the watchdog pushes a blank pictogram
//! half a second after the last real write.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{self, Role, DEFAULT_BLOCK_SIZE};
use crate::error::LuxError;
use crate::packet::Packet;
use crate::video::{Frame, FramePublish};

/// The feed is blanked this long after the last write.
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);
/// Watchdog polling granularity.
const WATCHDOG_TICK: Duration = Duration::from_millis(100);
/// Blank frames published on tunnel teardown.
const CLEAR_REPEATS: usize = 3;
/// Gap between teardown blanks.
const CLEAR_GAP: Duration = Duration::from_millis(50);

struct SinkState {
    last_write: Instant,
    idle_blanked: bool,
}

/// Mutex-serialised wrapper over the external camera sink.
pub struct CameraSink {
    publisher: Arc<dyn FramePublish>,
    role: Role,
    margin: usize,
    state: Mutex<SinkState>,
    idle: Frame,
}

impl CameraSink {
    pub fn new(publisher: Arc<dyn FramePublish>, role: Role, margin: usize) -> Self {
        Self {
            publisher,
            role,
            margin,
            state: Mutex::new(SinkState {
                last_write: Instant::now(),
                idle_blanked: false,
            }),
            idle: codec::idle_frame(margin, role),
        }
    }

    /// Push one frame to the camera. A sink failure is logged and
    /// tolerated: the tunnel keeps functioning logically, the peer just
    /// sees stale pixels until the sink recovers.
    pub fn publish(&self, frame: &Frame) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.publisher.publish(frame) {
            warn!(error = %e, "virtual camera rejected frame");
        }
        state.last_write = Instant::now();
        state.idle_blanked = false;
    }

    /// Encode a packet into a pictogram and publish it.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), LuxError> {
        let bytes = packet.to_bytes()?;
        let frame = codec::encode(&bytes, self.margin, DEFAULT_BLOCK_SIZE, self.role)?;
        self.publish(&frame);
        Ok(())
    }

    /// Publish a few blank pictograms so no payload stays on screen
    /// after a tunnel ends.
    pub async fn clear(&self) {
        for _ in 0..CLEAR_REPEATS {
            self.publish_idle();
            tokio::time::sleep(CLEAR_GAP).await;
        }
    }

    fn publish_idle(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.publisher.publish(&self.idle) {
            warn!(error = %e, "virtual camera rejected idle frame");
        }
        state.last_write = Instant::now();
        state.idle_blanked = true;
    }

    /// Spawn the idle watchdog: blanks the feed once whenever
    /// [`IDLE_TIMEOUT`] passes without a write.
    pub fn spawn_idle_watchdog(self: &Arc<Self>, cancel: CancellationToken) {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCHDOG_TICK) => {}
                }
                let stale = {
                    let state = sink.state.lock().unwrap_or_else(|e| e.into_inner());
                    !state.idle_blanked && state.last_write.elapsed() > IDLE_TIMEOUT
                };
                if stale {
                    debug!("camera idle; publishing blank frame");
                    sink.publish_idle();
                }
            }
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────
