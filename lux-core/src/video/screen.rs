//! Capture-side adapter: pacing, shared region state and the marker
//! tracker that keeps the capture rectangle glued to the peer's frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::detect;
use crate::codec::Role;
use crate::video::{Frame, FrameGrab, CAPTURE_HEIGHT, CAPTURE_WIDTH, FRAME_HEIGHT, FRAME_WIDTH};

/// Capture pacing before any negotiation has happened (2 FPS).
const DEFAULT_CAPTURE_DELAY: Duration = Duration::from_millis(500);
/// Floor for the capture delay when tracking a fast sender.
const MIN_CAPTURE_DELAY: Duration = Duration::from_millis(30);
/// Back-off after a failed capture call.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How often the marker tracker re-locates the peer frame.
const TRACKER_INTERVAL: Duration = Duration::from_secs(2);
/// Extra pixels searched around the current region before falling back
/// to a whole-screen scan.
const TRACKER_SLACK: i32 = 200;

// ── CaptureDelay ─────────────────────────────────────────────────

/// Shared handle to the capture pacing interval.
///
/// The dispatcher's capture loop sleeps this long before each grab; the
/// session negotiator and the tunnels tune it as the link speed changes.
#[derive(Debug, Clone)]
pub struct CaptureDelay(Arc<AtomicU64>);

impl CaptureDelay {
    pub fn new(initial: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(initial.as_micros() as u64)))
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, delay: Duration) {
        self.0.store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Capture exactly `fps` times per second (used after calibration).
    pub fn set_for_fps(&self, fps: f64) {
        let fps = fps.max(0.1);
        self.set(Duration::from_secs_f64(1.0 / fps));
    }

    /// Capture at twice the peer's send rate so no frame is skipped,
    /// floored at [`MIN_CAPTURE_DELAY`].
    pub fn track_send_fps(&self, fps: u32) {
        let delay = Duration::from_secs_f64(1.0 / (fps.max(1) as f64 * 2.0));
        self.set(delay.max(MIN_CAPTURE_DELAY));
    }
}

// ── RegionHandle ─────────────────────────────────────────────────

/// Shared top-left corner of the capture rectangle, in screen
/// coordinates. Updated by the tracker and the operator's hotkeys.
#[derive(Debug, Clone)]
pub struct RegionHandle(Arc<RwLock<(i32, i32)>>);

impl RegionHandle {
    pub fn new(x: i32, y: i32) -> Self {
        Self(Arc::new(RwLock::new((x, y))))
    }

    pub fn get(&self) -> (i32, i32) {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, x: i32, y: i32) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = (x, y);
    }
}

// ── ScreenSource ─────────────────────────────────────────────────

/// Paced frame source over the external capture primitive.
pub struct ScreenSource {
    grabber: Arc<dyn FrameGrab>,
    region: RegionHandle,
    delay: CaptureDelay,
}

impl ScreenSource {
    pub fn new(grabber: Arc<dyn FrameGrab>, x: i32, y: i32) -> Self {
        Self {
            grabber,
            region: RegionHandle::new(x, y),
            delay: CaptureDelay::new(DEFAULT_CAPTURE_DELAY),
        }
    }

    /// Shared pacing handle.
    pub fn delay(&self) -> CaptureDelay {
        self.delay.clone()
    }

    /// Shared capture-region handle.
    pub fn region(&self) -> RegionHandle {
        self.region.clone()
    }

    /// Sleep out the current pacing interval, then capture one
    /// rectangle. Capture failures are logged and retried after a
    /// short back-off; this only returns a frame.
    pub async fn next_frame(&self) -> Frame {
        let delay = self.delay.get();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        loop {
            let (x, y) = self.region.get();
            match self.grabber.grab(x, y, CAPTURE_WIDTH, CAPTURE_HEIGHT) {
                Ok(frame) => return frame,
                Err(e) => {
                    warn!(error = %e, "screen capture failed; retrying");
                    tokio::time::sleep(CAPTURE_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Spawn the capture loop: a task that feeds captured frames into
    /// a small channel for the dispatcher to drain.
    pub fn spawn_capture_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = self.next_frame() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(frame) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("capture loop stopped");
        });
        rx
    }

    /// Spawn the background marker tracker.
    ///
    /// Every couple of seconds it captures a rectangle slightly larger
    /// than the current region and looks for the peer's fiducials; if
    /// they have drifted, the shared region follows them. When they
    /// disappear entirely, the whole screen is scanned once per tick.
    pub fn spawn_tracker(self: &Arc<Self>, role: Role, cancel: CancellationToken) {
        let source = Arc::clone(self);
        let ranges = role.peer().ranges();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(TRACKER_INTERVAL) => {}
                }

                let (x, y) = source.region.get();
                let local_x = (x - TRACKER_SLACK / 2).max(0);
                let local_y = (y - TRACKER_SLACK / 2).max(0);
                let w = FRAME_WIDTH + TRACKER_SLACK as usize;
                let h = FRAME_HEIGHT + TRACKER_SLACK as usize;

                let mut found = false;
                if let Ok(img) = source.grabber.grab(local_x, local_y, w, h) {
                    if let Some((dx, dy)) = detect::find_frame_origin(&img, ranges) {
                        let (nx, ny) = (local_x + dx, local_y + dy);
                        if (nx, ny) != (x, y) {
                            info!(x = nx, y = ny, "markers tracked; region updated");
                            source.region.set(nx, ny);
                        }
                        found = true;
                    }
                }

                if !found {
                    let (sw, sh) = source.grabber.screen_size();
                    if let Ok(img) = source.grabber.grab(0, 0, sw, sh) {
                        if let Some((nx, ny)) = detect::find_frame_origin(&img, ranges) {
                            info!(x = nx, y = ny, "markers re-acquired on full screen");
                            source.region.set(nx, ny);
                        }
                    }
                }
            }
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────
