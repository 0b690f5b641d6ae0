//! Adaptive send-rate control and frame-rate metering.
//!
//! The sender walks a fixed FPS ladder, never jumping more than one
//! level at a time and never more often than once every five seconds.
//! The signal for a move is the *remote's* reported receive rate from
//! its heartbeats: if the peer keeps up with our current level we step
//! up; if it falls more than two frames short we step down.

use std::time::{Duration, Instant};

/// The fixed send-rate ladder, frames per second.
pub const FPS_LADDER: [u32; 5] = [1, 5, 10, 20, 25];

/// Minimum time between ladder moves.
pub const MIN_STEP_INTERVAL: Duration = Duration::from_secs(5);

/// How far (in FPS) the remote may fall behind the current level
/// before we step down.
const STEP_DOWN_SLACK: u32 = 2;

// ── RateState ────────────────────────────────────────────────────

/// A ladder move, for logging and capture-delay adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChange {
    Up(u32),
    Down(u32),
}

/// Shared rate state for one tunnel. Lives behind a mutex; the ingress
/// half feeds it remote observations, the egress half paces by it.
#[derive(Debug)]
pub struct RateState {
    /// Index into [`FPS_LADDER`].
    fps_idx: usize,
    /// Last target FPS the remote reported sending at.
    remote_target: u32,
    /// Last receive FPS the remote reported achieving.
    remote_received: u32,
    /// When the ladder last moved.
    last_change: Instant,
}

impl RateState {
    /// Start at the bottom of the ladder.
    pub fn new() -> Self {
        Self {
            fps_idx: 0,
            remote_target: 0,
            remote_received: 0,
            last_change: Instant::now(),
        }
    }

    /// The FPS we are currently sending at.
    pub fn current_fps(&self) -> u32 {
        FPS_LADDER[self.fps_idx]
    }

    /// The last receive rate the remote reported.
    pub fn remote_received(&self) -> u32 {
        self.remote_received
    }

    /// The last send rate the remote reported.
    pub fn remote_target(&self) -> u32 {
        self.remote_target
    }

    /// Whether the remote's receive rate lags our current level by at
    /// least one frame per second.
    pub fn remote_lagging(&self) -> bool {
        self.remote_received + 1 <= self.current_fps()
    }

    /// Record the rates from a remote heartbeat, then consider a ladder
    /// move. Returns the move if one happened.
    pub fn observe_remote(&mut self, target_fps: u32, received_fps: u32) -> Option<RateChange> {
        if target_fps > 0 {
            self.remote_target = target_fps;
        }
        if received_fps > 0 {
            self.remote_received = received_fps;
        }
        self.adjust()
    }

    /// Re-evaluate the ladder against the most recent remote report.
    ///
    /// Heartbeats supply the data; the clock supplies the five-second
    /// gate. The egress loop polls this so a step is not tied to the
    /// exact arrival instant of the next heartbeat.
    pub fn adjust(&mut self) -> Option<RateChange> {
        if self.remote_received == 0 || self.last_change.elapsed() < MIN_STEP_INTERVAL {
            return None;
        }
        let level = self.current_fps();

        if self.remote_received >= level && self.fps_idx + 1 < FPS_LADDER.len() {
            self.fps_idx += 1;
            self.last_change = Instant::now();
            return Some(RateChange::Up(self.current_fps()));
        }
        if self.remote_received + STEP_DOWN_SLACK < level && self.fps_idx > 0 {
            self.fps_idx -= 1;
            self.last_change = Instant::now();
            return Some(RateChange::Down(self.current_fps()));
        }
        None
    }

    #[cfg(test)]
    fn force_step_window_elapsed(&mut self) {
        self.last_change = Instant::now() - MIN_STEP_INTERVAL - Duration::from_millis(1);
    }
}

impl Default for RateState {
    fn default() -> Self {
        Self::new()
    }
}

// ── FrameMeter ───────────────────────────────────────────────────

/// Counts events over rolling one-second periods and reports the rate
/// of the last completed period.
#[derive(Debug)]
pub struct FrameMeter {
    frames: u32,
    period_start: Instant,
    last_rate: f32,
}

impl FrameMeter {
    pub fn new() -> Self {
        Self {
            frames: 0,
            period_start: Instant::now(),
            last_rate: 0.0,
        }
    }

    /// Record one event at the current instant.
    pub fn record(&mut self) {
        self.frames += 1;
    }

    /// Events per second over the most recent completed period.
    pub fn rate(&mut self) -> f32 {
        let elapsed = self.period_start.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            self.last_rate = self.frames as f32 / elapsed;
            self.frames = 0;
            self.period_start = Instant::now();
        }
        self.last_rate
    }
}

impl Default for FrameMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── ProcessingMeter ──────────────────────────────────────────────

/// Tracks per-frame processing cost alongside the frame rate.
#[derive(Debug)]
pub struct ProcessingMeter {
    frames: u32,
    total: Duration,
    period_start: Instant,
    last_rate: f32,
    last_avg_ms: u32,
}

impl ProcessingMeter {
    pub fn new() -> Self {
        Self {
            frames: 0,
            total: Duration::ZERO,
            period_start: Instant::now(),
            last_rate: 0.0,
            last_avg_ms: 0,
        }
    }

    /// Record that one frame took `cost` to process.
    pub fn record(&mut self, cost: Duration) {
        self.frames += 1;
        self.total += cost;
    }

    /// `(frames per second, mean milliseconds per frame)` over the most
    /// recent completed period.
    pub fn snapshot(&mut self) -> (f32, u32) {
        let elapsed = self.period_start.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            self.last_rate = self.frames as f32 / elapsed;
            self.last_avg_ms = if self.frames > 0 {
                (self.total.as_millis() as u32) / self.frames
            } else {
                0
            };
            self.frames = 0;
            self.total = Duration::ZERO;
            self.period_start = Instant::now();
        }
        (self.last_rate, self.last_avg_ms)
    }
}

impl Default for ProcessingMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_fps() {
        let rate = RateState::new();
        assert_eq!(rate.current_fps(), 1);
    }

    #[test]
    fn steps_up_when_remote_keeps_pace() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        let change = rate.observe_remote(1, 1);
        assert_eq!(change, Some(RateChange::Up(5)));
        assert_eq!(rate.current_fps(), 5);
    }

    #[test]
    fn single_step_only() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        // Remote reports far more than our level; still one step.
        rate.observe_remote(25, 30);
        assert_eq!(rate.current_fps(), 5);
    }

    #[test]
    fn step_rate_limited_to_five_seconds() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        assert!(rate.observe_remote(1, 10).is_some());
        // Immediately after a move, no further move is allowed.
        assert!(rate.observe_remote(1, 10).is_none());
        assert_eq!(rate.current_fps(), 5);
    }

    #[test]
    fn steps_down_when_remote_falls_behind() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        rate.observe_remote(1, 30); // up to 5
        rate.force_step_window_elapsed();
        rate.observe_remote(1, 30); // up to 10
        rate.force_step_window_elapsed();
        // 10 - 2 = 8; a report of 7 forces a step down.
        let change = rate.observe_remote(1, 7);
        assert_eq!(change, Some(RateChange::Down(5)));
    }

    #[test]
    fn holds_level_within_slack() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        rate.observe_remote(1, 30); // up to 5
        rate.force_step_window_elapsed();
        // 4 >= 5 - 2, and 4 < 5, so neither direction moves.
        assert!(rate.observe_remote(1, 4).is_none());
        assert_eq!(rate.current_fps(), 5);
    }

    #[test]
    fn never_steps_below_floor_or_above_ceiling() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        assert!(rate.observe_remote(1, 0).is_none()); // no data, no move

        for _ in 0..10 {
            rate.force_step_window_elapsed();
            rate.observe_remote(1, 30);
        }
        assert_eq!(rate.current_fps(), 25); // pinned at top
    }

    #[test]
    fn lag_detection() {
        let mut rate = RateState::new();
        rate.force_step_window_elapsed();
        rate.observe_remote(1, 30); // now at 5 FPS
        assert!(!rate.remote_lagging());

        let mut rate = RateState::new();
        assert_eq!(rate.current_fps(), 1);
        rate.remote_received = 0;
        assert!(rate.remote_lagging());
    }

    #[test]
    fn frame_meter_measures_rate() {
        let mut meter = FrameMeter::new();
        for _ in 0..10 {
            meter.record();
        }
        meter.period_start = Instant::now() - Duration::from_secs(2);
        let rate = meter.rate();
        assert!(rate > 4.0 && rate < 6.0, "rate = {rate}");
    }

    #[test]
    fn processing_meter_averages() {
        let mut meter = ProcessingMeter::new();
        meter.record(Duration::from_millis(10));
        meter.record(Duration::from_millis(30));
        meter.period_start = Instant::now() - Duration::from_secs(1);
        let (_, avg_ms) = meter.snapshot();
        assert_eq!(avg_ms, 20);
    }
}
