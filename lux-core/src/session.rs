//! Session identity and the negotiation state machine.
//!
//! Every process picks a random 63-bit session id at startup. Peers
//! detect each other's restarts by watching that id in heartbeats; a
//! change tears down all per-connection state and restarts negotiation.
//!
//! ```text
//!  Idle ──► Initiating ──► CalibratingPeer ──► Live
//!   ▲            │                │              │
//!   └────────────┴────── Lost ◄───┴──────────────┘
//! ```
//!
//! Transitions return `Result` instead of panicking, so a driver that
//! mis-sequences the machine gets a protocol violation it can log.

use std::time::Instant;

use rand::Rng;

use crate::error::LuxError;

/// Hard cap on one negotiation attempt before retrying from Idle.
pub const SYNC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// How long both peers count sync frames before computing the rate.
pub const CALIBRATION_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);
/// How many SYNC_COMPLETE frames the client emits.
pub const SYNC_COMPLETE_REPEATS: usize = 5;
/// Calibrated FPS is clamped into this range.
pub const CALIBRATED_FPS_MIN: f64 = 1.0;
pub const CALIBRATED_FPS_MAX: f64 = 30.0;

/// Length of the random token inside each SYNC frame.
const SYNC_TOKEN_LEN: usize = 32;

// ── SessionPhase ─────────────────────────────────────────────────

/// Where this peer is in the session lifecycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionPhase {
    /// Not negotiating and not connected. Initial / retry state.
    #[default]
    Idle,

    /// Flooding SYNC frames, waiting for the first peer SYNC.
    Initiating {
        /// When the flood started; bounds the attempt to [`SYNC_TIMEOUT`].
        since: Instant,
    },

    /// Counting peer SYNC frames for [`CALIBRATION_PERIOD`].
    CalibratingPeer {
        started: Instant,
        sync_seen: u32,
    },

    /// Negotiation complete; traffic flows at `fps`.
    Live { fps: f64 },

    /// The peer restarted underneath us; state must be destroyed.
    Lost,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initiating { .. } => write!(f, "initiating"),
            Self::CalibratingPeer { .. } => write!(f, "calibrating"),
            Self::Live { .. } => write!(f, "live"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

impl SessionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Start the SYNC flood.
    ///
    /// Valid from: `Idle`, `Lost` (retry).
    pub fn begin_sync(&mut self) -> Result<(), LuxError> {
        match self {
            Self::Idle | Self::Lost => {
                *self = Self::Initiating {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LuxError::ProtocolViolation(
                "cannot begin sync: not in Idle or Lost",
            )),
        }
    }

    /// First peer SYNC observed; start counting.
    ///
    /// Valid from: `Initiating`.
    pub fn begin_calibration(&mut self) -> Result<(), LuxError> {
        match self {
            Self::Initiating { .. } => {
                *self = Self::CalibratingPeer {
                    started: Instant::now(),
                    sync_seen: 1,
                };
                Ok(())
            }
            _ => Err(LuxError::ProtocolViolation(
                "cannot calibrate: not in Initiating",
            )),
        }
    }

    /// Count one more peer SYNC frame during calibration.
    pub fn record_sync(&mut self) {
        if let Self::CalibratingPeer { sync_seen, .. } = self {
            *sync_seen += 1;
        }
    }

    /// The receive rate measured so far in this calibration window.
    pub fn measured_fps(&self) -> Option<f64> {
        match self {
            Self::CalibratingPeer { started, sync_seen } => {
                let secs = started.elapsed().as_secs_f64();
                if secs > 0.0 {
                    Some(*sync_seen as f64 / secs)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Finish calibration with the negotiated frame rate.
    ///
    /// Valid from: `CalibratingPeer`.
    pub fn go_live(&mut self, fps: f64) -> Result<(), LuxError> {
        match self {
            Self::CalibratingPeer { .. } => {
                *self = Self::Live {
                    fps: fps.clamp(CALIBRATED_FPS_MIN, CALIBRATED_FPS_MAX),
                };
                Ok(())
            }
            _ => Err(LuxError::ProtocolViolation(
                "cannot go live: not in CalibratingPeer",
            )),
        }
    }

    /// The peer's session id changed; drop everything.
    ///
    /// Valid from any state.
    pub fn mark_lost(&mut self) {
        *self = Self::Lost;
    }

    /// Return to `Idle` for a fresh attempt.
    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// This peer's identity plus what it knows about the remote.
#[derive(Debug)]
pub struct SessionState {
    /// Our random 63-bit id, fixed for the life of the process.
    id: i64,
    /// The remote's id, learned from its SYNC / HEARTBEAT frames.
    remote_id: Option<i64>,
    /// Lifecycle phase.
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            id: rand::thread_rng().gen_range(0..i64::MAX),
            remote_id: None,
            phase: SessionPhase::Idle,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn remote_id(&self) -> Option<i64> {
        self.remote_id
    }

    /// Record the remote id seen in a SYNC frame.
    pub fn learn_remote(&mut self, remote_id: i64) {
        self.remote_id = Some(remote_id);
    }

    /// Check a heartbeat's session id against the remembered remote.
    ///
    /// Returns `true` when the id is consistent (or first seen), and
    /// `false` when the peer has restarted, in which case the phase is
    /// already moved to `Lost` and the remembered id cleared.
    pub fn verify_remote(&mut self, seen: i64) -> bool {
        match self.remote_id {
            Some(known) if known != seen => {
                tracing::warn!(known, seen, "remote session id changed; session lost");
                self.remote_id = None;
                self.phase.mark_lost();
                false
            }
            _ => {
                self.remote_id = Some(seen);
                true
            }
        }
    }

    /// Forget the remote and return to Idle (after Lost teardown).
    pub fn reset(&mut self) {
        self.remote_id = None;
        self.phase.reset();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh random token for one SYNC frame, so consecutive sync frames
/// never encode to identical pictograms.
pub fn sync_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SYNC_TOKEN_LEN)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::Idle;
        phase.begin_sync().unwrap();
        assert!(matches!(phase, SessionPhase::Initiating { .. }));

        phase.begin_calibration().unwrap();
        phase.record_sync();
        phase.record_sync();
        assert!(matches!(
            phase,
            SessionPhase::CalibratingPeer { sync_seen: 3, .. }
        ));

        phase.go_live(12.0).unwrap();
        assert!(phase.is_live());
    }

    #[test]
    fn go_live_clamps_fps() {
        let mut phase = SessionPhase::Idle;
        phase.begin_sync().unwrap();
        phase.begin_calibration().unwrap();
        phase.go_live(500.0).unwrap();
        assert!(matches!(phase, SessionPhase::Live { fps } if fps == CALIBRATED_FPS_MAX));

        let mut phase = SessionPhase::Idle;
        phase.begin_sync().unwrap();
        phase.begin_calibration().unwrap();
        phase.go_live(0.1).unwrap();
        assert!(matches!(phase, SessionPhase::Live { fps } if fps == CALIBRATED_FPS_MIN));
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut phase = SessionPhase::Idle;
        assert!(phase.begin_calibration().is_err());
        assert!(phase.go_live(5.0).is_err());

        phase.begin_sync().unwrap();
        assert!(phase.begin_sync().is_err());
    }

    #[test]
    fn lost_can_restart() {
        let mut phase = SessionPhase::Live { fps: 10.0 };
        phase.mark_lost();
        assert_eq!(phase, SessionPhase::Lost);
        phase.begin_sync().unwrap();
        assert!(matches!(phase, SessionPhase::Initiating { .. }));
    }

    #[test]
    fn record_sync_outside_calibration_is_noop() {
        let mut phase = SessionPhase::Idle;
        phase.record_sync();
        assert_eq!(phase, SessionPhase::Idle);
    }

    #[test]
    fn session_ids_are_nonnegative_and_distinct() {
        let a = SessionState::new();
        let b = SessionState::new();
        assert!(a.id() >= 0);
        assert!(b.id() >= 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn verify_remote_detects_restart() {
        let mut s = SessionState::new();
        s.phase = SessionPhase::Live { fps: 5.0 };
        assert!(s.verify_remote(111));
        assert!(s.verify_remote(111));
        assert!(!s.verify_remote(222));
        assert_eq!(s.phase, SessionPhase::Lost);
        assert_eq!(s.remote_id(), None);
    }

    #[test]
    fn reset_clears_remote() {
        let mut s = SessionState::new();
        s.learn_remote(5);
        s.phase.mark_lost();
        s.reset();
        assert_eq!(s.remote_id(), None);
        assert_eq!(s.phase, SessionPhase::Idle);
    }

    #[test]
    fn sync_tokens_are_fresh() {
        let t1 = sync_token();
        let t2 = sync_token();
        assert_eq!(t1.len(), 32);
        assert_ne!(t1, t2);
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionPhase::Idle.to_string(), "idle");
        assert_eq!(SessionPhase::Lost.to_string(), "lost");
        assert_eq!(SessionPhase::Live { fps: 1.0 }.to_string(), "live");
    }
}
