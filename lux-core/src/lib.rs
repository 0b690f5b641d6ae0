//! Core protocol stack for lux: a covert bidirectional TCP tunnel that
//! carries a SOCKS5 session over a visual channel.
//!
//! One peer renders protocol packets into 640x480 pictogram frames on
//! a virtual camera; the other captures the displayed frame from its
//! screen and decodes the bytes back. Both halves run at both ends, so
//! data flows both ways through the pair of video streams.
//!
//! The crate is organised around the data path:
//!
//! - [`codec`]: the per-frame visual codec (fiducials, Reed-Solomon,
//!   palette cells).
//! - [`packet`]: the framing protocol layered on top.
//! - [`dispatcher`]: frame capture to packet routing.
//! - [`tunnel`]: the per-connection egress/ingress task pair.
//! - [`session`] / [`rate`]: negotiation and adaptive rate control.
//! - [`socks`]: the RFC 1928 front-end.
//! - [`video`]: frame types plus the external capture / camera
//!   contracts.
//! - [`peer`]: the client and server role runtimes.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod peer;
pub mod rate;
pub mod session;
pub mod socks;
pub mod tunnel;
pub mod video;

pub use codec::{Role, DEFAULT_BLOCK_SIZE};
pub use dispatcher::{CaptureStatus, ConnectionTable, ControlChannels, Dispatcher};
pub use error::LuxError;
pub use packet::{BindAddr, HeartbeatBody, Packet, SyncBody, SyncCompleteBody};
pub use peer::{run_client, run_server, PeerConfig};
pub use rate::{RateState, FPS_LADDER};
pub use session::{SessionPhase, SessionState};
pub use tunnel::{Tunnel, TunnelConfig, TunnelStats, DEFAULT_HB_INTERVAL};
pub use video::{CameraSink, Frame, FrameGrab, FramePublish, ScreenSource};
