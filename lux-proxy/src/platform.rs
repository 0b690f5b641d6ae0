//! Platform video backends.
//!
//! The real capture and virtual-camera drivers live outside this
//! repository; they implement [`FrameGrab`] and [`FramePublish`] from
//! `lux-core` and get plugged in here. What ships in-tree are stub
//! backends, enough to bring a peer up on a machine with no video
//! plumbing: capture fails (the dispatcher logs and retries) and
//! published frames go nowhere.

use lux_core::{Frame, FrameGrab, FramePublish, LuxError};

/// Screen-capture stub for platforms without a capture driver.
pub struct StubGrabber;

impl FrameGrab for StubGrabber {
    fn grab(&self, _x: i32, _y: i32, _width: usize, _height: usize) -> Result<Frame, LuxError> {
        Err(LuxError::Video(
            "no screen-capture backend on this platform".into(),
        ))
    }

    fn screen_size(&self) -> (usize, usize) {
        (1920, 1080)
    }
}

/// Virtual-camera stub: accepts and discards frames.
pub struct StubCamera;

impl FramePublish for StubCamera {
    fn publish(&self, _frame: &Frame) -> Result<(), LuxError> {
        Ok(())
    }
}
