//! Frame sources feeding the pump.
//!
//! Three shapes exist at this boundary: a pull-style procedural source
//! ([`PatternSource`]), a push-style mailbox fed by a capture thread
//! ([`frame_mailbox`]), and an opaque GPU surface the session swaps
//! directly when the encoder accepts surface input ([`InputSurface`]).

use crate::errors::PumpError;
use crate::types::PixelBuffer;

mod mailbox;
mod pattern;

pub use mailbox::{frame_mailbox, FrameSender, MailboxSource, FRAME_WAIT_TIMEOUT};
pub use pattern::PatternSource;

/// Result of one pull from a frame source.
#[derive(Debug)]
pub enum FramePull {
    /// A frame is ready for submission.
    Frame(PixelBuffer),
    /// Nothing arrived within the source's bounded wait; the pump
    /// proceeds and retries on its next iteration.
    Pending,
    /// The source is exhausted; the pump moves to draining.
    End,
}

/// A producer of raw pixel buffers, pulled by the recording worker.
pub trait FrameSource: Send {
    /// Pull the next frame. `pts_us` is the presentation timestamp the
    /// pump will assign to it (sources may ignore it).
    fn pull(&mut self, pts_us: i64) -> Result<FramePull, PumpError>;
}

/// An opaque GPU surface bound to the encoder's input.
///
/// When the negotiated layout is `Opaque` the session publishes frames by
/// swapping this surface instead of filling pixel slots; the host renders
/// between `make_current` and `swap_buffers`.
pub trait InputSurface {
    fn make_current(&mut self) -> Result<(), PumpError>;

    /// Presentation time of the frame the next swap publishes, in
    /// nanoseconds.
    fn set_presentation_time(&mut self, pts_ns: i64) -> Result<(), PumpError>;

    /// Publish the current frame to the encoder.
    fn swap_buffers(&mut self) -> Result<(), PumpError>;
}
