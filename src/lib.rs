//! framepump: asynchronous encode/mux pump for block-oriented encoders.
//!
//! The crate drives an encoder through its slot-indexed buffer-exchange
//! protocol, converts raw ARGB/NV21 frames into the negotiated YUV420
//! layout, and forwards encoded access units into an MP4 container while
//! preserving timing, ordering, and end-of-stream semantics.
//!
//! # Features
//! - Slot-pool encoder protocol with bounded waits (never blocks forever)
//! - Deferred muxer track registration driven by the encoder's
//!   format-changed notification
//! - Planar and semi-planar YUV420 conversion from ARGB and NV21 sources
//! - A worker-thread recording lifecycle with cooperative start/stop/quit
//!
//! # Usage
//! ```rust,no_run
//! use framepump::{
//!     EncoderRegistry, PatternSource, PumpConfig, RecordingController, SessionSpec,
//! };
//!
//! let controller = RecordingController::spawn(EncoderRegistry::with_defaults())?;
//!
//! let config = PumpConfig::new(320, 240, 15.0).with_bitrate(2_000_000);
//! let frames = config.num_frames(5);
//! controller.request_start(SessionSpec {
//!     output_path: "out.mp4".into(),
//!     source: Box::new(PatternSource::new(config.width, config.height, frames)),
//!     config,
//! })?;
//!
//! // ... later, or let the source run out on its own:
//! // controller.request_stop()?;
//! # Ok::<(), framepump::PumpError>(())
//! ```

pub mod codec;
pub mod config;
pub mod controller;
pub mod convert;
pub mod errors;
pub mod format;
pub mod mux;
pub mod session;
pub mod source;
pub mod types;

// Re-exports for convenience
pub use codec::{BlockEncoder, EncoderEntry, EncoderRegistry, InputOutcome, OutputEvent};
pub use config::{PumpConfig, PumpQuality, PumpStats};
pub use controller::{PumpEvent, RecordingController, RecordingState, SessionSpec};
pub use convert::PixelLayout;
pub use errors::PumpError;
pub use format::FormatDescriptor;
pub use mux::{MuxSession, TrackMap};
pub use session::{EncodeSession, SessionState};
pub use source::{
    frame_mailbox, FramePull, FrameSender, FrameSource, InputSurface, MailboxSource,
    PatternSource,
};
pub use types::{PixelBuffer, SampleUnit, SlotIndex, SourceFormat, UnitFlags};

/// Initialize logging for the pump.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "framepump=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
