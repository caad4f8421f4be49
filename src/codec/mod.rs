//! The block-encoder buffer-exchange protocol.
//!
//! A [`BlockEncoder`] owns two fixed pools of reusable byte buffers
//! addressed by [`SlotIndex`]. The pump acquires an input slot, fills it,
//! queues it back, and drains output events one at a time. Output slots
//! travel inside [`SampleUnit`]s and must be released exactly once after
//! the bytes have been consumed; a skipped release starves the pool and
//! stalls the pipeline.

use std::time::Duration;

use crate::errors::PumpError;
use crate::format::FormatDescriptor;
use crate::types::{SampleUnit, SlotIndex, UnitFlags};

pub mod avc;
#[cfg(feature = "audio")]
pub mod opus;
pub mod registry;

pub use registry::{EncoderEntry, EncoderRegistry};

/// Bounded wait for acquiring an input slot or an output event.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// Outcome of submitting one input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Submitted,
    /// No input slot freed up within the bounded wait; retry next poll.
    NoSlotAvailable,
    /// The end-of-stream marker was already queued.
    AlreadyDone,
}

/// One output event from the encoder's drain side.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Nothing ready within the bounded wait; routine, retry next poll.
    Empty,
    /// The negotiated format is known. Emitted exactly once, strictly
    /// before any data-bearing unit, and is the only descriptor a muxer
    /// track may be registered with.
    FormatChanged(FormatDescriptor),
    /// The output pool's identity changed; cached slot references are
    /// stale and must be dropped. Recoverable, not an error.
    BuffersInvalidated,
    /// One encoded access unit. The caller owns the backing slot until it
    /// calls `release_output`.
    Unit(SampleUnit),
    /// Encoder hard error; the session is dead.
    Fatal(i32),
}

/// The buffer-exchange boundary of a block-oriented encoder.
///
/// Implementations are driven from a single thread; the trait is `Send`
/// so a session can move to its worker.
pub trait BlockEncoder: Send {
    /// Acquire a free input slot, waiting at most `timeout`.
    fn dequeue_input(&mut self, timeout: Duration) -> Option<SlotIndex>;

    /// The writable bytes of an acquired input slot.
    fn input_buffer(&mut self, slot: SlotIndex) -> &mut [u8];

    /// Hand a filled input slot back to the encoder. A zero-size queue
    /// with [`UnitFlags::END_OF_STREAM`] is the flush request; payload
    /// queued together with the flag is dropped (see the session layer,
    /// which refuses to do this).
    fn queue_input(
        &mut self,
        slot: SlotIndex,
        size: usize,
        pts_us: i64,
        flags: UnitFlags,
    ) -> Result<(), PumpError>;

    /// Pull the next output event, waiting at most `timeout`.
    fn dequeue_output(&mut self, timeout: Duration) -> OutputEvent;

    /// The readable bytes of an output slot currently held by the caller.
    fn output_buffer(&self, slot: SlotIndex) -> &[u8];

    /// Return an output slot to the pool. Exactly once per yielded unit.
    fn release_output(&mut self, slot: SlotIndex) -> Result<(), PumpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequeue_timeout_matches_protocol() {
        assert_eq!(DEQUEUE_TIMEOUT, Duration::from_millis(10));
    }

    #[test]
    fn test_outcome_equality() {
        assert_eq!(InputOutcome::Submitted, InputOutcome::Submitted);
        assert_ne!(InputOutcome::Submitted, InputOutcome::NoSlotAvailable);
    }
}
