//! Single-slot latest-frame mailbox between a capture thread and the
//! recording worker.
//!
//! The push side overwrites any unconsumed frame (latest wins) and
//! notifies; the pull side waits a bounded 2.5 s and then proceeds with a
//! logged missed-frame condition rather than blocking forever on a
//! stalled capture source.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::PumpError;
use crate::types::PixelBuffer;

use super::{FramePull, FrameSource};

/// Bounded wait for the next pushed frame.
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_millis(2500);

struct Slot {
    frame: Option<PixelBuffer>,
    closed: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    cv: Condvar,
}

/// Push half: handed to the capture callback thread.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Deposit the latest frame, replacing any unconsumed one. Returns
    /// false once the mailbox is closed.
    pub fn offer(&self, frame: PixelBuffer) -> bool {
        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        if slot.closed {
            return false;
        }
        if slot.frame.is_some() {
            log::debug!("unconsumed frame replaced in mailbox");
        }
        slot.frame = Some(frame);
        self.shared.cv.notify_all();
        true
    }

    /// End the stream; the pull side observes `End` once the slot is
    /// drained.
    pub fn close(&self) {
        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        slot.closed = true;
        self.shared.cv.notify_all();
    }
}

/// Pull half: owned by the recording worker.
pub struct MailboxSource {
    shared: Arc<Shared>,
    wait_timeout: Duration,
}

impl MailboxSource {
    /// Override the bounded wait (tests use a short one).
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

impl FrameSource for MailboxSource {
    fn pull(&mut self, _pts_us: i64) -> Result<FramePull, PumpError> {
        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(frame) = slot.frame.take() {
                return Ok(FramePull::Frame(frame));
            }
            if slot.closed {
                return Ok(FramePull::End);
            }
            let now = Instant::now();
            if now >= deadline {
                // Liveness over completeness: log and let the loop spin.
                log::error!("frame wait timed out");
                return Ok(FramePull::Pending);
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(slot, deadline - now)
                .expect("lock poisoned");
            slot = guard;
        }
    }
}

/// Create a connected (push, pull) mailbox pair.
pub fn frame_mailbox() -> (FrameSender, MailboxSource) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            frame: None,
            closed: false,
        }),
        cv: Condvar::new(),
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        MailboxSource {
            shared,
            wait_timeout: FRAME_WAIT_TIMEOUT,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_frame(tag: u8) -> PixelBuffer {
        PixelBuffer::argb(vec![tag; 2 * 2 * 4], 2, 2)
    }

    #[test]
    fn test_offer_then_pull() {
        let (sender, mut source) = frame_mailbox();
        assert!(sender.offer(test_frame(1)));
        match source.pull(0).unwrap() {
            FramePull::Frame(frame) => assert_eq!(frame.data[0], 1),
            other => panic!("unexpected pull result: {:?}", other),
        }
    }

    #[test]
    fn test_latest_frame_wins() {
        let (sender, mut source) = frame_mailbox();
        sender.offer(test_frame(1));
        sender.offer(test_frame(2));
        match source.pull(0).unwrap() {
            FramePull::Frame(frame) => assert_eq!(frame.data[0], 2),
            other => panic!("unexpected pull result: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_returns_pending() {
        let (_sender, source) = frame_mailbox();
        let mut source = source.with_wait_timeout(Duration::from_millis(20));
        assert!(matches!(source.pull(0).unwrap(), FramePull::Pending));
    }

    #[test]
    fn test_close_yields_end_after_drain() {
        let (sender, mut source) = frame_mailbox();
        sender.offer(test_frame(7));
        sender.close();
        assert!(matches!(source.pull(0).unwrap(), FramePull::Frame(_)));
        assert!(matches!(source.pull(0).unwrap(), FramePull::End));
        assert!(!sender.offer(test_frame(8)));
    }

    #[test]
    fn test_cross_thread_handoff() {
        let (sender, mut source) = frame_mailbox();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.offer(test_frame(9));
            sender.close();
        });

        match source.pull(0).unwrap() {
            FramePull::Frame(frame) => assert_eq!(frame.data[0], 9),
            other => panic!("unexpected pull result: {:?}", other),
        }
        assert!(matches!(source.pull(0).unwrap(), FramePull::End));
        producer.join().unwrap();
    }
}
