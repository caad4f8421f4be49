//! The encode session: one encoder's buffer-exchange cycle.
//!
//! Owns the selected block encoder, converts pulled frames into its
//! negotiated layout, and exposes the submit/poll halves of the pump. The
//! session is thread-confined to the recording worker.

use crate::codec::{
    BlockEncoder, EncoderRegistry, InputOutcome, OutputEvent, DEQUEUE_TIMEOUT,
};
use crate::convert::{self, PixelLayout};
use crate::errors::PumpError;
use crate::format::{FormatDescriptor, KEY_COLOR_FORMAT};
use crate::source::InputSurface;
use crate::types::{PixelBuffer, SampleUnit, UnitFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Running,
    Draining,
    Closed,
}

/// Drives one encoder through configure / submit / drain / close.
pub struct EncodeSession {
    state: SessionState,
    encoder: Option<Box<dyn BlockEncoder>>,
    encoder_name: &'static str,
    layout: PixelLayout,
    width: u32,
    height: u32,
    negotiated: Option<FormatDescriptor>,
    format_seen: bool,
    eos_seen: bool,
    frames_submitted: u64,
    // Frames are converted here first, then copied into the acquired
    // slot, so a conversion failure never strands a held slot.
    scratch: Vec<u8>,
}

impl EncodeSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unconfigured,
            encoder: None,
            encoder_name: "",
            layout: PixelLayout::Planar,
            width: 0,
            height: 0,
            negotiated: None,
            format_seen: false,
            eos_seen: false,
            frames_submitted: 0,
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn encoder_name(&self) -> &'static str {
        self.encoder_name
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// The negotiated descriptor, once `FormatChanged` has been observed.
    pub fn negotiated(&self) -> Option<&FormatDescriptor> {
        self.negotiated.as_ref()
    }

    /// Whether the terminal end-of-stream unit has been observed.
    pub fn eos_reached(&self) -> bool {
        self.eos_seen
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Select and instantiate an encoder for `request` from the registry.
    ///
    /// `NoSuitableEncoder` aborts this session only; the caller may
    /// retry with a different request or registry.
    pub fn configure(
        &mut self,
        registry: &EncoderRegistry,
        request: &FormatDescriptor,
    ) -> Result<(), PumpError> {
        if self.state != SessionState::Unconfigured {
            return Err(PumpError::invalid_state(
                "session is already configured",
            ));
        }

        // An explicit opaque color-format request selects surface input.
        let wants_surface = request
            .int(KEY_COLOR_FORMAT)
            .and_then(PixelLayout::from_code)
            == Some(PixelLayout::Opaque);

        let (encoder, layout, name) = if wants_surface {
            let entry = registry.select_surface(
                request
                    .mime()
                    .ok_or_else(|| PumpError::no_suitable_encoder("<missing mime>"))?,
            )?;
            let encoder = (entry.factory)(request, PixelLayout::Opaque)?;
            (encoder, PixelLayout::Opaque, entry.name)
        } else {
            registry.create(request)?
        };

        self.width = request.width().unwrap_or(0);
        self.height = request.height().unwrap_or(0);
        self.encoder = Some(encoder);
        self.encoder_name = name;
        self.layout = layout;
        self.state = SessionState::Running;
        log::info!(
            "configured encoder {} ({:?}, {}x{})",
            name,
            layout,
            self.width,
            self.height
        );
        Ok(())
    }

    /// Submit one frame, or the end-of-stream marker when `is_last`.
    ///
    /// The EOS marker is always queued as an empty, zero-length input;
    /// any payload passed alongside `is_last` is dropped with a warning
    /// (payload on the EOS buffer would be silently discarded by the
    /// encoder, shortening the output by one frame).
    pub fn submit_input(
        &mut self,
        frame: Option<&PixelBuffer>,
        is_last: bool,
        pts_us: i64,
    ) -> Result<InputOutcome, PumpError> {
        match self.state {
            SessionState::Unconfigured => {
                return Err(PumpError::invalid_state("session is not configured"))
            }
            SessionState::Draining | SessionState::Closed => {
                return Ok(InputOutcome::AlreadyDone)
            }
            SessionState::Running => {}
        }

        if is_last {
            if frame.is_some() {
                log::warn!("frame payload submitted with end-of-stream; payload dropped");
            }
            let encoder = self.encoder.as_mut().expect("configured session");
            let Some(slot) = encoder.dequeue_input(DEQUEUE_TIMEOUT) else {
                return Ok(InputOutcome::NoSlotAvailable);
            };
            encoder.queue_input(slot, 0, pts_us, UnitFlags::END_OF_STREAM)?;
            self.state = SessionState::Draining;
            log::debug!("sent input EOS (zero-length frame)");
            return Ok(InputOutcome::Submitted);
        }

        let frame = frame.ok_or_else(|| {
            PumpError::Encoding("submit_input called without a frame".to_string())
        })?;

        // Convert before acquiring a slot.
        self.scratch
            .resize(convert::frame_size(self.width, self.height), 0);
        let size = convert::convert_into(
            frame,
            self.layout,
            self.width,
            self.height,
            &mut self.scratch,
        )?;

        let encoder = self.encoder.as_mut().expect("configured session");
        let Some(slot) = encoder.dequeue_input(DEQUEUE_TIMEOUT) else {
            return Ok(InputOutcome::NoSlotAvailable);
        };
        encoder.input_buffer(slot)[..size].copy_from_slice(&self.scratch[..size]);
        encoder.queue_input(slot, size, pts_us, UnitFlags::NONE)?;
        self.frames_submitted += 1;
        log::trace!("submitted frame {} at pts {}us", self.frames_submitted, pts_us);
        Ok(InputOutcome::Submitted)
    }

    /// Submit pre-encoded bytes (e.g. PCM for an audio session) without
    /// pixel conversion.
    pub fn submit_raw(
        &mut self,
        data: &[u8],
        is_last: bool,
        pts_us: i64,
    ) -> Result<InputOutcome, PumpError> {
        match self.state {
            SessionState::Unconfigured => {
                return Err(PumpError::invalid_state("session is not configured"))
            }
            SessionState::Draining | SessionState::Closed => {
                return Ok(InputOutcome::AlreadyDone)
            }
            SessionState::Running => {}
        }

        let encoder = self.encoder.as_mut().expect("configured session");
        let Some(slot) = encoder.dequeue_input(DEQUEUE_TIMEOUT) else {
            return Ok(InputOutcome::NoSlotAvailable);
        };

        if is_last {
            if !data.is_empty() {
                log::warn!("raw payload submitted with end-of-stream; payload dropped");
            }
            encoder.queue_input(slot, 0, pts_us, UnitFlags::END_OF_STREAM)?;
            self.state = SessionState::Draining;
            return Ok(InputOutcome::Submitted);
        }

        let buffer = encoder.input_buffer(slot);
        if data.len() > buffer.len() {
            return Err(PumpError::Encoding(format!(
                "raw input of {} bytes exceeds slot capacity {}",
                data.len(),
                buffer.len()
            )));
        }
        buffer[..data.len()].copy_from_slice(data);
        encoder.queue_input(slot, data.len(), pts_us, UnitFlags::NONE)?;
        self.frames_submitted += 1;
        Ok(InputOutcome::Submitted)
    }

    /// Publish one frame through the opaque input surface (surface-input
    /// sessions only).
    pub fn submit_surface_frame(
        &mut self,
        surface: &mut dyn InputSurface,
        pts_ns: i64,
    ) -> Result<(), PumpError> {
        if self.state != SessionState::Running {
            return Err(PumpError::invalid_state("session is not running"));
        }
        if self.layout != PixelLayout::Opaque {
            return Err(PumpError::invalid_state(
                "session was not configured for surface input",
            ));
        }
        surface.make_current()?;
        surface.set_presentation_time(pts_ns)?;
        surface.swap_buffers()?;
        self.frames_submitted += 1;
        Ok(())
    }

    /// Pull the next output event from the encoder.
    pub fn poll_output(&mut self) -> Result<OutputEvent, PumpError> {
        match self.state {
            SessionState::Unconfigured | SessionState::Closed => {
                return Err(PumpError::invalid_state("session is not running"))
            }
            SessionState::Running | SessionState::Draining => {}
        }

        let encoder = self.encoder.as_mut().expect("configured session");
        let event = encoder.dequeue_output(DEQUEUE_TIMEOUT);
        match &event {
            OutputEvent::FormatChanged(desc) => {
                if self.format_seen {
                    // At most once in ordinary operation; a second one is
                    // a protocol violation worth surfacing loudly.
                    log::warn!("encoder emitted a second format change");
                }
                self.format_seen = true;
                self.negotiated = Some(desc.clone());
                log::debug!("encoder output format changed");
            }
            OutputEvent::BuffersInvalidated => {
                log::debug!("encoder output buffers changed");
            }
            OutputEvent::Unit(unit) => {
                if unit.is_end_of_stream() {
                    self.eos_seen = true;
                }
                if !self.format_seen && unit.is_data() {
                    log::warn!("data unit observed before format change");
                }
            }
            OutputEvent::Fatal(code) => {
                log::error!("unexpected result from encoder drain: {}", code);
            }
            OutputEvent::Empty => {}
        }
        Ok(event)
    }

    /// The bytes of a yielded unit, valid until its slot is released.
    pub fn read_unit(&self, unit: &SampleUnit) -> &[u8] {
        let encoder = self.encoder.as_ref().expect("configured session");
        &encoder.output_buffer(unit.slot)[unit.offset..unit.offset + unit.size]
    }

    /// Return the unit's slot to the encoder pool. Exactly once per
    /// yielded unit, after its bytes have been copied or written.
    pub fn release_unit(&mut self, unit: SampleUnit) -> Result<(), PumpError> {
        let encoder = self.encoder.as_mut().expect("configured session");
        encoder.release_output(unit.slot)
    }

    /// Release the encoder. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            log::debug!("releasing encoder {}", self.encoder_name);
            self.encoder = None;
            self.state = SessionState::Closed;
        }
    }
}

impl Default for EncodeSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncoderEntry;
    use crate::format::{KEY_MIME, MIME_VIDEO_AVC};
    use crate::types::{SlotIndex, SourceFormat};
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    thread_local! {
        // (size, flags) of every queue_input seen by mock encoders on
        // this test thread.
        static QUEUED: RefCell<Vec<(usize, UnitFlags)>> = const { RefCell::new(Vec::new()) };
    }

    /// Recording mock used to observe exactly what the session queues.
    struct RecordingEncoder {
        input: Vec<u8>,
        input_held: bool,
        output: Vec<u8>,
        output_busy: bool,
    }

    impl RecordingEncoder {
        fn new() -> Self {
            Self {
                input: vec![0u8; 64 * 48 * 3 / 2],
                input_held: false,
                output: vec![0xAB; 16],
                output_busy: false,
            }
        }
    }

    impl BlockEncoder for RecordingEncoder {
        fn dequeue_input(&mut self, _timeout: Duration) -> Option<SlotIndex> {
            if self.input_held {
                return None;
            }
            self.input_held = true;
            Some(SlotIndex(0))
        }

        fn input_buffer(&mut self, _slot: SlotIndex) -> &mut [u8] {
            &mut self.input
        }

        fn queue_input(
            &mut self,
            _slot: SlotIndex,
            size: usize,
            _pts_us: i64,
            flags: UnitFlags,
        ) -> Result<(), PumpError> {
            self.input_held = false;
            QUEUED.with(|q| q.borrow_mut().push((size, flags)));
            Ok(())
        }

        fn dequeue_output(&mut self, _timeout: Duration) -> OutputEvent {
            OutputEvent::Empty
        }

        fn output_buffer(&self, _slot: SlotIndex) -> &[u8] {
            &self.output
        }

        fn release_output(&mut self, _slot: SlotIndex) -> Result<(), PumpError> {
            if !self.output_busy {
                return Err(PumpError::invalid_state("slot not held"));
            }
            self.output_busy = false;
            Ok(())
        }
    }

    fn mock_registry() -> EncoderRegistry {
        fn factory(
            _request: &FormatDescriptor,
            _layout: PixelLayout,
        ) -> Result<Box<dyn BlockEncoder>, PumpError> {
            Ok(Box::new(RecordingEncoder::new()))
        }

        QUEUED.with(|q| q.borrow_mut().clear());
        let mut registry = EncoderRegistry::empty();
        registry.register(EncoderEntry {
            name: "mock",
            mime: MIME_VIDEO_AVC,
            layouts: vec![PixelLayout::Planar],
            factory,
        });
        registry
    }

    fn gray_frame(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer {
            format: SourceFormat::Argb,
            width,
            height,
            data: vec![0x80; (width * height * 4) as usize],
        }
    }

    #[test]
    fn test_configure_with_empty_registry_aborts_session_only() {
        let registry = EncoderRegistry::empty();
        let request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        let mut session = EncodeSession::new();

        let err = session.configure(&registry, &request).unwrap_err();
        assert!(matches!(err, PumpError::NoSuitableEncoder(_)));
        assert_eq!(session.state(), SessionState::Unconfigured);

        // No encoder was touched; further calls report the contract.
        assert!(session.submit_input(None, true, 0).is_err());
        assert!(session.poll_output().is_err());
    }

    #[test]
    fn test_eos_is_queued_as_zero_length() {
        let registry = mock_registry();
        let request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        let mut session = EncodeSession::new();
        session.configure(&registry, &request).unwrap();

        let frame = gray_frame(64, 48);
        session.submit_input(Some(&frame), false, 132).unwrap();
        session.submit_input(Some(&frame), true, 66_798).unwrap();

        QUEUED.with(|q| {
            let queued = q.borrow();
            assert_eq!(queued.len(), 2);
            assert_eq!(queued[0].0, 64 * 48 * 3 / 2);
            assert!(!queued[0].1.is_end_of_stream());
            // The EOS buffer carries no payload, whatever the caller
            // passed alongside it.
            assert_eq!(queued[1].0, 0);
            assert!(queued[1].1.is_end_of_stream());
        });
    }

    #[test]
    fn test_submit_before_configure_is_invalid_state() {
        let mut session = EncodeSession::new();
        let frame = gray_frame(64, 48);
        let err = session.submit_input(Some(&frame), false, 0).unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
    }

    #[test]
    fn test_eos_payload_never_reaches_encoder() {
        let registry = mock_registry();
        let request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        let mut session = EncodeSession::new();
        session.configure(&registry, &request).unwrap();

        let frame = gray_frame(64, 48);
        let outcome = session.submit_input(Some(&frame), true, 1_000).unwrap();
        assert_eq!(outcome, InputOutcome::Submitted);
        assert_eq!(session.state(), SessionState::Draining);

        // Submissions after EOS are AlreadyDone, not errors.
        let outcome = session.submit_input(Some(&frame), false, 2_000).unwrap();
        assert_eq!(outcome, InputOutcome::AlreadyDone);
    }

    #[test]
    fn test_surface_input_requires_opaque_layout() {
        struct CountingSurface {
            calls: Arc<AtomicU64>,
        }
        impl InputSurface for CountingSurface {
            fn make_current(&mut self) -> Result<(), PumpError> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            fn set_presentation_time(&mut self, _pts_ns: i64) -> Result<(), PumpError> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            fn swap_buffers(&mut self) -> Result<(), PumpError> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let registry = mock_registry();
        let request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        let mut session = EncodeSession::new();
        session.configure(&registry, &request).unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let mut surface = CountingSurface {
            calls: calls.clone(),
        };
        let err = session
            .submit_surface_frame(&mut surface, 1_000_000)
            .unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_surface_input_drives_the_surface() {
        struct FlagSurface {
            swapped: bool,
            pts_ns: i64,
        }
        impl InputSurface for FlagSurface {
            fn make_current(&mut self) -> Result<(), PumpError> {
                Ok(())
            }
            fn set_presentation_time(&mut self, pts_ns: i64) -> Result<(), PumpError> {
                self.pts_ns = pts_ns;
                Ok(())
            }
            fn swap_buffers(&mut self) -> Result<(), PumpError> {
                self.swapped = true;
                Ok(())
            }
        }

        fn factory(
            _request: &FormatDescriptor,
            _layout: PixelLayout,
        ) -> Result<Box<dyn BlockEncoder>, PumpError> {
            Ok(Box::new(RecordingEncoder::new()))
        }

        let mut registry = EncoderRegistry::empty();
        registry.register(EncoderEntry {
            name: "surface-capable",
            mime: MIME_VIDEO_AVC,
            layouts: vec![PixelLayout::Opaque],
            factory,
        });

        let mut request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        request.set_int(
            crate::format::KEY_COLOR_FORMAT,
            PixelLayout::Opaque.code(),
        );

        let mut session = EncodeSession::new();
        session.configure(&registry, &request).unwrap();
        assert_eq!(session.layout(), PixelLayout::Opaque);

        let mut surface = FlagSurface {
            swapped: false,
            pts_ns: 0,
        };
        session
            .submit_surface_frame(&mut surface, 132_000)
            .unwrap();
        assert!(surface.swapped);
        assert_eq!(surface.pts_ns, 132_000);
        assert_eq!(session.frames_submitted(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = mock_registry();
        let request = FormatDescriptor::video(MIME_VIDEO_AVC, 64, 48);
        let mut session = EncodeSession::new();
        session.configure(&registry, &request).unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_missing_mime_is_no_suitable_encoder() {
        let registry = EncoderRegistry::with_defaults();
        let mut request = FormatDescriptor::new();
        request.set_int(crate::format::KEY_WIDTH, 64);
        assert!(request.str_value(KEY_MIME).is_none());

        let mut session = EncodeSession::new();
        let err = session.configure(&registry, &request).unwrap_err();
        assert!(matches!(err, PumpError::NoSuitableEncoder(_)));
    }
}
