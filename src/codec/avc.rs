//! H.264 block encoder backed by openh264.
//!
//! Wraps the synchronous openh264 encoder behind the slot-pool exchange
//! protocol: a fixed pool of input frame buffers, a fixed pool of output
//! buffers, and a pending-event queue that yields the format-changed
//! notification and the codec-config unit ahead of the first data unit.

use std::collections::VecDeque;
use std::time::Duration;

use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::convert::{frame_size, PixelLayout};
use crate::errors::PumpError;
use crate::format::{FormatDescriptor, KEY_COLOR_FORMAT, KEY_CSD_0, KEY_CSD_1};
use crate::types::{SampleUnit, SlotIndex, UnitFlags};

use super::{BlockEncoder, OutputEvent};

/// Input slots in the reusable pool.
pub const INPUT_SLOTS: usize = 4;
/// Output slots in the reusable pool.
pub const OUTPUT_SLOTS: usize = 4;

enum Pending {
    Format(FormatDescriptor),
    Unit {
        data: Vec<u8>,
        pts_us: i64,
        flags: UnitFlags,
    },
}

/// openh264-backed implementation of the buffer-exchange protocol.
pub struct AvcEncoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    request: FormatDescriptor,
    layout: PixelLayout,
    input_slots: Vec<Vec<u8>>,
    input_free: Vec<bool>,
    output_slots: Vec<Vec<u8>>,
    output_busy: Vec<bool>,
    pending: VecDeque<Pending>,
    format_emitted: bool,
    input_done: bool,
    fatal: Option<i32>,
}

impl std::fmt::Debug for AvcEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvcEncoder")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("format_emitted", &self.format_emitted)
            .field("input_done", &self.input_done)
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}

impl AvcEncoder {
    pub fn new(request: &FormatDescriptor, layout: PixelLayout) -> Result<Self, PumpError> {
        if layout.is_semi_planar()? {
            return Err(PumpError::unsupported_format(
                "AVC encoder consumes planar YUV420 input only",
            ));
        }
        let width = request
            .width()
            .ok_or_else(|| PumpError::Encoding("request descriptor missing width".to_string()))?;
        let height = request
            .height()
            .ok_or_else(|| PumpError::Encoding("request descriptor missing height".to_string()))?;

        let encoder = Encoder::new()
            .map_err(|e| PumpError::Encoding(format!("failed to create encoder: {}", e)))?;

        let slot_size = frame_size(width, height);
        Ok(Self {
            encoder,
            width,
            height,
            request: request.clone(),
            layout,
            input_slots: vec![vec![0u8; slot_size]; INPUT_SLOTS],
            input_free: vec![true; INPUT_SLOTS],
            output_slots: vec![Vec::new(); OUTPUT_SLOTS],
            output_busy: vec![false; OUTPUT_SLOTS],
            pending: VecDeque::new(),
            format_emitted: false,
            input_done: false,
            fatal: None,
        })
    }

    fn negotiated_descriptor(&self, sps: &[u8], pps: &[u8]) -> FormatDescriptor {
        let mut desc = self.request.clone();
        desc.set_int(KEY_COLOR_FORMAT, self.layout.code());
        desc.set_bytes(KEY_CSD_0, sps.to_vec());
        desc.set_bytes(KEY_CSD_1, pps.to_vec());
        desc
    }

    fn encode_slot(&mut self, slot: usize, size: usize, pts_us: i64) -> Result<(), PumpError> {
        let frame = self.input_slots[slot][..size].to_vec();
        let yuv = YUVBuffer::from_vec(frame, self.width as usize, self.height as usize);

        let bitstream = match self.encoder.encode(&yuv) {
            Ok(bs) => bs,
            Err(e) => {
                // Surface the hard error through the drain side, like a
                // hardware codec would.
                log::error!("encode failed: {}", e);
                self.fatal = Some(-1);
                return Ok(());
            }
        };

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();

        if !self.format_emitted {
            let (sps, pps) = extract_parameter_sets(&data);
            self.pending
                .push_back(Pending::Format(self.negotiated_descriptor(&sps, &pps)));

            // The codec-config unit: parameter sets with start codes, no
            // timestamp semantics, never forwarded to the muxer.
            let mut config = Vec::with_capacity(sps.len() + pps.len() + 8);
            for nal in [&sps, &pps] {
                if !nal.is_empty() {
                    config.extend_from_slice(&[0, 0, 0, 1]);
                    config.extend_from_slice(nal);
                }
            }
            self.pending.push_back(Pending::Unit {
                data: config,
                pts_us: 0,
                flags: UnitFlags::CODEC_CONFIG,
            });
            self.format_emitted = true;
        }

        let flags = if is_keyframe {
            UnitFlags::KEY_FRAME
        } else {
            UnitFlags::NONE
        };
        self.pending.push_back(Pending::Unit {
            data,
            pts_us,
            flags,
        });
        Ok(())
    }
}

impl BlockEncoder for AvcEncoder {
    fn dequeue_input(&mut self, _timeout: Duration) -> Option<SlotIndex> {
        // Input slots recycle synchronously, so the bounded wait never
        // has to sleep: a slot is either free now or the pool is starved.
        let slot = self.input_free.iter().position(|&free| free)?;
        self.input_free[slot] = false;
        Some(SlotIndex(slot))
    }

    fn input_buffer(&mut self, slot: SlotIndex) -> &mut [u8] {
        &mut self.input_slots[slot.index()]
    }

    fn queue_input(
        &mut self,
        slot: SlotIndex,
        size: usize,
        pts_us: i64,
        flags: UnitFlags,
    ) -> Result<(), PumpError> {
        let idx = slot.index();
        if idx >= INPUT_SLOTS || self.input_free[idx] {
            return Err(PumpError::invalid_state(format!(
                "input slot {} was not acquired",
                idx
            )));
        }
        if self.input_done {
            self.input_free[idx] = true;
            return Err(PumpError::invalid_state(
                "input already finished with end-of-stream",
            ));
        }

        let result = if flags.is_end_of_stream() {
            if size > 0 {
                // Mirrors the hardware behavior the session layer guards
                // against: payload on the EOS buffer is not encoded.
                log::warn!("end-of-stream input carried {} bytes; payload dropped", size);
            }
            self.input_done = true;
            self.pending.push_back(Pending::Unit {
                data: Vec::new(),
                pts_us,
                flags: UnitFlags::END_OF_STREAM,
            });
            Ok(())
        } else if size != frame_size(self.width, self.height) {
            Err(PumpError::Encoding(format!(
                "invalid input size: expected {} bytes, got {}",
                frame_size(self.width, self.height),
                size
            )))
        } else {
            self.encode_slot(idx, size, pts_us)
        };

        self.input_free[idx] = true;
        result
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> OutputEvent {
        if let Some(code) = self.fatal {
            return OutputEvent::Fatal(code);
        }

        match self.pending.front() {
            None => OutputEvent::Empty,
            Some(Pending::Format(_)) => {
                if let Some(Pending::Format(desc)) = self.pending.pop_front() {
                    OutputEvent::FormatChanged(desc)
                } else {
                    OutputEvent::Empty
                }
            }
            Some(Pending::Unit { .. }) => {
                let Some(free) = self.output_busy.iter().position(|&busy| !busy) else {
                    // Every output slot is held by the caller; the unit
                    // stays queued until one is released.
                    log::debug!("no free output slot; pending unit deferred");
                    return OutputEvent::Empty;
                };
                let Some(Pending::Unit {
                    data,
                    pts_us,
                    flags,
                }) = self.pending.pop_front()
                else {
                    return OutputEvent::Empty;
                };

                let size = data.len();
                self.output_slots[free].clear();
                self.output_slots[free].extend_from_slice(&data);
                self.output_busy[free] = true;
                OutputEvent::Unit(SampleUnit {
                    slot: SlotIndex(free),
                    offset: 0,
                    size,
                    pts_us,
                    flags,
                })
            }
        }
    }

    fn output_buffer(&self, slot: SlotIndex) -> &[u8] {
        &self.output_slots[slot.index()]
    }

    fn release_output(&mut self, slot: SlotIndex) -> Result<(), PumpError> {
        let idx = slot.index();
        if idx >= OUTPUT_SLOTS || !self.output_busy[idx] {
            return Err(PumpError::invalid_state(format!(
                "output slot {} is not held",
                idx
            )));
        }
        self.output_busy[idx] = false;
        Ok(())
    }
}

/// Locate SPS and PPS NAL payloads (without start codes) in an Annex B
/// bitstream.
fn extract_parameter_sets(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut sps = Vec::new();
    let mut pps = Vec::new();
    for (start, end) in nal_ranges(data) {
        if start >= end {
            continue;
        }
        match data[start] & 0x1F {
            7 => sps = data[start..end].to_vec(),
            8 => pps = data[start..end].to_vec(),
            _ => {}
        }
    }
    (sps, pps)
}

/// Payload byte ranges of each NAL unit in an Annex B stream.
fn nal_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for n in 0..starts.len() {
        let (_, payload) = starts[n];
        let end = match starts.get(n + 1) {
            Some(&(next_prefix, _)) => next_prefix,
            None => data.len(),
        };
        ranges.push((payload, end));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEQUEUE_TIMEOUT;
    use crate::format::MIME_VIDEO_AVC;

    fn request(width: u32, height: u32) -> FormatDescriptor {
        FormatDescriptor::video(MIME_VIDEO_AVC, width, height)
    }

    fn gray_frame(width: u32, height: u32) -> Vec<u8> {
        let mut yuv = vec![128u8; frame_size(width, height)];
        for y in yuv.iter_mut().take((width * height) as usize) {
            *y = 100;
        }
        yuv
    }

    fn submit_frame(enc: &mut AvcEncoder, frame: &[u8], pts_us: i64) {
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).expect("input slot");
        enc.input_buffer(slot)[..frame.len()].copy_from_slice(frame);
        enc.queue_input(slot, frame.len(), pts_us, UnitFlags::NONE)
            .expect("queue");
    }

    #[test]
    fn test_encoder_creation() {
        assert!(AvcEncoder::new(&request(320, 240), PixelLayout::Planar).is_ok());
    }

    #[test]
    fn test_semi_planar_layout_rejected() {
        let err = AvcEncoder::new(&request(320, 240), PixelLayout::SemiPlanar).unwrap_err();
        assert!(matches!(err, PumpError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_format_then_config_then_data() {
        let mut enc = AvcEncoder::new(&request(320, 240), PixelLayout::Planar).unwrap();
        submit_frame(&mut enc, &gray_frame(320, 240), 132);

        let OutputEvent::FormatChanged(desc) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected format-changed first");
        };
        assert_eq!(desc.int(KEY_COLOR_FORMAT), Some(PixelLayout::Planar.code()));
        assert!(!desc.bytes(KEY_CSD_0).unwrap_or_default().is_empty());

        let OutputEvent::Unit(config) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected config unit second");
        };
        assert!(config.is_config());
        enc.release_output(config.slot).unwrap();

        let OutputEvent::Unit(data) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected data unit third");
        };
        assert!(data.is_data());
        assert!(data.flags.is_key_frame(), "first frame must be a keyframe");
        assert!(data.size > 0);
        // Annex B start code at the front of the payload.
        let bytes = enc.output_buffer(data.slot);
        assert!(bytes.starts_with(&[0, 0, 0, 1]) || bytes.starts_with(&[0, 0, 1]));
        enc.release_output(data.slot).unwrap();
    }

    #[test]
    fn test_eos_is_terminal_zero_size() {
        let mut enc = AvcEncoder::new(&request(320, 240), PixelLayout::Planar).unwrap();
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        enc.queue_input(slot, 0, 500_000, UnitFlags::END_OF_STREAM)
            .unwrap();

        let OutputEvent::Unit(eos) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected EOS unit");
        };
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.size, 0);
        enc.release_output(eos.slot).unwrap();

        // Further input is refused.
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        let err = enc
            .queue_input(slot, 0, 600_000, UnitFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
    }

    #[test]
    fn test_eos_payload_is_dropped() {
        let mut enc = AvcEncoder::new(&request(320, 240), PixelLayout::Planar).unwrap();
        let frame = gray_frame(320, 240);
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        enc.input_buffer(slot)[..frame.len()].copy_from_slice(&frame);
        enc.queue_input(slot, frame.len(), 132, UnitFlags::END_OF_STREAM)
            .unwrap();

        // Only the zero-size EOS marker comes out; the payload never
        // became a data unit (and no format was negotiated).
        let OutputEvent::Unit(eos) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected EOS unit");
        };
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.size, 0);
        enc.release_output(eos.slot).unwrap();
        assert!(matches!(
            enc.dequeue_output(DEQUEUE_TIMEOUT),
            OutputEvent::Empty
        ));
    }

    #[test]
    fn test_output_pool_starvation_defers_units() {
        let mut enc = AvcEncoder::new(&request(320, 240), PixelLayout::Planar).unwrap();
        let frame = gray_frame(320, 240);
        for i in 0..(OUTPUT_SLOTS as i64 + 2) {
            submit_frame(&mut enc, &frame, 132 + i * 66_666);
        }

        // Hold every yielded unit without releasing; the pool runs dry.
        let mut held = Vec::new();
        loop {
            match enc.dequeue_output(DEQUEUE_TIMEOUT) {
                OutputEvent::Unit(unit) => held.push(unit),
                OutputEvent::FormatChanged(_) => {}
                OutputEvent::Empty => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(held.len(), OUTPUT_SLOTS);

        // Releasing one slot lets the next pending unit through.
        enc.release_output(held.pop().unwrap().slot).unwrap();
        assert!(matches!(
            enc.dequeue_output(DEQUEUE_TIMEOUT),
            OutputEvent::Unit(_)
        ));
    }

    #[test]
    fn test_double_release_rejected() {
        let mut enc = AvcEncoder::new(&request(320, 240), PixelLayout::Planar).unwrap();
        submit_frame(&mut enc, &gray_frame(320, 240), 132);

        // Skip format, take the config unit.
        let _ = enc.dequeue_output(DEQUEUE_TIMEOUT);
        let OutputEvent::Unit(unit) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected unit");
        };
        enc.release_output(unit.slot).unwrap();
        assert!(enc.release_output(unit.slot).is_err());
    }

    #[test]
    fn test_nal_ranges_both_prefix_lengths() {
        let data = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB];
        let ranges = nal_ranges(&data);
        assert_eq!(ranges, vec![(4, 6), (9, 11)]);

        let (sps, pps) = extract_parameter_sets(&data);
        assert_eq!(sps, vec![0x67, 0xAA]);
        assert_eq!(pps, vec![0x68, 0xBB]);
    }
}
