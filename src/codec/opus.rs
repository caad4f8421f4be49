//! Opus block encoder backed by raw libopus.
//!
//! Input slots carry interleaved f32 PCM (little-endian bytes); output
//! units are raw Opus packets. Follows the same slot-pool protocol as the
//! video encoder, with output timestamps derived from the running sample
//! count rather than the input pts.

use std::collections::VecDeque;
use std::time::Duration;

use crate::errors::PumpError;
use crate::format::{FormatDescriptor, KEY_BITRATE, KEY_CHANNEL_COUNT, KEY_SAMPLE_RATE};
use crate::types::{SampleUnit, SlotIndex, UnitFlags};

use super::{BlockEncoder, OutputEvent};

/// Opus frame size in samples per channel at 48 kHz (20 ms).
const OPUS_FRAME_SAMPLES: usize = 960;

/// Value 2049 = OPUS_APPLICATION_AUDIO (music/mixed content).
const OPUS_APPLICATION_AUDIO: i32 = 2049;

/// Max Opus packet size.
const MAX_PACKET_SIZE: usize = 4000;

/// Input slot capacity in bytes (one slot holds up to 85 ms of stereo
/// f32 PCM, comfortably above typical capture callback sizes).
const INPUT_SLOT_SIZE: usize = 32768;

const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 4;

struct PendingUnit {
    data: Vec<u8>,
    pts_us: i64,
    flags: UnitFlags,
}

/// libopus-backed implementation of the buffer-exchange protocol.
///
/// The raw encoder pointer is owned exclusively by this struct and only
/// touched from whichever single thread holds it; `Sync` is deliberately
/// not implemented.
pub struct OpusBlockEncoder {
    encoder: *mut libopus_sys::OpusEncoder,
    sample_rate: u32,
    channels: u16,
    request: FormatDescriptor,
    input_slots: Vec<Vec<u8>>,
    input_free: Vec<bool>,
    output_slots: Vec<Vec<u8>>,
    output_busy: Vec<bool>,
    sample_buffer: Vec<f32>,
    samples_encoded: u64,
    pending: VecDeque<PendingUnit>,
    format_emitted: bool,
    input_done: bool,
    fatal: Option<i32>,
}

// SAFETY: the raw pointer is memory allocated by libopus; libopus
// encoders are safe to use from any single thread, the struct is not
// Sync, and ownership hands the encoder to at most one thread at a time.
unsafe impl Send for OpusBlockEncoder {}

impl OpusBlockEncoder {
    pub fn new(request: &FormatDescriptor) -> Result<Self, PumpError> {
        let sample_rate = request
            .int(KEY_SAMPLE_RATE)
            .unwrap_or(48000) as u32;
        let channels = request.int(KEY_CHANNEL_COUNT).unwrap_or(2) as u16;
        let bitrate = request.int(KEY_BITRATE).unwrap_or(128_000) as u32;

        if sample_rate != 48000 {
            return Err(PumpError::unsupported_format(
                "Opus requires a 48000 Hz sample rate",
            ));
        }
        if channels != 1 && channels != 2 {
            return Err(PumpError::unsupported_format(
                "Opus supports only mono (1) or stereo (2) channels",
            ));
        }

        let mut error: i32 = 0;
        let encoder = unsafe {
            libopus_sys::opus_encoder_create(
                sample_rate as i32,
                channels as i32,
                OPUS_APPLICATION_AUDIO,
                &mut error,
            )
        };
        if encoder.is_null() || error != 0 {
            return Err(PumpError::Encoding(format!(
                "failed to create Opus encoder: error code {}",
                error
            )));
        }

        let result = unsafe {
            libopus_sys::opus_encoder_ctl(
                encoder,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                bitrate as i32,
            )
        };
        if result != 0 {
            unsafe { libopus_sys::opus_encoder_destroy(encoder) };
            return Err(PumpError::Encoding(format!(
                "failed to set bitrate: error code {}",
                result
            )));
        }

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            request: request.clone(),
            input_slots: vec![vec![0u8; INPUT_SLOT_SIZE]; INPUT_SLOTS],
            input_free: vec![true; INPUT_SLOTS],
            output_slots: vec![Vec::new(); OUTPUT_SLOTS],
            output_busy: vec![false; OUTPUT_SLOTS],
            sample_buffer: Vec::with_capacity(OPUS_FRAME_SAMPLES * 4),
            samples_encoded: 0,
            pending: VecDeque::new(),
            format_emitted: false,
            input_done: false,
            fatal: None,
        })
    }

    /// Encode as many complete 20 ms frames as the buffer holds.
    fn drain_sample_buffer(&mut self) -> Result<(), PumpError> {
        let samples_per_frame = OPUS_FRAME_SAMPLES * self.channels as usize;
        while self.sample_buffer.len() >= samples_per_frame {
            let frame: Vec<f32> = self.sample_buffer.drain(..samples_per_frame).collect();
            let pts_us =
                (self.samples_encoded as i64) * 1_000_000 / self.sample_rate as i64;

            let mut output = vec![0u8; MAX_PACKET_SIZE];
            let len = unsafe {
                libopus_sys::opus_encode_float(
                    self.encoder,
                    frame.as_ptr(),
                    OPUS_FRAME_SAMPLES as i32,
                    output.as_mut_ptr(),
                    output.len() as i32,
                )
            };
            if len < 0 {
                log::error!("Opus encoding failed: error code {}", len);
                self.fatal = Some(len);
                return Ok(());
            }
            output.truncate(len as usize);

            self.pending.push_back(PendingUnit {
                data: output,
                pts_us,
                flags: UnitFlags::NONE,
            });
            self.samples_encoded += OPUS_FRAME_SAMPLES as u64;
        }
        Ok(())
    }

    /// Pad the tail to a full frame and encode it.
    fn flush(&mut self) -> Result<(), PumpError> {
        let samples_per_frame = OPUS_FRAME_SAMPLES * self.channels as usize;
        if !self.sample_buffer.is_empty() {
            let padding = samples_per_frame - (self.sample_buffer.len() % samples_per_frame);
            if padding < samples_per_frame {
                self.sample_buffer.extend(std::iter::repeat(0.0f32).take(padding));
            }
            self.drain_sample_buffer()?;
        }
        Ok(())
    }
}

impl BlockEncoder for OpusBlockEncoder {
    fn dequeue_input(&mut self, _timeout: Duration) -> Option<SlotIndex> {
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
                log::warn!("end-of-stream input carried {} bytes; payload dropped", size);
            }
            self.input_done = true;
            let flush_result = self.flush();
            self.pending.push_back(PendingUnit {
                data: Vec::new(),
                pts_us,
                flags: UnitFlags::END_OF_STREAM,
            });
            flush_result
        } else if size % 4 != 0 {
            Err(PumpError::Encoding(format!(
                "PCM input must be whole f32 samples, got {} bytes",
                size
            )))
        } else {
            let bytes = &self.input_slots[idx][..size];
            let mut samples = Vec::with_capacity(size / 4);
            for chunk in bytes.chunks_exact(4) {
                samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            self.sample_buffer.extend_from_slice(&samples);
            self.drain_sample_buffer()
        };

        self.input_free[idx] = true;
        result
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> OutputEvent {
        if let Some(code) = self.fatal {
            return OutputEvent::Fatal(code);
        }
        if !self.format_emitted && !self.pending.is_empty() {
            self.format_emitted = true;
            let mut desc = self.request.clone();
            desc.set_int(KEY_SAMPLE_RATE, self.sample_rate as i64);
            desc.set_int(KEY_CHANNEL_COUNT, self.channels as i64);
            return OutputEvent::FormatChanged(desc);
        }

        if self.pending.is_empty() {
            return OutputEvent::Empty;
        }
        let Some(free) = self.output_busy.iter().position(|&busy| !busy) else {
            log::debug!("no free output slot; pending unit deferred");
            return OutputEvent::Empty;
        };
        let Some(PendingUnit {
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

impl Drop for OpusBlockEncoder {
    fn drop(&mut self) {
        if !self.encoder.is_null() {
            unsafe {
                libopus_sys::opus_encoder_destroy(self.encoder);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEQUEUE_TIMEOUT;
    use crate::format::MIME_AUDIO_OPUS;

    fn request() -> FormatDescriptor {
        FormatDescriptor::audio(MIME_AUDIO_OPUS, 48000, 2)
    }

    fn pcm_bytes(samples: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples * 2 * 4);
        for i in 0..samples * 2 {
            let value = ((i as f32) * 0.001).sin() * 0.3;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_rejects_wrong_sample_rate() {
        let req = FormatDescriptor::audio(MIME_AUDIO_OPUS, 44100, 2);
        assert!(OpusBlockEncoder::new(&req).is_err());
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let req = FormatDescriptor::audio(MIME_AUDIO_OPUS, 48000, 5);
        assert!(OpusBlockEncoder::new(&req).is_err());
    }

    #[test]
    fn test_full_frame_produces_packet() {
        let mut enc = OpusBlockEncoder::new(&request()).unwrap();
        let bytes = pcm_bytes(OPUS_FRAME_SAMPLES);
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        enc.input_buffer(slot)[..bytes.len()].copy_from_slice(&bytes);
        enc.queue_input(slot, bytes.len(), 0, UnitFlags::NONE).unwrap();

        let OutputEvent::FormatChanged(desc) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected format-changed first");
        };
        assert_eq!(desc.int(KEY_SAMPLE_RATE), Some(48000));

        let OutputEvent::Unit(unit) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected packet");
        };
        assert!(unit.size > 0);
        enc.release_output(unit.slot).unwrap();
    }

    #[test]
    fn test_partial_frame_held_until_flush() {
        let mut enc = OpusBlockEncoder::new(&request()).unwrap();
        let bytes = pcm_bytes(100);
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        enc.input_buffer(slot)[..bytes.len()].copy_from_slice(&bytes);
        enc.queue_input(slot, bytes.len(), 0, UnitFlags::NONE).unwrap();
        assert!(matches!(
            enc.dequeue_output(DEQUEUE_TIMEOUT),
            OutputEvent::Empty
        ));

        // EOS flushes the padded tail, then terminates.
        let slot = enc.dequeue_input(DEQUEUE_TIMEOUT).unwrap();
        enc.queue_input(slot, 0, 2_000, UnitFlags::END_OF_STREAM)
            .unwrap();

        let OutputEvent::FormatChanged(_) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected format-changed");
        };
        let OutputEvent::Unit(packet) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected flushed packet");
        };
        assert!(packet.is_data());
        enc.release_output(packet.slot).unwrap();

        let OutputEvent::Unit(eos) = enc.dequeue_output(DEQUEUE_TIMEOUT) else {
            panic!("expected EOS unit");
        };
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.size, 0);
        enc.release_output(eos.slot).unwrap();
    }
}
