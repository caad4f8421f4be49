//! Core data model for the pump: pixel buffers, buffer slots, sample units.

/// Index into the encoder's fixed pool of reusable byte buffers.
///
/// A slot index is only valid between acquisition (`dequeue_input` /
/// `dequeue_output`) and the matching release. Ownership transfers by
/// convention, never by lifetime: whoever holds the index owns the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub usize);

impl SlotIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Flags carried by a [`SampleUnit`], one bit per condition.
///
/// Values match the conventional block-codec flag encoding: key-frame,
/// codec-config, end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitFlags(pub u32);

impl UnitFlags {
    pub const NONE: UnitFlags = UnitFlags(0);
    pub const KEY_FRAME: UnitFlags = UnitFlags(1);
    pub const CODEC_CONFIG: UnitFlags = UnitFlags(2);
    pub const END_OF_STREAM: UnitFlags = UnitFlags(4);

    pub fn contains(self, other: UnitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key_frame(self) -> bool {
        self.contains(UnitFlags::KEY_FRAME)
    }

    pub fn is_config(self) -> bool {
        self.contains(UnitFlags::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(UnitFlags::END_OF_STREAM)
    }
}

impl std::ops::BitOr for UnitFlags {
    type Output = UnitFlags;

    fn bitor(self, rhs: UnitFlags) -> UnitFlags {
        UnitFlags(self.0 | rhs.0)
    }
}

/// One encoded access unit: a byte range inside an output slot, its
/// presentation timestamp, and its flags.
///
/// Produced by the encode session, consumed exactly once by the mux
/// session (written, or discarded for config/EOS markers). The backing
/// slot must be released explicitly once the bytes have been copied or
/// written -- never twice, never skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleUnit {
    pub slot: SlotIndex,
    pub offset: usize,
    pub size: usize,
    /// Presentation timestamp in microseconds, monotonic per track.
    pub pts_us: i64,
    pub flags: UnitFlags,
}

impl SampleUnit {
    pub fn is_config(&self) -> bool {
        self.flags.is_config()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.is_end_of_stream()
    }

    /// True for units that carry payload destined for the container
    /// (excludes config and end-of-stream markers).
    pub fn is_data(&self) -> bool {
        !self.is_config() && !self.is_end_of_stream()
    }
}

/// Pixel layout of a source buffer handed to the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Interleaved 4-byte ARGB words, row-major.
    Argb,
    /// Full-resolution Y plane followed by interleaved VU at half
    /// horizontal/vertical resolution.
    Nv21,
}

/// A raw pixel buffer produced by a frame source.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub format: SourceFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn argb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            format: SourceFormat::Argb,
            width,
            height,
            data,
        }
    }

    pub fn nv21(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            format: SourceFormat::Nv21,
            width,
            height,
            data,
        }
    }

    /// Byte length a well-formed buffer of this format must have.
    pub fn expected_len(&self) -> usize {
        let pixels = (self.width * self.height) as usize;
        match self.format {
            SourceFormat::Argb => pixels * 4,
            SourceFormat::Nv21 => pixels * 3 / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let flags = UnitFlags::KEY_FRAME | UnitFlags::END_OF_STREAM;
        assert!(flags.is_key_frame());
        assert!(flags.is_end_of_stream());
        assert!(!flags.is_config());
    }

    #[test]
    fn test_data_unit_classification() {
        let unit = SampleUnit {
            slot: SlotIndex(0),
            offset: 0,
            size: 128,
            pts_us: 132,
            flags: UnitFlags::KEY_FRAME,
        };
        assert!(unit.is_data());

        let eos = SampleUnit {
            flags: UnitFlags::END_OF_STREAM,
            size: 0,
            ..unit
        };
        assert!(!eos.is_data());
    }

    #[test]
    fn test_expected_len() {
        let argb = PixelBuffer::argb(vec![0; 320 * 240 * 4], 320, 240);
        assert_eq!(argb.expected_len(), argb.data.len());

        let nv21 = PixelBuffer::nv21(vec![0; 320 * 240 * 3 / 2], 320, 240);
        assert_eq!(nv21.expected_len(), nv21.data.len());
    }
}
