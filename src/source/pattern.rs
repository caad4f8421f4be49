//! Procedural test-pattern source.
//!
//! Generates a bounded sequence of ARGB frames: a colored rectangle
//! stepping through eight positions over a solid background, so that
//! consecutive frames differ and the encoder's temporal path is
//! exercised.

use crate::types::PixelBuffer;

use super::{FramePull, FrameSource};
use crate::errors::PumpError;

// Rectangle and background colors; the RGB equivalents of the classic
// YUV test values {120,160,200} and {0,0,0}.
const RECT_R: u8 = 236;
const RECT_G: u8 = 50;
const RECT_B: u8 = 186;
const BACK_R: u8 = 0;
const BACK_G: u8 = 136;
const BACK_B: u8 = 0;

/// Pull-style source producing `num_frames` generated frames, then end.
pub struct PatternSource {
    width: u32,
    height: u32,
    num_frames: u64,
    next_index: u64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32, num_frames: u64) -> Self {
        Self {
            width,
            height,
            num_frames,
            next_index: 0,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.next_index
    }

    /// The frame for `index`: background fill with a moving rectangle
    /// cycling through eight positions (four across the top half, four
    /// across the bottom half).
    pub fn generate(&self, index: u64) -> PixelBuffer {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut data = Vec::with_capacity(w * h * 4);

        let pos = (index % 8) as usize;
        let (rect_x, rect_y) = if pos < 4 {
            (pos * w / 4, 0)
        } else {
            ((pos - 4) * w / 4, h / 2)
        };
        let rect_w = w / 4;
        let rect_h = h / 2;

        for y in 0..h {
            for x in 0..w {
                let in_rect =
                    x >= rect_x && x < rect_x + rect_w && y >= rect_y && y < rect_y + rect_h;
                if in_rect {
                    data.extend_from_slice(&[0xFF, RECT_R, RECT_G, RECT_B]);
                } else {
                    data.extend_from_slice(&[0xFF, BACK_R, BACK_G, BACK_B]);
                }
            }
        }

        PixelBuffer::argb(data, self.width, self.height)
    }
}

impl FrameSource for PatternSource {
    fn pull(&mut self, _pts_us: i64) -> Result<FramePull, PumpError> {
        if self.next_index >= self.num_frames {
            return Ok(FramePull::End);
        }
        let frame = self.generate(self.next_index);
        self.next_index += 1;
        Ok(FramePull::Frame(frame))
    }
}
