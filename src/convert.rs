//! Pixel-format conversion into the encoder's expected YUV420 memory layout.
//!
//! Supported targets are the planar and semi-planar YUV420 families; the
//! output is always `width * height * 3 / 2` bytes. RGB sources go through
//! the integer BT.601 transform; NV21 sources are re-packed without
//! touching the sample values.

use crate::errors::PumpError;
use crate::types::{PixelBuffer, SourceFormat};

/// Pixel layouts a block encoder may advertise.
///
/// The packed variants share their byte layout with the plain ones as far
/// as this converter is concerned; `Opaque` marks surface input, which
/// carries no CPU-visible pixels and cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Planar,
    PackedPlanar,
    SemiPlanar,
    PackedSemiPlanar,
    VendorPackedSemiPlanar,
    Opaque,
}

impl PixelLayout {
    /// Layouts the converter knows how to fill.
    pub fn is_recognized(self) -> bool {
        !matches!(self, PixelLayout::Opaque)
    }

    /// The conventional color-format code for this layout, as carried in
    /// a negotiated descriptor's `color-format` entry.
    pub fn code(self) -> i64 {
        match self {
            PixelLayout::Planar => 19,
            PixelLayout::PackedPlanar => 20,
            PixelLayout::SemiPlanar => 21,
            PixelLayout::PackedSemiPlanar => 39,
            PixelLayout::VendorPackedSemiPlanar => 2_130_706_688,
            PixelLayout::Opaque => 0x7F00_0789,
        }
    }

    pub fn from_code(code: i64) -> Option<PixelLayout> {
        match code {
            19 => Some(PixelLayout::Planar),
            20 => Some(PixelLayout::PackedPlanar),
            21 => Some(PixelLayout::SemiPlanar),
            39 => Some(PixelLayout::PackedSemiPlanar),
            2_130_706_688 => Some(PixelLayout::VendorPackedSemiPlanar),
            0x7F00_0789 => Some(PixelLayout::Opaque),
            _ => None,
        }
    }

    /// Whether chroma is stored as one interleaved UV plane rather than
    /// two separate quarter-resolution planes.
    pub fn is_semi_planar(self) -> Result<bool, PumpError> {
        match self {
            PixelLayout::Planar | PixelLayout::PackedPlanar => Ok(false),
            PixelLayout::SemiPlanar
            | PixelLayout::PackedSemiPlanar
            | PixelLayout::VendorPackedSemiPlanar => Ok(true),
            PixelLayout::Opaque => Err(PumpError::unsupported_format(
                "opaque surface layout has no chroma arrangement",
            )),
        }
    }
}

/// Output size of a YUV420 frame: full-resolution Y plus two
/// quarter-resolution chroma planes.
pub fn frame_size(width: u32, height: u32) -> usize {
    (width as usize * height as usize) * 3 / 2
}

/// Convert `source` into `layout`, allocating the output buffer.
pub fn convert(
    source: &PixelBuffer,
    layout: PixelLayout,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, PumpError> {
    let mut out = vec![0u8; frame_size(width, height)];
    convert_into(source, layout, width, height, &mut out)?;
    Ok(out)
}

/// Convert `source` into `layout`, writing into a caller-provided buffer
/// (typically an encoder input slot). Returns the number of bytes written.
pub fn convert_into(
    source: &PixelBuffer,
    layout: PixelLayout,
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<usize, PumpError> {
    if !layout.is_recognized() {
        return Err(PumpError::unsupported_format(format!(
            "cannot produce pixel data for layout {:?}",
            layout
        )));
    }
    if source.width != width || source.height != height {
        return Err(PumpError::Encoding(format!(
            "frame dimensions {}x{} don't match session {}x{}",
            source.width, source.height, width, height
        )));
    }
    if source.data.len() != source.expected_len() {
        return Err(PumpError::Encoding(format!(
            "invalid frame size: expected {} bytes, got {}",
            source.expected_len(),
            source.data.len()
        )));
    }
    let needed = frame_size(width, height);
    if out.len() < needed {
        return Err(PumpError::Encoding(format!(
            "output buffer too small: need {} bytes, have {}",
            needed,
            out.len()
        )));
    }

    let semi_planar = layout.is_semi_planar()?;
    match source.format {
        SourceFormat::Argb => {
            argb_to_yuv420(&source.data, width, height, semi_planar, out);
        }
        SourceFormat::Nv21 => {
            nv21_to_yuv420(&source.data, width, height, semi_planar, out);
        }
    }
    Ok(needed)
}

/// BT.601 integer transform from one ARGB word (alpha ignored).
#[inline]
fn rgb_to_yuv(r: i32, g: i32, b: i32) -> (u8, u8, u8) {
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (
        y.clamp(0, 255) as u8,
        u.clamp(0, 255) as u8,
        v.clamp(0, 255) as u8,
    )
}

fn argb_to_yuv420(argb: &[u8], width: u32, height: u32, semi_planar: bool, out: &mut [u8]) {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);

    let (y_plane, chroma) = out.split_at_mut(y_size);

    for row in 0..h {
        for col in 0..w {
            let px = (row * w + col) * 4;
            let r = argb[px + 1] as i32;
            let g = argb[px + 2] as i32;
            let b = argb[px + 3] as i32;

            let (y, u, v) = rgb_to_yuv(r, g, b);
            y_plane[row * w + col] = y;

            // 4:2:0 subsampling: one chroma sample per 2x2 luma block.
            if row % 2 == 0 && col % 2 == 0 {
                let uv_idx = (row / 2) * (w / 2) + (col / 2);
                if semi_planar {
                    chroma[uv_idx * 2] = u;
                    chroma[uv_idx * 2 + 1] = v;
                } else {
                    chroma[uv_idx] = u;
                    chroma[uv_size + uv_idx] = v;
                }
            }
        }
    }
}

fn nv21_to_yuv420(nv21: &[u8], width: u32, height: u32, semi_planar: bool, out: &mut [u8]) {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);

    out[..y_size].copy_from_slice(&nv21[..y_size]);

    // NV21 chroma is interleaved VU; the targets want UV or U-then-V.
    let vu = &nv21[y_size..];
    let chroma = &mut out[y_size..];
    for i in 0..uv_size {
        let v = vu[i * 2];
        let u = vu[i * 2 + 1];
        if semi_planar {
            chroma[i * 2] = u;
            chroma[i * 2 + 1] = v;
        } else {
            chroma[i] = u;
            chroma[uv_size + i] = v;
        }
    }
}
