//! Configuration-driven encoder selection.
//!
//! Instead of enumerating platform codec names at runtime, available
//! implementations are rows in a capability table: a mime type, the pixel
//! layouts the implementation accepts, and a factory. Selection picks the
//! first row whose mime matches and whose layout set intersects the
//! recognized allow-list.

use crate::convert::PixelLayout;
use crate::errors::PumpError;
use crate::format::FormatDescriptor;

use super::BlockEncoder;

/// Layouts the conversion path knows how to fill, in preference order.
pub const RECOGNIZED_LAYOUTS: [PixelLayout; 5] = [
    PixelLayout::Planar,
    PixelLayout::PackedPlanar,
    PixelLayout::SemiPlanar,
    PixelLayout::PackedSemiPlanar,
    PixelLayout::VendorPackedSemiPlanar,
];

type EncoderFactory =
    fn(&FormatDescriptor, PixelLayout) -> Result<Box<dyn BlockEncoder>, PumpError>;

/// One row of the capability table.
#[derive(Debug)]
pub struct EncoderEntry {
    pub name: &'static str,
    pub mime: &'static str,
    pub layouts: Vec<PixelLayout>,
    pub factory: EncoderFactory,
}

/// The table of available encoder implementations.
pub struct EncoderRegistry {
    entries: Vec<EncoderEntry>,
}

impl EncoderRegistry {
    /// A registry with no entries; every selection fails.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The built-in table: the openh264-backed AVC entry, plus the Opus
    /// entry when the crate is built with the `audio` feature.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(EncoderEntry {
            name: "openh264.avc",
            mime: crate::format::MIME_VIDEO_AVC,
            layouts: vec![PixelLayout::Planar, PixelLayout::PackedPlanar],
            factory: |request, layout| {
                Ok(Box::new(super::avc::AvcEncoder::new(request, layout)?))
            },
        });
        #[cfg(feature = "audio")]
        registry.register(EncoderEntry {
            name: "libopus.opus",
            mime: crate::format::MIME_AUDIO_OPUS,
            layouts: vec![PixelLayout::Planar],
            factory: |request, _layout| {
                Ok(Box::new(super::opus::OpusBlockEncoder::new(request)?))
            },
        });
        registry
    }

    pub fn register(&mut self, entry: EncoderEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry matching `mime` whose layouts intersect the
    /// recognized allow-list, together with the negotiated layout.
    pub fn select(&self, mime: &str) -> Result<(&EncoderEntry, PixelLayout), PumpError> {
        for entry in &self.entries {
            if !entry.mime.eq_ignore_ascii_case(mime) {
                continue;
            }
            // First advertised layout the converter recognizes wins.
            if let Some(&layout) = entry
                .layouts
                .iter()
                .find(|candidate| RECOGNIZED_LAYOUTS.contains(candidate))
            {
                return Ok((entry, layout));
            }
        }
        Err(PumpError::no_suitable_encoder(mime))
    }

    /// First entry matching `mime` that accepts opaque surface input.
    /// Surface mode bypasses the converter allow-list: the request asked
    /// for it explicitly.
    pub fn select_surface(&self, mime: &str) -> Result<&EncoderEntry, PumpError> {
        self.entries
            .iter()
            .find(|entry| {
                entry.mime.eq_ignore_ascii_case(mime)
                    && entry.layouts.contains(&PixelLayout::Opaque)
            })
            .ok_or_else(|| PumpError::no_suitable_encoder(mime))
    }

    /// Select and instantiate an encoder for the request descriptor.
    pub fn create(
        &self,
        request: &FormatDescriptor,
    ) -> Result<(Box<dyn BlockEncoder>, PixelLayout, &'static str), PumpError> {
        let mime = request
            .mime()
            .ok_or_else(|| PumpError::no_suitable_encoder("<missing mime>"))?;
        let (entry, layout) = self.select(mime)?;
        log::debug!("selected encoder {} with layout {:?}", entry.name, layout);
        let encoder = (entry.factory)(request, layout)?;
        Ok((encoder, layout, entry.name))
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
