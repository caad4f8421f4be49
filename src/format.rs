//! String-keyed format descriptors exchanged with encoders and the muxer.
//!
//! Two instances matter per track: the *request* descriptor (input to
//! encoder configuration) and the *negotiated* descriptor (emitted by the
//! encoder once it knows its final layout). Only a negotiated descriptor
//! may be used for track registration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Well-known descriptor keys.
pub const KEY_MIME: &str = "mime";
pub const KEY_WIDTH: &str = "width";
pub const KEY_HEIGHT: &str = "height";
pub const KEY_BITRATE: &str = "bitrate";
pub const KEY_FRAME_RATE: &str = "frame-rate";
pub const KEY_IFRAME_INTERVAL: &str = "i-frame-interval";
pub const KEY_COLOR_FORMAT: &str = "color-format";
pub const KEY_SAMPLE_RATE: &str = "sample-rate";
pub const KEY_CHANNEL_COUNT: &str = "channel-count";
/// Codec-specific data (e.g. H.264 SPS) attached to a negotiated format.
pub const KEY_CSD_0: &str = "csd-0";
/// Codec-specific data (e.g. H.264 PPS) attached to a negotiated format.
pub const KEY_CSD_1: &str = "csd-1";

/// MIME identifier for H.264 / AVC video.
pub const MIME_VIDEO_AVC: &str = "video/avc";
/// MIME identifier for Opus audio.
pub const MIME_AUDIO_OPUS: &str = "audio/opus";

/// A scalar value stored under a descriptor key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormatValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Mapping from string keys to scalar values describing one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    entries: HashMap<String, FormatValue>,
}

impl FormatDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request descriptor for a video stream.
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        let mut desc = Self::new();
        desc.set_str(KEY_MIME, mime);
        desc.set_int(KEY_WIDTH, width as i64);
        desc.set_int(KEY_HEIGHT, height as i64);
        desc
    }

    /// Request descriptor for an audio stream.
    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        let mut desc = Self::new();
        desc.set_str(KEY_MIME, mime);
        desc.set_int(KEY_SAMPLE_RATE, sample_rate as i64);
        desc.set_int(KEY_CHANNEL_COUNT, channel_count as i64);
        desc
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.entries.insert(key.to_string(), FormatValue::Int(value));
        self
    }

    pub fn set_float(&mut self, key: &str, value: f64) -> &mut Self {
        self.entries
            .insert(key.to_string(), FormatValue::Float(value));
        self
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.entries
            .insert(key.to_string(), FormatValue::Str(value.to_string()));
        self
    }

    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) -> &mut Self {
        self.entries
            .insert(key.to_string(), FormatValue::Bytes(value));
        self
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(FormatValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(FormatValue::Float(v)) => Some(*v),
            Some(FormatValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(FormatValue::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        self.str_value(KEY_MIME)
    }

    pub fn width(&self) -> Option<u32> {
        self.int(KEY_WIDTH).map(|v| v as u32)
    }

    pub fn height(&self) -> Option<u32> {
        self.int(KEY_HEIGHT).map(|v| v as u32)
    }

    pub fn is_video(&self) -> bool {
        self.mime().is_some_and(|m| m.starts_with("video/"))
    }

    pub fn is_audio(&self) -> bool {
        self.mime().is_some_and(|m| m.starts_with("audio/"))
    }
}
