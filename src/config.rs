//! Recording configuration and statistics.

use serde::{Deserialize, Serialize};

use crate::format::{
    FormatDescriptor, KEY_BITRATE, KEY_FRAME_RATE, KEY_IFRAME_INTERVAL, MIME_VIDEO_AVC,
};

/// Quality presets for the encode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpQuality {
    /// 720p, lower bitrate.
    Low,
    /// 1080p, standard bitrate.
    Medium,
    /// 1080p, high bitrate.
    High,
    /// Custom settings.
    Custom,
}

impl PumpQuality {
    /// Recommended bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        match self {
            PumpQuality::Low => 2_500_000,
            PumpQuality::Medium => 5_000_000,
            PumpQuality::High => 10_000_000,
            PumpQuality::Custom => 5_000_000,
        }
    }

    /// Recommended resolution (width, height).
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            PumpQuality::Low => (1280, 720),
            _ => (1920, 1080),
        }
    }
}

impl Default for PumpQuality {
    fn default() -> Self {
        PumpQuality::High
    }
}

/// Configuration for one recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
    /// Frames per second.
    pub fps: f64,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Seconds between forced keyframes.
    pub iframe_interval_secs: u32,
    /// Encoder mime type to request.
    pub mime: String,
    /// Quality preset used.
    pub quality: PumpQuality,
    /// Enable fast-start (moov before mdat).
    pub fast_start: bool,
    /// Optional title metadata.
    pub title: Option<String>,
    /// Optional rotation hint in degrees, applied before the muxer
    /// starts.
    pub orientation_degrees: Option<i32>,
}

impl PumpConfig {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate: 5_000_000,
            iframe_interval_secs: 10,
            mime: MIME_VIDEO_AVC.to_string(),
            quality: PumpQuality::Custom,
            fast_start: true,
            title: None,
            orientation_degrees: None,
        }
    }

    pub fn from_quality(quality: PumpQuality, fps: f64) -> Self {
        let (width, height) = quality.resolution();
        Self {
            bitrate: quality.bitrate(),
            quality,
            ..Self::new(width, height, fps)
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    pub fn with_orientation(mut self, degrees: i32) -> Self {
        self.orientation_degrees = Some(degrees);
        self
    }

    pub fn with_fast_start(mut self, enabled: bool) -> Self {
        self.fast_start = enabled;
        self
    }

    /// Number of generated frames covering `duration_secs` at this
    /// frame rate.
    pub fn num_frames(&self, duration_secs: u64) -> u64 {
        (duration_secs as f64 * self.fps).round() as u64
    }

    /// The encoder request descriptor for this configuration.
    pub fn request_descriptor(&self) -> FormatDescriptor {
        let mut desc = FormatDescriptor::video(&self.mime, self.width, self.height);
        desc.set_int(KEY_BITRATE, self.bitrate as i64);
        desc.set_float(KEY_FRAME_RATE, self.fps);
        desc.set_int(KEY_IFRAME_INTERVAL, self.iframe_interval_secs as i64);
        desc
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from_quality(PumpQuality::High, 30.0)
    }
}

/// Statistics reported once a recording has been finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpStats {
    /// Data-bearing samples written to the container.
    pub samples_written: u64,
    /// Container duration in seconds.
    pub duration_secs: f64,
    /// Total bytes written to the output file.
    pub bytes_written: u64,
    /// Frames the source failed to deliver within its bounded wait.
    pub missed_frames: u64,
    /// Output file path.
    pub output_path: String,
}

impl PumpStats {
    /// Average bitrate achieved, in bits per second.
    pub fn avg_bitrate(&self) -> f64 {
        if self.duration_secs > 0.0 {
            (self.bytes_written as f64 * 8.0) / self.duration_secs
        } else {
            0.0
        }
    }
}
