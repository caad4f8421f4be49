//! The mux session: deferred track registration over the MP4 writer.
//!
//! Track registration is only valid before `start()` because the
//! container writer needs every track's negotiated descriptor up front;
//! the descriptors only exist once the encoder has emitted its
//! format-changed notification. After `start()` the track set is frozen
//! and samples flow through `write_sample` until `finalize()`.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use muxide::api::{Metadata, Muxer, MuxerBuilder, VideoCodec};

use crate::config::PumpStats;
use crate::errors::PumpError;
use crate::format::{FormatDescriptor, KEY_FRAME_RATE};
use crate::types::SampleUnit;

/// Mapping from source/logical stream ids to destination track ids
/// assigned at registration. Built once per session, immutable after
/// `start()`.
#[derive(Debug, Clone, Default)]
pub struct TrackMap {
    entries: HashMap<u32, u32>,
}

impl TrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_id: u32, dest_id: u32) {
        self.entries.insert(source_id, dest_id);
    }

    pub fn get(&self, source_id: u32) -> Option<u32> {
        self.entries.get(&source_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Collecting,
    Started,
    Finalized,
}

/// Owns the container writer for one recording.
pub struct MuxSession {
    output_path: PathBuf,
    writer: Option<BufWriter<File>>,
    muxer: Option<Muxer<BufWriter<File>>>,
    state: MuxState,
    expected_tracks: usize,
    registered: Vec<FormatDescriptor>,
    orientation_degrees: Option<i32>,
    title: Option<String>,
    fast_start: bool,
    samples_written: u64,
    last_pts_us: Vec<i64>,
}

impl MuxSession {
    /// Open the output file. Failing here is a failed start; nothing has
    /// been written yet.
    pub fn create<P: AsRef<Path>>(
        output_path: P,
        expected_tracks: usize,
    ) -> Result<Self, PumpError> {
        let path = output_path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|e| PumpError::Io(format!("failed to create output file: {}", e)))?;
        log::info!("output file is {}", path.display());

        Ok(Self {
            output_path: path,
            writer: Some(BufWriter::new(file)),
            muxer: None,
            state: MuxState::Collecting,
            expected_tracks: expected_tracks.max(1),
            registered: Vec::new(),
            orientation_degrees: None,
            title: None,
            fast_start: true,
            samples_written: 0,
            last_pts_us: Vec::new(),
        })
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn set_fast_start(&mut self, enabled: bool) {
        self.fast_start = enabled;
    }

    /// Rotation hint in degrees. Only valid before `start()`.
    pub fn set_orientation(&mut self, degrees: i32) -> Result<(), PumpError> {
        if self.state != MuxState::Collecting {
            return Err(PumpError::invalid_state(
                "orientation hint must be set before start",
            ));
        }
        self.orientation_degrees = Some(degrees);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state == MuxState::Started
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn track_count(&self) -> usize {
        self.registered.len()
    }

    /// Register a track from a negotiated descriptor, returning the
    /// destination track id. Only valid before `start()`.
    pub fn register_track(&mut self, negotiated: &FormatDescriptor) -> Result<u32, PumpError> {
        if self.state != MuxState::Collecting {
            return Err(PumpError::invalid_state(
                "cannot register a track after the muxer has started",
            ));
        }
        if !negotiated.is_video() {
            // The container surface carried here records video tracks;
            // audio units are returned to the host instead.
            return Err(PumpError::unsupported_format(format!(
                "cannot register track for mime {:?}",
                negotiated.mime()
            )));
        }
        negotiated
            .width()
            .ok_or_else(|| PumpError::Muxing("negotiated descriptor missing width".to_string()))?;
        negotiated
            .height()
            .ok_or_else(|| PumpError::Muxing("negotiated descriptor missing height".to_string()))?;

        let dest_id = self.registered.len() as u32;
        self.registered.push(negotiated.clone());
        log::debug!("registered track {} ({:?})", dest_id, negotiated.mime());
        Ok(dest_id)
    }

    /// Start the muxer. Valid only once every expected track has been
    /// registered; the track set is frozen afterwards.
    pub fn start(&mut self) -> Result<(), PumpError> {
        if self.state != MuxState::Collecting {
            return Err(PumpError::invalid_state("muxer already started"));
        }
        if self.registered.len() < self.expected_tracks {
            return Err(PumpError::invalid_state(format!(
                "muxer started with {} of {} expected tracks registered",
                self.registered.len(),
                self.expected_tracks
            )));
        }

        let writer = self
            .writer
            .take()
            .ok_or_else(|| PumpError::Muxing("output writer already consumed".to_string()))?;

        // The writer takes one video description; additional tracks are
        // rejected at registration by the expected-track bound.
        let desc = &self.registered[0];
        let width = desc.width().expect("validated at registration");
        let height = desc.height().expect("validated at registration");
        let fps = desc.float(KEY_FRAME_RATE).unwrap_or(30.0);

        let mut builder = MuxerBuilder::new(writer)
            .video(VideoCodec::H264, width, height, fps)
            .with_fast_start(self.fast_start);

        let mut metadata = Metadata::new().with_current_time();
        if let Some(ref title) = self.title {
            metadata = metadata.with_title(title);
        }
        builder = builder.with_metadata(metadata);

        if let Some(degrees) = self.orientation_degrees {
            // The writer has no rotation box; the hint is honored for
            // state checking and reported for diagnostics.
            log::info!("orientation hint: {} degrees", degrees);
        }

        self.muxer = Some(
            builder
                .build()
                .map_err(|e| PumpError::Muxing(format!("failed to create muxer: {}", e)))?,
        );
        self.last_pts_us = vec![i64::MIN; self.registered.len()];
        self.state = MuxState::Started;
        log::debug!("muxer started with {} track(s)", self.registered.len());
        Ok(())
    }

    /// Write one sample. End-of-stream markers are never forwarded to
    /// the writer (they carry no payload and would only pollute the
    /// sample table); config markers are dropped with a warning since
    /// the caller should have discarded them.
    pub fn write_sample(
        &mut self,
        track_id: u32,
        data: &[u8],
        unit: &SampleUnit,
    ) -> Result<(), PumpError> {
        if self.state != MuxState::Started {
            return Err(PumpError::invalid_state(
                "cannot write a sample before the muxer has started",
            ));
        }
        let track = track_id as usize;
        if track >= self.registered.len() {
            return Err(PumpError::Muxing(format!(
                "unknown track id {}",
                track_id
            )));
        }

        if unit.is_end_of_stream() {
            log::debug!("end-of-stream marker reached the muxer; skipped");
            return Ok(());
        }
        if unit.is_config() {
            log::warn!("codec-config unit offered to the muxer; skipped");
            return Ok(());
        }

        if unit.pts_us < self.last_pts_us[track] {
            log::warn!(
                "non-monotonic pts on track {}: {} after {}",
                track_id,
                unit.pts_us,
                self.last_pts_us[track]
            );
        }
        self.last_pts_us[track] = unit.pts_us;

        let muxer = self.muxer.as_mut().expect("started muxer");
        let pts_secs = unit.pts_us as f64 / 1_000_000.0;
        muxer
            .write_video(pts_secs, data, unit.flags.is_key_frame())
            .map_err(|e| PumpError::Muxing(format!("failed to write sample: {}", e)))?;
        self.samples_written += 1;
        log::trace!("sent {} bytes to muxer at pts {}us", data.len(), unit.pts_us);
        Ok(())
    }

    /// Flush the container trailer and close the output. At most once;
    /// finalizing an unstarted session is reported as an error without
    /// crashing (the classic "started a muxer but never fed it" case is
    /// the caller's to log and move on from).
    pub fn finalize(&mut self) -> Result<PumpStats, PumpError> {
        match self.state {
            MuxState::Collecting => {
                log::error!("finalize called on a muxer that was never started");
                Err(PumpError::invalid_state(
                    "muxer was never started; nothing to finalize",
                ))
            }
            MuxState::Finalized => Err(PumpError::invalid_state("muxer already finalized")),
            MuxState::Started => {
                let muxer = self
                    .muxer
                    .take()
                    .ok_or_else(|| PumpError::Muxing("muxer already consumed".to_string()))?;
                let stats = muxer
                    .finish_with_stats()
                    .map_err(|e| PumpError::Muxing(format!("failed to finalize: {}", e)))?;
                self.state = MuxState::Finalized;
                log::info!(
                    "finalized {}: {} frames, {:.2}s, {} bytes",
                    self.output_path.display(),
                    stats.video_frames,
                    stats.duration_secs,
                    stats.bytes_written
                );
                Ok(PumpStats {
                    samples_written: stats.video_frames,
                    duration_secs: stats.duration_secs,
                    bytes_written: stats.bytes_written,
                    missed_frames: 0,
                    output_path: self.output_path.to_string_lossy().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatDescriptor, MIME_VIDEO_AVC, MIME_AUDIO_OPUS, KEY_FRAME_RATE};
    use crate::types::{SlotIndex, UnitFlags};
    use tempfile::tempdir;

    fn video_descriptor() -> FormatDescriptor {
        let mut desc = FormatDescriptor::video(MIME_VIDEO_AVC, 320, 240);
        desc.set_float(KEY_FRAME_RATE, 15.0);
        desc
    }

    fn eos_unit() -> SampleUnit {
        SampleUnit {
            slot: SlotIndex(0),
            offset: 0,
            size: 0,
            pts_us: 0,
            flags: UnitFlags::END_OF_STREAM,
        }
    }

    #[test]
    fn test_register_after_start_is_invalid_state() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        mux.register_track(&video_descriptor()).unwrap();
        mux.start().unwrap();

        let err = mux.register_track(&video_descriptor()).unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
        assert_eq!(mux.track_count(), 1, "track set must be unchanged");
    }

    #[test]
    fn test_start_requires_all_expected_tracks() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 2).unwrap();
        mux.register_track(&video_descriptor()).unwrap();
        let err = mux.start().unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
    }

    #[test]
    fn test_write_before_start_is_invalid_state() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        mux.register_track(&video_descriptor()).unwrap();

        let err = mux.write_sample(0, &[0u8; 4], &eos_unit()).unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
    }

    #[test]
    fn test_eos_marker_is_skipped_not_written() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        mux.register_track(&video_descriptor()).unwrap();
        mux.start().unwrap();

        mux.write_sample(0, &[], &eos_unit()).unwrap();
        assert_eq!(mux.samples_written(), 0);
    }

    #[test]
    fn test_finalize_without_start_reports_not_crashes() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        let err = mux.finalize().unwrap_err();
        assert!(matches!(err, PumpError::InvalidState(_)));
        // A second call still just reports.
        assert!(mux.finalize().is_err());
    }

    #[test]
    fn test_orientation_only_before_start() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        mux.set_orientation(180).unwrap();
        mux.register_track(&video_descriptor()).unwrap();
        mux.start().unwrap();
        assert!(mux.set_orientation(90).is_err());
    }

    #[test]
    fn test_audio_descriptor_rejected_by_container_surface() {
        let dir = tempdir().unwrap();
        let mut mux = MuxSession::create(dir.path().join("t.mp4"), 1).unwrap();
        let desc = FormatDescriptor::audio(MIME_AUDIO_OPUS, 48000, 2);
        let err = mux.register_track(&desc).unwrap_err();
        assert!(matches!(err, PumpError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_track_map_is_stable() {
        let mut map = TrackMap::new();
        map.insert(0, 0);
        map.insert(7, 1);
        assert_eq!(map.get(7), Some(1));
        assert_eq!(map.get(3), None);
        assert_eq!(map.len(), 2);
    }
}
