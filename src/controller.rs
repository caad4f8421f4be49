//! The recording controller: a small state machine on a dedicated worker.
//!
//! External start/stop/quit requests and the worker loop mutate one
//! [`RecordingState`] field behind the same mutex; the loop observes
//! requests at iteration granularity (cooperative, never preemptive).
//! Per iteration the worker performs exactly one state's work: acquire
//! resources (Starting), one submit+drain cycle (Running), flush and
//! release (Stopping), wait (Idle), or exit (Quit).

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::codec::{EncoderRegistry, InputOutcome, OutputEvent};
use crate::config::{PumpConfig, PumpStats};
use crate::errors::PumpError;
use crate::mux::{MuxSession, TrackMap};
use crate::session::{EncodeSession, SessionState};
use crate::source::{FramePull, FrameSource};
use crate::types::PixelBuffer;

/// Fixed base offset of generated presentation timestamps, in
/// microseconds.
const PTS_BASE_US: i64 = 132;

/// Idle-state wait between command checks.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Upper bound on drain iterations during Stopping, so a wedged encoder
/// cannot hang teardown.
const DRAIN_LIMIT: u32 = 10_000;

/// Bounded capacity of the controller's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of the recording worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Starting,
    Running,
    Stopping,
    Quit,
}

/// Events delivered to the host on the controller's channel.
#[derive(Debug)]
pub enum PumpEvent {
    /// Resources acquired; the pump is running.
    Started,
    /// Resource acquisition failed; the recording did not proceed.
    StartFailed(String),
    /// The recording was finalized.
    Finished(PumpStats),
    /// A running session died; resources were released.
    Error(String),
}

/// Everything one recording needs: where to write, how to encode, and
/// where frames come from.
pub struct SessionSpec {
    pub output_path: PathBuf,
    pub config: PumpConfig,
    pub source: Box<dyn FrameSource>,
}

struct Shared {
    state: Mutex<RecordingState>,
    cv: Condvar,
    pending: Mutex<Option<SessionSpec>>,
}

impl Shared {
    fn state(&self) -> RecordingState {
        *self.state.lock().expect("lock poisoned")
    }

    fn switch_state(&self, to: RecordingState) {
        let mut state = self.state.lock().expect("lock poisoned");
        log::debug!("state {:?} -> {:?}", *state, to);
        *state = to;
        self.cv.notify_all();
    }

    /// Transition only if the current state matches; both the request
    /// path and the worker go through here.
    fn switch_state_from(&self, from: RecordingState, to: RecordingState) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        if *state != from {
            return false;
        }
        log::debug!("state {:?} -> {:?}", from, to);
        *state = to;
        self.cv.notify_all();
        true
    }
}

/// Handle exposed to the host. Dropping it tears the worker down.
pub struct RecordingController {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    events: Receiver<PumpEvent>,
}

impl RecordingController {
    /// Spawn the worker thread with the given encoder table.
    pub fn spawn(registry: EncoderRegistry) -> Result<Self, PumpError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(RecordingState::Idle),
            cv: Condvar::new(),
            pending: Mutex::new(None),
        });
        let (sender, receiver) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("framepump-worker".to_string())
            .spawn(move || worker_loop(worker_shared, registry, sender))
            .map_err(|e| PumpError::Io(format!("failed to spawn worker: {}", e)))?;

        Ok(Self {
            shared,
            worker: Some(worker),
            events: receiver,
        })
    }

    pub fn state(&self) -> RecordingState {
        self.shared.state()
    }

    /// Begin a recording. Valid from Idle only.
    pub fn request_start(&self, spec: SessionSpec) -> Result<(), PumpError> {
        *self.shared.pending.lock().expect("lock poisoned") = Some(spec);
        if self
            .shared
            .switch_state_from(RecordingState::Idle, RecordingState::Starting)
        {
            Ok(())
        } else {
            *self.shared.pending.lock().expect("lock poisoned") = None;
            Err(PumpError::invalid_state(format!(
                "cannot start while {:?}",
                self.state()
            )))
        }
    }

    /// Stop the active recording. Valid from Running only; the worker
    /// observes the request at its next iteration.
    pub fn request_stop(&self) -> Result<(), PumpError> {
        if self.shared.switch_state_from(RecordingState::Running, RecordingState::Stopping) {
            Ok(())
        } else {
            Err(PumpError::invalid_state("no recording is running"))
        }
    }

    /// Tear the worker down. Terminal; cooperative like stop.
    pub fn request_quit(&self) {
        self.shared.switch_state(RecordingState::Quit);
    }

    /// The host-side event channel.
    pub fn events(&self) -> &Receiver<PumpEvent> {
        &self.events
    }

    /// Quit and join the worker.
    pub fn shutdown(mut self) {
        self.request_quit();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        self.request_quit();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Presentation time for generated frame `index` at `fps`.
fn pts_for_frame(index: u64, fps: f64) -> i64 {
    PTS_BASE_US + ((index as f64) * 1_000_000.0 / fps).round() as i64
}

fn worker_loop(shared: Arc<Shared>, registry: EncoderRegistry, events: Sender<PumpEvent>) {
    let mut active: Option<ActivePump> = None;

    loop {
        match shared.state() {
            RecordingState::Idle => {
                let guard = shared.state.lock().expect("lock poisoned");
                let _ = shared
                    .cv
                    .wait_timeout(guard, IDLE_WAIT)
                    .expect("lock poisoned");
            }
            RecordingState::Starting => {
                let spec = shared.pending.lock().expect("lock poisoned").take();
                match spec.ok_or_else(|| PumpError::invalid_state("no session spec")) {
                    Ok(spec) => match ActivePump::acquire(&registry, spec) {
                        Ok(pump) => {
                            active = Some(pump);
                            // Stay cooperative: a quit issued mid-start
                            // wins over the Running transition.
                            shared.switch_state_from(
                                RecordingState::Starting,
                                RecordingState::Running,
                            );
                            let _ = events.send(PumpEvent::Started);
                        }
                        Err(e) => {
                            log::error!("could not start recording: {}", e);
                            let _ = events.send(PumpEvent::StartFailed(e.to_string()));
                            shared.switch_state_from(
                                RecordingState::Starting,
                                RecordingState::Idle,
                            );
                        }
                    },
                    Err(e) => {
                        let _ = events.send(PumpEvent::StartFailed(e.to_string()));
                        shared.switch_state_from(RecordingState::Starting, RecordingState::Idle);
                    }
                }
            }
            RecordingState::Running => {
                let Some(pump) = active.as_mut() else {
                    shared.switch_state_from(RecordingState::Running, RecordingState::Idle);
                    continue;
                };
                match pump.cycle() {
                    Ok(CycleOutcome::Continue) => {}
                    Ok(CycleOutcome::EndOfInput) => {
                        // Natural end of input drains exactly like an
                        // external stop request.
                        shared.switch_state_from(
                            RecordingState::Running,
                            RecordingState::Stopping,
                        );
                    }
                    Err(e) => {
                        log::error!("pump cycle failed: {}", e);
                        if let Some(mut pump) = active.take() {
                            pump.abort();
                        }
                        let _ = events.send(PumpEvent::Error(e.to_string()));
                        shared.switch_state_from(RecordingState::Running, RecordingState::Idle);
                    }
                }
            }
            RecordingState::Stopping => {
                if let Some(mut pump) = active.take() {
                    match pump.finish() {
                        Ok(stats) => {
                            let _ = events.send(PumpEvent::Finished(stats));
                        }
                        Err(e) => {
                            log::error!("failed to finish recording: {}", e);
                            let _ = events.send(PumpEvent::Error(e.to_string()));
                        }
                    }
                }
                shared.switch_state_from(RecordingState::Stopping, RecordingState::Idle);
            }
            RecordingState::Quit => break,
        }
    }

    // Quit while a session is live still releases its resources.
    if let Some(mut pump) = active.take() {
        pump.abort();
    }
    log::debug!("worker loop exited");
}

enum CycleOutcome {
    Continue,
    EndOfInput,
}

/// The live resources of one recording, owned by the worker thread.
struct ActivePump {
    session: EncodeSession,
    mux: MuxSession,
    source: Box<dyn FrameSource>,
    track_map: TrackMap,
    fps: f64,
    frame_index: u64,
    missed_frames: u64,
    data_units_written: u64,
    // A frame pulled while the encoder pool was starved, resubmitted on
    // the next cycle.
    carried_frame: Option<PixelBuffer>,
}

impl ActivePump {
    fn acquire(registry: &EncoderRegistry, spec: SessionSpec) -> Result<Self, PumpError> {
        let SessionSpec {
            output_path,
            config,
            source,
        } = spec;

        let mut session = EncodeSession::new();
        session.configure(registry, &config.request_descriptor())?;

        let mut mux = MuxSession::create(&output_path, 1)?;
        if let Some(ref title) = config.title {
            mux.set_title(title);
        }
        mux.set_fast_start(config.fast_start);
        if let Some(degrees) = config.orientation_degrees {
            mux.set_orientation(degrees)?;
        }

        Ok(Self {
            session,
            mux,
            source,
            track_map: TrackMap::new(),
            fps: config.fps,
            frame_index: 0,
            missed_frames: 0,
            data_units_written: 0,
            carried_frame: None,
        })
    }

    /// One submit+drain iteration of the pump.
    fn cycle(&mut self) -> Result<CycleOutcome, PumpError> {
        let outcome = self.submit_half()?;
        self.drain_half()?;
        Ok(outcome)
    }

    fn submit_half(&mut self) -> Result<CycleOutcome, PumpError> {
        if self.session.state() != SessionState::Running {
            return Ok(CycleOutcome::Continue);
        }

        let pts_us = pts_for_frame(self.frame_index, self.fps);
        let frame = match self.carried_frame.take() {
            Some(frame) => frame,
            None => match self.source.pull(pts_us)? {
                FramePull::Frame(frame) => frame,
                FramePull::Pending => {
                    self.missed_frames += 1;
                    return Ok(CycleOutcome::Continue);
                }
                FramePull::End => return Ok(CycleOutcome::EndOfInput),
            },
        };

        match self.session.submit_input(Some(&frame), false, pts_us)? {
            InputOutcome::Submitted => {
                self.frame_index += 1;
            }
            InputOutcome::NoSlotAvailable => {
                self.carried_frame = Some(frame);
            }
            InputOutcome::AlreadyDone => {}
        }
        Ok(CycleOutcome::Continue)
    }

    fn drain_half(&mut self) -> Result<(), PumpError> {
        match self.session.poll_output()? {
            OutputEvent::Empty => {}
            OutputEvent::BuffersInvalidated => {
                // No slot indices are cached across iterations, so a
                // pool change needs no further action here.
                log::debug!("encoder output buffers changed");
            }
            OutputEvent::FormatChanged(negotiated) => {
                let dest = self.mux.register_track(&negotiated)?;
                self.track_map.insert(0, dest);
                self.mux.start()?;
            }
            OutputEvent::Unit(unit) => {
                if unit.is_data() {
                    let track = self.track_map.get(0).ok_or_else(|| {
                        PumpError::invalid_state("data unit before track registration")
                    })?;
                    {
                        let bytes = self.session.read_unit(&unit);
                        self.mux.write_sample(track, bytes, &unit)?;
                    }
                    self.data_units_written += 1;
                }
                // Config and EOS markers are discarded; every unit's
                // slot goes back to the pool exactly once.
                self.session.release_unit(unit)?;
            }
            OutputEvent::Fatal(code) => return Err(PumpError::Fatal(code)),
        }
        Ok(())
    }

    /// Queue the end-of-stream marker and drain until the encoder's EOS
    /// unit has been observed and handled, then finalize.
    fn finish(&mut self) -> Result<PumpStats, PumpError> {
        let mut drains = 0u32;
        while !self.session.eos_reached() {
            if self.session.state() == SessionState::Running {
                let pts_us = pts_for_frame(self.frame_index, self.fps);
                self.session.submit_input(None, true, pts_us)?;
            }
            self.drain_half()?;

            drains += 1;
            if drains >= DRAIN_LIMIT {
                return Err(PumpError::Encoding(
                    "encoder did not emit end-of-stream while draining".to_string(),
                ));
            }
        }

        if self.data_units_written != self.mux.samples_written() {
            log::warn!(
                "{} data units forwarded but {} samples written",
                self.data_units_written,
                self.mux.samples_written()
            );
        }

        let mut stats = self.mux.finalize()?;
        stats.missed_frames = self.missed_frames;
        self.session.close();
        Ok(stats)
    }

    /// Release everything without expecting a clean drain.
    fn abort(&mut self) {
        if self.mux.is_started() {
            if let Err(e) = self.mux.finalize() {
                log::error!("finalize during abort failed: {}", e);
            }
        } else {
            // Never started: attempting finalize is the documented
            // recoverable error, reported and swallowed.
            if let Err(e) = self.mux.finalize() {
                log::warn!("{}", e);
            }
        }
        self.session.close();
    }

}
