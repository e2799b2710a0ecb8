//! Session state shared by the playback worker and the caller's handle.

use crate::buffer::PlaybackBuffer;
use crate::device::AudioDevice;
use crate::error::{CapabilityError, SessionError, SessionResult};
use crate::events::{EventDispatcher, SpeechEvent};
use crate::scheduler::{ChunkState, SchedulerStats};
use crate::types::{PlaybackState, SessionOutcome};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// The output device together with the engine-wide permit that makes it
/// exclusive. Dropping the slot lets the next session start.
pub(crate) struct DeviceSlot {
    pub(crate) device: Box<dyn AudioDevice>,
    _permit: OwnedSemaphorePermit,
}

impl DeviceSlot {
    pub(crate) fn new(device: Box<dyn AudioDevice>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            device,
            _permit: permit,
        }
    }
}

/// Maps the device clock onto the utterance timeline. Re-anchored whenever
/// queued audio is flushed, since content is contiguous between flushes.
#[derive(Debug, Clone, Copy)]
struct PlaybackClock {
    device_base: f64,
    content_base: f64,
}

impl PlaybackClock {
    fn heard(&self, device_position: f64) -> f64 {
        self.content_base + (device_position - self.device_base).max(0.0)
    }
}

pub(crate) struct SeekRequest {
    pub(crate) offset: f64,
    pub(crate) reply: oneshot::Sender<SessionResult<()>>,
}

pub(crate) struct SessionCore {
    pub(crate) id: u64,
    state: watch::Sender<PlaybackState>,
    position: watch::Sender<f64>,
    /// Held for every device access; state changes that affect the device
    /// happen under this lock so no write can follow a stop.
    pub(crate) device: tokio::sync::Mutex<Option<DeviceSlot>>,
    pub(crate) buffer: PlaybackBuffer,
    pub(crate) events: EventDispatcher,
    pub(crate) cancel: CancellationToken,
    pub(crate) scheduler: Arc<SchedulerStats>,
    pub(crate) seeks: mpsc::UnboundedSender<SeekRequest>,
    /// `Ok` when seeking is possible, otherwise the reason it is not
    pub(crate) seek_support: Result<(), String>,
    frames_written: AtomicU64,
    outcome: Mutex<Option<SessionOutcome>>,
    clock: Mutex<PlaybackClock>,
}

pub(crate) struct SessionParts {
    pub(crate) id: u64,
    pub(crate) device: DeviceSlot,
    pub(crate) buffer: PlaybackBuffer,
    pub(crate) events: EventDispatcher,
    pub(crate) scheduler: Arc<SchedulerStats>,
    pub(crate) cancel: CancellationToken,
    pub(crate) seek_support: Result<(), String>,
}

impl SessionCore {
    pub(crate) fn new(parts: SessionParts) -> (Arc<Self>, mpsc::UnboundedReceiver<SeekRequest>) {
        let (seeks, seek_rx) = mpsc::unbounded_channel();
        let clock = PlaybackClock {
            device_base: parts.device.device.position(),
            content_base: 0.0,
        };
        let core = Arc::new(Self {
            id: parts.id,
            state: watch::Sender::new(PlaybackState::Idle),
            position: watch::Sender::new(0.0),
            device: tokio::sync::Mutex::new(Some(parts.device)),
            buffer: parts.buffer,
            events: parts.events,
            cancel: parts.cancel,
            scheduler: parts.scheduler,
            seeks,
            seek_support: parts.seek_support,
            frames_written: AtomicU64::new(0),
            outcome: Mutex::new(None),
            clock: Mutex::new(clock),
        });
        (core, seek_rx)
    }

    pub(crate) fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: PlaybackState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session {}: {:?} -> {:?}", self.id, previous, state);
        }
    }

    pub(crate) fn position(&self) -> f64 {
        *self.position.borrow()
    }

    pub(crate) fn set_position(&self, position: f64) {
        self.position.send_replace(position);
    }

    /// Publish the position the device reports as heard, and return it
    pub(crate) fn sync_position(&self, device_position: f64) -> f64 {
        let heard = self
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heard(device_position);
        self.set_position(heard);
        heard
    }

    /// Device position `device_position` now plays content offset `content`
    pub(crate) fn anchor_clock(&self, device_position: f64, content: f64) {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner) = PlaybackClock {
            device_base: device_position,
            content_base: content,
        };
        self.set_position(content);
    }

    pub(crate) fn record_write(&self) {
        self.frames_written.fetch_add(1, Ordering::SeqCst);
    }

    /// Idle -> Playing
    pub(crate) fn start(&self) {
        if self.state() == PlaybackState::Idle {
            self.set_state(PlaybackState::Playing);
            self.events.publish(SpeechEvent::Started {
                position: self.position(),
            });
        }
    }

    /// Move to a terminal state: cancel synthesis, discard buffered audio,
    /// close and release the device, then publish `Ended`. Returns `false`
    /// when the session had already ended.
    pub(crate) async fn terminate(&self, outcome: SessionOutcome) -> bool {
        let mut slot = self.device.lock().await;
        if self.state().is_terminal() {
            return false;
        }

        self.cancel.cancel();
        let discarded = self.buffer.close();
        if discarded > 0 {
            debug!("Session {}: discarded {} buffered frame(s)", self.id, discarded);
        }

        let mut outcome = outcome;
        if let Some(mut released) = slot.take() {
            if let Err(err) = released.device.close().await {
                warn!("Session {}: closing device failed: {}", self.id, err);
                if outcome == SessionOutcome::Finished {
                    outcome = SessionOutcome::Errored(err.into());
                }
            }
        }

        if let Some(err) = outcome.error() {
            error!("Session {} failed: {}", self.id, err);
        }
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        self.set_state(outcome.state());
        self.events.publish(SpeechEvent::Ended {
            outcome,
            position: self.position(),
        });
        true
    }

    fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to one utterance's playback.
///
/// Dropping the handle does not stop playback; call [`stop`](Self::stop).
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .field("position", &self.position())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn state(&self) -> PlaybackState {
        self.core.state()
    }

    /// Content offset in seconds that the device reports as played.
    /// Audio queued inside the device is not counted until it is heard.
    pub fn position(&self) -> f64 {
        self.core.position()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.core.subscribe_state()
    }

    /// Watch position changes
    pub fn subscribe_position(&self) -> watch::Receiver<f64> {
        self.core.position.subscribe()
    }

    /// Terminal outcome, once the session has ended
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.core.outcome()
    }

    pub fn error(&self) -> Option<SessionError> {
        self.outcome().and_then(|o| o.error().cloned())
    }

    /// Adapter calls repeated after failures
    pub fn retries(&self) -> u32 {
        self.core.scheduler.retries()
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.core.scheduler.chunk_states()
    }

    /// Device writes performed so far
    pub fn frames_written(&self) -> u64 {
        self.core.frames_written.load(Ordering::SeqCst)
    }

    pub fn buffered_frames(&self) -> usize {
        self.core.buffer.len()
    }

    /// Highest number of frames the playback buffer held at once
    pub fn peak_buffered_frames(&self) -> usize {
        self.core.buffer.peak_len()
    }

    /// Word events dropped because listeners fell behind
    pub fn dropped_events(&self) -> u64 {
        self.core.events.dropped()
    }

    pub fn supports_seek(&self) -> bool {
        self.core.seek_support.is_ok()
    }

    /// Playing -> Paused. Buffered audio is kept and synthesis continues up
    /// to the buffer capacity.
    pub async fn pause(&self) -> SessionResult<()> {
        let mut slot = self.core.device.lock().await;
        let state = self.core.state();
        if state != PlaybackState::Playing {
            return Err(SessionError::InvalidState {
                operation: "pause",
                state,
            });
        }
        let result = match slot.as_mut() {
            Some(slot) => slot.device.pause().await,
            None => Ok(()),
        };
        if let Err(err) = result {
            drop(slot);
            return self.fail_device(err).await;
        }
        if let Some(slot) = slot.as_ref() {
            self.core.sync_position(slot.device.position());
        }
        self.core.set_state(PlaybackState::Paused);
        Ok(())
    }

    /// Paused -> Playing, continuing at the exact sample where playback paused
    pub async fn resume(&self) -> SessionResult<()> {
        let mut slot = self.core.device.lock().await;
        let state = self.core.state();
        if state != PlaybackState::Paused {
            return Err(SessionError::InvalidState {
                operation: "resume",
                state,
            });
        }
        let result = match slot.as_mut() {
            Some(slot) => slot.device.resume().await,
            None => Ok(()),
        };
        if let Err(err) = result {
            drop(slot);
            return self.fail_device(err).await;
        }
        self.core.set_state(PlaybackState::Playing);
        Ok(())
    }

    async fn fail_device(&self, err: crate::error::DeviceError) -> SessionResult<()> {
        self.core
            .terminate(SessionOutcome::Errored(err.clone().into()))
            .await;
        Err(err.into())
    }

    /// Stop playback and release the device. Returns after the device is
    /// closed; a no-op on a session that has already ended.
    pub async fn stop(&self) -> SessionResult<()> {
        self.core.terminate(SessionOutcome::Stopped).await;
        Ok(())
    }

    /// Continue playback from `offset` seconds into the utterance.
    ///
    /// Requires seek support from the configuration, the adapter and the
    /// device. Seeking beyond the audio waits for synthesis to finish before
    /// reporting [`CapabilityError::OffsetOutOfRange`].
    pub async fn seek(&self, offset: f64) -> SessionResult<()> {
        if let Err(reason) = &self.core.seek_support {
            return Err(CapabilityError::SeekUnsupported(reason.clone()).into());
        }
        let state = self.core.state();
        if !matches!(state, PlaybackState::Playing | PlaybackState::Paused) {
            return Err(SessionError::InvalidState {
                operation: "seek",
                state,
            });
        }
        if !(offset.is_finite() && offset >= 0.0) {
            return Err(CapabilityError::OffsetOutOfRange {
                offset,
                duration: self.position(),
            }
            .into());
        }

        let (reply, response) = oneshot::channel();
        let ended = || SessionError::InvalidState {
            operation: "seek",
            state: self.core.state(),
        };
        self.core
            .seeks
            .send(SeekRequest { offset, reply })
            .map_err(|_| ended())?;
        response.await.map_err(|_| ended())?
    }

    /// Wait for the terminal state and for `Ended` to reach every listener
    pub async fn wait(&self) -> SessionOutcome {
        let mut state = self.core.subscribe_state();
        let _ = state.wait_for(PlaybackState::is_terminal).await;
        self.core.events.drained().await;
        self.outcome().unwrap_or(SessionOutcome::Stopped)
    }
}
