//! Playback state machine.
//!
//! The controller pulls frames from the [`PlaybackBuffer`](crate::PlaybackBuffer)
//! and writes them to the device one period at a time. Every write happens
//! under the device lock after re-checking that the session is `Playing`, which
//! is what makes pause exact and stop final. Word events wait until the
//! device reports that playback has reached the word's start.

use crate::config::EngineConfig;
use crate::error::{CapabilityError, SessionError, SessionResult};
use crate::events::SpeechEvent;
use crate::session::{SeekRequest, SessionCore};
use crate::sink::AudioSink;
use crate::types::{AudioFrame, PlaybackState, SessionOutcome, samples_to_seconds};
use log::{debug, error};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Slack when comparing word starts against the device clock
const CLOCK_EPSILON: f64 = 1e-9;

/// A frame placed on the utterance timeline
struct PlacedFrame {
    frame: AudioFrame,
    /// Absolute start in seconds
    start: f64,
}

impl PlacedFrame {
    fn end(&self) -> f64 {
        self.start + self.frame.duration()
    }
}

/// Next sample to write and next word to announce, within the current frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Cursor {
    frame: usize,
    sample: usize,
    word: usize,
}

enum Wake {
    Cancelled,
    Resumed,
    Seek(Option<SeekRequest>),
    Frame(Option<AudioFrame>),
}

enum Step {
    Continue,
    Done,
}

pub(crate) struct PlaybackController {
    core: Arc<SessionCore>,
    seeks: mpsc::UnboundedReceiver<SeekRequest>,
    sink: Option<Box<dyn AudioSink>>,
    period_ms: u64,
    /// Seconds of played audio kept so earlier offsets stay seekable
    history: f64,
    timeline: VecDeque<PlacedFrame>,
    cursor: Cursor,
    /// Words already written to the device but not yet heard
    pending: VecDeque<SpeechEvent>,
    /// Content offset where the last written period ends
    written_end: f64,
    loaded_end: f64,
    next_ordinal: usize,
    stream_ended: bool,
}

impl PlaybackController {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        seeks: mpsc::UnboundedReceiver<SeekRequest>,
        config: &EngineConfig,
        sink: Option<Box<dyn AudioSink>>,
    ) -> Self {
        let history = match core.seek_support {
            Ok(()) => config.seek_history_seconds.unwrap_or(f64::INFINITY),
            Err(_) => 0.0,
        };
        Self {
            core,
            seeks,
            sink,
            period_ms: config.period_ms.max(1),
            history,
            timeline: VecDeque::new(),
            cursor: Cursor::default(),
            pending: VecDeque::new(),
            written_end: 0.0,
            loaded_end: 0.0,
            next_ordinal: 0,
            stream_ended: false,
        }
    }

    /// Drive the session from `Playing` to a terminal state
    pub(crate) async fn run(mut self) {
        debug!("Session {}: playback worker started", self.core.id);
        loop {
            if self.core.cancel.is_cancelled() {
                break;
            }
            while let Ok(request) = self.seeks.try_recv() {
                self.serve_seek(request).await;
            }

            let state = self.core.state();
            if state.is_terminal() {
                break;
            }
            if state == PlaybackState::Paused {
                let mut states = self.core.subscribe_state();
                let wake = tokio::select! {
                    _ = self.core.cancel.cancelled() => Wake::Cancelled,
                    _ = states.wait_for(|s| *s != PlaybackState::Paused) => Wake::Resumed,
                    request = self.seeks.recv() => Wake::Seek(request),
                };
                match wake {
                    Wake::Cancelled => break,
                    Wake::Seek(Some(request)) => self.serve_seek(request).await,
                    _ => {}
                }
                continue;
            }

            if self.timeline.get(self.cursor.frame).is_none() {
                if self.stream_ended {
                    if self.finish().await {
                        break;
                    }
                    continue;
                }
                let wake = tokio::select! {
                    _ = self.core.cancel.cancelled() => Wake::Cancelled,
                    request = self.seeks.recv() => Wake::Seek(request),
                    frame = self.core.buffer.pop() => Wake::Frame(frame),
                };
                match wake {
                    Wake::Cancelled => break,
                    Wake::Seek(Some(request)) => self.serve_seek(request).await,
                    Wake::Frame(Some(frame)) => {
                        if let Err(err) = self.load(frame) {
                            self.core.terminate(SessionOutcome::Errored(err)).await;
                            break;
                        }
                    }
                    Wake::Frame(None) => self.stream_ended = true,
                    _ => {}
                }
                continue;
            }

            if let Step::Done = self.write_period().await {
                break;
            }
        }
        debug!("Session {}: playback worker exited", self.core.id);
    }

    /// Append a frame to the timeline and forward it to the sink
    fn load(&mut self, frame: AudioFrame) -> SessionResult<()> {
        if frame.ordinal != self.next_ordinal {
            return Err(SessionError::OrderingViolation {
                expected: self.next_ordinal,
                received: frame.ordinal,
            });
        }
        self.next_ordinal += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink.write_frame(&frame)?;
        }

        let start = self.loaded_end;
        self.loaded_end += frame.duration();
        self.timeline.push_back(PlacedFrame { frame, start });
        Ok(())
    }

    async fn write_period(&mut self) -> Step {
        let core = self.core.clone();
        let mut guard = core.device.lock().await;
        if core.state() != PlaybackState::Playing {
            return Step::Continue;
        }
        let Some(slot) = guard.as_mut() else {
            return Step::Done;
        };
        let Some(placed) = self.timeline.get(self.cursor.frame) else {
            return Step::Continue;
        };

        let frame = &placed.frame;
        let len = frame.samples.len();
        let period = (frame.sample_rate as u64 * self.period_ms / 1000).max(1) as usize;
        let from = self.cursor.sample.min(len);
        let to = (from + period).min(len);
        let last = to == len;
        let period_end = placed.start + samples_to_seconds(to, frame.sample_rate);

        let mut word = self.cursor.word;
        while let Some(timing) = frame.timings.get(word) {
            let start = placed.start + timing.start;
            if !last && start >= period_end {
                break;
            }
            self.pending.push_back(SpeechEvent::Word {
                word: timing.word.clone(),
                start,
                end: placed.start + timing.end,
                chunk: frame.ordinal,
                source: timing.source,
            });
            word += 1;
        }

        if to > from {
            let written = slot
                .device
                .write(&frame.samples[from..to], frame.sample_rate)
                .await;
            if let Err(err) = written {
                drop(guard);
                error!("Session {}: device write failed: {}", core.id, err);
                core.terminate(SessionOutcome::Errored(err.into())).await;
                return Step::Done;
            }
            core.record_write();
        }

        let heard = core.sync_position(slot.device.position());
        self.cursor.word = word;
        self.cursor.sample = to;
        self.written_end = period_end;
        self.release_words(heard);
        if last {
            self.advance_frame();
        }
        Step::Continue
    }

    /// Publish pending words whose start the device has played past
    fn release_words(&mut self, heard: f64) {
        while self
            .pending
            .front()
            .is_some_and(|event| event.position() + CLOCK_EPSILON < heard)
        {
            if let Some(event) = self.pending.pop_front() {
                self.core.events.publish(event);
            }
        }
    }

    fn advance_frame(&mut self) {
        self.cursor = Cursor {
            frame: self.cursor.frame + 1,
            ..Cursor::default()
        };
        // Drop played frames older than the seek history
        let keep_from = self.written_end - self.history;
        while self.cursor.frame > 0
            && self
                .timeline
                .front()
                .is_some_and(|placed| placed.end() <= keep_from + CLOCK_EPSILON)
        {
            self.timeline.pop_front();
            self.cursor.frame -= 1;
        }
    }

    /// End of stream reached and every frame written. Returns `false` if the
    /// session is not playing any more (paused in between) and should go on.
    async fn finish(&mut self) -> bool {
        if self.core.cancel.is_cancelled() {
            return true;
        }
        let core = self.core.clone();
        // Announce the remaining words as the device plays them out, until
        // its clock stops moving, then drain whatever is left
        let mut last_heard = f64::NEG_INFINITY;
        loop {
            let mut guard = core.device.lock().await;
            match core.state() {
                PlaybackState::Playing => {}
                state => return state.is_terminal(),
            }
            let Some(slot) = guard.as_mut() else {
                return true;
            };
            let heard = core.sync_position(slot.device.position());
            self.release_words(heard);
            if self.pending.is_empty() || heard <= last_heard {
                if let Err(err) = slot.device.drain().await {
                    drop(guard);
                    core.terminate(SessionOutcome::Errored(err.into())).await;
                    return true;
                }
                break;
            }
            last_heard = heard;
            drop(guard);
            tokio::time::sleep(Duration::from_millis(self.period_ms)).await;
        }
        core.set_position(self.written_end);
        self.release_words(f64::INFINITY);

        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.finish() {
                core.terminate(SessionOutcome::Errored(err.into())).await;
                return true;
            }
        }
        core.terminate(SessionOutcome::Finished).await;
        true
    }

    async fn serve_seek(&mut self, request: SeekRequest) {
        let result = self.seek_to(request.offset).await;
        let _ = request.reply.send(result);
    }

    fn ended(&self) -> SessionError {
        SessionError::InvalidState {
            operation: "seek",
            state: self.core.state(),
        }
    }

    async fn seek_to(&mut self, offset: f64) -> SessionResult<()> {
        let core = self.core.clone();

        // Buffer frames until one covers the offset or the stream ends
        while offset >= self.loaded_end && !self.stream_ended {
            let frame = tokio::select! {
                _ = core.cancel.cancelled() => return Err(self.ended()),
                frame = core.buffer.pop() => frame,
            };
            match frame {
                Some(frame) => {
                    if let Err(err) = self.load(frame) {
                        core.terminate(SessionOutcome::Errored(err.clone())).await;
                        return Err(err);
                    }
                }
                None => self.stream_ended = true,
            }
        }

        let first_start = self.timeline.front().map_or(self.loaded_end, |p| p.start);
        if offset > self.loaded_end || offset < first_start {
            return Err(CapabilityError::OffsetOutOfRange {
                offset,
                duration: self.loaded_end,
            }
            .into());
        }

        let index = self
            .timeline
            .iter()
            .position(|p| offset < p.end())
            .unwrap_or(self.timeline.len());
        let cursor = match self.timeline.get(index) {
            Some(placed) => {
                let relative = offset - placed.start;
                let sample = (relative * placed.frame.sample_rate as f64).round() as usize;
                Cursor {
                    frame: index,
                    sample: sample.min(placed.frame.samples.len()),
                    word: placed
                        .frame
                        .timings
                        .iter()
                        .position(|t| placed.start + t.start >= offset)
                        .unwrap_or(placed.frame.timings.len()),
                }
            }
            None => Cursor {
                frame: index,
                ..Cursor::default()
            },
        };

        let mut guard = core.device.lock().await;
        let state = core.state();
        if state.is_terminal() {
            return Err(SessionError::InvalidState {
                operation: "seek",
                state,
            });
        }
        let flushed = match guard.as_mut() {
            Some(slot) => slot.device.flush().await,
            None => Ok(()),
        };
        if let Err(err) = flushed {
            drop(guard);
            core.terminate(SessionOutcome::Errored(err.clone().into()))
                .await;
            return Err(err.into());
        }

        self.cursor = cursor;
        self.pending.clear();
        self.written_end = offset;
        match guard.as_ref() {
            Some(slot) => core.anchor_clock(slot.device.position(), offset),
            None => core.set_position(offset),
        }
        debug!("Session {}: seek to {:.3}s", core.id, offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PlaybackBuffer;
    use crate::device::AudioDevice;
    use crate::error::DeviceError;
    use crate::events::{EventDispatcher, EventKind, ListenerRegistry};
    use crate::scheduler::SchedulerStats;
    use crate::session::{DeviceSlot, Session, SessionParts};
    use crate::types::WordTiming;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    type Writes = Arc<Mutex<Vec<Vec<i16>>>>;

    struct MockDevice {
        writes: Writes,
        fail_after: Option<usize>,
        delay: Duration,
        played: f64,
    }

    #[async_trait]
    impl AudioDevice for MockDevice {
        async fn write(&mut self, samples: &[i16], rate: u32) -> Result<(), DeviceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut writes = self.writes.lock().unwrap();
            if self.fail_after.is_some_and(|n| writes.len() >= n) {
                return Err(DeviceError::Write("underrun".to_string()));
            }
            writes.push(samples.to_vec());
            self.played += samples.len() as f64 / rate as f64;
            Ok(())
        }

        fn position(&self) -> f64 {
            self.played
        }

        async fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn supports_seek(&self) -> bool {
            true
        }
    }

    /// 10 samples at 1 kHz with a 5 ms period gives two writes per frame
    fn frame(ordinal: usize, words: &[(&str, f64)]) -> AudioFrame {
        AudioFrame {
            ordinal,
            text: String::new(),
            samples: (0..10).map(|i| (ordinal * 100 + i) as i16).collect(),
            sample_rate: 1000,
            timings: words
                .iter()
                .map(|(w, start)| WordTiming::estimated(*w, *start, start + 0.002))
                .collect(),
        }
    }

    struct Harness {
        session: Session,
        writes: Writes,
        events: Arc<Mutex<Vec<SpeechEvent>>>,
        worker: tokio::task::JoinHandle<()>,
    }

    async fn harness(frames: Vec<AudioFrame>, fail_after: Option<usize>, seekable: bool) -> Harness {
        let config = EngineConfig::default().with_period_ms(5);
        harness_with(frames, fail_after, seekable, Duration::ZERO, config).await
    }

    async fn harness_with(
        frames: Vec<AudioFrame>,
        fail_after: Option<usize>,
        seekable: bool,
        delay: Duration,
        config: EngineConfig,
    ) -> Harness {
        let writes: Writes = Arc::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = ListenerRegistry::new();
        {
            let events = events.clone();
            listeners.on_any(
                &[EventKind::Started, EventKind::Word, EventKind::Ended],
                move |event| events.lock().unwrap().push(event.clone()),
            );
        }

        let buffer = PlaybackBuffer::new(16, None);
        for frame in frames {
            buffer.try_push(frame).unwrap();
        }
        buffer.mark_complete();

        let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
        let device = MockDevice {
            writes: writes.clone(),
            fail_after,
            delay,
            played: 0.0,
        };
        let (core, seeks) = SessionCore::new(SessionParts {
            id: 1,
            device: DeviceSlot::new(Box::new(device), permit),
            buffer,
            events: EventDispatcher::spawn(listeners, 64),
            scheduler: Arc::new(SchedulerStats::default()),
            cancel: CancellationToken::new(),
            seek_support: if seekable { Ok(()) } else { Err("disabled".to_string()) },
        });
        core.start();
        let controller = PlaybackController::new(core.clone(), seeks, &config, None);
        Harness {
            session: Session::new(core),
            writes,
            events,
            worker: tokio::spawn(controller.run()),
        }
    }

    #[tokio::test]
    async fn plays_every_period_in_order_then_finishes() {
        let h = harness(
            vec![frame(0, &[("a", 0.0), ("b", 0.006)]), frame(1, &[("c", 0.0)])],
            None,
            false,
        )
        .await;
        let outcome = h.session.wait().await;
        h.worker.await.unwrap();

        assert_eq!(outcome, SessionOutcome::Finished);
        let written: Vec<i16> = h.writes.lock().unwrap().concat();
        let expected: Vec<i16> = (0..10).chain(100..110).collect();
        assert_eq!(written, expected);
        assert_eq!(h.writes.lock().unwrap().len(), 4);
        assert!((h.session.position() - 0.02).abs() < 1e-9);

        let events = h.events.lock().unwrap();
        let kinds: Vec<EventKind> = events.iter().map(SpeechEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::Word,
                EventKind::Word,
                EventKind::Word,
                EventKind::Ended
            ]
        );
        let starts: Vec<f64> = events.iter().map(SpeechEvent::position).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
        assert!((starts[3] - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn device_failure_errors_the_session() {
        let h = harness(vec![frame(0, &[]), frame(1, &[])], Some(1), false).await;
        let outcome = h.session.wait().await;

        assert!(matches!(
            outcome,
            SessionOutcome::Errored(SessionError::Device(DeviceError::Write(_)))
        ));
        assert_eq!(h.session.state(), PlaybackState::Errored);
        assert_eq!(h.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_validate_state() {
        let h = harness(vec![frame(0, &[])], None, false).await;
        h.session.pause().await.unwrap();
        assert_eq!(h.session.state(), PlaybackState::Paused);
        assert!(matches!(
            h.session.pause().await,
            Err(SessionError::InvalidState { operation: "pause", .. })
        ));
        let frozen = h.session.position();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.session.position(), frozen);

        h.session.resume().await.unwrap();
        assert_eq!(h.session.wait().await, SessionOutcome::Finished);
        assert!(matches!(
            h.session.resume().await,
            Err(SessionError::InvalidState { operation: "resume", .. })
        ));
        let written: Vec<i16> = h.writes.lock().unwrap().concat();
        assert_eq!(written, (0..10).collect::<Vec<i16>>());
    }

    #[tokio::test]
    async fn seek_replays_from_offset() {
        let h = harness(vec![frame(0, &[]), frame(1, &[])], None, true).await;
        h.session.pause().await.unwrap();

        h.session.seek(0.015).await.unwrap();
        assert!((h.session.position() - 0.015).abs() < 1e-9);
        let err = h.session.seek(5.0).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capability(CapabilityError::OffsetOutOfRange { .. })
        ));

        let before = h.writes.lock().unwrap().concat();
        h.session.resume().await.unwrap();
        h.session.wait().await;
        let after = h.writes.lock().unwrap().concat();
        assert_eq!(&after[before.len()..], &(105..110).collect::<Vec<i16>>()[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_history_releases_old_frames() {
        let config = EngineConfig::default()
            .with_period_ms(5)
            .with_seek_history_seconds(0.005);
        let h = harness_with(
            vec![frame(0, &[]), frame(1, &[]), frame(2, &[])],
            None,
            true,
            Duration::from_millis(5),
            config,
        )
        .await;
        let mut position = h.session.subscribe_position();
        position.wait_for(|p| *p >= 0.02 - 1e-9).await.unwrap();
        h.session.pause().await.unwrap();

        // Frame 0 ended more than 5 ms before the write cursor
        assert!(matches!(
            h.session.seek(0.0).await,
            Err(SessionError::Capability(CapabilityError::OffsetOutOfRange { .. }))
        ));
        h.session.seek(0.012).await.unwrap();

        let before = h.writes.lock().unwrap().concat().len();
        h.session.resume().await.unwrap();
        assert_eq!(h.session.wait().await, SessionOutcome::Finished);
        let after = h.writes.lock().unwrap().concat();
        let replayed: Vec<i16> = (102..110).chain(200..210).collect();
        assert_eq!(&after[before..], &replayed[..]);
    }

    #[tokio::test]
    async fn seek_requires_support() {
        let h = harness(vec![frame(0, &[])], None, false).await;
        let err = h.session.seek(0.0).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capability(CapabilityError::SeekUnsupported(_))
        ));
        h.session.stop().await.unwrap();
    }
}
