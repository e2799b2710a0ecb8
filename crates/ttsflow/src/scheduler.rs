//! Chunk synthesis with bounded concurrency and in-order delivery.
//!
//! Up to `max_in_flight` adapter calls run at once. Results may complete in any
//! order; they are held back until every earlier chunk has been handed to the
//! [`PlaybackBuffer`], so the buffer always receives frames by ordinal. No chunk
//! is started more than `max_in_flight` ordinals ahead of the next one due,
//! which bounds the frames held outside the buffer.

use crate::adapter::{SynthesisAdapter, SynthesisOptions, SynthesisOutput};
use crate::buffer::PlaybackBuffer;
use crate::chunker::ChunkSpec;
use crate::codec::decode_payload;
use crate::config::EngineConfig;
use crate::error::{BufferError, SessionError, SessionResult, SynthesisError, SynthesisResult};
use crate::ssml::strip_tags;
use crate::timing::{TimingEstimator, complete_from_starts, normalize_native};
use crate::types::{AudioFrame, VoiceIdentifier, samples_to_seconds};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Synthesis state of one chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Ready,
    Failed,
}

/// Counters shared between the scheduler and the session handle
#[derive(Debug, Default)]
pub struct SchedulerStats {
    retries: AtomicU32,
    states: Mutex<Vec<ChunkState>>,
}

impl SchedulerStats {
    /// Adapter calls repeated after a failure, across all chunks
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.lock_states().clone()
    }

    fn lock_states(&self) -> MutexGuard<'_, Vec<ChunkState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, ordinal: usize, state: ChunkState) {
        if let Some(slot) = self.lock_states().get_mut(ordinal) {
            *slot = state;
        }
    }
}

/// Everything a synthesis task needs, shared by all tasks of a session
struct ChunkRequest {
    adapter: Arc<dyn SynthesisAdapter>,
    estimator: TimingEstimator,
    voice: Option<VoiceIdentifier>,
    options: SynthesisOptions,
    /// Content is SSML but the adapter only takes plain text
    strip_markup: bool,
    config: EngineConfig,
    stats: Arc<SchedulerStats>,
}

impl ChunkRequest {
    /// Synthesize one chunk, retrying with exponential backoff
    async fn synthesize(&self, chunk: &ChunkSpec) -> SessionResult<AudioFrame> {
        let text = if self.strip_markup {
            strip_tags(&chunk.text)
        } else {
            chunk.text.clone()
        };
        let timeout = self.config.synthesis_timeout();
        let max_attempts = self.config.max_retries + 1;

        let mut attempt = 1;
        loop {
            let call = self
                .adapter
                .synthesize(&text, self.voice.as_ref(), &self.options);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result.and_then(|output| self.build_frame(chunk, output)),
                Err(_) => Err(SynthesisError::Timeout(timeout)),
            };

            match result {
                Ok(frame) => return Ok(frame),
                Err(err) if attempt < max_attempts => {
                    let delay = self.config.retry_backoff(attempt);
                    warn!(
                        "Chunk {} attempt {}/{} failed on '{}': {}; retrying in {}ms",
                        chunk.ordinal,
                        attempt,
                        max_attempts,
                        self.adapter.name(),
                        err,
                        delay.as_millis()
                    );
                    self.stats.retries.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        "Chunk {} failed after {} attempt(s) on '{}': {}",
                        chunk.ordinal,
                        attempt,
                        self.adapter.name(),
                        err
                    );
                    return Err(SessionError::SynthesisExhausted {
                        chunk: chunk.ordinal,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    fn build_frame(&self, chunk: &ChunkSpec, output: SynthesisOutput) -> SynthesisResult<AudioFrame> {
        let (samples, sample_rate) = decode_payload(&output.pcm, output.sample_rate)?;
        let duration = samples_to_seconds(samples.len(), sample_rate);

        let timings = match (output.word_timings, output.word_starts) {
            (Some(timings), _) if !timings.is_empty() => normalize_native(timings, duration),
            (_, Some(starts)) if !starts.is_empty() => {
                normalize_native(complete_from_starts(starts, duration), duration)
            }
            _ => {
                if self.adapter.capabilities().supports_native_timing {
                    debug!(
                        "'{}' returned no timings for chunk {}, estimating",
                        self.adapter.name(),
                        chunk.ordinal
                    );
                }
                self.estimator.estimate(&chunk.text, duration)
            }
        };

        Ok(AudioFrame {
            ordinal: chunk.ordinal,
            text: chunk.text.clone(),
            samples,
            sample_rate,
            timings,
        })
    }
}

/// Drives synthesis of a session's chunks into a [`PlaybackBuffer`]
pub struct ChunkScheduler {
    request: ChunkRequest,
    max_in_flight: usize,
    cancel: CancellationToken,
}

impl ChunkScheduler {
    pub fn new(adapter: Arc<dyn SynthesisAdapter>, config: &EngineConfig) -> Self {
        Self {
            request: ChunkRequest {
                adapter,
                estimator: TimingEstimator::from_config(config),
                voice: config.default_voice.clone(),
                options: SynthesisOptions {
                    ssml: false,
                    properties: config.properties.clone(),
                },
                strip_markup: false,
                config: config.clone(),
                stats: Arc::new(SchedulerStats::default()),
            },
            max_in_flight: config.max_in_flight.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Voice for every chunk; `None` keeps the backend default
    pub fn with_voice(mut self, voice: Option<VoiceIdentifier>) -> Self {
        if voice.is_some() {
            self.request.voice = voice;
        }
        self
    }

    /// Options for every chunk. SSML is reduced to plain text when the
    /// adapter cannot take it.
    pub fn with_options(mut self, mut options: SynthesisOptions) -> Self {
        let supports_ssml = self.request.adapter.capabilities().supports_ssml;
        let strip_markup = options.ssml && !supports_ssml;
        if strip_markup {
            debug!(
                "'{}' does not accept SSML, sending plain text",
                self.request.adapter.name()
            );
            options.ssml = false;
        }
        self.request.options = options;
        self.request.strip_markup = strip_markup;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.request.stats.clone()
    }

    /// Synthesize `chunks` and push their frames into `buffer` in ordinal order.
    ///
    /// Returns `Ok` when every frame was pushed, or early when the session is
    /// cancelled or the buffer closed. The first chunk that exhausts its
    /// retries aborts the remaining work and is returned as the error.
    pub async fn run(self, chunks: Vec<ChunkSpec>, buffer: &PlaybackBuffer) -> SessionResult<()> {
        let Self {
            request,
            max_in_flight,
            cancel,
        } = self;
        let request = Arc::new(request);
        let stats = request.stats.clone();
        *stats.lock_states() = vec![ChunkState::Pending; chunks.len()];

        let mut pending = chunks.into_iter().peekable();
        let mut in_flight: JoinSet<(usize, SessionResult<AudioFrame>)> = JoinSet::new();
        let mut ready: BTreeMap<usize, AudioFrame> = BTreeMap::new();
        let mut next_due = 0;

        loop {
            while in_flight.len() < max_in_flight {
                let Some(chunk) = pending.next_if(|c| c.ordinal < next_due + max_in_flight) else {
                    break;
                };
                stats.set_state(chunk.ordinal, ChunkState::InFlight);
                let request = request.clone();
                in_flight.spawn(async move { (chunk.ordinal, request.synthesize(&chunk).await) });
            }

            if in_flight.is_empty() {
                if pending.peek().is_none() {
                    return Ok(());
                }
                // Only reachable if ordinals are not contiguous
                let received = pending.peek().map(|c| c.ordinal).unwrap_or(next_due);
                return Err(SessionError::OrderingViolation {
                    expected: next_due,
                    received,
                });
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Synthesis cancelled with {} call(s) in flight", in_flight.len());
                    in_flight.abort_all();
                    return Ok(());
                }
                joined = in_flight.join_next() => joined,
            };

            match joined {
                Some(Ok((ordinal, Ok(frame)))) => {
                    stats.set_state(ordinal, ChunkState::Ready);
                    ready.insert(ordinal, frame);
                }
                Some(Ok((ordinal, Err(err)))) => {
                    stats.set_state(ordinal, ChunkState::Failed);
                    in_flight.abort_all();
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    // A panicking adapter; the failed chunk is not known, blame the one due
                    error!("Synthesis task failed: {}", join_err);
                    in_flight.abort_all();
                    return Err(SessionError::SynthesisExhausted {
                        chunk: next_due,
                        attempts: 1,
                        source: SynthesisError::backend(
                            request.adapter.name(),
                            format!("synthesis task failed: {join_err}"),
                        ),
                    });
                }
                None => {}
            }

            while let Some(frame) = ready.remove(&next_due) {
                let pushed = tokio::select! {
                    _ = cancel.cancelled() => {
                        in_flight.abort_all();
                        return Ok(());
                    }
                    pushed = buffer.push(frame) => pushed,
                };
                match pushed {
                    Ok(()) => next_due += 1,
                    Err(BufferError::OutOfOrder { expected, received }) => {
                        in_flight.abort_all();
                        return Err(SessionError::OrderingViolation { expected, received });
                    }
                    // Closed by stop; a blocking push never reports Full
                    Err(BufferError::Closed(_) | BufferError::Full(_)) => {
                        in_flight.abort_all();
                        return Ok(());
                    }
                }
            }
        }
    }
}
