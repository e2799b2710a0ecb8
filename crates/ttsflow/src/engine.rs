//! Engine facade: owns the adapter, the device provider and the listener
//! registry, and starts one [`Session`] per utterance.

use crate::adapter::{Capabilities, SynthesisAdapter, SynthesisOptions};
use crate::buffer::PlaybackBuffer;
use crate::chunker::{ChunkSpec, Chunker};
use crate::config::EngineConfig;
use crate::controller::PlaybackController;
use crate::device::{AudioDevice, DeviceProvider};
use crate::error::{ConfigError, DeviceError, SessionResult};
use crate::events::{EventDispatcher, EventKind, ListenerRegistry, SpeechEvent};
use crate::scheduler::ChunkScheduler;
use crate::session::{DeviceSlot, Session, SessionCore, SessionParts};
use crate::sink::AudioSink;
use crate::types::{
    AudioFrame, ContentKind, Property, SessionOutcome, SpeechProperties, Utterance, WordTiming,
};
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Text-to-speech engine.
///
/// One engine drives one audio output: sessions started while another one
/// still holds the device wait for it to end.
///
/// ```no_run
/// use ttsflow::{EngineConfig, EventKind, NullDeviceProvider, SpeechEvent, TtsEngine, Utterance};
/// # async fn run(adapter: impl ttsflow::SynthesisAdapter + 'static) -> ttsflow::SessionResult<()> {
/// let mut engine = TtsEngine::new(adapter, NullDeviceProvider, EngineConfig::default())?;
/// engine.on(EventKind::Word, |event| {
///     if let SpeechEvent::Word { word, start, .. } = event {
///         println!("{start:.2}s {word}");
///     }
/// });
/// let session = engine.speak(Utterance::text("Hello world. This is a test.")).await?;
/// assert!(session.outcome().is_some());
/// # Ok(())
/// # }
/// ```
pub struct TtsEngine {
    adapter: Arc<dyn SynthesisAdapter>,
    devices: Arc<dyn DeviceProvider>,
    config: EngineConfig,
    listeners: ListenerRegistry,
    properties: SpeechProperties,
    device_permit: Arc<Semaphore>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for TtsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsEngine")
            .field("adapter", &self.adapter.name())
            .field("listeners", &self.listeners.len())
            .field("properties", &self.properties)
            .finish()
    }
}

impl TtsEngine {
    pub fn new<A, D>(adapter: A, devices: D, config: EngineConfig) -> Result<Self, ConfigError>
    where
        A: SynthesisAdapter + 'static,
        D: DeviceProvider + 'static,
    {
        Self::from_shared(Arc::new(adapter), Arc::new(devices), config)
    }

    /// Build from an adapter and provider that are shared with other owners
    pub fn from_shared(
        adapter: Arc<dyn SynthesisAdapter>,
        devices: Arc<dyn DeviceProvider>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "TTS engine using backend '{}' ({:?})",
            adapter.name(),
            adapter.capabilities()
        );
        Ok(Self {
            adapter,
            devices,
            properties: config.properties,
            config,
            listeners: ListenerRegistry::new(),
            device_permit: Arc::new(Semaphore::new(1)),
            next_session: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// Register a listener for sessions started after this call
    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: Fn(&SpeechEvent) + Send + Sync + 'static,
    {
        self.listeners.on(kind, callback);
    }

    pub fn on_any<F>(&mut self, kinds: &[EventKind], callback: F)
    where
        F: Fn(&SpeechEvent) + Send + Sync + 'static,
    {
        self.listeners.on_any(kinds, callback);
    }

    /// Engine-wide prosody default. Utterance properties take precedence.
    pub fn set_property(&mut self, property: Property, value: f32) {
        self.properties.set(property, Some(value));
    }

    /// Return a property to the backend default
    pub fn clear_property(&mut self, property: Property) {
        self.properties.set(property, None);
    }

    pub fn property(&self, property: Property) -> Option<f32> {
        self.properties.get(property)
    }

    /// Speak `utterance` and return once the session has ended and every
    /// listener has seen `Ended`.
    pub async fn speak(&self, utterance: Utterance) -> SessionResult<Session> {
        let session = self.speak_streamed(utterance).await?;
        let outcome = session.wait().await;
        debug!("Session {} ended: {:?}", session.id(), outcome);
        Ok(session)
    }

    /// Start speaking `utterance` and return the session handle right away.
    ///
    /// Waits for the previous session to release the device first.
    pub async fn speak_streamed(&self, utterance: Utterance) -> SessionResult<Session> {
        self.start_session(utterance, None).await
    }

    /// Like [`speak_streamed`](Self::speak_streamed), also copying every
    /// synthesized frame into `sink`
    pub async fn speak_streamed_with_sink<S>(
        &self,
        utterance: Utterance,
        sink: S,
    ) -> SessionResult<Session>
    where
        S: AudioSink + 'static,
    {
        self.start_session(utterance, Some(Box::new(sink))).await
    }

    /// Synthesize the whole utterance without playing it
    pub async fn synthesize(&self, utterance: Utterance) -> SessionResult<SynthesizedAudio> {
        let chunks = self.chunk(&utterance);
        let scheduler = self.scheduler_for(&utterance, CancellationToken::new());
        let buffer = PlaybackBuffer::new(
            self.config.buffer_capacity_frames,
            self.config.buffer_max_seconds,
        );

        let produce = async {
            let result = scheduler.run(chunks, &buffer).await;
            match &result {
                Ok(()) => buffer.mark_complete(),
                Err(_) => {
                    buffer.close();
                }
            }
            result
        };
        let collect = async {
            let mut frames = Vec::new();
            while let Some(frame) = buffer.pop().await {
                frames.push(frame);
            }
            frames
        };
        let (result, frames) = futures::future::join(produce, collect).await;
        result?;
        Ok(SynthesizedAudio::new(frames))
    }

    /// Synthesize the utterance into a WAV file
    #[cfg(feature = "wav")]
    pub async fn synthesize_to_file(
        &self,
        utterance: Utterance,
        path: impl AsRef<std::path::Path>,
    ) -> SessionResult<SynthesizedAudio> {
        let audio = self.synthesize(utterance).await?;
        let mut sink = crate::sink::WavSink::new(path);
        for frame in audio.frames() {
            sink.write_frame(frame)?;
        }
        sink.finish()?;
        info!(
            "Wrote {:.2}s of audio to {}",
            audio.duration(),
            sink.path().display()
        );
        Ok(audio)
    }

    fn chunk(&self, utterance: &Utterance) -> Vec<ChunkSpec> {
        let chunks = Chunker::new(self.config.max_chunk_chars).split(utterance);
        debug!(
            "Split {} chars of {:?} into {} chunk(s)",
            utterance.content().len(),
            utterance.kind(),
            chunks.len()
        );
        chunks
    }

    fn scheduler_for(&self, utterance: &Utterance, cancel: CancellationToken) -> ChunkScheduler {
        let voice = utterance
            .voice()
            .cloned()
            .or_else(|| self.config.default_voice.clone());
        let options = SynthesisOptions {
            ssml: utterance.kind() == ContentKind::Ssml,
            properties: self.properties.merged(utterance.properties()),
        };
        ChunkScheduler::new(self.adapter.clone(), &self.config)
            .with_voice(voice)
            .with_options(options)
            .with_cancellation(cancel)
    }

    /// `Ok` when sessions on `device` can seek, otherwise the reason
    fn seek_support(&self, device: &dyn AudioDevice) -> Result<(), String> {
        if !self.config.enable_seek {
            Err("seeking is disabled in the engine configuration".to_string())
        } else if !self.adapter.capabilities().supports_seek {
            Err(format!(
                "backend '{}' does not support seeking",
                self.adapter.name()
            ))
        } else if !device.supports_seek() {
            Err("the audio device cannot discard queued audio".to_string())
        } else {
            Ok(())
        }
    }

    async fn start_session(
        &self,
        utterance: Utterance,
        sink: Option<Box<dyn AudioSink>>,
    ) -> SessionResult<Session> {
        let permit = self
            .device_permit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeviceError::Unavailable("engine is shutting down".to_string()))?;
        let device = self.devices.open()?;
        let seek_support = self.seek_support(device.as_ref());

        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let chunks = self.chunk(&utterance);
        let cancel = CancellationToken::new();
        let scheduler = self.scheduler_for(&utterance, cancel.clone());

        let (core, seeks) = SessionCore::new(SessionParts {
            id,
            device: DeviceSlot::new(device, permit),
            buffer: PlaybackBuffer::new(
                self.config.buffer_capacity_frames,
                self.config.buffer_max_seconds,
            ),
            events: EventDispatcher::spawn(
                self.listeners.clone(),
                self.config.event_queue_capacity,
            ),
            scheduler: scheduler.stats(),
            cancel,
            seek_support,
        });
        info!("Session {} started with {} chunk(s)", id, chunks.len());
        core.start();

        let controller = PlaybackController::new(core.clone(), seeks, &self.config, sink);
        tokio::spawn(controller.run());

        let producer = core.clone();
        tokio::spawn(async move {
            match scheduler.run(chunks, &producer.buffer).await {
                Ok(()) => producer.buffer.mark_complete(),
                Err(err) => {
                    producer.terminate(SessionOutcome::Errored(err)).await;
                }
            }
        });

        Ok(Session::new(core))
    }
}

/// Audio for a whole utterance, produced by [`TtsEngine::synthesize`]
#[derive(Debug, Default)]
pub struct SynthesizedAudio {
    frames: Vec<AudioFrame>,
}

impl SynthesizedAudio {
    fn new(frames: Vec<AudioFrame>) -> Self {
        Self { frames }
    }

    /// Frames in chunk order
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<AudioFrame> {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.samples.is_empty())
    }

    pub fn duration(&self) -> f64 {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    /// Sample rate of the first frame
    pub fn sample_rate(&self) -> Option<u32> {
        self.frames.first().map(|f| f.sample_rate)
    }

    /// All samples, concatenated
    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }

    /// PCM16LE bytes of the whole utterance
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.frames.iter().flat_map(AudioFrame::to_le_bytes).collect()
    }

    /// Word timings relative to the start of the utterance
    pub fn word_timings(&self) -> Vec<WordTiming> {
        let mut offset = 0.0;
        let mut timings = Vec::new();
        for frame in &self.frames {
            timings.extend(frame.timings.iter().map(|t| t.shifted(offset)));
            offset += frame.duration();
        }
        timings
    }
}
