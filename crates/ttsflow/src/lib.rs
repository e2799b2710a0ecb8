//! # ttsflow
//!
//! Streaming text-to-speech core: turns an utterance into audio through a
//! pluggable synthesis backend and plays it while later parts are still being
//! synthesized.
//!
//! ## Pipeline
//!
//! - **Chunker**: splits plain text at sentence boundaries and SSML between
//!   elements, keeping every chunk under the backend's length limit
//! - **ChunkScheduler**: keeps a bounded number of adapter calls in flight,
//!   retries failures with exponential backoff and releases frames in order
//! - **TimingEstimator**: gives every word a start and end when the backend
//!   reports no timings
//! - **PlaybackBuffer**: bounded queue between synthesis and playback
//! - **Session**: pause, resume, stop and seek for one utterance
//! - **EventDispatcher**: delivers `Started`, `Word` and `Ended` events to
//!   listeners off the audio path
//!
//! ## Backends and outputs
//!
//! Backends implement [`SynthesisAdapter`]; outputs implement [`AudioDevice`]
//! and are opened per session through a [`DeviceProvider`]. Enable outputs
//! with feature flags:
//! - `wav` (default): WAV payload decoding, [`WavSink`] and
//!   [`TtsEngine::synthesize_to_file`]
//! - `playback`: [`RodioDevice`] on the system's default output
//!
//! ## Example
//!
//! ```rust
//! use ttsflow::{
//!     EngineConfig, NullDeviceProvider, SynthesisAdapter, SynthesisOptions, SynthesisOutput,
//!     SynthesisResult, TtsEngine, Utterance, VoiceIdentifier,
//! };
//!
//! struct Silence;
//!
//! #[async_trait::async_trait]
//! impl SynthesisAdapter for Silence {
//!     async fn synthesize(
//!         &self,
//!         text: &str,
//!         _voice: Option<&VoiceIdentifier>,
//!         _options: &SynthesisOptions,
//!     ) -> SynthesisResult<SynthesisOutput> {
//!         Ok(SynthesisOutput::from_samples(&vec![0; text.len() * 10], 16000))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "silence"
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let engine = TtsEngine::new(Silence, NullDeviceProvider, EngineConfig::default()).unwrap();
//! let audio = engine.synthesize(Utterance::text("Hello world.")).await.unwrap();
//! assert_eq!(audio.word_timings().len(), 2);
//! # });
//! ```

pub mod adapter;
pub mod buffer;
pub mod chunker;
pub mod codec;
pub mod config;
mod controller;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod session;
pub mod sink;
mod ssml;
pub mod timing;
pub mod types;

#[cfg(feature = "playback")]
pub mod playback;

pub use adapter::{Capabilities, SynthesisAdapter, SynthesisOptions, SynthesisOutput};
pub use buffer::PlaybackBuffer;
pub use chunker::{ChunkSpec, Chunker};
pub use config::EngineConfig;
pub use device::{AudioDevice, DeviceProvider, NullDevice, NullDeviceProvider};
pub use engine::{SynthesizedAudio, TtsEngine};
pub use error::{
    BufferError, CapabilityError, ConfigError, DeviceError, SessionError, SessionResult,
    SinkError, SynthesisError, SynthesisResult,
};
pub use events::{EventDispatcher, EventKind, ListenerRegistry, SpeechEvent};
pub use scheduler::{ChunkScheduler, ChunkState, SchedulerStats};
pub use session::Session;
pub use sink::AudioSink;
pub use ssml::strip_tags;
pub use timing::TimingEstimator;
pub use types::{
    AudioFrame, ContentKind, PlaybackState, Property, SessionOutcome, SpeechProperties,
    TimingSource, Utterance, VoiceIdentifier, WordTiming,
};

#[cfg(feature = "wav")]
pub use sink::WavSink;

#[cfg(feature = "playback")]
pub use playback::{RodioDevice, RodioDeviceProvider};
