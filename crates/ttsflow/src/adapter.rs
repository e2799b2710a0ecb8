use crate::error::SynthesisResult;
use crate::types::{SpeechProperties, VoiceIdentifier, WordTiming};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a backend can do beyond plain synthesis.
///
/// The engine branches on these flags instead of on concrete backend types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Backend returns per-word timings with its audio
    pub supports_native_timing: bool,
    /// Backend accepts SSML markup
    pub supports_ssml: bool,
    /// Backend audio may be repositioned during playback
    pub supports_seek: bool,
}

impl Capabilities {
    pub fn with_native_timing(mut self) -> Self {
        self.supports_native_timing = true;
        self
    }

    pub fn with_ssml(mut self) -> Self {
        self.supports_ssml = true;
        self
    }

    pub fn with_seek(mut self) -> Self {
        self.supports_seek = true;
        self
    }
}

/// Per-call options handed to the adapter
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesisOptions {
    /// `text` is an SSML document rather than plain text
    pub ssml: bool,
    /// Prosody after merging engine defaults with utterance overrides
    pub properties: SpeechProperties,
}

/// Audio returned by one adapter call
#[derive(Clone, Debug)]
pub struct SynthesisOutput {
    /// PCM16LE mono samples, or a mono 16-bit RIFF/WAV container
    pub pcm: Bytes,
    /// Sample rate of `pcm` in Hz
    pub sample_rate: u32,
    /// Word timings relative to the start of this audio, if the backend reports them
    pub word_timings: Option<Vec<WordTiming>>,
    /// Word start offsets only, for backends that do not report ends.
    /// Ignored when `word_timings` is present.
    pub word_starts: Option<Vec<(f64, String)>>,
}

impl SynthesisOutput {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
            word_timings: None,
            word_starts: None,
        }
    }

    /// Build from PCM16 samples
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(pcm, sample_rate)
    }

    pub fn with_word_timings(mut self, timings: Vec<WordTiming>) -> Self {
        self.word_timings = Some(timings);
        self
    }

    pub fn with_word_starts(mut self, starts: Vec<(f64, String)>) -> Self {
        self.word_starts = Some(starts);
        self
    }
}

/// A synthesis backend: cloud API, OS synthesizer or local model.
///
/// Implementations must be safe to call concurrently for different chunks;
/// the scheduler keeps several calls in flight per session.
#[async_trait]
pub trait SynthesisAdapter: Send + Sync {
    /// Produce audio for one chunk of text (required)
    ///
    /// # Arguments
    /// * `text` - Chunk text, or a self-contained `<speak>` document when `options.ssml` is set
    /// * `voice` - Voice to use; `None` selects the backend default
    /// * `options` - Prosody and content kind
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&VoiceIdentifier>,
        options: &SynthesisOptions,
    ) -> SynthesisResult<SynthesisOutput>;

    /// Backend name used in logs and errors
    fn name(&self) -> &str;

    /// Capability set (default: plain text only, no timings, no seek)
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Sample rate the backend produces by default
    fn default_sample_rate(&self) -> u32 {
        24000
    }
}
