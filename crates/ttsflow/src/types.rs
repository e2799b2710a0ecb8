use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Voice identifier passed through to the synthesis backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VoiceIdentifier {
    /// Backend-specific voice name (e.g., "en-US-JennyNeural", "alba")
    pub name: String,
}

impl VoiceIdentifier {
    /// Create a voice identifier from a backend voice name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get the voice name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<String> for VoiceIdentifier {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&str> for VoiceIdentifier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for VoiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Whether utterance content is plain text or SSML markup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Plain,
    Ssml,
}

impl ContentKind {
    /// Content whose first element is `<speak` is SSML; anything else is plain text.
    pub fn detect(content: &str) -> Self {
        let trimmed = content.trim_start();
        match (trimmed.get(..6), trimmed.get(6..)) {
            (Some(head), Some(rest)) if head.eq_ignore_ascii_case("<speak") => {
                let terminated = rest
                    .chars()
                    .next()
                    .map(|c| c == '>' || c == '/' || c.is_whitespace())
                    .unwrap_or(false);
                if terminated {
                    ContentKind::Ssml
                } else {
                    ContentKind::Plain
                }
            }
            _ => ContentKind::Plain,
        }
    }
}

/// Tunable prosody properties
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    /// Speaking rate multiplier (1.0 = normal)
    Rate,
    /// Output volume in percent (0-100)
    Volume,
    /// Pitch multiplier (1.0 = normal)
    Pitch,
}

/// Prosody settings. `None` leaves the backend default in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechProperties {
    #[serde(default)]
    pub rate: Option<f32>,
    #[serde(default)]
    pub volume: Option<f32>,
    #[serde(default)]
    pub pitch: Option<f32>,
}

impl SpeechProperties {
    pub fn get(&self, property: Property) -> Option<f32> {
        match property {
            Property::Rate => self.rate,
            Property::Volume => self.volume,
            Property::Pitch => self.pitch,
        }
    }

    pub fn set(&mut self, property: Property, value: Option<f32>) {
        match property {
            Property::Rate => self.rate = value,
            Property::Volume => self.volume = value,
            Property::Pitch => self.pitch = value,
        }
    }

    /// Values set in `overrides` win over `self`.
    pub fn merged(&self, overrides: &SpeechProperties) -> SpeechProperties {
        SpeechProperties {
            rate: overrides.rate.or(self.rate),
            volume: overrides.volume.or(self.volume),
            pitch: overrides.pitch.or(self.pitch),
        }
    }
}

/// One text-to-speech request. Immutable once handed to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Utterance {
    content: String,
    kind: ContentKind,
    voice: Option<VoiceIdentifier>,
    properties: SpeechProperties,
}

impl Utterance {
    /// Create an utterance, detecting SSML from the content
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let kind = ContentKind::detect(&content);
        Self {
            content,
            kind,
            voice: None,
            properties: SpeechProperties::default(),
        }
    }

    /// Plain text utterance, never interpreted as SSML
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Plain,
            ..Self::new(content)
        }
    }

    /// SSML utterance
    pub fn ssml(content: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Ssml,
            ..Self::new(content)
        }
    }

    pub fn with_voice(mut self, voice: impl Into<VoiceIdentifier>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_property(mut self, property: Property, value: f32) -> Self {
        self.properties.set(property, Some(value));
        self
    }

    pub fn with_properties(mut self, properties: SpeechProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn voice(&self) -> Option<&VoiceIdentifier> {
        self.voice.as_ref()
    }

    pub fn properties(&self) -> &SpeechProperties {
        &self.properties
    }
}

/// Where a word timing came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingSource {
    /// Reported by the backend; authoritative
    Native,
    /// Computed by the timing estimator; advisory only
    Estimated,
}

/// Start/end offset of one word, in seconds relative to the start of its chunk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub source: TimingSource,
}

impl WordTiming {
    pub fn native(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
            source: TimingSource::Native,
        }
    }

    pub fn estimated(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
            source: TimingSource::Estimated,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Same timing shifted by `offset` seconds
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            ..self.clone()
        }
    }
}

/// Decoded PCM16 mono audio for one chunk, plus the word timings that belong to it.
///
/// Frames are moved, never copied, from the scheduler into the playback buffer
/// and from there into the playback controller.
#[derive(Debug, PartialEq)]
pub struct AudioFrame {
    /// Ordinal of the originating chunk
    pub ordinal: usize,
    /// Text that was synthesized for this chunk
    pub text: String,
    /// PCM16 mono samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Word timings relative to the start of this frame
    pub timings: Vec<WordTiming>,
}

impl AudioFrame {
    /// Decoded audio duration in seconds
    pub fn duration(&self) -> f64 {
        samples_to_seconds(self.samples.len(), self.sample_rate)
    }

    /// Source of this frame's word timings, if there are any
    pub fn timing_source(&self) -> Option<TimingSource> {
        self.timings.first().map(|t| t.source)
    }

    /// Samples as little-endian PCM16 bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

pub(crate) fn samples_to_seconds(samples: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f64 / sample_rate as f64
}

/// Playback session state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Finished,
    Errored,
}

impl PlaybackState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlaybackState::Stopped | PlaybackState::Finished | PlaybackState::Errored
        )
    }
}

/// Terminal result of a session
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// All audio was written to the device
    Finished,
    /// The caller stopped the session
    Stopped,
    /// The session failed
    Errored(SessionError),
}

impl SessionOutcome {
    pub fn state(&self) -> PlaybackState {
        match self {
            SessionOutcome::Finished => PlaybackState::Finished,
            SessionOutcome::Stopped => PlaybackState::Stopped,
            SessionOutcome::Errored(_) => PlaybackState::Errored,
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            SessionOutcome::Errored(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, SessionOutcome::Errored(_))
    }
}
