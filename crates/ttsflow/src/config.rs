use crate::error::ConfigError;
use crate::types::{SpeechProperties, VoiceIdentifier};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// max_in_flight = 3
/// buffer_capacity_frames = 4
/// words_per_minute = 170
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest chunk (in characters) sent to the backend in one call
    pub max_chunk_chars: usize,
    /// Concurrent adapter calls per session
    pub max_in_flight: usize,
    /// Retries per chunk after the first failed attempt
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each following retry
    pub retry_backoff_ms: u64,
    /// Timeout for a single adapter call
    pub synthesis_timeout_ms: u64,
    /// Ready frames the playback buffer holds before producers suspend
    pub buffer_capacity_frames: usize,
    /// Optional cap on buffered audio, in seconds
    pub buffer_max_seconds: Option<f64>,
    /// Amount of audio written to the device per write call
    pub period_ms: u64,
    /// Speaking rate assumed by the timing estimator
    pub words_per_minute: u32,
    /// Pause weight added after every estimated word, in characters
    pub inter_word_gap: f64,
    /// Dispatcher queue length before word events start being dropped
    pub event_queue_capacity: usize,
    /// Keep played frames so sessions can seek. Without
    /// `seek_history_seconds` every frame of the utterance stays in memory
    /// until the session ends.
    pub enable_seek: bool,
    /// Seconds of played audio kept for seeking backwards; older frames are
    /// released and offsets before them become out of range
    pub seek_history_seconds: Option<f64>,
    /// Voice used when an utterance does not name one
    pub default_voice: Option<VoiceIdentifier>,
    /// Default prosody, overridden per utterance
    pub properties: SpeechProperties,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 400,
            max_in_flight: 2,
            max_retries: 3,
            retry_backoff_ms: 100,
            synthesis_timeout_ms: 30_000,
            buffer_capacity_frames: 8,
            buffer_max_seconds: None,
            period_ms: 20,
            words_per_minute: 150,
            inter_word_gap: 1.0,
            event_queue_capacity: 256,
            enable_seek: false,
            seek_history_seconds: None,
            default_voice: None,
            properties: SpeechProperties::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("max_chunk_chars", self.max_chunk_chars as u64)?;
        positive("max_in_flight", self.max_in_flight as u64)?;
        positive("synthesis_timeout_ms", self.synthesis_timeout_ms)?;
        positive("buffer_capacity_frames", self.buffer_capacity_frames as u64)?;
        positive("period_ms", self.period_ms)?;
        positive("words_per_minute", self.words_per_minute as u64)?;
        positive("event_queue_capacity", self.event_queue_capacity as u64)?;

        if let Some(seconds) = self.buffer_max_seconds {
            if !(seconds.is_finite() && seconds > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "buffer_max_seconds",
                    reason: format!("must be a positive number of seconds, got {seconds}"),
                });
            }
        }
        if let Some(seconds) = self.seek_history_seconds {
            if !(seconds.is_finite() && seconds >= 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "seek_history_seconds",
                    reason: format!("must be zero or more seconds, got {seconds}"),
                });
            }
        }
        if !(self.inter_word_gap.is_finite() && self.inter_word_gap > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "inter_word_gap",
                reason: format!("must be positive, got {}", self.inter_word_gap),
            });
        }
        Ok(())
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn with_max_chunk_chars(mut self, chars: usize) -> Self {
        self.max_chunk_chars = chars;
        self
    }

    pub fn with_max_in_flight(mut self, in_flight: usize) -> Self {
        self.max_in_flight = in_flight;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_synthesis_timeout_ms(mut self, ms: u64) -> Self {
        self.synthesis_timeout_ms = ms;
        self
    }

    pub fn with_buffer_capacity_frames(mut self, frames: usize) -> Self {
        self.buffer_capacity_frames = frames;
        self
    }

    pub fn with_buffer_max_seconds(mut self, seconds: f64) -> Self {
        self.buffer_max_seconds = Some(seconds);
        self
    }

    pub fn with_period_ms(mut self, ms: u64) -> Self {
        self.period_ms = ms;
        self
    }

    pub fn with_words_per_minute(mut self, wpm: u32) -> Self {
        self.words_per_minute = wpm;
        self
    }

    pub fn with_inter_word_gap(mut self, gap: f64) -> Self {
        self.inter_word_gap = gap;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_seek(mut self, enabled: bool) -> Self {
        self.enable_seek = enabled;
        self
    }

    pub fn with_seek_history_seconds(mut self, seconds: f64) -> Self {
        self.seek_history_seconds = Some(seconds);
        self
    }

    pub fn with_default_voice(mut self, voice: impl Into<VoiceIdentifier>) -> Self {
        self.default_voice = Some(voice.into());
        self
    }

    pub fn with_properties(mut self, properties: SpeechProperties) -> Self {
        self.properties = properties;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
max_in_flight = 3
buffer_capacity_frames = 4
default_voice = { name = "alba" }

[properties]
rate = 1.25
"#;
        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_in_flight, 3);
        assert_eq!(config.buffer_capacity_frames, 4);
        assert_eq!(config.words_per_minute, 150);
        assert_eq!(config.default_voice, Some(VoiceIdentifier::new("alba")));
        assert_eq!(config.properties.rate, Some(1.25));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = EngineConfig::default()
            .with_buffer_capacity_frames(0)
            .validate()
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "buffer_capacity_frames"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_toml() {
        let err = EngineConfig::from_toml_str("max_in_flight = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_negative_buffer_seconds() {
        let err = EngineConfig::default()
            .with_buffer_max_seconds(-1.0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "buffer_max_seconds",
                ..
            }
        ));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let config = EngineConfig::default().with_retry_backoff_ms(10);
        assert_eq!(config.retry_backoff(1), Duration::from_millis(10));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(20));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttsflow.toml");
        std::fs::write(
            &path,
            "period_ms = 10\nenable_seek = true\nseek_history_seconds = 30.0\n",
        )
        .unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.period_ms, 10);
        assert!(config.enable_seek);
        assert_eq!(config.seek_history_seconds, Some(30.0));
    }

    #[test]
    fn rejects_negative_seek_history() {
        let err = EngineConfig::default()
            .with_seek_history_seconds(-2.0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "seek_history_seconds",
                ..
            }
        ));
    }
}
