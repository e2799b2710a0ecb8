use crate::types::{AudioFrame, PlaybackState};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`SynthesisAdapter`](crate::SynthesisAdapter) call.
///
/// These are transient from the session's point of view: the scheduler retries
/// them and only surfaces [`SessionError::SynthesisExhausted`] once the retry
/// budget is spent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    /// Backend-specific failure
    #[error("Synthesis failed in backend '{backend}': {message}")]
    Backend { backend: String, message: String },

    /// The adapter did not answer within the configured timeout
    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),

    /// The adapter returned audio the core cannot decode
    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    /// Voice not known to the backend
    #[error("Voice not found: '{0}'")]
    VoiceNotFound(String),
}

impl SynthesisError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Audio output failures. Always fatal to the session that owns the device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Failed to open audio output device: {0}")]
    Open(String),
    #[error("Failed to write audio frames to device: {0}")]
    Write(String),
    #[error("Failed to close audio output device: {0}")]
    Close(String),
    #[error("Audio device is unavailable: {0}")]
    Unavailable(String),
}

/// Requested operation is not supported by the adapter, device or configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error(
        "Seeking is not supported\nReason: {0}\nSuggestion: enable `enable_seek` and use an adapter and device that both report seek support"
    )]
    SeekUnsupported(String),

    #[error("Seek offset {offset:.3}s is outside the stream (duration {duration:.3}s)")]
    OffsetOutOfRange { offset: f64, duration: f64 },
}

/// Errors raised while writing frames to an [`AudioSink`](crate::AudioSink).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink IO error: {0}")]
    Io(String),
    #[error("Sink rejected audio: {0}")]
    Format(String),
}

/// Rejected [`PlaybackBuffer`](crate::PlaybackBuffer) pushes. Frames are handed
/// back so the producer keeps ownership.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Playback buffer is full")]
    Full(AudioFrame),
    #[error("Playback buffer no longer accepts frames")]
    Closed(AudioFrame),
    #[error("Frame for chunk {received} pushed while chunk {expected} is due")]
    OutOfOrder { expected: usize, received: usize },
}

/// Invalid engine configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Failed to read configuration file '{path}': {reason}")]
    Io { path: String, reason: String },
}

/// Session-level errors. Every terminal session state that is not a success
/// carries one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A chunk kept failing after all retries
    #[error(
        "Synthesis of chunk {chunk} failed after {attempts} attempt(s): {source}\nSuggestion: check backend availability or raise `max_retries`"
    )]
    SynthesisExhausted {
        chunk: usize,
        attempts: u32,
        #[source]
        source: SynthesisError,
    },

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Frames reached the playback path out of ordinal order. Internal invariant breach.
    #[error("Ordering violation: expected chunk {expected}, received chunk {received}")]
    OrderingViolation { expected: usize, received: usize },

    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlaybackState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Result type for adapter calls
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_error_exposes_source() {
        let err = SessionError::SynthesisExhausted {
            chunk: 3,
            attempts: 4,
            source: SynthesisError::Timeout(Duration::from_millis(50)),
        };
        let message = err.to_string();
        assert!(message.contains("chunk 3"));
        assert!(message.contains("4 attempt"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn device_error_converts_into_session_error() {
        let err: SessionError = DeviceError::Write("underrun".to_string()).into();
        match err {
            SessionError::Device(DeviceError::Write(msg)) => assert_eq!(msg, "underrun"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
