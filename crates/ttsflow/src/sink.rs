//! Sinks receive the same frame stream as the audio device.

use crate::error::SinkError;
use crate::types::AudioFrame;
#[cfg(feature = "wav")]
use std::fs::File;
#[cfg(feature = "wav")]
use std::io::BufWriter;
#[cfg(feature = "wav")]
use std::path::{Path, PathBuf};

/// Collaborator that persists or forwards played audio
pub trait AudioSink: Send {
    /// Receive one frame. Frames arrive in ordinal order, each at most once.
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), SinkError>;

    /// Called once after the last frame when the session finishes normally
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Rate used for a WAV file that never received audio
#[cfg(feature = "wav")]
const EMPTY_FILE_SAMPLE_RATE: u32 = 24000;

/// Writes frames to a mono 16-bit WAV file.
///
/// The file is created on the first frame, whose sample rate fixes the rate of
/// the whole file.
#[cfg(feature = "wav")]
pub struct WavSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_rate: Option<u32>,
    finished: bool,
}

#[cfg(feature = "wav")]
impl WavSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            sample_rate: None,
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self, sample_rate: u32) -> Result<(), SinkError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&self.path, spec).map_err(|err| {
            SinkError::Io(format!("cannot create '{}': {err}", self.path.display()))
        })?;
        self.writer = Some(writer);
        self.sample_rate = Some(sample_rate);
        Ok(())
    }
}

#[cfg(feature = "wav")]
impl AudioSink for WavSink {
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Io("sink already finished".to_string()));
        }
        match self.sample_rate {
            None => self.open(frame.sample_rate)?,
            Some(rate) if rate != frame.sample_rate => {
                return Err(SinkError::Format(format!(
                    "chunk {} has sample rate {} Hz, file was started at {} Hz",
                    frame.ordinal, frame.sample_rate, rate
                )));
            }
            Some(_) => {}
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Io("WAV writer is not open".to_string()));
        };
        let mut samples = writer.get_i16_writer(frame.samples.len() as u32);
        for &sample in &frame.samples {
            samples.write_sample(sample);
        }
        samples
            .flush()
            .map_err(|err| SinkError::Io(err.to_string()))
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if self.finished {
            return Ok(());
        }
        if self.writer.is_none() {
            self.open(EMPTY_FILE_SAMPLE_RATE)?;
        }
        self.finished = true;
        match self.writer.take() {
            Some(writer) => writer
                .finalize()
                .map_err(|err| SinkError::Io(err.to_string())),
            None => Ok(()),
        }
    }
}
