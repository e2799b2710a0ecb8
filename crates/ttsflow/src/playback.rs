use crate::device::{AudioDevice, DeviceProvider};
use crate::error::DeviceError;
use async_trait::async_trait;
use log::debug;
use rodio::{OutputStreamBuilder, Sink};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Queued buffers allowed inside the sink before `write` waits
const MAX_QUEUED_BUFFERS: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default system output through rodio.
///
/// The output stream lives on its own thread for the lifetime of the device;
/// the sink is driven from the session.
pub struct RodioDevice {
    sink: Sink,
    shutdown: Option<mpsc::Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
    written_seconds: f64,
    /// Durations of the most recently appended buffers, oldest first
    queued: VecDeque<f64>,
}

impl RodioDevice {
    /// Open the default output device
    pub fn try_new() -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let stream_thread = std::thread::Builder::new()
            .name("ttsflow-output".to_string())
            .spawn(move || {
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(DeviceError::Open(err.to_string())));
                        return;
                    }
                };
                let sink = Sink::connect_new(stream.mixer());
                if ready_tx.send(Ok(sink)).is_err() {
                    return;
                }
                // Keep the stream alive until the device is closed or dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|err| DeviceError::Open(err.to_string()))?;

        let sink = ready_rx
            .recv()
            .map_err(|_| DeviceError::Open("output thread exited".to_string()))??;

        Ok(Self {
            sink,
            shutdown: Some(shutdown_tx),
            stream_thread: Some(stream_thread),
            written_seconds: 0.0,
            queued: VecDeque::with_capacity(MAX_QUEUED_BUFFERS),
        })
    }

    /// Check if audio is currently playing
    pub fn is_playing(&self) -> bool {
        !self.sink.empty() && !self.sink.is_paused()
    }

    fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.stream_thread.take() {
            let _ = thread.join();
        }
    }
}

#[async_trait]
impl AudioDevice for RodioDevice {
    async fn write(&mut self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError> {
        if self.shutdown.is_none() {
            return Err(DeviceError::Write("device is closed".to_string()));
        }
        while self.sink.len() >= MAX_QUEUED_BUFFERS {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let samples: Vec<f32> = samples
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();
        let seconds = crate::types::samples_to_seconds(samples.len(), sample_rate);
        self.written_seconds += seconds;
        if self.queued.len() == MAX_QUEUED_BUFFERS {
            self.queued.pop_front();
        }
        self.queued.push_back(seconds);
        let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples);
        self.sink.append(source);
        Ok(())
    }

    /// Written audio minus what is still queued in the sink. The sink's
    /// queue holds the newest buffers, the first of them partly played.
    fn position(&self) -> f64 {
        let queued_buffers = self.sink.len();
        if queued_buffers == 0 {
            return self.written_seconds;
        }
        let queued: f64 = self.queued.iter().rev().take(queued_buffers).sum();
        let played_of_current = self.sink.get_pos().as_secs_f64();
        (self.written_seconds - queued + played_of_current).clamp(0.0, self.written_seconds)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.sink.stop();
        self.shutdown();
        debug!(
            "Closed audio output after {:.3}s of audio",
            self.written_seconds
        );
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DeviceError> {
        self.sink.pause();
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), DeviceError> {
        self.sink.play();
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), DeviceError> {
        while !self.sink.empty() && !self.sink.is_paused() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn supports_seek(&self) -> bool {
        true
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        self.written_seconds = self.position();
        self.queued.clear();
        self.sink.clear();
        self.sink.play();
        Ok(())
    }
}

impl Drop for RodioDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens a [`RodioDevice`] on the default output for every session
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioDeviceProvider;

impl DeviceProvider for RodioDeviceProvider {
    fn open(&self) -> Result<Box<dyn AudioDevice>, DeviceError> {
        Ok(Box::new(RodioDevice::try_new()?))
    }
}
