use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ttsflow::{AudioDevice, DeviceError, DeviceProvider};

/// One call made on a [`RecordingDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Open,
    Write(Vec<i16>),
    Pause,
    Resume,
    Drain,
    Flush,
    Close,
}

#[derive(Debug, Default)]
struct LogState {
    calls: Vec<DeviceCall>,
    open: usize,
    peak_open: usize,
}

/// Calls made on every device a [`RecordingDeviceProvider`] opened
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    state: Arc<Mutex<LogState>>,
}

impl DeviceLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DeviceCall) {
        let mut state = self.lock();
        match call {
            DeviceCall::Open => {
                state.open += 1;
                state.peak_open = state.peak_open.max(state.open);
            }
            DeviceCall::Close => state.open = state.open.saturating_sub(1),
            _ => {}
        }
        state.calls.push(call);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    /// Sample blocks in write order
    pub fn writes(&self) -> Vec<Vec<i16>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Write(samples) => Some(samples.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every written sample, concatenated
    pub fn samples(&self) -> Vec<i16> {
        self.writes().concat()
    }

    pub fn write_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, DeviceCall::Write(_)))
            .count()
    }

    pub fn count(&self, call: &DeviceCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Devices opened and not yet closed
    pub fn open_devices(&self) -> usize {
        self.lock().open
    }

    /// Highest number of devices open at the same time
    pub fn peak_open_devices(&self) -> usize {
        self.lock().peak_open
    }

    /// Number of writes recorded after the first close
    pub fn writes_after_close(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .skip_while(|call| **call != DeviceCall::Close)
            .filter(|call| matches!(call, DeviceCall::Write(_)))
            .count()
    }
}

/// Device that records every call into a shared [`DeviceLog`].
///
/// Its clock reports everything written as played, minus an optional lag
/// standing in for audio queued inside a real output. `drain` plays the
/// queue out and `flush` discards it.
#[derive(Debug)]
pub struct RecordingDevice {
    log: DeviceLog,
    write_delay: Duration,
    fail_after: Option<usize>,
    seekable: bool,
    lag: f64,
    writes: usize,
    /// Seconds accepted since open, excluding flushed audio
    written: f64,
    /// Lowest position the clock may report
    played_floor: f64,
}

#[async_trait]
impl AudioDevice for RecordingDevice {
    async fn write(&mut self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError> {
        if self.fail_after.is_some_and(|limit| self.writes >= limit) {
            return Err(DeviceError::Write("scripted device failure".to_string()));
        }
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.writes += 1;
        if sample_rate > 0 {
            self.written += samples.len() as f64 / sample_rate as f64;
        }
        self.log.record(DeviceCall::Write(samples.to_vec()));
        Ok(())
    }

    fn position(&self) -> f64 {
        (self.written - self.lag).max(self.played_floor).max(0.0)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.log.record(DeviceCall::Close);
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DeviceError> {
        self.log.record(DeviceCall::Pause);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), DeviceError> {
        self.log.record(DeviceCall::Resume);
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), DeviceError> {
        self.played_floor = self.written;
        self.log.record(DeviceCall::Drain);
        Ok(())
    }

    fn supports_seek(&self) -> bool {
        self.seekable
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        let played = self.position();
        self.written = played;
        self.played_floor = played;
        self.log.record(DeviceCall::Flush);
        Ok(())
    }
}

/// Opens [`RecordingDevice`]s that share one log
#[derive(Debug, Clone, Default)]
pub struct RecordingDeviceProvider {
    log: DeviceLog,
    write_delay: Duration,
    fail_after: Option<usize>,
    seekable: bool,
    lag: Duration,
    open_error: Option<DeviceError>,
}

impl RecordingDeviceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every write, standing in for a real-time clock
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail every write after `writes` successful ones
    pub fn failing_after(mut self, writes: usize) -> Self {
        self.fail_after = Some(writes);
        self
    }

    /// Report playback this far behind the written audio until drained
    pub fn with_playback_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    pub fn seekable(mut self) -> Self {
        self.seekable = true;
        self
    }

    /// Fail `open` with `error`
    pub fn unavailable(mut self, error: DeviceError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }
}

impl DeviceProvider for RecordingDeviceProvider {
    fn open(&self) -> Result<Box<dyn AudioDevice>, DeviceError> {
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        self.log.record(DeviceCall::Open);
        Ok(Box::new(RecordingDevice {
            log: self.log.clone(),
            write_delay: self.write_delay,
            fail_after: self.fail_after,
            seekable: self.seekable,
            lag: self.lag.as_secs_f64(),
            writes: 0,
            written: 0.0,
            played_floor: 0.0,
        }))
    }
}
