use crate::error::DeviceError;
use async_trait::async_trait;

/// Audio output that accepts PCM16 mono frames.
///
/// A device is owned by exactly one session at a time. `write` may suspend
/// until the device has room; the controller relies on that for pacing, so a
/// real output should not queue unbounded audio.
#[async_trait]
pub trait AudioDevice: Send {
    /// Write one period of samples
    async fn write(&mut self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError>;

    /// Seconds of audio the device has played (or accepted, for devices
    /// without a clock)
    fn position(&self) -> f64;

    /// Release the device. No writes follow a close.
    async fn close(&mut self) -> Result<(), DeviceError>;

    /// Halt audio that is already queued inside the device
    async fn pause(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Wait until audio queued inside the device has been played
    async fn drain(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Device can drop queued audio so playback continues from another offset
    fn supports_seek(&self) -> bool {
        false
    }

    /// Discard audio queued inside the device after a seek
    async fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Opens a device for each new session
pub trait DeviceProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioDevice>, DeviceError>;
}

impl<F> DeviceProvider for F
where
    F: Fn() -> Result<Box<dyn AudioDevice>, DeviceError> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn AudioDevice>, DeviceError> {
        self()
    }
}

/// Device that discards audio while keeping an accurate position.
/// Used for engines without an output, e.g. file rendering.
#[derive(Debug, Default)]
pub struct NullDevice {
    samples: u64,
    sample_rate: u32,
}

#[async_trait]
impl AudioDevice for NullDevice {
    async fn write(&mut self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError> {
        self.samples += samples.len() as u64;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn position(&self) -> f64 {
        crate::types::samples_to_seconds(self.samples as usize, self.sample_rate)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Provider for [`NullDevice`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeviceProvider;

impl DeviceProvider for NullDeviceProvider {
    fn open(&self) -> Result<Box<dyn AudioDevice>, DeviceError> {
        Ok(Box::new(NullDevice::default()))
    }
}
