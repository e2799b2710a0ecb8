//! Scriptable doubles for testing code built on `ttsflow`.

mod adapter;
mod device;
mod listener;

pub use adapter::{Request, StubAdapter};
pub use device::{DeviceCall, DeviceLog, RecordingDevice, RecordingDeviceProvider};
pub use listener::RecordingListener;

/// Turn on `log` output for a test; safe to call from every test
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
