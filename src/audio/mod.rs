pub mod backend;

#[cfg(feature = "audio-io")]
pub mod cpal_device;

pub use backend::{
    bytes_to_samples, samples_to_bytes, AudioDevice, AudioDeviceFactory, AudioFormat, FrameSink,
    FrameSource, SampleFormat, UnavailableDevice,
};
#[cfg(feature = "audio-io")]
pub use cpal_device::CpalDevice;
