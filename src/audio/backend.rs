use std::sync::Arc;
use std::time::Duration;

use crate::error::DeviceError;
use crate::protocol::AudioFrame;

/// PCM sample encoding on the wire and at the device boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
        }
    }
}

/// Fixed format shared by capture and playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    /// Number of channels (1 = mono)
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Samples per channel in one frame
    pub frame_size: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_format: SampleFormat::I16,
            channels: 1,
            sample_rate: 44100,
            frame_size: 1024,
        }
    }
}

impl AudioFormat {
    /// Size of one frame's payload in bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// Nominal playing time of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

/// An open capture stream
#[async_trait::async_trait]
pub trait FrameSource: Send {
    /// Wait for the next captured frame
    ///
    /// Must be cancel-safe: dropping the future loses no data beyond the
    /// frame being waited for.
    async fn read_frame(&mut self) -> Result<AudioFrame, DeviceError>;
}

/// An open playback stream
pub trait FrameSink: Send {
    /// Queue a frame for playback. Never blocks; a full queue drops the frame.
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), DeviceError>;
}

/// Audio device capability
///
/// Implementations:
/// - `CpalDevice`: default input/output devices via cpal (`audio-io` feature)
/// - `UnavailableDevice`: every open fails, for builds without audio I/O
pub trait AudioDevice: Send + Sync {
    /// Open the capture source
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn FrameSource>, DeviceError>;

    /// Open the playback sink
    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn FrameSink>, DeviceError>;

    /// Release the device entirely; later opens fail
    fn terminate(&self) {}

    /// Device name for logging
    fn name(&self) -> &str;
}

/// Audio device factory
pub struct AudioDeviceFactory;

impl AudioDeviceFactory {
    /// Create the platform audio device
    pub fn create() -> Arc<dyn AudioDevice> {
        #[cfg(feature = "audio-io")]
        {
            Arc::new(super::cpal_device::CpalDevice::new())
        }

        #[cfg(not(feature = "audio-io"))]
        {
            Arc::new(UnavailableDevice)
        }
    }
}

/// Device used when the crate is built without audio I/O
pub struct UnavailableDevice;

impl AudioDevice for UnavailableDevice {
    fn open_capture(&self, _format: &AudioFormat) -> Result<Box<dyn FrameSource>, DeviceError> {
        Err(DeviceError::OpenFailed("built without audio-io support".to_string()))
    }

    fn open_playback(&self, _format: &AudioFormat) -> Result<Box<dyn FrameSink>, DeviceError> {
        Err(DeviceError::OpenFailed("built without audio-io support".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Interleaved i16 samples to little-endian PCM bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Little-endian PCM bytes to i16 samples; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}
