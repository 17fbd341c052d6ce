// cpal-backed capture and playback
//
// cpal streams are not Send, so each opened stream lives on its own thread
// and is dropped there when the owning handle goes away. Captured audio
// crosses to async code through a tokio channel, playback audio goes the
// other way through a bounded crossbeam channel drained by the callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backend::{
    bytes_to_samples, samples_to_bytes, AudioDevice, AudioFormat, FrameSink, FrameSource,
};
use crate::error::DeviceError;
use crate::protocol::AudioFrame;

/// Captured frames buffered between the callback and the reader
const CAPTURE_QUEUE_FRAMES: usize = 32;

/// Frames buffered ahead of the playback callback
const PLAYBACK_QUEUE_FRAMES: usize = 16;

/// Default cpal host devices
pub struct CpalDevice {
    terminated: AtomicBool,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            terminated: AtomicBool::new(false),
        }
    }

    fn ensure_alive(&self) -> Result<(), DeviceError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed("audio device already released".to_string()));
        }
        Ok(())
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn FrameSource>, DeviceError> {
        self.ensure_alive()?;

        let (frame_tx, frame_rx) = mpsc::channel(CAPTURE_QUEUE_FRAMES);
        let format = format.clone();
        let guard = StreamThread::spawn("loqa-capture", move || build_capture_stream(&format, frame_tx))?;

        Ok(Box::new(CpalCapture {
            frames: frame_rx,
            _guard: guard,
        }))
    }

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn FrameSink>, DeviceError> {
        self.ensure_alive()?;

        let (sample_tx, sample_rx) = crossbeam_channel::bounded(PLAYBACK_QUEUE_FRAMES);
        let failed = Arc::new(AtomicBool::new(false));
        let format = format.clone();
        let stream_failed = Arc::clone(&failed);
        let guard = StreamThread::spawn("loqa-playback", move || {
            build_playback_stream(&format, sample_rx, stream_failed)
        })?;

        Ok(Box::new(CpalPlayback {
            samples: sample_tx,
            failed,
            _guard: guard,
        }))
    }

    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!("Audio device released");
        }
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

/// Owns the thread a cpal stream lives on; dropping it stops the stream
struct StreamThread {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<Stream, DeviceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Park until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::OpenFailed(format!("failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::OpenFailed("audio thread exited during setup".to_string())),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio stream thread panicked");
            }
        }
    }
}

fn stream_config(format: &AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

fn build_capture_stream(
    format: &AudioFormat,
    frame_tx: mpsc::Sender<Result<AudioFrame, DeviceError>>,
) -> Result<Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceError::OpenFailed("No input device available".to_string()))?;

    info!("Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let samples_per_frame = format.frame_size * format.channels as usize;
    let mut pending: Vec<i16> = Vec::with_capacity(samples_per_frame);
    let data_tx = frame_tx.clone();

    let err_fn = move |err: cpal::StreamError| {
        error!("Audio input stream error: {}", err);
        let _ = frame_tx.try_send(Err(DeviceError::IoFailure(err.to_string())));
    };

    let stream = device
        .build_input_stream(
            &stream_config(format),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(f32_to_i16(sample));
                    if pending.len() == samples_per_frame {
                        let frame = AudioFrame::new(samples_to_bytes(&pending));
                        pending.clear();
                        if let Err(e) = data_tx.try_send(Ok(frame)) {
                            debug!("Dropping captured frame: {}", e);
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DeviceError::OpenFailed(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| DeviceError::OpenFailed(format!("Failed to start input stream: {}", e)))?;

    Ok(stream)
}

fn build_playback_stream(
    format: &AudioFormat,
    sample_rx: Receiver<Vec<f32>>,
    failed: Arc<AtomicBool>,
) -> Result<Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::OpenFailed("No output device available".to_string()))?;

    info!("Using output device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let mut buffer: VecDeque<f32> = VecDeque::new();

    let err_fn = move |err: cpal::StreamError| {
        error!("Audio output stream error: {}", err);
        failed.store(true, Ordering::SeqCst);
    };

    let stream = device
        .build_output_stream(
            &stream_config(format),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while buffer.len() < data.len() {
                    match sample_rx.try_recv() {
                        Ok(samples) => buffer.extend(samples),
                        Err(_) => break,
                    }
                }
                for out in data.iter_mut() {
                    *out = buffer.pop_front().unwrap_or(0.0);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DeviceError::OpenFailed(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| DeviceError::OpenFailed(format!("Failed to start output stream: {}", e)))?;

    Ok(stream)
}

struct CpalCapture {
    frames: mpsc::Receiver<Result<AudioFrame, DeviceError>>,
    _guard: StreamThread,
}

#[async_trait::async_trait]
impl FrameSource for CpalCapture {
    async fn read_frame(&mut self) -> Result<AudioFrame, DeviceError> {
        match self.frames.recv().await {
            Some(result) => result,
            None => Err(DeviceError::IoFailure("capture stream closed".to_string())),
        }
    }
}

struct CpalPlayback {
    samples: Sender<Vec<f32>>,
    failed: Arc<AtomicBool>,
    _guard: StreamThread,
}

impl FrameSink for CpalPlayback {
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), DeviceError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(DeviceError::IoFailure("playback stream failed".to_string()));
        }

        let samples = bytes_to_samples(&frame.data).into_iter().map(i16_to_f32).collect();
        match self.samples.try_send(samples) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Playback queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(DeviceError::IoFailure("playback stream closed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_terminated_device_refuses_to_open() {
        let device = CpalDevice::new();
        device.terminate();
        let format = AudioFormat::default();
        assert!(matches!(device.open_capture(&format), Err(DeviceError::OpenFailed(_))));
        assert!(matches!(device.open_playback(&format), Err(DeviceError::OpenFailed(_))));
    }
}
