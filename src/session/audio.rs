use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::stream;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use super::state::AudioConnectionState;
use super::stats::AudioStats;
use crate::audio::{AudioDevice, AudioFormat, FrameSink, FrameSource};
use crate::console::Console;
use crate::error::{AudioError, DeviceError, UsageError};
use crate::protocol::{AudioFrame, SessionIdentity};
use crate::transport::{DuplexChannel, Inbound, Outbound, Transport};

type SharedSource = Arc<tokio::sync::Mutex<Box<dyn FrameSource>>>;

/// Everything that only exists while a channel is open
struct Connected {
    generation: u64,
    mic: Option<SharedSource>,
    speakers: Option<Box<dyn FrameSink>>,
    cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

/// Mic and speakers are only reachable through `Connected`
enum AudioState {
    Idle,
    Connecting { generation: u64 },
    Connected(Connected),
}

/// What the outbound generator should do next
enum Gate {
    Stop,
    Wait,
    Capture(SharedSource),
}

/// State shared between the session, its outbound generator and its receiver task
struct AudioShared {
    state: Mutex<AudioState>,
    /// Bumped on every state change; the outbound generator sleeps on it
    wake: watch::Sender<u64>,
    next_generation: AtomicU64,
    console: Arc<dyn Console>,
    connections_opened: AtomicUsize,
    frames_sent: AtomicUsize,
    frames_played: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl AudioShared {
    fn notify(&self) {
        self.wake.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    fn gate(&self, generation: u64) -> Gate {
        match &*self.state.lock() {
            AudioState::Connecting { generation: g } if *g == generation => Gate::Wait,
            AudioState::Connected(c) if c.generation == generation => match &c.mic {
                Some(mic) => Gate::Capture(mic.clone()),
                None => Gate::Wait,
            },
            _ => Gate::Stop,
        }
    }

    /// True if `mic` is still the installed capture source of this connection
    fn mic_is_current(&self, generation: u64, mic: &SharedSource) -> bool {
        match &*self.state.lock() {
            AudioState::Connected(c) if c.generation == generation => {
                c.mic.as_ref().is_some_and(|m| Arc::ptr_eq(m, mic))
            }
            _ => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        match &*self.state.lock() {
            AudioState::Connecting { generation: g } => *g == generation,
            AudioState::Connected(c) => c.generation == generation,
            AudioState::Idle => false,
        }
    }

    /// Write an inbound frame to the speakers, or drop it if they are off
    ///
    /// A failed write turns the speakers off. If the mic is off too, nothing
    /// uses the channel any more and it is cancelled.
    fn play(&self, generation: u64, frame: &AudioFrame) {
        let failure = {
            let mut state = self.state.lock();
            match &mut *state {
                AudioState::Connected(c) if c.generation == generation => match c.speakers.as_mut() {
                    Some(sink) => match sink.write_frame(frame) {
                        Ok(()) => {
                            self.frames_played.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                        Err(e) => {
                            let unused = c.mic.is_none();
                            if unused {
                                c.cancel.cancel();
                            }
                            Some((e, c.speakers.take(), unused))
                        }
                    },
                    None => {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                },
                _ => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        };

        if let Some((err, sink, unused)) = failure {
            release_off_runtime(sink);
            warn!("Playback failed, speakers disabled: {}", err);
            self.console.report_error("playback", &err);
            if unused {
                info!("Closing audio connection {}: mic and speakers are off", generation);
            }
            self.notify();
        }
    }

    /// Capture broke: the mic goes away and so does the channel
    fn capture_failed(&self, generation: u64, err: &DeviceError) {
        warn!("Capture failed, closing audio connection: {}", err);
        self.console.report_error("capture", err);

        let mic = {
            let mut state = self.state.lock();
            match &mut *state {
                AudioState::Connected(c) if c.generation == generation => {
                    c.cancel.cancel();
                    c.mic.take()
                }
                _ => None,
            }
        };
        release_off_runtime(mic);
        self.notify();
    }

    /// Called by the receiver on exit; a no-op if teardown already replaced the state
    fn connection_lost(&self, generation: u64) {
        let previous = {
            let mut state = self.state.lock();
            if !matches!(&*state, AudioState::Connected(c) if c.generation == generation) {
                return;
            }
            std::mem::replace(&mut *state, AudioState::Idle)
        };
        if let AudioState::Connected(c) = previous {
            c.cancel.cancel();
            release_off_runtime(c);
        }
        self.notify();

        info!("Audio connection {} lost", generation);
        self.console.notice("Audio connection lost.");
    }
}

/// Voice side of a chat session: one audio channel gated by mic/speaker toggles
///
/// Connection lifecycle is Idle → Connecting → Connected → Idle. Mic and
/// speakers can only be switched on while Connected; the channel itself stays
/// open with both off so the caller decides when to tear it down.
pub struct AudioSession {
    identity: SessionIdentity,
    transport: Arc<dyn Transport>,
    device: Arc<dyn AudioDevice>,
    format: AudioFormat,
    config: SessionConfig,
    shared: Arc<AudioShared>,
    /// Serializes connection start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl AudioSession {
    pub fn new(
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
        device: Arc<dyn AudioDevice>,
        console: Arc<dyn Console>,
        format: AudioFormat,
        config: SessionConfig,
    ) -> Self {
        let (wake, _) = watch::channel(0);

        Self {
            identity,
            transport,
            device,
            format,
            config,
            shared: Arc::new(AudioShared {
                state: Mutex::new(AudioState::Idle),
                wake,
                next_generation: AtomicU64::new(0),
                console,
                connections_opened: AtomicUsize::new(0),
                frames_sent: AtomicUsize::new(0),
                frames_played: AtomicUsize::new(0),
                frames_dropped: AtomicUsize::new(0),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn connection_state(&self) -> AudioConnectionState {
        match &*self.shared.state.lock() {
            AudioState::Idle => AudioConnectionState::Idle,
            AudioState::Connecting { .. } => AudioConnectionState::Connecting,
            AudioState::Connected(_) => AudioConnectionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == AudioConnectionState::Connected
    }

    pub fn is_mic_active(&self) -> bool {
        matches!(&*self.shared.state.lock(), AudioState::Connected(c) if c.mic.is_some())
    }

    pub fn is_speakers_active(&self) -> bool {
        matches!(&*self.shared.state.lock(), AudioState::Connected(c) if c.speakers.is_some())
    }

    pub fn stats(&self) -> AudioStats {
        AudioStats {
            connections_opened: self.shared.connections_opened.load(Ordering::Relaxed),
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_played: self.shared.frames_played.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Open the audio channel and spawn its receiver. No-op if already connected.
    pub async fn start_audio_connection(&self) -> Result<(), AudioError> {
        let _guard = self.lifecycle.lock().await;

        let generation = {
            let mut state = self.shared.state.lock();
            if matches!(&*state, AudioState::Idle) {
                let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                *state = AudioState::Connecting { generation };
                Some(generation)
            } else {
                None
            }
        };
        let Some(generation) = generation else {
            self.shared.console.notice("Audio connection already active.");
            return Ok(());
        };

        info!(
            "Opening audio connection {} via {} as {} in {}",
            generation,
            self.transport.name(),
            self.identity.sender(),
            self.identity.room_id()
        );

        let outbound = outbound_frames(self.shared.clone(), generation);
        let channel = match self.transport.open_audio(outbound, self.identity.metadata()).await {
            Ok(channel) => channel,
            Err(e) => {
                *self.shared.state.lock() = AudioState::Idle;
                self.shared.notify();
                warn!("Failed to open audio connection: {}", e);
                return Err(e.into());
            }
        };

        let DuplexChannel { inbound, cancel } = channel;
        *self.shared.state.lock() = AudioState::Connected(Connected {
            generation,
            mic: None,
            speakers: None,
            cancel: cancel.clone(),
            receiver: None,
        });
        self.shared.notify();

        let handle = tokio::spawn(receive_frames(self.shared.clone(), generation, inbound, cancel));
        if let AudioState::Connected(c) = &mut *self.shared.state.lock() {
            if c.generation == generation {
                c.receiver = Some(handle);
            }
        }

        self.shared.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.shared.console.notice("Audio connection established.");
        Ok(())
    }

    /// Start capturing and sending. Requires an established connection.
    pub async fn start_mic(&self) -> Result<(), AudioError> {
        let (generation, active) = self.connected(|c| (c.generation, c.mic.is_some()))?;
        if active {
            self.shared.console.notice("Microphone already on.");
            return Ok(());
        }

        let device = self.device.clone();
        let format = self.format.clone();
        let source = tokio::task::spawn_blocking(move || device.open_capture(&format))
            .await
            .map_err(|e| DeviceError::OpenFailed(format!("capture open task failed: {}", e)))??;
        let source: SharedSource = Arc::new(tokio::sync::Mutex::new(source));

        let rejected = self.connected(move |c| {
            if c.generation == generation && c.mic.is_none() {
                c.mic = Some(source);
                None
            } else {
                Some(source)
            }
        });
        match rejected {
            Ok(None) => {}
            Ok(Some(source)) => {
                release_off_runtime(source);
                return Err(UsageError::ConnectionNotEstablished.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.shared.notify();

        info!("Microphone on ({})", self.device.name());
        self.shared.console.notice("Microphone on.");
        Ok(())
    }

    /// Start playing inbound frames. Requires an established connection.
    pub async fn start_speakers(&self) -> Result<(), AudioError> {
        let (generation, active) = self.connected(|c| (c.generation, c.speakers.is_some()))?;
        if active {
            self.shared.console.notice("Speakers already on.");
            return Ok(());
        }

        let device = self.device.clone();
        let format = self.format.clone();
        let sink = tokio::task::spawn_blocking(move || device.open_playback(&format))
            .await
            .map_err(|e| DeviceError::OpenFailed(format!("playback open task failed: {}", e)))??;

        let rejected = self.connected(move |c| {
            if c.generation == generation && c.speakers.is_none() {
                c.speakers = Some(sink);
                None
            } else {
                Some(sink)
            }
        });
        match rejected {
            Ok(None) => {}
            Ok(Some(sink)) => {
                release_off_runtime(sink);
                return Err(UsageError::ConnectionNotEstablished.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.shared.notify();

        info!("Speakers on ({})", self.device.name());
        self.shared.console.notice("Speakers on.");
        Ok(())
    }

    pub fn stop_mic(&self) {
        let mic = self.take_connected(|c| c.mic.take());
        if mic.is_some() {
            release_off_runtime(mic);
            self.shared.notify();
            info!("Microphone off");
            self.shared.console.notice("Microphone off.");
        }
    }

    pub fn stop_speakers(&self) {
        let sink = self.take_connected(|c| c.speakers.take());
        if sink.is_some() {
            release_off_runtime(sink);
            self.shared.notify();
            info!("Speakers off");
            self.shared.console.notice("Speakers off.");
        }
    }

    /// Close the channel. Waits for the receiver at most `receiver_join_timeout`.
    pub async fn stop_audio_connection(&self) {
        let _guard = self.lifecycle.lock().await;

        let previous = std::mem::replace(&mut *self.shared.state.lock(), AudioState::Idle);
        let Connected {
            generation,
            mic,
            speakers,
            cancel,
            receiver,
        } = match previous {
            AudioState::Connected(c) => c,
            _ => return,
        };
        self.shared.notify();

        if mic.is_some() {
            release_off_runtime(mic);
            self.shared.console.notice("Microphone off.");
        }
        if speakers.is_some() {
            release_off_runtime(speakers);
            self.shared.console.notice("Speakers off.");
        }

        cancel.cancel();

        if let Some(mut handle) = receiver {
            let limit = self.config.receiver_join_timeout();
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => debug!("Audio receiver {} joined", generation),
                Ok(Err(e)) => warn!("Audio receiver {} failed: {}", generation, e),
                Err(_) => {
                    warn!(
                        "Audio receiver {} did not stop within {:?}, aborting",
                        generation, limit
                    );
                    handle.abort();
                }
            }
        }

        info!("Audio connection {} closed", generation);
        self.shared.console.notice("Audio connection closed.");
    }

    /// Final release: close the connection and terminate the device
    pub async fn cleanup(&self) {
        self.stop_audio_connection().await;
        self.device.terminate();
        debug!("Audio device {} terminated", self.device.name());
    }

    fn connected<R>(&self, f: impl FnOnce(&mut Connected) -> R) -> Result<R, UsageError> {
        match &mut *self.shared.state.lock() {
            AudioState::Connected(c) => Ok(f(c)),
            _ => Err(UsageError::ConnectionNotEstablished),
        }
    }

    fn take_connected<T>(&self, f: impl FnOnce(&mut Connected) -> Option<T>) -> Option<T> {
        self.connected(f).ok().flatten()
    }
}

/// Lazy frame sequence for one connection
///
/// Sleeps on the wake signal while the mic is off and ends once the
/// connection it belongs to is no longer current.
fn outbound_frames(shared: Arc<AudioShared>, generation: u64) -> Outbound<AudioFrame> {
    let mut wake = shared.wake.subscribe();

    let frames = stream! {
        loop {
            wake.borrow_and_update();

            let mic = match shared.gate(generation) {
                Gate::Stop => break,
                Gate::Wait => {
                    if wake.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                Gate::Capture(mic) => mic,
            };

            let read = {
                let mut source = mic.lock().await;
                tokio::select! {
                    result = source.read_frame() => Some(result),
                    _ = wake.changed() => None,
                }
            };

            // A replaced mic may be the last handle to its device stream
            let mic = if shared.mic_is_current(generation, &mic) {
                Some(mic)
            } else {
                release_off_runtime(mic);
                None
            };

            match read {
                None => continue,
                Some(Ok(frame)) => {
                    if mic.is_some() {
                        shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                        yield frame;
                    }
                }
                Some(Err(e)) => {
                    shared.capture_failed(generation, &e);
                    release_off_runtime(mic);
                    break;
                }
            }
        }
        debug!("Audio outbound {} finished", generation);
    };

    frames.boxed()
}

async fn receive_frames(
    shared: Arc<AudioShared>,
    generation: u64,
    mut inbound: Inbound<AudioFrame>,
    cancel: CancellationToken,
) {
    debug!("Audio receiver {} started", generation);

    // Cancelling the channel ends `inbound`; teardown bounds the wait for that
    while let Some(item) = inbound.next().await {
        match item {
            Ok(frame) => shared.play(generation, &frame),
            Err(e) => {
                let terminating = cancel.is_cancelled() || !shared.is_current(generation);
                if e.is_teardown_expected() && terminating {
                    debug!("Audio receiver {} ended by teardown: {}", generation, e);
                } else {
                    warn!("Audio reception failed: {}", e);
                    shared.console.report_error("audio reception", &e);
                }
                break;
            }
        }
    }

    shared.console.notice("Audio reception ended.");
    shared.connection_lost(generation);
}

/// Device streams join their threads when dropped; do that on the blocking pool
fn release_off_runtime<T: Send + 'static>(resource: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(resource));
        }
        Err(_) => drop(resource),
    }
}
