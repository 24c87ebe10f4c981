//! Playback state machine and per-tick frame consumer.
//!
//! [`PlaybackController`] owns the logical clock. Each [`update`] advances
//! it and publishes at most one due frame to the [`RenderSurface`]. The
//! decode thread and the audio callback observe the state through
//! [`SharedState`]; only the controller writes it.
//!
//! [`update`]: PlaybackController::update

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::audio::{AudioEngine, CallbackId, MixBus};
use crate::audio_ring::{AudioRing, RingSetup};
use crate::config::PlaybackConfig;
use crate::container::{Container, DecoderPreference};
use crate::decode_worker::{self, WorkerContext, WorkerEvent};
use crate::error::PipelineError;
use crate::frame::{FrameInfo, PixelFormat, PlaneImage};
use crate::frame_queue::FrameQueue;
use crate::hw_transfer::HardwareTransfer;
use crate::mixer::{AudioMixer, VolumeControl};
use crate::session::{MediaInfo, StreamSession};

/// Externally visible playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlaybackState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Atomically shared [`PlaybackState`]: one writer, many readers.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn new() -> Self {
        Self(AtomicU8::new(PlaybackState::Stopped as u8))
    }

    pub fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: PlaybackState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.get() == PlaybackState::Playing
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == PlaybackState::Stopped
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives controller notifications, synchronously on the controller's thread.
pub trait PlaybackObserver: Send {
    fn on_state_changed(&mut self, _state: PlaybackState) {}

    fn on_pixel_format_changed(&mut self, _format: PixelFormat) {}
}

/// Destination for published pictures.
pub trait RenderSurface: Send {
    /// (Re)creates textures for `format`, one per plane.
    fn allocate(&mut self, format: PixelFormat, plane_count: usize);

    /// Full upload; the plane dimensions may differ from the previous ones.
    fn set_planes(&mut self, planes: Vec<PlaneImage>);

    /// In-place upload at unchanged dimensions.
    fn update_planes(&mut self, planes: Vec<PlaneImage>);
}

/// Plays one source: open, then play/pause/seek/stop, driven by `update`.
pub struct PlaybackController {
    config: PlaybackConfig,
    surface: Box<dyn RenderSurface>,
    observer: Option<Box<dyn PlaybackObserver>>,
    engine: Option<Arc<dyn AudioEngine>>,
    transfers: HardwareTransfer,

    state: Arc<SharedState>,
    queue: Arc<FrameQueue>,
    ring: Option<Arc<AudioRing>>,
    events_tx: Sender<WorkerEvent>,
    events: Receiver<WorkerEvent>,

    session: Option<StreamSession>,
    info: Option<MediaInfo>,
    worker: Option<JoinHandle<StreamSession>>,
    mix_callback: Option<CallbackId>,
    volume: Arc<VolumeControl>,
    /// The session has been decoded from before and must rewind on restart
    rewind_on_play: bool,

    /// Logical playback clock, in seconds
    time: f64,
    /// Presentation time of the last published frame
    position: f64,
    length: Cell<Option<f64>>,

    format: Option<PixelFormat>,
    surface_size: Option<(u32, u32)>,
    published: u64,
    last_error: Option<PipelineError>,
}

impl PlaybackController {
    pub fn new(config: PlaybackConfig, surface: Box<dyn RenderSurface>) -> Self {
        let (events_tx, events) = crossbeam_channel::unbounded();
        Self {
            queue: Arc::new(FrameQueue::new(config.max_decoded_frames)),
            config,
            surface,
            observer: None,
            engine: None,
            transfers: HardwareTransfer::default(),
            state: Arc::new(SharedState::new()),
            ring: None,
            events_tx,
            events,
            session: None,
            info: None,
            worker: None,
            mix_callback: None,
            volume: Arc::new(VolumeControl::new()),
            rewind_on_play: false,
            time: 0.0,
            position: 0.0,
            length: Cell::new(None),
            format: None,
            surface_size: None,
            published: 0,
            last_error: None,
        }
    }

    /// Routes audio to `engine`. Must be set before [`open`](Self::open).
    pub fn with_audio_engine(mut self, engine: Arc<dyn AudioEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Replaces the hardware surface transfer table.
    pub fn with_hardware_transfer(mut self, transfers: HardwareTransfer) -> Self {
        self.transfers = transfers;
        self
    }

    pub fn set_observer(&mut self, observer: Box<dyn PlaybackObserver>) {
        self.observer = Some(observer);
    }

    /// Opens `container` with the default decoder choice.
    pub fn open(&mut self, container: Box<dyn Container>) -> Result<(), PipelineError> {
        self.open_with_preference(container, &DecoderPreference::default())
    }

    /// Opens `container`, selecting streams and decoders. No thread is
    /// spawned until [`play`](Self::play).
    pub fn open_with_preference(
        &mut self,
        container: Box<dyn Container>,
        preference: &DecoderPreference,
    ) -> Result<(), PipelineError> {
        if self.session.is_some() || self.worker.is_some() {
            return Err(PipelineError::OpenFailed(
                "a source is already open".to_string(),
            ));
        }

        let session = StreamSession::open(container, preference)?;
        let info = session.info().clone();

        self.ring = match (&self.engine, info.sample_rate, info.channels) {
            (Some(engine), Some(source_rate), Some(channels)) => {
                let ring = AudioRing::new(RingSetup {
                    channels,
                    source_rate,
                    target_rate: engine.mix_rate(),
                    buffering_ms: self.config.audio_buffering_ms,
                    min_frames: engine.buffer_size() * 2,
                });
                tracing::debug!(
                    "Audio ring: {channels} ch, {source_rate} Hz -> {} Hz, {} frames",
                    engine.mix_rate(),
                    ring.capacity_frames()
                );
                Some(Arc::new(ring))
            }
            _ => None,
        };

        self.queue = Arc::new(FrameQueue::new(self.config.max_decoded_frames));
        self.session = Some(session);
        self.info = Some(info);
        self.rewind_on_play = false;
        self.length.set(None);
        self.last_error = None;
        Ok(())
    }

    /// Stops playback and releases the source so another can be opened.
    pub fn close(&mut self) {
        self.stop();
        self.session = None;
        self.info = None;
        self.ring = None;
        self.format = None;
        self.surface_size = None;
    }

    /// Starts or resumes playback. A no-op while already playing.
    pub fn play(&mut self) {
        match self.state.get() {
            PlaybackState::Playing => return,
            PlaybackState::Paused => {
                self.set_state(PlaybackState::Playing);
                return;
            }
            PlaybackState::Stopped => {}
        }

        let Some(session) = self.session.take() else {
            tracing::warn!("play() called without an open source");
            return;
        };

        let leftovers = self.queue.reopen();
        if leftovers > 0 {
            tracing::trace!("Discarded {leftovers} frames from the previous run");
        }
        if self.rewind_on_play {
            self.queue.clear_and_seek(0.0);
        }
        if let Some(ring) = &self.ring {
            ring.flush();
        }
        while self.events.try_recv().is_ok() {}

        // The worker polls the state from its first iteration
        self.state.set(PlaybackState::Playing);
        if !self.spawn_worker(session) {
            return;
        }
        self.rewind_on_play = true;
        self.register_mixer();
        self.notify_state(PlaybackState::Playing);
    }

    /// Pauses playback. Only valid while playing.
    pub fn pause(&mut self) {
        if self.state.get() != PlaybackState::Playing {
            tracing::debug!("pause() ignored in state {:?}", self.state.get());
            return;
        }
        self.set_state(PlaybackState::Paused);
    }

    /// Stops playback and joins the decode thread. Valid in any state.
    pub fn stop(&mut self) {
        if let (Some(engine), Some(id)) = (&self.engine, self.mix_callback.take()) {
            engine.remove_mix_callback(id);
        }

        let previous = self.state.get();
        let state = Arc::clone(&self.state);
        self.queue
            .close_with(move || state.set(PlaybackState::Stopped));

        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(session) => self.session = Some(session),
                Err(_) => {
                    tracing::error!("Decode thread panicked; source released");
                    self.info = None;
                    self.last_error =
                        Some(PipelineError::Thread("decode thread panicked".to_string()));
                }
            }
        }
        self.drain_events();

        self.queue.reopen();
        if let Some(ring) = &self.ring {
            ring.flush();
        }
        self.time = 0.0;
        self.position = 0.0;
        self.length.set(None);

        if previous != PlaybackState::Stopped {
            tracing::debug!("Playback stopped");
            self.notify_state(PlaybackState::Stopped);
        }
    }

    /// Requests a seek to `target` seconds. Returns false when stopped.
    ///
    /// Queued frames are discarded and the clock jumps to the target
    /// immediately; the decode thread repositions asynchronously.
    pub fn seek(&mut self, target: f64) -> bool {
        if self.poll_worker() || self.state.is_stopped() {
            tracing::debug!("seek({target:.3}) ignored while stopped");
            return false;
        }

        let length = self.length();
        let target = if length > 0.0 {
            target.clamp(0.0, length)
        } else {
            target.max(0.0)
        };

        let dropped = self.queue.clear_and_seek(target);
        self.time = target;
        self.position = target;
        if let Some(ring) = &self.ring {
            ring.flush();
        }

        // A worker that already queued end of stream has exited; restart it
        // so it picks up the pending seek.
        let ended = dropped.iter().any(FrameInfo::is_end_of_stream);
        drop(dropped);
        if ended || self.worker.as_ref().is_some_and(|h| h.is_finished()) {
            self.restart_worker();
        }
        true
    }

    /// Advances the clock by `delta` seconds and publishes a due frame.
    ///
    /// Never blocks, except for the join when end of stream or a fatal
    /// decode error stops playback.
    pub fn update(&mut self, delta: f64) {
        if self.poll_worker() || !self.state.is_playing() {
            return;
        }

        self.time += delta;
        // No pictures to follow, so the position tracks the clock
        if self.info.as_ref().is_some_and(|info| !info.has_video()) {
            let length = self.length();
            self.position = if length > 0.0 { self.time.min(length) } else { self.time };
        }
        let Some(frame) = self.queue.pop_due(self.time) else {
            return;
        };
        if frame.is_end_of_stream() {
            tracing::debug!("End of stream at {:.3}s", self.time);
            self.stop();
            return;
        }

        let pts = frame.pts();
        if let Some(slack) = self.config.clock_clamp_slack {
            let limit = pts + slack.as_secs_f64();
            if self.time > limit {
                tracing::trace!(
                    "Decode behind by {:.3}s, clamping clock to {limit:.3}s",
                    self.time - pts
                );
                self.time = limit;
            }
        }
        self.position = pts;
        self.publish(frame);
    }

    fn publish(&mut self, frame: FrameInfo) {
        let Some(format) = frame.format() else {
            return;
        };
        if self.format != Some(format) {
            tracing::debug!("Pixel format changed to {format}, reallocating textures");
            self.surface.allocate(format, format.plane_count());
            self.format = Some(format);
            self.surface_size = None;
            if let Some(observer) = self.observer.as_mut() {
                observer.on_pixel_format_changed(format);
            }
        }

        let size = frame.dimensions();
        let planes = frame.into_planes();
        if size.is_some() && size == self.surface_size {
            self.surface.update_planes(planes);
        } else {
            self.surface_size = size;
            self.surface.set_planes(planes);
        }
        self.published += 1;
    }

    /// Presentation time of the last published frame (or the seek target).
    ///
    /// Without a video stream this is the playback clock, capped at the length.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// The playback clock in seconds, which frames are released against.
    pub fn clock(&self) -> f64 {
        self.time
    }

    /// Container duration in seconds, 0 when unknown.
    pub fn length(&self) -> f64 {
        if let Some(length) = self.length.get() {
            return length;
        }
        let length = self
            .info
            .as_ref()
            .and_then(|info| info.duration)
            .unwrap_or(0.0);
        self.length.set(Some(length));
        length
    }

    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == PlaybackState::Stopped
    }

    /// Whether a source is open.
    pub fn is_open(&self) -> bool {
        self.info.is_some()
    }

    /// Stream and codec metadata of the open source.
    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.info.as_ref()
    }

    /// Decoded frames waiting to be published.
    pub fn buffered_frames(&self) -> usize {
        self.queue.len()
    }

    /// Frames published to the surface since construction.
    pub fn published_frames(&self) -> u64 {
        self.published
    }

    /// Audio output volume (0-100).
    pub fn volume(&self) -> u32 {
        self.volume.volume()
    }

    /// Sets the audio output volume (0-100). Applies to the running callback.
    pub fn set_volume(&mut self, volume: u32) {
        self.volume.set_volume(volume);
    }

    pub fn current_pixel_format(&self) -> Option<PixelFormat> {
        self.format
    }

    /// Most recent decode diagnostic (fatal format, failed seek, thread error).
    pub fn last_error(&self) -> Option<&PipelineError> {
        self.last_error.as_ref()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    fn set_state(&mut self, state: PlaybackState) {
        self.state.set(state);
        self.notify_state(state);
    }

    fn notify_state(&mut self, state: PlaybackState) {
        tracing::debug!("Playback state -> {state:?}");
        if let Some(observer) = self.observer.as_mut() {
            observer.on_state_changed(state);
        }
    }

    fn spawn_worker(&mut self, session: StreamSession) -> bool {
        let context = WorkerContext {
            queue: Arc::clone(&self.queue),
            ring: self.ring.clone(),
            state: Arc::clone(&self.state),
            events: self.events_tx.clone(),
            transfers: self.transfers.clone(),
            config: self.config.clone(),
        };
        match decode_worker::spawn(session, context) {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                tracing::error!("{e}");
                self.state.set(PlaybackState::Stopped);
                self.info = None;
                self.last_error = Some(e);
                false
            }
        }
    }

    fn restart_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(session) => {
                tracing::debug!("Restarting decode thread for seek");
                if !self.spawn_worker(session) {
                    self.stop();
                }
            }
            Err(_) => {
                tracing::error!("Decode thread panicked; source released");
                self.info = None;
                self.stop();
                self.last_error =
                    Some(PipelineError::Thread("decode thread panicked".to_string()));
            }
        }
    }

    fn register_mixer(&mut self) {
        let (Some(engine), Some(ring)) = (&self.engine, &self.ring) else {
            return;
        };
        if self.mix_callback.is_some() {
            return;
        }
        let mut mixer = AudioMixer::new(
            Arc::clone(ring),
            Arc::clone(&self.state),
            engine.buffer_size(),
            self.config.resampler_grace_limit,
            Arc::clone(&self.volume),
        );
        let id =
            engine.add_mix_callback(Box::new(move |bus: &mut MixBus| mixer.mix_into_bus(bus)));
        self.mix_callback = Some(id);
    }

    /// Records worker diagnostics. Returns the fatal error, if one arrived.
    fn drain_events(&mut self) -> Option<PipelineError> {
        let mut fatal = None;
        while let Ok(event) = self.events.try_recv() {
            match event {
                WorkerEvent::SeekFailed(e) => self.last_error = Some(e),
                WorkerEvent::Fatal(e) => {
                    self.last_error = Some(e.clone());
                    fatal = Some(e);
                }
                WorkerEvent::Finished(exit) => {
                    tracing::trace!("Decode thread finished: {exit:?}");
                }
            }
        }
        fatal
    }

    /// Stops playback if the decode thread hit a fatal error.
    fn poll_worker(&mut self) -> bool {
        let Some(error) = self.drain_events() else {
            return false;
        };
        tracing::error!("Stopping playback: {error}");
        self.stop();
        self.last_error = Some(error);
        true
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticConfig, SyntheticContainer};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct NullSurface;

    impl RenderSurface for NullSurface {
        fn allocate(&mut self, _format: PixelFormat, _plane_count: usize) {}
        fn set_planes(&mut self, _planes: Vec<PlaneImage>) {}
        fn update_planes(&mut self, _planes: Vec<PlaneImage>) {}
    }

    struct StateLog(Arc<Mutex<Vec<PlaybackState>>>);

    impl PlaybackObserver for StateLog {
        fn on_state_changed(&mut self, state: PlaybackState) {
            self.0.lock().push(state);
        }
    }

    fn controller(seconds: u64) -> (PlaybackController, Arc<Mutex<Vec<PlaybackState>>>) {
        let mut controller =
            PlaybackController::new(PlaybackConfig::default(), Box::new(NullSurface));
        let log = Arc::new(Mutex::new(Vec::new()));
        controller.set_observer(Box::new(StateLog(Arc::clone(&log))));
        let container = SyntheticContainer::new(SyntheticConfig::new(Duration::from_secs(seconds)));
        if let Err(e) = controller.open(Box::new(container)) {
            panic!("open failed: {e}");
        }
        (controller, log)
    }

    #[test]
    fn test_shared_state_round_trip() {
        let state = SharedState::new();
        assert!(state.is_stopped());
        state.set(PlaybackState::Paused);
        assert_eq!(state.get(), PlaybackState::Paused);
        state.set(PlaybackState::Playing);
        assert!(state.is_playing());
    }

    #[test]
    fn test_state_transitions_and_idempotence() {
        let (mut controller, log) = controller(5);
        assert!(controller.is_stopped());

        controller.pause();
        assert!(controller.is_stopped(), "pause is only valid while playing");

        controller.play();
        controller.play();
        assert!(controller.is_playing());

        controller.pause();
        controller.pause();
        assert!(controller.is_paused());

        controller.play();
        assert!(controller.is_playing());

        controller.stop();
        controller.stop();
        assert!(controller.is_stopped());

        assert_eq!(
            *log.lock(),
            vec![
                PlaybackState::Playing,
                PlaybackState::Paused,
                PlaybackState::Playing,
                PlaybackState::Stopped
            ]
        );
    }

    #[test]
    fn test_seek_rejected_while_stopped() {
        let (mut controller, _) = controller(5);
        assert!(!controller.seek(1.0));
        controller.play();
        assert!(controller.seek(1.0));
        assert_eq!(controller.position(), 1.0);
    }

    #[test]
    fn test_seek_clamps_to_length() {
        let (mut controller, _) = controller(5);
        controller.play();
        assert!(controller.seek(-3.0));
        assert_eq!(controller.position(), 0.0);
        assert!(controller.seek(60.0));
        assert_eq!(controller.position(), 5.0);
    }

    #[test]
    fn test_open_twice_rejected() {
        let (mut controller, _) = controller(1);
        let second = SyntheticContainer::new(SyntheticConfig::new(Duration::from_secs(1)));
        assert!(matches!(
            controller.open(Box::new(second)),
            Err(PipelineError::OpenFailed(_))
        ));

        controller.close();
        assert!(!controller.is_open());
        let third = SyntheticContainer::new(SyntheticConfig::new(Duration::from_secs(1)));
        assert!(controller.open(Box::new(third)).is_ok());
    }

    #[test]
    fn test_play_without_source() {
        let mut controller =
            PlaybackController::new(PlaybackConfig::default(), Box::new(NullSurface));
        controller.play();
        assert!(controller.is_stopped());
        assert_eq!(controller.length(), 0.0);
    }

    #[test]
    fn test_length_and_stop_reset() {
        let (mut controller, _) = controller(4);
        assert_eq!(controller.length(), 4.0);
        controller.play();
        assert!(controller.seek(2.0));
        controller.stop();
        assert_eq!(controller.position(), 0.0);
        assert_eq!(controller.length(), 4.0);
        assert_eq!(controller.buffered_frames(), 0);
    }
}
