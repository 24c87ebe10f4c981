//! End-to-end playback tests.
//!
//! Drive a [`PlaybackController`] over the synthetic container with a real
//! decode thread, the way a host application's frame loop would.
//!
//! ```bash
//! RUST_LOG=avsync_core=debug cargo test --package avsync-core --test playback -- --nocapture
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use avsync_core::audio::{AudioEngine, ManualAudioEngine};
use avsync_core::container::DecoderPreference;
use avsync_core::synthetic::{SyntheticConfig, SyntheticContainer, SyntheticPixels};
use avsync_core::{
    PipelineError, PixelFormat, PlaneImage, PlaybackConfig, PlaybackController,
    PlaybackObserver, PlaybackState, RenderSurface,
};
use parking_lot::Mutex;

const TICK: f64 = 1.0 / 30.0;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct SurfaceLog {
    allocations: Vec<(PixelFormat, usize)>,
    full_uploads: usize,
    in_place_updates: usize,
    last_luma: Option<u8>,
}

struct RecordingSurface(Arc<Mutex<SurfaceLog>>);

impl RecordingSurface {
    fn record(&self, planes: &[PlaneImage]) {
        self.0.lock().last_luma = planes.first().and_then(|p| p.data.first().copied());
    }
}

impl RenderSurface for RecordingSurface {
    fn allocate(&mut self, format: PixelFormat, plane_count: usize) {
        self.0.lock().allocations.push((format, plane_count));
    }

    fn set_planes(&mut self, planes: Vec<PlaneImage>) {
        self.0.lock().full_uploads += 1;
        self.record(&planes);
    }

    fn update_planes(&mut self, planes: Vec<PlaneImage>) {
        self.0.lock().in_place_updates += 1;
        self.record(&planes);
    }
}

#[derive(Default)]
struct ObserverLog {
    states: Vec<PlaybackState>,
    formats: Vec<PixelFormat>,
}

struct RecordingObserver(Arc<Mutex<ObserverLog>>);

impl PlaybackObserver for RecordingObserver {
    fn on_state_changed(&mut self, state: PlaybackState) {
        self.0.lock().states.push(state);
    }

    fn on_pixel_format_changed(&mut self, format: PixelFormat) {
        self.0.lock().formats.push(format);
    }
}

struct Fixture {
    controller: PlaybackController,
    surface: Arc<Mutex<SurfaceLog>>,
    observer: Arc<Mutex<ObserverLog>>,
}

fn fixture_with(
    source: SyntheticConfig,
    config: PlaybackConfig,
    engine: Option<Arc<dyn AudioEngine>>,
) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let surface = Arc::new(Mutex::new(SurfaceLog::default()));
    let observer = Arc::new(Mutex::new(ObserverLog::default()));
    let mut controller =
        PlaybackController::new(config, Box::new(RecordingSurface(Arc::clone(&surface))));
    if let Some(engine) = engine {
        controller = controller.with_audio_engine(engine);
    }
    controller.set_observer(Box::new(RecordingObserver(Arc::clone(&observer))));
    if let Err(e) = controller.open(Box::new(SyntheticContainer::new(source))) {
        panic!("open failed: {e}");
    }
    Fixture {
        controller,
        surface,
        observer,
    }
}

fn fixture(source: SyntheticConfig) -> Fixture {
    fixture_with(source, PlaybackConfig::default(), None)
}

/// Waits for the decode thread to queue a frame, then advances the clock.
fn tick(controller: &mut PlaybackController, delta: f64) {
    let deadline = Instant::now() + WAIT;
    while controller.buffered_frames() == 0
        && !controller.is_stopped()
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(1));
    }
    controller.update(delta);
}

/// Keeps updating until the controller reports Stopped.
fn run_until_stopped(controller: &mut PlaybackController, delta: f64) {
    let deadline = Instant::now() + WAIT;
    while !controller.is_stopped() {
        assert!(Instant::now() < deadline, "playback never stopped");
        if controller.buffered_frames() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        controller.update(delta);
    }
}

#[test]
fn test_one_second_of_ticks_reaches_one_second() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(10)));
    f.controller.play();
    for _ in 0..30 {
        tick(&mut f.controller, TICK);
    }

    assert!(f.controller.is_playing());
    let position = f.controller.position();
    assert!(
        (position - 1.0).abs() <= TICK + 1e-6,
        "position {position} should be within one frame of 1.0"
    );
    assert!(f.controller.published_frames() >= 25);
    assert_eq!(f.controller.current_pixel_format(), Some(PixelFormat::Yuv420p));

    let surface = f.surface.lock();
    assert_eq!(surface.allocations, vec![(PixelFormat::Yuv420p, 3)]);
    assert_eq!(surface.full_uploads, 1);
    assert_eq!(
        surface.in_place_updates as u64,
        f.controller.published_frames() - 1
    );
}

#[test]
fn test_seek_publishes_target_frame() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(10)));
    f.controller.play();
    for _ in 0..5 {
        tick(&mut f.controller, TICK);
    }

    assert!(f.controller.seek(5.0));
    assert_eq!(f.controller.position(), 5.0);

    let published = f.controller.published_frames();
    let deadline = Instant::now() + WAIT;
    while f.controller.published_frames() == published {
        assert!(Instant::now() < deadline, "no frame after seek");
        tick(&mut f.controller, 0.0);
    }

    assert!(f.controller.position() >= 5.0);
    assert!(f.controller.position() < 5.0 + 2.0 * TICK);
    // Frame 150 sits exactly on a keyframe at 5.0s
    assert_eq!(
        f.surface.lock().last_luma,
        Some(SyntheticConfig::luma_for(150))
    );
}

#[test]
fn test_seek_is_clamped_to_length() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(2)));
    f.controller.play();
    assert!(f.controller.seek(60.0));
    assert_eq!(f.controller.position(), 2.0);
    assert!(f.controller.seek(-3.0));
    assert_eq!(f.controller.position(), 0.0);
}

#[test]
fn test_end_of_stream_stops_playback() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_millis(500)));
    f.controller.play();
    run_until_stopped(&mut f.controller, TICK);

    assert_eq!(f.controller.published_frames(), 15);
    assert_eq!(f.controller.position(), 0.0);
    assert!(f.controller.last_error().is_none());
    assert_eq!(
        f.observer.lock().states,
        vec![PlaybackState::Playing, PlaybackState::Stopped]
    );
}

#[test]
fn test_seek_after_end_of_stream_queued_restarts_decoding() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_millis(500)));
    f.controller.play();
    // Let the decode thread run to the end without publishing anything
    let deadline = Instant::now() + WAIT;
    while f.controller.buffered_frames() < f.controller.config().max_decoded_frames {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    for _ in 0..14 {
        tick(&mut f.controller, TICK);
    }

    assert!(f.controller.seek(0.0));
    tick(&mut f.controller, 0.0);
    assert!(f.controller.is_playing());
    assert_eq!(f.surface.lock().last_luma, Some(SyntheticConfig::luma_for(0)));
}

#[test]
fn test_stop_returns_while_decoder_is_blocked() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(10)));
    f.controller.play();

    let deadline = Instant::now() + WAIT;
    while f.controller.buffered_frames() < f.controller.config().max_decoded_frames {
        assert!(Instant::now() < deadline, "queue never filled");
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    f.controller.stop();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(f.controller.is_stopped());
    assert_eq!(f.controller.buffered_frames(), 0);
    assert!(f.controller.is_open());
}

#[test]
fn test_play_after_stop_rewinds() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(10)));
    f.controller.play();
    for _ in 0..10 {
        tick(&mut f.controller, TICK);
    }
    f.controller.stop();
    assert_eq!(f.controller.position(), 0.0);

    f.controller.play();
    tick(&mut f.controller, TICK);
    assert!(f.controller.position() < TICK + 1e-6);
    assert_eq!(f.surface.lock().last_luma, Some(SyntheticConfig::luma_for(0)));
}

#[test]
fn test_controls_are_idempotent() {
    let mut f = fixture(SyntheticConfig::new(Duration::from_secs(10)));
    f.controller.play();
    f.controller.play();
    tick(&mut f.controller, TICK);
    f.controller.pause();
    f.controller.pause();

    let published = f.controller.published_frames();
    for _ in 0..5 {
        f.controller.update(1.0);
    }
    assert_eq!(f.controller.published_frames(), published);

    f.controller.play();
    f.controller.stop();
    f.controller.stop();
    assert_eq!(
        f.observer.lock().states,
        vec![
            PlaybackState::Playing,
            PlaybackState::Paused,
            PlaybackState::Playing,
            PlaybackState::Stopped,
        ]
    );
}

#[test]
fn test_unsupported_pixel_format_stops_with_error() {
    let mut f = fixture(
        SyntheticConfig::new(Duration::from_secs(2))
            .with_pixels(SyntheticPixels::Other("p010le".to_string())),
    );
    f.controller.play();
    run_until_stopped(&mut f.controller, TICK);

    assert_eq!(f.controller.published_frames(), 0);
    match f.controller.last_error() {
        Some(PipelineError::FatalFormat(msg)) => assert!(msg.contains("p010le")),
        other => panic!("Expected FatalFormat, got {other:?}"),
    }
}

#[test]
fn test_pixel_format_change_reallocates_surface() {
    let mut f = fixture(
        SyntheticConfig::new(Duration::from_secs(2))
            .with_pixel_switch(10, SyntheticPixels::Nv12),
    );
    f.controller.play();
    for _ in 0..20 {
        tick(&mut f.controller, TICK);
    }

    assert_eq!(f.controller.current_pixel_format(), Some(PixelFormat::Nv12));
    assert_eq!(
        f.surface.lock().allocations,
        vec![(PixelFormat::Yuv420p, 3), (PixelFormat::Nv12, 2)]
    );
    assert_eq!(
        f.observer.lock().formats,
        vec![PixelFormat::Yuv420p, PixelFormat::Nv12]
    );
}

#[test]
fn test_clock_is_clamped_to_published_frame() {
    let config = PlaybackConfig::default().with_clock_clamp_slack(Some(Duration::from_millis(50)));
    let mut f = fixture_with(SyntheticConfig::new(Duration::from_secs(10)), config, None);
    f.controller.play();

    // A long stall: the clock jumps a full second past frame 0
    tick(&mut f.controller, 1.0);
    assert_eq!(f.controller.position(), 0.0);

    // Clock now sits at 0.05s: frame 1 (0.033s) is due, frame 2 (0.067s) is not
    tick(&mut f.controller, 0.0);
    tick(&mut f.controller, 0.0);
    assert_eq!(f.controller.published_frames(), 2);
    assert!((f.controller.position() - TICK).abs() < 1e-6);
}

#[test]
fn test_unclamped_clock_catches_up_frame_by_frame() {
    let config = PlaybackConfig::default().with_clock_clamp_slack(None);
    let mut f = fixture_with(SyntheticConfig::new(Duration::from_secs(10)), config, None);
    f.controller.play();

    tick(&mut f.controller, 1.0);
    for _ in 0..5 {
        tick(&mut f.controller, 0.0);
    }
    // One frame per update, each already due
    assert_eq!(f.controller.published_frames(), 6);
    assert!((f.controller.position() - 5.0 * TICK).abs() < 1e-6);
}

#[test]
fn test_decoded_audio_reaches_the_engine() {
    let engine = Arc::new(ManualAudioEngine::new(48_000, 512, 2));
    let mut f = fixture_with(
        SyntheticConfig::new(Duration::from_secs(10)),
        PlaybackConfig::default(),
        Some(Arc::clone(&engine) as Arc<dyn AudioEngine>),
    );
    assert_eq!(engine.registered_callbacks(), 0);

    f.controller.play();
    assert_eq!(engine.registered_callbacks(), 1);
    for _ in 0..10 {
        tick(&mut f.controller, TICK);
    }

    let bus = engine.pump();
    let Some(channel) = bus.channel(0) else {
        panic!("bus has no channel 0");
    };
    assert!(channel.iter().any(|frame| frame.left > 0.0));
    assert!(channel.iter().any(|frame| frame.right < 0.0));

    f.controller.pause();
    let bus = engine.pump();
    let Some(channel) = bus.channel(0) else {
        panic!("bus has no channel 0");
    };
    assert!(channel.iter().all(|frame| frame.left == 0.0));

    f.controller.stop();
    assert_eq!(engine.registered_callbacks(), 0);
}

#[test]
fn test_volume_scales_engine_output() {
    let engine = Arc::new(ManualAudioEngine::new(48_000, 512, 2));
    let mut f = fixture_with(
        SyntheticConfig::new(Duration::from_secs(10)),
        PlaybackConfig::default(),
        Some(Arc::clone(&engine) as Arc<dyn AudioEngine>),
    );
    assert_eq!(f.controller.volume(), 100);
    f.controller.play();
    for _ in 0..10 {
        tick(&mut f.controller, TICK);
    }

    f.controller.set_volume(0);
    let bus = engine.pump();
    assert!(bus.channel(0).is_some_and(|c| c.iter().all(|frame| frame.left == 0.0)));

    f.controller.set_volume(250);
    assert_eq!(f.controller.volume(), 100);
    let bus = engine.pump();
    assert!(bus.channel(1).is_some_and(|c| c.iter().any(|frame| frame.left > 0.0)));
}

#[test]
fn test_audio_only_plays_out_every_sample() {
    let engine = Arc::new(ManualAudioEngine::new(48_000, 512, 2));
    let mut f = fixture_with(
        SyntheticConfig::new(Duration::from_secs(1)).without_video(),
        PlaybackConfig::default(),
        Some(Arc::clone(&engine) as Arc<dyn AudioEngine>),
    );
    f.controller.play();

    // One 512-frame engine callback per update
    let mut audible = 0;
    let mut updates = 0;
    let deadline = Instant::now() + WAIT;
    while !f.controller.is_stopped() {
        assert!(Instant::now() < deadline, "audio-only playback never ended");
        thread::sleep(Duration::from_millis(2));
        f.controller.update(512.0 / 48_000.0);
        updates += 1;
        let bus = engine.pump();
        if bus.channel(0).is_some_and(|c| c.iter().any(|frame| frame.left != 0.0)) {
            audible += 1;
        }
        if updates == 10 {
            assert!(f.controller.is_playing());
            let expected = 10.0 * 512.0 / 48_000.0;
            assert!((f.controller.position() - expected).abs() < 1e-6);
        }
    }

    // 48000 frames take at least 94 callbacks of 512
    assert!(audible >= 93, "only {audible} audible callbacks");
    assert!(updates >= 94, "stopped after {updates} updates");
    assert!(f.controller.last_error().is_none());
    assert_eq!(f.controller.published_frames(), 0);
}

#[test]
fn test_stop_returns_during_slow_read() {
    let mut f = fixture(
        SyntheticConfig::new(Duration::from_secs(10)).with_read_delay(Duration::from_millis(300)),
    );
    f.controller.play();
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    f.controller.stop();
    assert!(start.elapsed() < Duration::from_secs(1), "stop took {:?}", start.elapsed());
    assert!(f.controller.is_stopped());
    assert!(f.controller.last_error().is_none());
}

#[test]
fn test_slow_decode_keeps_clock_near_published_frame() {
    let slack = PlaybackConfig::default()
        .clock_clamp_slack
        .map_or(0.0, |s| s.as_secs_f64());
    let mut f = fixture(
        SyntheticConfig::new(Duration::from_secs(10))
            .with_audio(None)
            .with_decode_cost(Duration::from_millis(60)),
    );
    f.controller.play();

    // Real-time updates while decoding runs at roughly half speed
    let start = Instant::now();
    let mut last = start;
    let mut worst_lead: f64 = 0.0;
    while start.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(10));
        let now = Instant::now();
        f.controller.update(now.duration_since(last).as_secs_f64());
        last = now;
        if f.controller.published_frames() > 0 {
            worst_lead = worst_lead.max(f.controller.clock() - f.controller.position());
        }
    }

    assert!(f.controller.is_playing());
    let published = f.controller.published_frames();
    assert!(published > 10 && published < 90, "published {published}");
    // Between pictures the clock may run one decode interval past the slack
    assert!(worst_lead <= slack + 0.25, "clock ran {worst_lead:.3}s ahead");
}

#[test]
fn test_hardware_preference_publishes_nv12() {
    for device in ["vaapi", "cuda"] {
        let mut f = fixture(SyntheticConfig::new(Duration::from_secs(2)));
        // Reopen with a hardware decoder preference
        f.controller.close();
        let preference = DecoderPreference {
            codec: None,
            hw_device: Some(device.to_string()),
        };
        let source = SyntheticContainer::new(SyntheticConfig::new(Duration::from_secs(2)));
        if let Err(e) = f.controller.open_with_preference(Box::new(source), &preference) {
            panic!("open with {device} failed: {e}");
        }
        f.controller.play();
        for _ in 0..5 {
            tick(&mut f.controller, TICK);
        }

        let error = f.controller.last_error();
        assert!(error.is_none(), "{device}: {error:?}");
        assert_eq!(f.controller.published_frames(), 5);
        assert_eq!(f.controller.current_pixel_format(), Some(PixelFormat::Nv12));
    }
}

#[test]
fn test_media_info_is_available_after_open() {
    let f = fixture(SyntheticConfig::new(Duration::from_secs(4)).with_subtitle_streams(2));
    let Some(info) = f.controller.media_info() else {
        panic!("media info missing after open");
    };
    assert_eq!(info.format_name, "synthetic");
    assert_eq!(info.subtitle_streams, 2);
    assert_eq!(info.video_codec.as_deref(), Some("Synthetic test pattern"));
    assert_eq!(f.controller.length(), 4.0);
    assert!(f.controller.is_stopped());
}
