//! avsync Demo Application
//!
//! Headless playback driver: opens a source, plays it on a fixed-rate
//! update loop and logs what the pipeline publishes.
//!
//! ```bash
//! # Synthetic 10 s test pattern, play 3 s, seek to 6 s first
//! RUST_LOG=avsync_core=debug cargo run -p avsync-demo -- --synthetic 3 --seek 6
//!
//! # A real file (needs system FFmpeg)
//! cargo run -p avsync-demo --features ffmpeg -- movie.mkv 10
//! ```

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use avsync_core::container::Container;
use avsync_core::synthetic::{SyntheticConfig, SyntheticContainer};
use avsync_core::{
    PixelFormat, PlaneImage, PlaybackConfig, PlaybackController, PlaybackObserver, PlaybackState,
    RenderSurface,
};

/// Update loop rate of the demo "display".
const TICK_RATE: f64 = 60.0;

struct Args {
    source: Option<String>,
    seconds: f64,
    seek: Option<f64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        source: None,
        seconds: 5.0,
        seek: None,
    };
    let mut positional = 0;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--synthetic" => args.source = None,
            "--seek" => {
                let value = iter.next().ok_or("--seek needs a value")?;
                args.seek = Some(
                    value
                        .parse()
                        .map_err(|e| format!("invalid --seek value {value}: {e}"))?,
                );
            }
            _ if positional == 0 && arg.parse::<f64>().is_err() => {
                args.source = Some(arg);
                positional += 1;
            }
            _ => {
                args.seconds = arg
                    .parse()
                    .map_err(|e| format!("invalid duration {arg}: {e}"))?;
                positional = 2;
            }
        }
    }
    Ok(args)
}

/// Logs texture (re)allocations and counts uploads.
#[derive(Default)]
struct LoggingSurface {
    uploads: u64,
}

impl RenderSurface for LoggingSurface {
    fn allocate(&mut self, format: PixelFormat, plane_count: usize) {
        tracing::info!("Allocating {plane_count} textures for {format}");
    }

    fn set_planes(&mut self, planes: Vec<PlaneImage>) {
        let sizes: Vec<_> = planes.iter().map(PlaneImage::dimensions).collect();
        tracing::info!("Surface resized, planes {sizes:?}");
        self.uploads += 1;
    }

    fn update_planes(&mut self, _planes: Vec<PlaneImage>) {
        self.uploads += 1;
        if self.uploads % 60 == 0 {
            tracing::debug!("{} uploads", self.uploads);
        }
    }
}

struct LoggingObserver;

impl PlaybackObserver for LoggingObserver {
    fn on_state_changed(&mut self, state: PlaybackState) {
        tracing::info!("State: {state:?}");
    }

    fn on_pixel_format_changed(&mut self, format: PixelFormat) {
        tracing::info!("Pixel format: {format}");
    }
}

fn open_source(source: Option<&str>) -> Result<Box<dyn Container>, String> {
    match source {
        None => Ok(Box::new(SyntheticContainer::new(SyntheticConfig::new(
            Duration::from_secs(10),
        )))),
        #[cfg(feature = "ffmpeg")]
        Some(path) => avsync_core::ffmpeg_container::FfmpegContainer::open_path(path)
            .map(|c| Box::new(c) as Box<dyn Container>)
            .map_err(|e| e.to_string()),
        #[cfg(not(feature = "ffmpeg"))]
        Some(path) => Err(format!(
            "cannot open {path}: built without the `ffmpeg` feature"
        )),
    }
}

fn run(args: Args) -> Result<(), String> {
    #[allow(unused_mut)]
    let mut controller =
        PlaybackController::new(PlaybackConfig::default(), Box::new(LoggingSurface::default()));

    #[cfg(feature = "audio-output")]
    let _stream = match avsync_core::audio::CpalAudioEngine::open_default() {
        Ok((engine, stream)) => {
            controller = controller.with_audio_engine(engine);
            Some(stream)
        }
        Err(e) => {
            tracing::warn!("Audio disabled: {e}");
            None
        }
    };

    controller.set_observer(Box::new(LoggingObserver));
    controller
        .open(open_source(args.source.as_deref())?)
        .map_err(|e| e.to_string())?;

    if let Some(info) = controller.media_info() {
        tracing::info!(
            "{}: {:.2}s, video {:?} ({:?}), audio {:?} ({:?} Hz, {:?} ch), decoders {:?}",
            info.format_name,
            controller.length(),
            info.video_encoding,
            info.video_codec,
            info.audio_encoding,
            info.sample_rate,
            info.channels,
            info.available_video_decoders()
        );
    }

    controller.play();
    if let Some(target) = args.seek {
        controller.seek(target);
    }

    let tick = Duration::from_secs_f64(1.0 / TICK_RATE);
    let start = Instant::now();
    let mut last = start;
    while controller.is_playing() && start.elapsed().as_secs_f64() < args.seconds {
        thread::sleep(tick);
        let now = Instant::now();
        controller.update(now.duration_since(last).as_secs_f64());
        last = now;
    }

    tracing::info!(
        "Played {:.2}s, position {:.3}s, {} frames published",
        start.elapsed().as_secs_f64(),
        controller.position(),
        controller.published_frames()
    );
    let error = controller.last_error().map(ToString::to_string);
    controller.close();
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let result = parse_args().and_then(run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
