//! avsync-core: threaded decode and A/V synchronization pipeline.
//!
//! A background decode thread demultiplexes a container, decodes video into
//! a tiny bounded [`frame_queue`] and audio into a resampling
//! [`audio_ring`]. The [`controller`] advances a logical clock on every
//! update tick and publishes due pictures; the [`mixer`] feeds a real-time
//! audio engine from the ring.
//!
//! - Data: [`frame`], [`container`], [`byte_source`]
//! - Threading: [`frame_queue`], [`audio_ring`], [`decode_worker`]
//! - Conversion: [`convert`], [`hw_transfer`]
//! - Control: [`controller`], [`session`], [`config`]
//! - Audio output: [`audio`], [`mixer`]
//!
//! Container back ends implement [`container::Container`]. The
//! [`synthetic`] container is always available; the FFmpeg one needs the
//! `ffmpeg` feature.

pub mod error;
pub mod config;
pub mod frame;

pub mod container;
pub mod byte_source;
pub mod hw_transfer;
pub mod convert;

pub mod frame_queue;
pub mod audio;
pub mod audio_ring;
pub mod mixer;

pub mod session;
pub mod decode_worker;
pub mod controller;

pub mod synthetic;

// === Optional back ends ===

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_container;

pub use config::PlaybackConfig;
pub use controller::{
    PlaybackController, PlaybackObserver, PlaybackState, RenderSurface, SharedState,
};
pub use error::PipelineError;
pub use frame::{FrameInfo, PixelFormat, PlaneImage};
pub use session::MediaInfo;
