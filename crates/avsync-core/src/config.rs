//! Playback tuning knobs.

use std::time::Duration;

use crate::frame_queue::DEFAULT_CAPACITY;

/// Tunables for one playback session.
///
/// Defaults reproduce the classic pacing: two buffered frames, a 500 ms
/// clock clamp and a two-call resampler grace period.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Capacity of the decoded frame queue (minimum 1)
    pub max_decoded_frames: usize,
    /// How far the playback clock may run ahead of the last popped frame
    /// before it is pulled back. `None` disables the clamp.
    pub clock_clamp_slack: Option<Duration>,
    /// Audio callbacks to sit out while the resampler is short of frames
    pub resampler_grace_limit: u32,
    /// Audio ring length, in milliseconds of source audio
    pub audio_buffering_ms: u32,
    /// Pause between retries when the container reports "try again"
    pub read_retry_backoff: Duration,
    /// Frames decoded before a seek target are dropped if earlier than
    /// `target - seek_tolerance`
    pub seek_tolerance: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_decoded_frames: DEFAULT_CAPACITY,
            clock_clamp_slack: Some(Duration::from_millis(500)),
            resampler_grace_limit: 2,
            audio_buffering_ms: 1000,
            read_retry_backoff: Duration::from_millis(1),
            seek_tolerance: Duration::from_millis(1),
        }
    }
}

impl PlaybackConfig {
    pub fn with_max_decoded_frames(mut self, frames: usize) -> Self {
        self.max_decoded_frames = frames.max(1);
        self
    }

    pub fn with_clock_clamp_slack(mut self, slack: Option<Duration>) -> Self {
        self.clock_clamp_slack = slack;
        self
    }

    pub fn with_resampler_grace_limit(mut self, calls: u32) -> Self {
        self.resampler_grace_limit = calls;
        self
    }

    pub fn with_audio_buffering_ms(mut self, ms: u32) -> Self {
        self.audio_buffering_ms = ms.max(1);
        self
    }

    pub fn with_read_retry_backoff(mut self, backoff: Duration) -> Self {
        self.read_retry_backoff = backoff;
        self
    }

    pub fn with_seek_tolerance(mut self, tolerance: Duration) -> Self {
        self.seek_tolerance = tolerance;
        self
    }
}
