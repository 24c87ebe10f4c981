//! Audio pull callback: resampled ring output fanned out onto the mix bus.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::{MixBus, StereoFrame};
use crate::audio_ring::AudioRing;
use crate::controller::SharedState;

/// Output volume shared between the controller and the audio callback.
#[derive(Debug)]
pub struct VolumeControl {
    /// 0-100
    volume: AtomicU32,
}

impl VolumeControl {
    pub fn new() -> Self {
        Self {
            volume: AtomicU32::new(100),
        }
    }

    /// Returns the current volume (0-100).
    pub fn volume(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Sets the volume (0-100).
    pub fn set_volume(&self, volume: u32) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    /// Linear gain for the current volume.
    pub fn gain(&self) -> f32 {
        self.volume() as f32 / 100.0
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls from an [`AudioRing`] on the engine's real-time thread.
///
/// When the ring is short of frames the mixer sits out up to `grace_limit`
/// consecutive calls before mixing whatever is there, which smooths over
/// decode jitter around pause and resume. Never blocks beyond the ring's
/// short copy lock.
pub struct AudioMixer {
    ring: Arc<AudioRing>,
    state: Arc<SharedState>,
    buffer: Vec<StereoFrame>,
    grace_limit: u32,
    waited: u32,
    volume: Arc<VolumeControl>,
}

impl AudioMixer {
    pub(crate) fn new(
        ring: Arc<AudioRing>,
        state: Arc<SharedState>,
        buffer_size: usize,
        grace_limit: u32,
        volume: Arc<VolumeControl>,
    ) -> Self {
        Self {
            ring,
            state,
            buffer: vec![StereoFrame::SILENCE; buffer_size],
            grace_limit,
            waited: 0,
            volume,
        }
    }

    /// Fills the internal buffer with `frames` resampled frames.
    ///
    /// Returns false ("no output this call") while the ring holds fewer than
    /// `frames` frames and the grace period has not run out. Once it has, the
    /// available frames are mixed and the rest is silence.
    pub fn mix(&mut self, frames: usize) -> bool {
        if self.buffer.len() < frames {
            self.buffer.resize(frames, StereoFrame::SILENCE);
        }
        if frames <= self.ring.ready_frames() || self.grace_limit <= self.waited {
            self.waited = 0;
            self.ring.mix(&mut self.buffer[..frames]);
            return true;
        }
        self.waited += 1;
        false
    }

    /// Mixed output of the last successful [`mix`](Self::mix).
    pub fn output(&self) -> &[StereoFrame] {
        &self.buffer
    }

    /// Engine callback body: mixes one bus-sized buffer and accumulates it.
    ///
    /// Every bus channel receives the frames, scaled by the shared volume.
    pub fn mix_into_bus(&mut self, bus: &mut MixBus) {
        if !self.state.is_playing() {
            return;
        }
        let frames = bus.frames();
        if frames == 0 || !self.mix(frames) {
            return;
        }

        let gain = self.volume.gain();
        let source = &self.buffer[..frames];
        for channel in 0..bus.channel_count() {
            let Some(target) = bus.channel_mut(channel) else {
                tracing::error!("Mix bus channel {channel} missing");
                return;
            };
            for (out, frame) in target.iter_mut().zip(source) {
                *out += *frame * gain;
            }
        }
    }
}
