//! Audio ring buffer with rate conversion for the pull callback.
//!
//! The decode worker writes planar or interleaved `f32` frames at the source
//! rate. The audio callback reads stereo frames at the engine's mix rate;
//! conversion is linear interpolation driven by a 16.16 fixed-point phase.
//!
//! Cursors are monotonically increasing frame counts and the backing store is
//! a power of two, so indices are `pos & mask`. The write cursor never laps
//! the read cursor: when the ring is full the newest frames are dropped and
//! counted.
//!
//! A single mutex guards cursors and samples. Both sides hold it only for the
//! copy itself.

use parking_lot::Mutex;

use crate::audio::StereoFrame;

const FRAC_BITS: u32 = 16;
const FRAC_ONE: u64 = 1 << FRAC_BITS;
const FRAC_MASK: u64 = FRAC_ONE - 1;

/// Lower bound on ring length, in frames.
const MIN_CAPACITY_FRAMES: usize = 1024;

/// Parameters for [`AudioRing::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSetup {
    /// Interleaved channels stored per frame
    pub channels: usize,
    /// Rate of the samples written by the decoder, in Hz
    pub source_rate: u32,
    /// Rate of the frames read by the audio callback, in Hz
    pub target_rate: u32,
    /// Ring length in milliseconds of source audio
    pub buffering_ms: u32,
    /// Minimum ring length in frames (e.g. twice the engine buffer)
    pub min_frames: usize,
}

impl RingSetup {
    /// Ring length rounded up to a power of two.
    fn capacity_frames(&self) -> usize {
        let wanted =
            (u64::from(self.source_rate) * u64::from(self.buffering_ms) / 1000) as usize;
        wanted
            .max(self.min_frames)
            .max(MIN_CAPACITY_FRAMES)
            .next_power_of_two()
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioRingMetrics {
    pub capacity_frames: usize,
    /// Source frames currently buffered
    pub buffered_frames: usize,
    /// Source frames accepted by the ring
    pub total_written: u64,
    /// Output frames produced by [`AudioRing::mix`]
    pub total_mixed: u64,
    /// Source frames dropped because the ring was full
    pub dropped_frames: u64,
    pub flush_count: u64,
}

struct RingInner {
    samples: Vec<f32>,
    channels: usize,
    capacity: usize,
    mask: usize,
    write_pos: usize,
    read_pos: usize,
    /// Fractional read position in 16.16 fixed point
    phase: u64,
    /// Source frames advanced per output frame, 16.16 fixed point
    increment: u64,
    /// True while a run of writes is being clipped, to log once per episode
    overflowing: bool,
    total_written: u64,
    total_mixed: u64,
    dropped_frames: u64,
    flush_count: u64,
}

impl RingInner {
    fn used(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn space(&self) -> usize {
        self.capacity - self.used()
    }

    fn ready(&self) -> usize {
        let used = self.used() as u64;
        if used == 0 {
            return 0;
        }
        let last = (used - 1) << FRAC_BITS;
        if self.phase > last {
            return 0;
        }
        ((last - self.phase) / self.increment + 1) as usize
    }

    fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.samples[(frame & self.mask) * self.channels + channel]
    }

    fn stereo_at(&self, frame: usize) -> StereoFrame {
        if self.channels == 1 {
            StereoFrame::mono(self.sample(frame, 0))
        } else {
            StereoFrame::new(self.sample(frame, 0), self.sample(frame, 1))
        }
    }

    /// Records a clipped write and decides whether it deserves a warning.
    fn note_clipped(&mut self, requested: usize, accepted: usize) {
        if accepted == requested {
            self.overflowing = false;
            return;
        }
        let dropped = requested - accepted;
        self.dropped_frames += dropped as u64;
        if !self.overflowing {
            tracing::warn!(
                "Discarding {dropped} audio frames: ring full ({} frames buffered)",
                self.used()
            );
        } else {
            tracing::trace!("Discarding {dropped} audio frames");
        }
        self.overflowing = true;
    }
}

/// Lock-protected audio ring shared by the decode worker and the audio callback.
pub struct AudioRing {
    inner: Mutex<RingInner>,
    source_rate: u32,
    target_rate: u32,
}

impl AudioRing {
    pub fn new(setup: RingSetup) -> Self {
        let channels = setup.channels.max(1);
        let source_rate = setup.source_rate.max(1);
        let target_rate = setup.target_rate.max(1);
        let capacity = setup.capacity_frames();
        let increment = ((u64::from(source_rate) << FRAC_BITS) / u64::from(target_rate)).max(1);

        tracing::debug!(
            "AudioRing: {channels}ch {source_rate}Hz -> {target_rate}Hz, {capacity} frames"
        );

        Self {
            inner: Mutex::new(RingInner {
                samples: vec![0.0; capacity * channels],
                channels,
                capacity,
                mask: capacity - 1,
                write_pos: 0,
                read_pos: 0,
                phase: 0,
                increment,
                overflowing: false,
                total_written: 0,
                total_mixed: 0,
                dropped_frames: 0,
                flush_count: 0,
            }),
            source_rate,
            target_rate,
        }
    }

    pub fn channels(&self) -> usize {
        self.inner.lock().channels
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn capacity_frames(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Source frames that can be written without dropping.
    pub fn writer_space(&self) -> usize {
        self.inner.lock().space()
    }

    /// Output frames [`mix`](Self::mix) can produce right now.
    pub fn ready_frames(&self) -> usize {
        self.inner.lock().ready()
    }

    /// Interleaves `planes` (one slice per channel) into the ring.
    ///
    /// Writes at most `frames` frames, clipped to free space; the excess is
    /// dropped and reported. Returns the number of frames stored.
    pub fn write_planar<P: AsRef<[f32]>>(&self, planes: &[P], frames: usize) -> usize {
        let mut inner = self.inner.lock();
        let channels = inner.channels;
        let available = planes
            .iter()
            .take(channels)
            .map(|p| p.as_ref().len())
            .min()
            .unwrap_or(0);
        let requested = if planes.len() < channels { 0 } else { frames.min(available) };
        let todo = requested.min(inner.space());

        let start = inner.write_pos;
        let mask = inner.mask;
        for i in 0..todo {
            let base = ((start + i) & mask) * channels;
            for (ch, plane) in planes.iter().take(channels).enumerate() {
                inner.samples[base + ch] = plane.as_ref()[i];
            }
        }
        inner.write_pos += todo;
        inner.total_written += todo as u64;
        inner.note_clipped(frames.min(available), todo);
        todo
    }

    /// Copies already interleaved samples into the ring.
    ///
    /// `samples.len()` must be a multiple of the channel count; a trailing
    /// partial frame is ignored. Returns the number of frames stored.
    pub fn write_interleaved(&self, samples: &[f32]) -> usize {
        let mut inner = self.inner.lock();
        let channels = inner.channels;
        let requested = samples.len() / channels;
        let todo = requested.min(inner.space());

        let start = inner.write_pos;
        let mask = inner.mask;
        for (i, frame) in samples.chunks_exact(channels).take(todo).enumerate() {
            let base = ((start + i) & mask) * channels;
            inner.samples[base..base + channels].copy_from_slice(frame);
        }
        inner.write_pos += todo;
        inner.total_written += todo as u64;
        inner.note_clipped(requested, todo);
        todo
    }

    /// Fills `dest` with resampled stereo frames.
    ///
    /// Produces as many frames as are ready and silences the remainder.
    /// Returns the number of frames produced.
    pub fn mix(&self, dest: &mut [StereoFrame]) -> usize {
        let mut inner = self.inner.lock();
        let todo = inner.ready().min(dest.len());
        let increment = inner.increment;
        let base = inner.read_pos;
        let mut pos = inner.phase;

        for slot in dest.iter_mut().take(todo) {
            let index = base + (pos >> FRAC_BITS) as usize;
            let frac = pos & FRAC_MASK;
            *slot = if frac == 0 {
                inner.stereo_at(index)
            } else {
                let a = inner.stereo_at(index);
                let b = inner.stereo_at(index + 1);
                let t = frac as f32 / FRAC_ONE as f32;
                a * (1.0 - t) + b * t
            };
            pos += increment;
        }
        for slot in dest.iter_mut().skip(todo) {
            *slot = StereoFrame::SILENCE;
        }

        if todo > 0 {
            let advance = (pos >> FRAC_BITS) as usize;
            let used = inner.used();
            if advance > used {
                inner.read_pos += used;
                inner.phase = 0;
            } else {
                inner.read_pos += advance;
                inner.phase = pos & FRAC_MASK;
            }
            inner.total_mixed += todo as u64;
        }
        todo
    }

    /// Discards everything buffered.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.used();
        inner.read_pos = inner.write_pos;
        inner.phase = 0;
        inner.overflowing = false;
        inner.flush_count += 1;
        drop(inner);
        tracing::debug!("AudioRing::flush: dropped {dropped} frames");
    }

    pub fn metrics(&self) -> AudioRingMetrics {
        let inner = self.inner.lock();
        AudioRingMetrics {
            capacity_frames: inner.capacity,
            buffered_frames: inner.used(),
            total_written: inner.total_written,
            total_mixed: inner.total_mixed,
            dropped_frames: inner.dropped_frames,
            flush_count: inner.flush_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn setup(channels: usize, source_rate: u32, target_rate: u32) -> RingSetup {
        RingSetup {
            channels,
            source_rate,
            target_rate,
            buffering_ms: 10,
            min_frames: 0,
        }
    }

    #[test]
    fn test_capacity_is_power_of_two() {
        let ring = AudioRing::new(RingSetup {
            buffering_ms: 1000,
            ..setup(2, 48_000, 48_000)
        });
        assert_eq!(ring.capacity_frames(), 65_536);
        assert_eq!(ring.writer_space(), 65_536);

        let small = AudioRing::new(setup(2, 8_000, 48_000));
        assert_eq!(small.capacity_frames(), MIN_CAPACITY_FRAMES);
    }

    #[test]
    fn test_round_trip_interleaved() {
        let ring = AudioRing::new(setup(2, 48_000, 48_000));
        let n = ring.capacity_frames();
        let samples: Vec<f32> = (0..n * 2).map(|i| i as f32 / 10_000.0).collect();

        assert_eq!(ring.write_interleaved(&samples), n);
        assert_eq!(ring.ready_frames(), n);

        let mut out = vec![StereoFrame::SILENCE; n];
        assert_eq!(ring.mix(&mut out), n);
        for (i, frame) in out.iter().enumerate() {
            assert_eq!(frame.left, samples[i * 2]);
            assert_eq!(frame.right, samples[i * 2 + 1]);
        }
        assert_eq!(ring.ready_frames(), 0);
    }

    #[test]
    fn test_round_trip_planar() {
        let ring = AudioRing::new(setup(2, 44_100, 44_100));
        let left: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let right: Vec<f32> = (0..100).map(|i| -(i as f32)).collect();

        assert_eq!(ring.write_planar(&[left.clone(), right.clone()], 100), 100);

        let mut out = vec![StereoFrame::SILENCE; 100];
        assert_eq!(ring.mix(&mut out), 100);
        for i in 0..100 {
            assert_eq!(out[i], StereoFrame::new(left[i], right[i]));
        }
    }

    #[test]
    fn test_mono_duplicates_to_both_sides() {
        let ring = AudioRing::new(setup(1, 48_000, 48_000));
        ring.write_interleaved(&[0.25, 0.5]);
        let mut out = [StereoFrame::SILENCE; 2];
        ring.mix(&mut out);
        assert_eq!(out, [StereoFrame::mono(0.25), StereoFrame::mono(0.5)]);
    }

    #[test]
    fn test_upsampling_interpolates() {
        let ring = AudioRing::new(setup(1, 24_000, 48_000));
        ring.write_interleaved(&[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(ring.ready_frames(), 7);

        let mut out = [StereoFrame::SILENCE; 8];
        assert_eq!(ring.mix(&mut out), 7);
        let lefts: Vec<f32> = out.iter().map(|f| f.left).collect();
        assert_eq!(lefts, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 0.0]);

        // Half a source frame is pending until the next write arrives.
        assert_eq!(ring.ready_frames(), 0);
        ring.write_interleaved(&[4.0]);
        let mut next = [StereoFrame::SILENCE; 2];
        assert_eq!(ring.mix(&mut next), 2);
        assert_eq!(next[0].left, 3.5);
        assert_eq!(next[1].left, 4.0);
    }

    #[test]
    fn test_downsampling_skips_frames() {
        let ring = AudioRing::new(setup(1, 96_000, 48_000));
        let samples: Vec<f32> = (0..8).map(|i| i as f32).collect();
        ring.write_interleaved(&samples);
        assert_eq!(ring.ready_frames(), 4);

        let mut out = [StereoFrame::SILENCE; 4];
        assert_eq!(ring.mix(&mut out), 4);
        let lefts: Vec<f32> = out.iter().map(|f| f.left).collect();
        assert_eq!(lefts, vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(ring.metrics().buffered_frames, 0);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let ring = AudioRing::new(setup(1, 48_000, 48_000));
        let capacity = ring.capacity_frames();
        let first: Vec<f32> = vec![1.0; capacity - 2];
        assert_eq!(ring.write_interleaved(&first), capacity - 2);

        let second = [2.0, 2.0, 3.0, 3.0];
        assert_eq!(ring.write_interleaved(&second), 2);
        assert_eq!(ring.writer_space(), 0);

        let metrics = ring.metrics();
        assert_eq!(metrics.dropped_frames, 2);
        assert_eq!(metrics.buffered_frames, capacity);

        // Oldest data is intact; the clipped tail never made it in.
        let mut out = vec![StereoFrame::SILENCE; capacity];
        assert_eq!(ring.mix(&mut out), capacity);
        assert_eq!(out[0].left, 1.0);
        assert_eq!(out[capacity - 1].left, 2.0);
    }

    #[test]
    fn test_short_plane_list_writes_nothing() {
        let ring = AudioRing::new(setup(2, 48_000, 48_000));
        let only_left = vec![vec![0.5f32; 16]];
        assert_eq!(ring.write_planar(&only_left, 16), 0);
        assert_eq!(ring.metrics().buffered_frames, 0);
    }

    #[test]
    fn test_mix_silences_underrun() {
        let ring = AudioRing::new(setup(2, 48_000, 48_000));
        ring.write_interleaved(&[0.1, 0.2]);
        let mut out = [StereoFrame::new(9.0, 9.0); 3];
        assert_eq!(ring.mix(&mut out), 1);
        assert_eq!(out[0], StereoFrame::new(0.1, 0.2));
        assert_eq!(out[1], StereoFrame::SILENCE);
        assert_eq!(out[2], StereoFrame::SILENCE);
    }

    #[test]
    fn test_flush_discards_buffered() {
        let ring = AudioRing::new(setup(2, 48_000, 48_000));
        ring.write_interleaved(&[0.5; 64]);
        ring.flush();
        assert_eq!(ring.ready_frames(), 0);
        assert_eq!(ring.writer_space(), ring.capacity_frames());
        assert_eq!(ring.metrics().flush_count, 1);

        ring.write_interleaved(&[0.75, 0.25]);
        let mut out = [StereoFrame::SILENCE; 1];
        ring.mix(&mut out);
        assert_eq!(out[0], StereoFrame::new(0.75, 0.25));
    }

    #[test]
    fn test_wraparound() {
        let ring = AudioRing::new(setup(1, 48_000, 48_000));
        let capacity = ring.capacity_frames();
        let mut out = vec![StereoFrame::SILENCE; capacity / 2];
        let mut next = 0.0f32;
        let mut expected = 0.0f32;

        for _ in 0..10 {
            let chunk: Vec<f32> = (0..capacity / 2)
                .map(|_| {
                    next += 1.0;
                    next
                })
                .collect();
            assert_eq!(ring.write_interleaved(&chunk), capacity / 2);
            assert_eq!(ring.mix(&mut out), capacity / 2);
            for frame in &out {
                expected += 1.0;
                assert_eq!(frame.left, expected);
            }
        }
    }

    #[test]
    fn test_concurrent_write_and_mix() {
        let ring = Arc::new(AudioRing::new(setup(1, 48_000, 48_000)));
        let total = 50_000usize;

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut sent = 0usize;
                while sent < total {
                    let end = (sent + 256).min(total);
                    let chunk: Vec<f32> = (sent..end).map(|i| i as f32).collect();
                    let written = ring.write_interleaved(&chunk);
                    sent += written;
                    if written < chunk.len() {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = 0usize;
        let mut out = vec![StereoFrame::SILENCE; 300];
        while received < total {
            let produced = ring.mix(&mut out);
            for frame in &out[..produced] {
                assert_eq!(frame.left, received as f32, "sample order broken");
                received += 1;
            }
            if produced == 0 {
                thread::yield_now();
            }
        }
        writer.join().expect("writer panicked");
    }
}
