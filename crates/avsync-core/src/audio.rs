//! Audio engine seam.
//!
//! The pipeline never owns an output device. It registers a mix callback
//! with an [`AudioEngine`], which invokes it on its own real-time thread with
//! a [`MixBus`] to accumulate into. [`ManualAudioEngine`] drives callbacks on
//! demand (tests, headless runs); `CpalAudioEngine` (feature
//! `audio-output`) drives them from a cpal output stream.

use std::ops::{Add, AddAssign, Mul};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// One stereo sample pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoFrame {
    pub left: f32,
    pub right: f32,
}

impl StereoFrame {
    pub const SILENCE: StereoFrame = StereoFrame {
        left: 0.0,
        right: 0.0,
    };

    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn mono(value: f32) -> Self {
        Self {
            left: value,
            right: value,
        }
    }
}

impl Add for StereoFrame {
    type Output = StereoFrame;

    fn add(self, rhs: StereoFrame) -> StereoFrame {
        StereoFrame::new(self.left + rhs.left, self.right + rhs.right)
    }
}

impl AddAssign for StereoFrame {
    fn add_assign(&mut self, rhs: StereoFrame) {
        self.left += rhs.left;
        self.right += rhs.right;
    }
}

impl Mul<f32> for StereoFrame {
    type Output = StereoFrame;

    fn mul(self, gain: f32) -> StereoFrame {
        StereoFrame::new(self.left * gain, self.right * gain)
    }
}

/// Per-callback output buffers: one stereo buffer per output channel pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MixBus {
    channels: Vec<Vec<StereoFrame>>,
}

impl MixBus {
    /// Creates a silent bus with `channel_count` stereo channels of `frames` each.
    pub fn new(channel_count: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![StereoFrame::SILENCE; frames]; channel_count.max(1)],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> Option<&[StereoFrame]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [StereoFrame]> {
        self.channels.get_mut(index).map(Vec::as_mut_slice)
    }

    /// Resizes every channel to `frames` and silences it.
    pub fn reset(&mut self, frames: usize) {
        for channel in &mut self.channels {
            channel.clear();
            channel.resize(frames, StereoFrame::SILENCE);
        }
    }
}

/// Callback invoked by the engine once per output buffer.
pub type MixCallback = Box<dyn FnMut(&mut MixBus) + Send>;

/// Handle returned by [`AudioEngine::add_mix_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// A real-time audio engine that pulls from registered mix callbacks.
pub trait AudioEngine: Send + Sync {
    /// Output sample rate in Hz.
    fn mix_rate(&self) -> u32;

    /// Frames per callback.
    fn buffer_size(&self) -> usize;

    /// Number of stereo channel pairs on the output bus.
    fn channel_count(&self) -> usize;

    fn add_mix_callback(&self, callback: MixCallback) -> CallbackId;

    /// Unregisters a callback. Once this returns the callback will not run again.
    fn remove_mix_callback(&self, id: CallbackId) -> bool;
}

/// Callback table shared by the engine implementations.
#[derive(Default)]
pub struct MixCallbackRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(CallbackId, MixCallback)>>,
}

impl MixCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: MixCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        tracing::debug!("Registered mix callback {:?}", id);
        id
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        let removed = callbacks.len() != before;
        if removed {
            tracing::debug!("Removed mix callback {:?}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered callback against `bus`.
    pub fn run(&self, bus: &mut MixBus) {
        let mut callbacks = self.callbacks.lock();
        for (_, callback) in callbacks.iter_mut() {
            callback(bus);
        }
    }
}

/// An engine whose callbacks run only when [`pump`](ManualAudioEngine::pump)
/// is called.
pub struct ManualAudioEngine {
    mix_rate: u32,
    buffer_size: usize,
    channel_count: usize,
    registry: MixCallbackRegistry,
}

impl ManualAudioEngine {
    pub fn new(mix_rate: u32, buffer_size: usize, channel_count: usize) -> Self {
        Self {
            mix_rate,
            buffer_size: buffer_size.max(1),
            channel_count: channel_count.max(1),
            registry: MixCallbackRegistry::new(),
        }
    }

    /// Runs one engine cycle and returns the mixed bus.
    pub fn pump(&self) -> MixBus {
        let mut bus = MixBus::new(self.channel_count, self.buffer_size);
        self.registry.run(&mut bus);
        bus
    }

    pub fn registered_callbacks(&self) -> usize {
        self.registry.len()
    }
}

impl Default for ManualAudioEngine {
    fn default() -> Self {
        Self::new(48_000, 512, 1)
    }
}

impl AudioEngine for ManualAudioEngine {
    fn mix_rate(&self) -> u32 {
        self.mix_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn add_mix_callback(&self, callback: MixCallback) -> CallbackId {
        self.registry.add(callback)
    }

    fn remove_mix_callback(&self, id: CallbackId) -> bool {
        self.registry.remove(id)
    }
}

#[cfg(feature = "audio-output")]
pub use cpal_impl::{CpalAudioEngine, CpalOutputStream};

#[cfg(feature = "audio-output")]
mod cpal_impl {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample};
    use std::sync::Arc;

    /// Frames per device callback requested from the host.
    const DEVICE_BUFFER_FRAMES: u32 = 1024;

    /// Mix callback registry fed by the default cpal output device.
    pub struct CpalAudioEngine {
        mix_rate: u32,
        device_channels: usize,
        registry: Arc<MixCallbackRegistry>,
    }

    /// Keeps the cpal stream alive; audio stops when dropped.
    ///
    /// Not `Send` on every backend, so it is held apart from the engine.
    pub struct CpalOutputStream {
        stream: cpal::Stream,
    }

    impl CpalOutputStream {
        pub fn pause(&self) {
            // Not supported everywhere; the callbacks still produce silence.
            let _ = self.stream.pause();
        }

        pub fn resume(&self) -> Result<(), String> {
            self.stream
                .play()
                .map_err(|e| format!("cpal stream play failed: {e}"))
        }
    }

    impl CpalAudioEngine {
        /// Opens the default output device and starts pulling from callbacks.
        pub fn open_default() -> Result<(Arc<Self>, CpalOutputStream), String> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "No audio output device available".to_string())?;
            let supported_config = device
                .default_output_config()
                .map_err(|e| format!("Failed to get default output config: {e}"))?;

            let sample_format = supported_config.sample_format();
            let mix_rate = supported_config.sample_rate();
            let device_channels = supported_config.channels().max(1);

            #[cfg(target_os = "linux")]
            let stream_config = cpal::StreamConfig {
                channels: device_channels,
                sample_rate: mix_rate,
                buffer_size: cpal::BufferSize::Fixed(DEVICE_BUFFER_FRAMES),
            };
            #[cfg(not(target_os = "linux"))]
            let stream_config = cpal::StreamConfig {
                channels: device_channels,
                sample_rate: mix_rate,
                buffer_size: cpal::BufferSize::Default,
            };

            let registry = Arc::new(MixCallbackRegistry::new());
            let stream =
                build_cpal_stream(&device, &stream_config, sample_format, Arc::clone(&registry))?;
            stream
                .play()
                .map_err(|e| format!("cpal stream play failed: {e}"))?;

            tracing::info!(
                "Audio engine initialized (cpal, {}Hz, {}ch, {:?})",
                mix_rate,
                device_channels,
                sample_format
            );

            let engine = Arc::new(Self {
                mix_rate,
                device_channels: usize::from(device_channels),
                registry,
            });
            Ok((engine, CpalOutputStream { stream }))
        }
    }

    impl AudioEngine for CpalAudioEngine {
        fn mix_rate(&self) -> u32 {
            self.mix_rate
        }

        fn buffer_size(&self) -> usize {
            DEVICE_BUFFER_FRAMES as usize
        }

        fn channel_count(&self) -> usize {
            self.device_channels.div_ceil(2)
        }

        fn add_mix_callback(&self, callback: MixCallback) -> CallbackId {
            self.registry.add(callback)
        }

        fn remove_mix_callback(&self, id: CallbackId) -> bool {
            self.registry.remove(id)
        }
    }

    fn build_cpal_stream(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        sample_format: SampleFormat,
        registry: Arc<MixCallbackRegistry>,
    ) -> Result<cpal::Stream, String> {
        match sample_format {
            SampleFormat::I16 => build_cpal_stream_typed::<i16>(device, config, registry),
            SampleFormat::I32 => build_cpal_stream_typed::<i32>(device, config, registry),
            SampleFormat::U16 => build_cpal_stream_typed::<u16>(device, config, registry),
            SampleFormat::F32 => build_cpal_stream_typed::<f32>(device, config, registry),
            SampleFormat::F64 => build_cpal_stream_typed::<f64>(device, config, registry),
            other => Err(format!("Unsupported output sample format: {other:?}")),
        }
    }

    fn build_cpal_stream_typed<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        registry: Arc<MixCallbackRegistry>,
    ) -> Result<cpal::Stream, String>
    where
        T: SizedSample + FromSample<f32>,
    {
        let output_channels = usize::from(config.channels);
        let mut bus = MixBus::new(output_channels.div_ceil(2), DEVICE_BUFFER_FRAMES as usize);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / output_channels;
                    bus.reset(frames);
                    registry.run(&mut bus);

                    for (index, frame) in data.chunks_mut(output_channels).enumerate() {
                        for (channel, sample) in frame.iter_mut().enumerate() {
                            let value = bus
                                .channel(channel / 2)
                                .and_then(|pair| pair.get(index))
                                .map_or(0.0, |s| if channel % 2 == 0 { s.left } else { s.right });
                            *sample = T::from_sample(value.clamp(-1.0, 1.0));
                        }
                    }
                },
                |err| tracing::error!("cpal output stream error: {err}"),
                None,
            )
            .map_err(|e| format!("Failed to build output stream: {e}"))
    }
}
