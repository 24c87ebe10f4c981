//! Deterministic in-memory container for tests and headless runs.
//!
//! Generates an interleaved video + audio stream with real codec-like
//! behavior: keyframe-snapping seeks, decoders that buffer frames and
//! reject input while full, and optional injected faults (transient reads,
//! corrupt packets, slow decode, unsupported layouts).

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::container::{
    AudioSamples, CodecDescriptor, Container, ContainerError, DecodedFrame, Decoder,
    DecoderPreference, Packet, RawAudioFrame, RawPixelFormat, RawPlane, RawVideoFrame,
    StreamInfo, StreamKind, TimeBase, VideoPayload,
};
use crate::hw_transfer::{HardwareSurface, SurfaceKind};

/// Ticks per second of the video stream time base.
const VIDEO_TIME_SCALE: i32 = 15_360;

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;

const SOFTWARE_DECODER: &str = "synthetic";

/// Pixel layout emitted by the synthetic video decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticPixels {
    Yuv420p,
    Nv12,
    /// Device surface downloading to NV12
    Surface(SurfaceKind),
    /// Unconvertible layout, by name
    Other(String),
}

/// Sample layout emitted by the synthetic audio decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticSampleLayout {
    Planar,
    Interleaved,
    Other(String),
}

/// Audio stream parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: usize,
    /// Frames per packet
    pub packet_frames: usize,
    pub layout: SyntheticSampleLayout,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            packet_frames: 1024,
            layout: SyntheticSampleLayout::Planar,
        }
    }
}

/// Shape of the generated media and the faults to inject.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// A keyframe every this many frames
    pub keyframe_interval: u32,
    pub pixels: SyntheticPixels,
    /// Switch to another layout from the given frame index on
    pub pixel_switch: Option<(u32, SyntheticPixels)>,
    /// Padding bytes appended to every decoded row
    pub row_padding: usize,
    pub audio: Option<SyntheticAudio>,
    pub subtitle_streams: usize,
    /// Frames the video decoder holds back before emitting
    pub decoder_delay: usize,
    /// Every Nth read reports "try again" first
    pub transient_read_every: Option<u32>,
    /// Video frame indices whose packets fail to decode
    pub corrupt_frames: Vec<u32>,
    /// Sleep per decoded video frame
    pub decode_cost: Duration,
    /// Sleep per packet read
    pub read_delay: Duration,
    /// Streams on which seeks are rejected
    pub reject_seek_on: Vec<StreamKind>,
}

impl SyntheticConfig {
    /// 30 fps YUV 4:2:0 video with 48 kHz stereo planar audio.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            width: 32,
            height: 18,
            fps: 30,
            keyframe_interval: 15,
            pixels: SyntheticPixels::Yuv420p,
            pixel_switch: None,
            row_padding: 8,
            audio: Some(SyntheticAudio::default()),
            subtitle_streams: 0,
            decoder_delay: 0,
            transient_read_every: None,
            corrupt_frames: Vec::new(),
            decode_cost: Duration::ZERO,
            read_delay: Duration::ZERO,
            reject_seek_on: Vec::new(),
        }
    }

    pub fn with_pixels(mut self, pixels: SyntheticPixels) -> Self {
        self.pixels = pixels;
        self
    }

    pub fn with_pixel_switch(mut self, frame: u32, pixels: SyntheticPixels) -> Self {
        self.pixel_switch = Some((frame, pixels));
        self
    }

    pub fn with_audio(mut self, audio: Option<SyntheticAudio>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_subtitle_streams(mut self, count: usize) -> Self {
        self.subtitle_streams = count;
        self
    }

    pub fn with_decoder_delay(mut self, frames: usize) -> Self {
        self.decoder_delay = frames;
        self
    }

    pub fn with_transient_reads(mut self, every: u32) -> Self {
        self.transient_read_every = Some(every.max(1));
        self
    }

    pub fn with_corrupt_frames(mut self, frames: Vec<u32>) -> Self {
        self.corrupt_frames = frames;
        self
    }

    pub fn with_decode_cost(mut self, cost: Duration) -> Self {
        self.decode_cost = cost;
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_rejected_seeks(mut self, kinds: Vec<StreamKind>) -> Self {
        self.reject_seek_on = kinds;
        self
    }

    pub fn without_video(mut self) -> Self {
        self.fps = 0;
        self
    }

    fn total_video_frames(&self) -> u32 {
        if self.fps == 0 {
            return 0;
        }
        (self.duration.as_secs_f64() * f64::from(self.fps)).floor() as u32
    }

    fn total_audio_packets(&self) -> usize {
        self.audio.as_ref().map_or(0, |audio| {
            let frames = (self.duration.as_secs_f64() * f64::from(audio.sample_rate)) as usize;
            frames.div_ceil(audio.packet_frames.max(1))
        })
    }

    fn video_ticks_per_frame(&self) -> i64 {
        i64::from(VIDEO_TIME_SCALE) / i64::from(self.fps.max(1))
    }

    fn pixels_for(&self, frame: u32) -> &SyntheticPixels {
        match &self.pixel_switch {
            Some((from, pixels)) if frame >= *from => pixels,
            _ => &self.pixels,
        }
    }

    /// Luma value painted into frame `index`, so tests can identify it.
    pub fn luma_for(index: u32) -> u8 {
        16 + (index % 200) as u8
    }

    /// Sample value of channel `channel` at absolute frame `frame`.
    pub fn sample_for(frame: usize, channel: usize) -> f32 {
        let value = (frame % 100) as f32 / 100.0;
        if channel % 2 == 0 {
            value
        } else {
            -value
        }
    }
}

/// Demultiplexer over generated packets.
pub struct SyntheticContainer {
    config: Arc<SyntheticConfig>,
    streams: Vec<StreamInfo>,
    next_video: u32,
    next_audio: usize,
    reads: u32,
    transient_pending: bool,
}

impl SyntheticContainer {
    pub fn new(config: SyntheticConfig) -> Self {
        let mut streams = Vec::new();
        if config.fps > 0 {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: StreamKind::Video,
                time_base: TimeBase::new(1, VIDEO_TIME_SCALE),
                codec_id: "synthetic_video".to_string(),
                duration: Some(
                    i64::from(config.total_video_frames()) * config.video_ticks_per_frame(),
                ),
                sample_rate: None,
                channels: None,
            });
        }
        if let Some(audio) = &config.audio {
            let rate = i32::try_from(audio.sample_rate).unwrap_or(i32::MAX);
            streams.push(StreamInfo {
                index: streams.len(),
                kind: StreamKind::Audio,
                time_base: TimeBase::new(1, rate),
                codec_id: "synthetic_audio".to_string(),
                duration: Some((config.duration.as_secs_f64() * f64::from(rate)) as i64),
                sample_rate: Some(audio.sample_rate),
                channels: Some(audio.channels),
            });
        }
        for _ in 0..config.subtitle_streams {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: StreamKind::Subtitle,
                time_base: TimeBase::new(1, 1000),
                codec_id: "webvtt".to_string(),
                duration: None,
                sample_rate: None,
                channels: None,
            });
        }

        Self {
            config: Arc::new(config),
            streams,
            next_video: 0,
            next_audio: 0,
            reads: 0,
            transient_pending: false,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn stream_of(&self, kind: StreamKind) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    fn next_video_time(&self) -> Option<f64> {
        (self.next_video < self.config.total_video_frames())
            .then(|| f64::from(self.next_video) / f64::from(self.config.fps))
    }

    fn next_audio_time(&self) -> Option<f64> {
        let audio = self.config.audio.as_ref()?;
        (self.next_audio < self.config.total_audio_packets()).then(|| {
            (self.next_audio * audio.packet_frames) as f64 / f64::from(audio.sample_rate)
        })
    }

    fn video_packet(&mut self, stream_index: usize) -> Packet {
        let index = self.next_video;
        self.next_video += 1;
        let corrupt = self.config.corrupt_frames.contains(&index);
        let mut data = index.to_le_bytes().to_vec();
        data.push(u8::from(corrupt));
        let ticks = self.config.video_ticks_per_frame();
        let pts = i64::from(index) * ticks;
        Packet {
            stream_index,
            pts: Some(pts),
            dts: Some(pts),
            duration: ticks,
            is_keyframe: index % self.config.keyframe_interval.max(1) == 0,
            data,
            side_data: Vec::new(),
        }
    }

    fn audio_packet(&mut self, stream_index: usize, audio: &SyntheticAudio) -> Packet {
        let index = self.next_audio;
        self.next_audio += 1;
        let first_frame = index * audio.packet_frames;
        let total = (self.config.duration.as_secs_f64() * f64::from(audio.sample_rate)) as usize;
        let frames = audio.packet_frames.min(total.saturating_sub(first_frame));
        let mut data = (first_frame as u64).to_le_bytes().to_vec();
        data.extend_from_slice(&(frames as u32).to_le_bytes());
        Packet {
            stream_index,
            pts: Some(first_frame as i64),
            dts: Some(first_frame as i64),
            duration: frames as i64,
            is_keyframe: true,
            data,
            side_data: Vec::new(),
        }
    }
}

impl Container for SyntheticContainer {
    fn format_name(&self) -> &str {
        "synthetic"
    }

    fn duration(&self) -> Option<f64> {
        Some(self.config.duration.as_secs_f64())
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, ContainerError> {
        if !self.config.read_delay.is_zero() {
            thread::sleep(self.config.read_delay);
        }
        if let Some(every) = self.config.transient_read_every {
            if self.transient_pending {
                self.transient_pending = false;
            } else {
                self.reads += 1;
                if self.reads % every == 0 {
                    self.transient_pending = true;
                    return Err(ContainerError::Again);
                }
            }
        }

        let video_index = self.stream_of(StreamKind::Video).map(|s| s.index);
        let audio_index = self.stream_of(StreamKind::Audio).map(|s| s.index);
        let packet = match (self.next_video_time(), self.next_audio_time()) {
            (None, None) => None,
            (Some(v), Some(a)) if a < v => {
                let audio = self.config.audio.clone();
                audio.map(|audio| self.audio_packet(audio_index.unwrap_or(AUDIO_STREAM), &audio))
            }
            (Some(_), _) => Some(self.video_packet(video_index.unwrap_or(VIDEO_STREAM))),
            (None, Some(_)) => {
                let audio = self.config.audio.clone();
                audio.map(|audio| self.audio_packet(audio_index.unwrap_or(AUDIO_STREAM), &audio))
            }
        };
        Ok(packet)
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), ContainerError> {
        let Some(stream) = self.streams.get(stream_index) else {
            return Err(ContainerError::SeekRejected(format!(
                "no stream {stream_index}"
            )));
        };
        if self.config.reject_seek_on.contains(&stream.kind)
            || !matches!(stream.kind, StreamKind::Video | StreamKind::Audio)
        {
            return Err(ContainerError::SeekRejected(format!(
                "stream {stream_index} is not seekable"
            )));
        }

        let target = stream.time_base.to_seconds(timestamp).max(0.0);
        let (frame, keyframe_time) = if self.config.fps > 0 {
            let frame = ((target * f64::from(self.config.fps)) + 1e-9).floor() as u32;
            let frame = frame.min(self.config.total_video_frames());
            let key = frame - frame % self.config.keyframe_interval.max(1);
            (key, f64::from(key) / f64::from(self.config.fps))
        } else {
            (0, target)
        };
        self.next_video = frame;
        self.next_audio = self.config.audio.as_ref().map_or(0, |audio| {
            (keyframe_time * f64::from(audio.sample_rate)) as usize / audio.packet_frames.max(1)
        });
        tracing::debug!(
            "SyntheticContainer: seek to {target:.3}s snapped to {keyframe_time:.3}s \
             (frame {frame})"
        );
        Ok(())
    }

    fn available_decoders(&self, stream_index: usize) -> Vec<CodecDescriptor> {
        match self.streams.get(stream_index).map(|s| s.kind) {
            Some(StreamKind::Video) => vec![CodecDescriptor {
                name: SOFTWARE_DECODER.to_string(),
                hw_configs: vec![
                    "dxva2".to_string(),
                    "d3d11va".to_string(),
                    "videotoolbox".to_string(),
                    "vaapi".to_string(),
                    "cuda".to_string(),
                ],
            }],
            Some(StreamKind::Audio) => vec![CodecDescriptor {
                name: SOFTWARE_DECODER.to_string(),
                hw_configs: Vec::new(),
            }],
            _ => Vec::new(),
        }
    }

    fn codec_long_name(&self, stream_index: usize) -> Option<String> {
        match self.streams.get(stream_index)?.kind {
            StreamKind::Video => Some("Synthetic test pattern".to_string()),
            StreamKind::Audio => Some("Synthetic PCM float".to_string()),
            StreamKind::Subtitle => Some("WebVTT subtitle".to_string()),
            StreamKind::Data => None,
        }
    }

    fn open_decoder(
        &self,
        stream_index: usize,
        preference: &DecoderPreference,
    ) -> Result<Box<dyn Decoder>, ContainerError> {
        if let Some(codec) = &preference.codec {
            if codec != SOFTWARE_DECODER {
                return Err(ContainerError::DecoderNotFound(codec.clone()));
            }
        }
        let Some(stream) = self.streams.get(stream_index) else {
            return Err(ContainerError::DecoderNotFound(format!("stream {stream_index}")));
        };
        match stream.kind {
            StreamKind::Video => {
                let surface = preference.hw_device.as_deref().and_then(surface_for_device);
                if let Some(kind) = surface {
                    tracing::info!("Using hw decoder {}", kind.name());
                }
                Ok(Box::new(SyntheticVideoDecoder::new(
                    Arc::clone(&self.config),
                    surface,
                )))
            }
            StreamKind::Audio => Ok(Box::new(SyntheticAudioDecoder::new(Arc::clone(
                &self.config,
            )))),
            other => Err(ContainerError::DecoderNotFound(format!(
                "no decoder for {other:?} stream"
            ))),
        }
    }
}

fn surface_for_device(device: &str) -> Option<SurfaceKind> {
    match device {
        "dxva2" => Some(SurfaceKind::Dxva2Vld),
        "d3d11va" => Some(SurfaceKind::D3d11),
        "videotoolbox" => Some(SurfaceKind::VideoToolbox),
        "vaapi" => Some(SurfaceKind::Vaapi),
        "cuda" => Some(SurfaceKind::Cuda),
        _ => None,
    }
}

fn padded_plane(row_bytes: usize, rows: usize, padding: usize, value: u8) -> RawPlane {
    let stride = row_bytes + padding;
    let mut data = vec![0u8; stride * rows];
    for row in data.chunks_mut(stride) {
        row[..row_bytes].fill(value);
    }
    RawPlane { data, stride }
}

fn nv12_planes(width: u32, height: u32, padding: usize, luma: u8) -> Vec<RawPlane> {
    let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
    vec![
        padded_plane(width as usize, height as usize, padding, luma),
        padded_plane(cw * 2, ch, padding, 128),
    ]
}

/// Device surface that downloads to NV12.
struct SyntheticSurface {
    kind: SurfaceKind,
    width: u32,
    height: u32,
    luma: u8,
}

impl HardwareSurface for SyntheticSurface {
    fn kind(&self) -> SurfaceKind {
        self.kind
    }

    fn download(&self) -> Result<(RawPixelFormat, Vec<RawPlane>), ContainerError> {
        Ok((
            RawPixelFormat::Nv12,
            nv12_planes(self.width, self.height, 0, self.luma),
        ))
    }
}

struct SyntheticVideoDecoder {
    config: Arc<SyntheticConfig>,
    surface: Option<SurfaceKind>,
    pending: VecDeque<RawVideoFrame>,
    draining: bool,
    need_keyframe: bool,
}

impl SyntheticVideoDecoder {
    fn new(config: Arc<SyntheticConfig>, surface: Option<SurfaceKind>) -> Self {
        Self {
            config,
            surface,
            pending: VecDeque::new(),
            draining: false,
            need_keyframe: true,
        }
    }

    fn picture(&self, index: u32, pts: Option<i64>) -> RawVideoFrame {
        let config = &self.config;
        let (width, height) = (config.width, config.height);
        let luma = SyntheticConfig::luma_for(index);
        let pixels = match self.surface {
            Some(kind) => SyntheticPixels::Surface(kind),
            None => config.pixels_for(index).clone(),
        };

        let payload = match pixels {
            SyntheticPixels::Yuv420p => {
                let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
                VideoPayload::Host {
                    format: RawPixelFormat::Yuv420p,
                    planes: vec![
                        padded_plane(width as usize, height as usize, config.row_padding, luma),
                        padded_plane(cw, ch, config.row_padding, 128),
                        padded_plane(cw, ch, config.row_padding, 128),
                    ],
                }
            }
            SyntheticPixels::Nv12 => VideoPayload::Host {
                format: RawPixelFormat::Nv12,
                planes: nv12_planes(width, height, config.row_padding, luma),
            },
            SyntheticPixels::Surface(kind) => VideoPayload::Surface(Box::new(SyntheticSurface {
                kind,
                width,
                height,
                luma,
            })),
            SyntheticPixels::Other(name) => VideoPayload::Host {
                format: RawPixelFormat::Other(name),
                planes: Vec::new(),
            },
        };

        RawVideoFrame {
            width,
            height,
            pts,
            payload,
        }
    }
}

impl Decoder for SyntheticVideoDecoder {
    fn name(&self) -> &str {
        SOFTWARE_DECODER
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ContainerError> {
        // Like libavcodec, input after end of stream needs a flush first
        if self.draining {
            return Err(ContainerError::InvalidData(
                "packet sent after end of stream".to_string(),
            ));
        }
        if self.pending.len() > self.config.decoder_delay {
            return Err(ContainerError::Again);
        }
        let Some(header) = packet.data.get(..4) else {
            return Err(ContainerError::InvalidData("truncated video packet".to_string()));
        };
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(header);
        let index = u32::from_le_bytes(bytes);

        if packet.data.get(4).copied().unwrap_or(0) != 0 {
            return Err(ContainerError::InvalidData(format!(
                "corrupt slice in frame {index}"
            )));
        }
        if self.need_keyframe {
            if !packet.is_keyframe {
                tracing::trace!("SyntheticVideoDecoder: skipping non-key frame {index}");
                return Ok(());
            }
            self.need_keyframe = false;
        }
        if !self.config.decode_cost.is_zero() {
            thread::sleep(self.config.decode_cost);
        }
        let frame = self.picture(index, packet.pts);
        self.pending.push_back(frame);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), ContainerError> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, ContainerError> {
        if self.draining || self.pending.len() > self.config.decoder_delay {
            return Ok(self.pending.pop_front().map(DecodedFrame::Video));
        }
        Ok(None)
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
        self.need_keyframe = true;
    }
}

struct SyntheticAudioDecoder {
    config: Arc<SyntheticConfig>,
    pending: VecDeque<RawAudioFrame>,
}

impl SyntheticAudioDecoder {
    fn new(config: Arc<SyntheticConfig>) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
        }
    }
}

impl Decoder for SyntheticAudioDecoder {
    fn name(&self) -> &str {
        SOFTWARE_DECODER
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ContainerError> {
        let Some(audio) = self.config.audio.as_ref() else {
            return Err(ContainerError::InvalidData("no audio configured".to_string()));
        };
        if packet.data.len() < 12 {
            return Err(ContainerError::InvalidData("truncated audio packet".to_string()));
        }
        let mut first = [0u8; 8];
        first.copy_from_slice(&packet.data[..8]);
        let mut count = [0u8; 4];
        count.copy_from_slice(&packet.data[8..12]);
        let first = u64::from_le_bytes(first) as usize;
        let frames = u32::from_le_bytes(count) as usize;

        let samples = match &audio.layout {
            SyntheticSampleLayout::Planar => AudioSamples::PlanarF32(
                (0..audio.channels)
                    .map(|ch| {
                        (first..first + frames)
                            .map(|f| SyntheticConfig::sample_for(f, ch))
                            .collect()
                    })
                    .collect(),
            ),
            SyntheticSampleLayout::Interleaved => AudioSamples::InterleavedF32(
                (first..first + frames)
                    .flat_map(|f| {
                        (0..audio.channels).map(move |ch| SyntheticConfig::sample_for(f, ch))
                    })
                    .collect(),
            ),
            SyntheticSampleLayout::Other(name) => AudioSamples::Other(name.clone()),
        };

        self.pending.push_back(RawAudioFrame {
            pts: packet.pts,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            frames,
            samples,
        });
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), ContainerError> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, ContainerError> {
        Ok(self.pending.pop_front().map(DecodedFrame::Audio))
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}
