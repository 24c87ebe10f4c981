//! Container and codec collaborator seam.
//!
//! The pipeline does not detect or parse containers itself. It drives any
//! [`Container`] implementation: the deterministic
//! [`SyntheticContainer`](crate::synthetic::SyntheticContainer) used by tests
//! and the demo, or `FfmpegContainer` behind the `ffmpeg` feature.

use crate::hw_transfer::HardwareSurface;

/// Errors reported by a container or decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerError {
    /// Temporarily unable to make progress; retry the same call
    Again,
    /// Corrupt or undecodable input for one packet or frame
    InvalidData(String),
    /// Layout with no conversion path
    Unsupported(String),
    /// No decoder available for a stream
    DecoderNotFound(String),
    /// Seek could not be performed on the requested stream
    SeekRejected(String),
    /// Byte source failure
    Io(String),
}

impl ContainerError {
    /// Returns true if the failed call may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ContainerError::Again)
    }
}

impl std::fmt::Display for ContainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerError::Again => write!(f, "Resource temporarily unavailable"),
            ContainerError::InvalidData(msg) => write!(f, "Invalid data: {msg}"),
            ContainerError::Unsupported(msg) => write!(f, "Unsupported: {msg}"),
            ContainerError::DecoderNotFound(msg) => write!(f, "Decoder not found: {msg}"),
            ContainerError::SeekRejected(msg) => write!(f, "Seek rejected: {msg}"),
            ContainerError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ContainerError {}

/// Rational unit in which a stream's timestamps are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROSECONDS: TimeBase = TimeBase::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Converts a timestamp in this time base to seconds.
    pub fn to_seconds(self, pts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        pts as f64 * f64::from(self.num) / f64::from(self.den)
    }

    /// Converts seconds to a timestamp in this time base (truncating).
    pub fn from_seconds(self, seconds: f64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (seconds * f64::from(self.den) / f64::from(self.num)) as i64
    }
}

/// Media type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Static description of one stream in a container.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    /// Codec identifier name (e.g. "h264", "aac")
    pub codec_id: String,
    /// Duration in `time_base` units, if known
    pub duration: Option<i64>,
    /// Audio only: source sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Audio only: channel count
    pub channels: Option<usize>,
}

impl StreamInfo {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(|d| self.time_base.to_seconds(d))
    }
}

/// A decoder implementation available for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    /// Decoder name (e.g. "h264", "h264_cuvid")
    pub name: String,
    /// Hardware device types the decoder can use, lowercase (e.g. "videotoolbox")
    pub hw_configs: Vec<String>,
}

/// Which decoder to open for a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderPreference {
    /// Decoder name; the container's default decoder when None
    pub codec: Option<String>,
    /// Hardware device type to try; software decode when None or unavailable
    pub hw_device: Option<String>,
}

/// One undecoded chunk of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp in the stream's time base
    pub pts: Option<i64>,
    /// Decode timestamp in the stream's time base
    pub dts: Option<i64>,
    /// Duration in the stream's time base, 0 when unknown
    pub duration: i64,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
    pub side_data: Vec<PacketSideData>,
}

/// Side data kinds that change how a packet decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideDataKind {
    /// Replacement codec extradata (in-band parameter sets)
    NewExtradata,
    /// Mid-stream sample rate, channel or dimension change
    ParamChange,
    Palette,
    /// Encoder delay and padding to trim from decoded audio
    SkipSamples,
    DisplayMatrix,
}

/// Out-of-band data attached to a packet by the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSideData {
    pub kind: SideDataKind,
    pub data: Vec<u8>,
}

/// Host-memory pixel layouts a decoder can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPixelFormat {
    Yuv420p,
    Nv12,
    /// Anything else, by name
    Other(String),
}

impl RawPixelFormat {
    pub fn name(&self) -> &str {
        match self {
            RawPixelFormat::Yuv420p => "yuv420p",
            RawPixelFormat::Nv12 => "nv12",
            RawPixelFormat::Other(name) => name,
        }
    }
}

/// One plane as emitted by a decoder, possibly with row padding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPlane {
    pub data: Vec<u8>,
    /// Bytes per row including padding
    pub stride: usize,
}

/// Where a decoded picture lives.
pub enum VideoPayload {
    /// Planes in host memory
    Host {
        format: RawPixelFormat,
        planes: Vec<RawPlane>,
    },
    /// A device surface that must be transferred before use
    Surface(Box<dyn HardwareSurface>),
}

impl std::fmt::Debug for VideoPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoPayload::Host { format, planes } => f
                .debug_struct("Host")
                .field("format", format)
                .field("planes", &planes.len())
                .finish(),
            VideoPayload::Surface(surface) => {
                f.debug_tuple("Surface").field(&surface.kind()).finish()
            }
        }
    }
}

/// A decoded picture before conversion to a [`FrameInfo`](crate::frame::FrameInfo).
#[derive(Debug)]
pub struct RawVideoFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in the stream's time base
    pub pts: Option<i64>,
    pub payload: VideoPayload,
}

/// Decoded audio sample layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSamples {
    /// One `f32` buffer per channel (FLTP)
    PlanarF32(Vec<Vec<f32>>),
    /// Interleaved `f32` (FLT)
    InterleavedF32(Vec<f32>),
    /// Any other sample format, by name
    Other(String),
}

/// A decoded block of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudioFrame {
    /// Presentation timestamp in the stream's time base
    pub pts: Option<i64>,
    pub sample_rate: u32,
    pub channels: usize,
    /// Frames (samples per channel) in this block
    pub frames: usize,
    pub samples: AudioSamples,
}

impl RawAudioFrame {
    pub fn duration_seconds(&self) -> f64 {
        self.frames as f64 / f64::from(self.sample_rate.max(1))
    }
}

/// Output of [`Decoder::receive_frame`].
#[derive(Debug)]
pub enum DecodedFrame {
    Video(RawVideoFrame),
    Audio(RawAudioFrame),
}

/// Per-stream decoder. Emits 0..N frames per submitted packet.
pub trait Decoder: Send {
    /// Decoder implementation name.
    fn name(&self) -> &str;

    /// Submits a packet. [`ContainerError::Again`] means the decoder must be
    /// drained with [`receive_frame`](Decoder::receive_frame) before the same
    /// packet is resubmitted.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), ContainerError>;

    /// Signals end of input so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<(), ContainerError>;

    /// Takes the next decoded frame. `Ok(None)` means no frame is ready until
    /// more input arrives (or, after [`send_eof`](Decoder::send_eof), that the
    /// decoder is fully drained).
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, ContainerError>;

    /// Drops all buffered state, e.g. after a seek.
    fn flush(&mut self);
}

/// An opened, demultiplexed container.
pub trait Container: Send {
    /// Short container format name (e.g. "mov,mp4,m4a,3gp,3g2,mj2")
    fn format_name(&self) -> &str;

    /// Container duration in seconds, if known.
    fn duration(&self) -> Option<f64>;

    fn streams(&self) -> &[StreamInfo];

    /// Reads the next packet; `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>, ContainerError>;

    /// Repositions so the next packet is at or before `timestamp` on
    /// `stream_index` (backward keyframe snapping).
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), ContainerError>;

    /// Decoders able to handle `stream_index`.
    fn available_decoders(&self, stream_index: usize) -> Vec<CodecDescriptor>;

    /// Human-readable codec name of a stream (e.g. "H.264 / AVC").
    fn codec_long_name(&self, stream_index: usize) -> Option<String>;

    fn open_decoder(
        &self,
        stream_index: usize,
        preference: &DecoderPreference,
    ) -> Result<Box<dyn Decoder>, ContainerError>;
}
