//! [`Container`] backed by FFmpeg (ffmpeg-next).
//!
//! Requires the `ffmpeg` feature and FFmpeg development libraries:
//!
//! - **macOS**: `brew install ffmpeg`
//! - **Ubuntu/Debian**: `apt install libavcodec-dev libavformat-dev libavutil-dev \
//!   libswscale-dev libswresample-dev`
//! - **Windows**: Download from https://ffmpeg.org/download.html
//!
//! Containers are opened either from a path or over any [`ByteSource`]
//! through a custom AVIO context.

use std::ffi::{c_int, c_void, CStr, CString};
use std::io::SeekFrom;
use std::path::Path;
use std::ptr;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::byte_source::ByteSource;
use crate::container::{
    AudioSamples, CodecDescriptor, Container, ContainerError, DecodedFrame, Decoder,
    DecoderPreference, Packet, PacketSideData, RawAudioFrame, RawPixelFormat, RawPlane,
    RawVideoFrame, SideDataKind, StreamInfo, StreamKind, TimeBase, VideoPayload,
};
use crate::hw_transfer::{HardwareSurface, SurfaceKind};

const AVIO_BUFFER_SIZE: usize = 32 * 1024;

fn map_error(err: ffmpeg::Error) -> ContainerError {
    match err {
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => ContainerError::Again,
        ffmpeg::Error::InvalidData => ContainerError::InvalidData(err.to_string()),
        ffmpeg::Error::DecoderNotFound => ContainerError::DecoderNotFound(err.to_string()),
        other => ContainerError::InvalidData(other.to_string()),
    }
}

/// Opaque state behind the AVIO callbacks.
struct AvioSource {
    source: Box<dyn ByteSource>,
}

unsafe extern "C" fn avio_read(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let io = &mut *(opaque as *mut AvioSource);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size.max(0) as usize);
    match io.source.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) => {
            tracing::warn!("AVIO read failed: {e}");
            ffi::AVERROR_EXTERNAL
        }
    }
}

unsafe extern "C" fn avio_seek(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let io = &mut *(opaque as *mut AvioSource);
    if whence & ffi::AVSEEK_SIZE as c_int != 0 {
        return io.source.size().map_or(-1, |size| size as i64);
    }
    let pos = match whence & !(ffi::AVSEEK_FORCE as c_int) {
        0 => SeekFrom::Start(offset.max(0) as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return -1,
    };
    match io.source.seek(pos) {
        Ok(position) => position as i64,
        Err(e) => {
            tracing::warn!("AVIO seek failed: {e}");
            -1
        }
    }
}

/// Owns a custom AVIO context and the byte source behind it.
///
/// Must be dropped after the format context that reads through it.
struct CustomIo {
    avio: *mut ffi::AVIOContext,
    opaque: *mut AvioSource,
}

impl CustomIo {
    unsafe fn free(mut avio: *mut ffi::AVIOContext, opaque: *mut AvioSource) {
        if !avio.is_null() {
            // FFmpeg may have reallocated the buffer; free the current one
            ffi::av_freep(ptr::addr_of_mut!((*avio).buffer) as *mut c_void);
            ffi::avio_context_free(&mut avio);
        }
        if !opaque.is_null() {
            drop(Box::from_raw(opaque));
        }
    }
}

impl Drop for CustomIo {
    fn drop(&mut self) {
        unsafe { Self::free(self.avio, self.opaque) }
    }
}

/// Wrapper for a hardware device context buffer reference.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDeviceCtx {
    /// Creates a device context for a device type name such as "videotoolbox".
    fn create(name: &str) -> Option<Self> {
        let c_name = CString::new(name).ok()?;
        let device_type = unsafe { ffi::av_hwdevice_find_type_by_name(c_name.as_ptr()) };
        if device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            tracing::warn!("Unknown hardware device type {name}");
            return None;
        }

        let mut ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut ctx, device_type, ptr::null(), ptr::null_mut(), 0)
        };
        if ret < 0 || ctx.is_null() {
            tracing::warn!("Failed to create {name} device context, error: {ret}");
            return None;
        }
        tracing::info!("Created hardware device context {name}");
        Some(Self { ptr: ctx })
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { ffi::av_buffer_unref(&mut self.ptr) };
        }
    }
}

fn surface_kind(format: c_int) -> Option<SurfaceKind> {
    use ffi::AVPixelFormat::*;
    [
        (AV_PIX_FMT_DXVA2_VLD, SurfaceKind::Dxva2Vld),
        (AV_PIX_FMT_D3D11, SurfaceKind::D3d11),
        (AV_PIX_FMT_VIDEOTOOLBOX, SurfaceKind::VideoToolbox),
        (AV_PIX_FMT_VAAPI, SurfaceKind::Vaapi),
        (AV_PIX_FMT_CUDA, SurfaceKind::Cuda),
    ]
    .into_iter()
    .find(|(pix, _)| *pix as c_int == format)
    .map(|(_, kind)| kind)
}

fn host_planes(frame: &ffmpeg::frame::Video) -> (RawPixelFormat, Vec<RawPlane>) {
    let format = match frame.format() {
        ffmpeg::format::Pixel::YUV420P => RawPixelFormat::Yuv420p,
        ffmpeg::format::Pixel::NV12 => RawPixelFormat::Nv12,
        other => RawPixelFormat::Other(format!("{other:?}").to_lowercase()),
    };
    let planes = (0..frame.planes())
        .map(|i| RawPlane {
            data: frame.data(i).to_vec(),
            stride: frame.stride(i),
        })
        .collect();
    (format, planes)
}

fn f32_samples(bytes: &[u8], count: usize) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .take(count)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// A decoded picture still in device memory.
struct FfmpegSurface {
    frame: ffmpeg::frame::Video,
    kind: SurfaceKind,
}

// SAFETY: the frame is exclusively owned and only touched by the decode thread
// that created it.
unsafe impl Send for FfmpegSurface {}

impl HardwareSurface for FfmpegSurface {
    fn kind(&self) -> SurfaceKind {
        self.kind
    }

    fn download(&self) -> Result<(RawPixelFormat, Vec<RawPlane>), ContainerError> {
        let mut sw_frame = ffmpeg::frame::Video::empty();
        let ret = unsafe {
            ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), self.frame.as_ptr(), 0)
        };
        if ret < 0 {
            return Err(ContainerError::InvalidData(format!(
                "av_hwframe_transfer_data failed: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(host_planes(&sw_frame))
    }
}

fn side_data_type(kind: SideDataKind) -> ffi::AVPacketSideDataType {
    use ffi::AVPacketSideDataType::*;
    match kind {
        SideDataKind::NewExtradata => AV_PKT_DATA_NEW_EXTRADATA,
        SideDataKind::ParamChange => AV_PKT_DATA_PARAM_CHANGE,
        SideDataKind::Palette => AV_PKT_DATA_PALETTE,
        SideDataKind::SkipSamples => AV_PKT_DATA_SKIP_SAMPLES,
        SideDataKind::DisplayMatrix => AV_PKT_DATA_DISPLAYMATRIX,
    }
}

fn side_data_kind(kind: ffi::AVPacketSideDataType) -> Option<SideDataKind> {
    use ffi::AVPacketSideDataType::*;
    match kind {
        AV_PKT_DATA_NEW_EXTRADATA => Some(SideDataKind::NewExtradata),
        AV_PKT_DATA_PARAM_CHANGE => Some(SideDataKind::ParamChange),
        AV_PKT_DATA_PALETTE => Some(SideDataKind::Palette),
        AV_PKT_DATA_SKIP_SAMPLES => Some(SideDataKind::SkipSamples),
        AV_PKT_DATA_DISPLAYMATRIX => Some(SideDataKind::DisplayMatrix),
        _ => None,
    }
}

fn read_side_data(packet: &ffmpeg::Packet) -> Vec<PacketSideData> {
    let raw = unsafe { &*packet.as_ptr() };
    if raw.side_data.is_null() || raw.side_data_elems <= 0 {
        return Vec::new();
    }
    let entries =
        unsafe { std::slice::from_raw_parts(raw.side_data, raw.side_data_elems as usize) };
    entries
        .iter()
        .filter_map(|entry| {
            let Some(kind) = side_data_kind(entry.type_) else {
                tracing::trace!("Dropping packet side data {:?}", entry.type_);
                return None;
            };
            let data = if entry.data.is_null() || entry.size == 0 {
                Vec::new()
            } else {
                unsafe { std::slice::from_raw_parts(entry.data, entry.size as usize) }.to_vec()
            };
            Some(PacketSideData { kind, data })
        })
        .collect()
}

fn to_native_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut native = ffmpeg::Packet::copy(&packet.data);
    native.set_pts(packet.pts);
    native.set_dts(packet.dts);
    native.set_duration(packet.duration);
    native.set_stream(packet.stream_index);
    if packet.is_keyframe {
        native.set_flags(ffmpeg::packet::Flags::KEY);
    }
    for side in &packet.side_data {
        let dst = unsafe {
            ffi::av_packet_new_side_data(
                native.as_mut_ptr(),
                side_data_type(side.kind),
                side.data.len() as _,
            )
        };
        if dst.is_null() {
            tracing::warn!("Failed to attach {:?} side data", side.kind);
            continue;
        }
        unsafe { ptr::copy_nonoverlapping(side.data.as_ptr(), dst, side.data.len()) };
    }
    native
}

struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    name: String,
    // Keeps the device alive for the decoder's lifetime
    _hw_device: Option<HwDeviceCtx>,
}

// SAFETY: the decoder and its device context are exclusively owned and used by
// one thread at a time (moved into the decode thread, handed back on join).
unsafe impl Send for FfmpegVideoDecoder {}

impl Decoder for FfmpegVideoDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ContainerError> {
        self.decoder
            .send_packet(&to_native_packet(packet))
            .map_err(map_error)
    }

    fn send_eof(&mut self) -> Result<(), ContainerError> {
        self.decoder.send_eof().map_err(map_error)
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, ContainerError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(None)
            }
            Err(e) => return Err(map_error(e)),
        }

        let pts = frame.timestamp().or_else(|| frame.pts());
        let (width, height) = (frame.width(), frame.height());
        let raw_format = unsafe { (*frame.as_ptr()).format };
        let payload = match surface_kind(raw_format) {
            Some(kind) => VideoPayload::Surface(Box::new(FfmpegSurface { frame, kind })),
            None => {
                let (format, planes) = host_planes(&frame);
                VideoPayload::Host { format, planes }
            }
        };
        Ok(Some(DecodedFrame::Video(RawVideoFrame {
            width,
            height,
            pts,
            payload,
        })))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

struct FfmpegAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    name: String,
}

// SAFETY: see FfmpegVideoDecoder.
unsafe impl Send for FfmpegAudioDecoder {}

impl Decoder for FfmpegAudioDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ContainerError> {
        self.decoder
            .send_packet(&to_native_packet(packet))
            .map_err(map_error)
    }

    fn send_eof(&mut self) -> Result<(), ContainerError> {
        self.decoder.send_eof().map_err(map_error)
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, ContainerError> {
        let mut frame = ffmpeg::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(None)
            }
            Err(e) => return Err(map_error(e)),
        }

        let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels }.max(0) as usize;
        let frames = frame.samples();
        let samples = match frame.format() {
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar) => {
                AudioSamples::PlanarF32(
                    (0..channels.min(frame.planes()))
                        .map(|ch| f32_samples(frame.data(ch), frames))
                        .collect(),
                )
            }
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed) => {
                AudioSamples::InterleavedF32(f32_samples(frame.data(0), frames * channels))
            }
            other => AudioSamples::Other(format!("{other:?}").to_lowercase()),
        };

        Ok(Some(DecodedFrame::Audio(RawAudioFrame {
            pts: frame.timestamp().or_else(|| frame.pts()),
            sample_rate: frame.rate(),
            channels,
            frames,
            samples,
        })))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// A demultiplexer over an FFmpeg format context.
pub struct FfmpegContainer {
    // Declared before `io` so the format context closes first
    input: ffmpeg::format::context::Input,
    io: Option<CustomIo>,
    format_name: String,
    streams: Vec<StreamInfo>,
}

// SAFETY: the format context (and custom IO) is exclusively owned; the
// pipeline moves it into the decode thread and back, never sharing it.
unsafe impl Send for FfmpegContainer {}

impl FfmpegContainer {
    /// Opens a file or URL.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        ffmpeg::init().map_err(|e| ContainerError::Io(format!("FFmpeg init failed: {e}")))?;
        let path = path.as_ref();
        let input = ffmpeg::format::input(path)
            .map_err(|e| ContainerError::Io(format!("Failed to open {}: {e}", path.display())))?;
        Ok(Self::from_input(input, None))
    }

    /// Opens a container read through `source`.
    pub fn open_source(source: Box<dyn ByteSource>) -> Result<Self, ContainerError> {
        ffmpeg::init().map_err(|e| ContainerError::Io(format!("FFmpeg init failed: {e}")))?;

        unsafe {
            let buffer = ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                return Err(ContainerError::Io("Failed to allocate AVIO buffer".to_string()));
            }
            let opaque = Box::into_raw(Box::new(AvioSource { source }));
            let avio = ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                0,
                opaque as *mut c_void,
                Some(avio_read),
                None,
                Some(avio_seek),
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(opaque));
                return Err(ContainerError::Io("Failed to create AVIO context".to_string()));
            }
            let io = CustomIo { avio, opaque };

            let mut format_ctx = ffi::avformat_alloc_context();
            if format_ctx.is_null() {
                return Err(ContainerError::Io(
                    "Failed to allocate format context".to_string(),
                ));
            }
            (*format_ctx).pb = avio;
            (*format_ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            // Frees the format context itself on failure
            let ret = ffi::avformat_open_input(
                &mut format_ctx,
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            );
            if ret < 0 {
                return Err(ContainerError::Io(format!(
                    "Failed to open input: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let ret = ffi::avformat_find_stream_info(format_ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut format_ctx);
                return Err(ContainerError::Io(format!(
                    "Failed to find stream info: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let input = ffmpeg::format::context::Input::wrap(format_ctx);
            Ok(Self::from_input(input, Some(io)))
        }
    }

    fn from_input(input: ffmpeg::format::context::Input, io: Option<CustomIo>) -> Self {
        let streams = input
            .streams()
            .map(|stream| {
                let params = stream.parameters();
                let kind = match params.medium() {
                    ffmpeg::media::Type::Video => StreamKind::Video,
                    ffmpeg::media::Type::Audio => StreamKind::Audio,
                    ffmpeg::media::Type::Subtitle => StreamKind::Subtitle,
                    _ => StreamKind::Data,
                };
                let time_base = stream.time_base();
                let (sample_rate, channels) = if kind == StreamKind::Audio {
                    let raw = unsafe { &*params.as_ptr() };
                    (
                        u32::try_from(raw.sample_rate).ok(),
                        usize::try_from(raw.ch_layout.nb_channels).ok(),
                    )
                } else {
                    (None, None)
                };
                StreamInfo {
                    index: stream.index(),
                    kind,
                    time_base: TimeBase::new(time_base.numerator(), time_base.denominator()),
                    codec_id: params.id().name().to_string(),
                    duration: (stream.duration() > 0).then(|| stream.duration()),
                    sample_rate,
                    channels,
                }
            })
            .collect();

        let format_name = input.format().name().to_string();
        tracing::debug!("FfmpegContainer: opened {format_name}");
        Self {
            input,
            io,
            format_name,
            streams,
        }
    }

    fn codec_id(&self, stream_index: usize) -> Option<ffmpeg::codec::Id> {
        self.input
            .stream(stream_index)
            .map(|stream| stream.parameters().id())
    }

    /// Whether the container reads through a [`ByteSource`].
    pub fn uses_custom_io(&self) -> bool {
        self.io.is_some()
    }
}

impl Container for FfmpegContainer {
    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn duration(&self) -> Option<f64> {
        let duration = self.input.duration();
        (duration > 0).then(|| duration as f64 / f64::from(ffi::AV_TIME_BASE))
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, ContainerError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) => return Err(map_error(e)),
        }
        Ok(Some(Packet {
            stream_index: packet.stream(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            is_keyframe: packet.is_key(),
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            side_data: read_side_data(&packet),
        }))
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), ContainerError> {
        let index = c_int::try_from(stream_index)
            .map_err(|_| ContainerError::SeekRejected(format!("stream {stream_index}")))?;
        let ret = unsafe {
            ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                index,
                timestamp,
                ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        if ret < 0 {
            return Err(ContainerError::SeekRejected(format!(
                "av_seek_frame on stream {stream_index}: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(())
    }

    fn available_decoders(&self, stream_index: usize) -> Vec<CodecDescriptor> {
        let Some(id) = self.codec_id(stream_index) else {
            return Vec::new();
        };
        let wanted: ffi::AVCodecID = id.into();
        let mut decoders = Vec::new();
        let mut iter: *mut c_void = ptr::null_mut();
        unsafe {
            loop {
                let codec = ffi::av_codec_iterate(&mut iter);
                if codec.is_null() {
                    break;
                }
                if ffi::av_codec_is_decoder(codec) == 0 || (*codec).id != wanted {
                    continue;
                }
                let name = CStr::from_ptr((*codec).name).to_string_lossy().into_owned();
                let mut hw_configs = Vec::new();
                let mut i = 0;
                loop {
                    let config = ffi::avcodec_get_hw_config(codec, i);
                    if config.is_null() {
                        break;
                    }
                    let type_name = ffi::av_hwdevice_get_type_name((*config).device_type);
                    if !type_name.is_null() {
                        hw_configs.push(CStr::from_ptr(type_name).to_string_lossy().into_owned());
                    }
                    i += 1;
                }
                decoders.push(CodecDescriptor { name, hw_configs });
            }
        }
        decoders
    }

    fn codec_long_name(&self, stream_index: usize) -> Option<String> {
        let id = self.codec_id(stream_index)?;
        ffmpeg::decoder::find(id).map(|codec| codec.description().to_string())
    }

    fn open_decoder(
        &self,
        stream_index: usize,
        preference: &DecoderPreference,
    ) -> Result<Box<dyn Decoder>, ContainerError> {
        let Some(stream) = self.input.stream(stream_index) else {
            return Err(ContainerError::DecoderNotFound(format!("stream {stream_index}")));
        };
        let params = stream.parameters();
        let medium = params.medium();
        let mut context = ffmpeg::codec::context::Context::from_parameters(params)
            .map_err(|e| ContainerError::DecoderNotFound(format!("codec context: {e}")))?;

        let codec = match &preference.codec {
            Some(name) => Some(
                ffmpeg::decoder::find_by_name(name)
                    .ok_or_else(|| ContainerError::DecoderNotFound(name.clone()))?,
            ),
            None => None,
        };

        match medium {
            ffmpeg::media::Type::Video => {
                let hw_device = preference.hw_device.as_deref().and_then(HwDeviceCtx::create);
                if let Some(hw) = &hw_device {
                    unsafe {
                        (*context.as_mut_ptr()).hw_device_ctx = ffi::av_buffer_ref(hw.ptr);
                    }
                }
                let opened = match codec {
                    Some(codec) => context.decoder().open_as(codec),
                    None => context.decoder().open(),
                }
                .map_err(|e| ContainerError::DecoderNotFound(format!("open video decoder: {e}")))?;
                let decoder = opened
                    .video()
                    .map_err(|e| ContainerError::DecoderNotFound(format!("video decoder: {e}")))?;
                let name = decoder
                    .codec()
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::info!(
                    "FfmpegContainer: video decoder {name} ({}x{}), hw: {:?}",
                    decoder.width(),
                    decoder.height(),
                    preference.hw_device.as_deref().filter(|_| hw_device.is_some())
                );
                Ok(Box::new(FfmpegVideoDecoder {
                    decoder,
                    name,
                    _hw_device: hw_device,
                }))
            }
            ffmpeg::media::Type::Audio => {
                let opened = match codec {
                    Some(codec) => context.decoder().open_as(codec),
                    None => context.decoder().open(),
                }
                .map_err(|e| ContainerError::DecoderNotFound(format!("open audio decoder: {e}")))?;
                let decoder = opened
                    .audio()
                    .map_err(|e| ContainerError::DecoderNotFound(format!("audio decoder: {e}")))?;
                let name = decoder
                    .codec()
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(Box::new(FfmpegAudioDecoder { decoder, name }))
            }
            other => Err(ContainerError::Unsupported(format!(
                "no decoder for {other:?} stream"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::MemorySource;

    #[test]
    fn test_f32_samples_truncates_padding() {
        let bytes: Vec<u8> = [1.0f32, -0.5, 0.25, 9.0]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        assert_eq!(f32_samples(&bytes, 3), vec![1.0, -0.5, 0.25]);
    }

    #[test]
    fn test_native_packet_keeps_timing_and_side_data() {
        let packet = Packet {
            stream_index: 1,
            pts: Some(3072),
            dts: Some(2048),
            duration: 512,
            is_keyframe: true,
            data: vec![0, 0, 1, 0x65],
            side_data: vec![PacketSideData {
                kind: SideDataKind::NewExtradata,
                data: vec![0x67, 0x42],
            }],
        };
        let native = to_native_packet(&packet);
        assert_eq!(native.pts(), Some(3072));
        assert_eq!(native.dts(), Some(2048));
        assert_eq!(native.duration(), 512);
        assert_eq!(native.stream(), 1);
        assert!(native.is_key());
        assert_eq!(read_side_data(&native), packet.side_data);
    }

    #[test]
    fn test_surface_kind_lookup() {
        use ffi::AVPixelFormat::*;
        assert_eq!(surface_kind(AV_PIX_FMT_D3D11 as c_int), Some(SurfaceKind::D3d11));
        assert_eq!(
            surface_kind(AV_PIX_FMT_VIDEOTOOLBOX as c_int),
            Some(SurfaceKind::VideoToolbox)
        );
        assert_eq!(surface_kind(AV_PIX_FMT_YUV420P as c_int), None);
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => panic!("tempdir: {e}"),
        };
        assert!(matches!(
            FfmpegContainer::open_path(dir.path().join("missing.mkv")),
            Err(ContainerError::Io(_))
        ));
    }

    #[test]
    fn test_empty_source_fails_to_open() {
        let source = MemorySource::new(Vec::new());
        assert!(FfmpegContainer::open_source(Box::new(source)).is_err());
    }
}
