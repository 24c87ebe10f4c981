//! An open container with its selected streams and decoders.

use crate::container::{
    CodecDescriptor, Container, Decoder, DecoderPreference, StreamInfo, StreamKind, TimeBase,
};
use crate::error::PipelineError;

/// Read-only stream and codec metadata, captured at open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    /// Container (encapsulation) format name
    pub format_name: String,
    /// Container duration in seconds, if known
    pub duration: Option<f64>,
    pub video_streams: usize,
    pub audio_streams: usize,
    pub subtitle_streams: usize,
    /// Codec id of the selected video stream
    pub video_encoding: Option<String>,
    /// Codec id of the selected audio stream
    pub audio_encoding: Option<String>,
    /// Human readable codec name of the selected video stream
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Decoders able to decode the selected video stream
    pub video_decoders: Vec<CodecDescriptor>,
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video_encoding.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_encoding.is_some()
    }

    /// Names of the decoders able to handle the video stream.
    pub fn available_video_decoders(&self) -> Vec<&str> {
        self.video_decoders.iter().map(|d| d.name.as_str()).collect()
    }

    /// Hardware device configs supported by the named video decoder.
    pub fn video_decoder_hw_configs(&self, decoder: &str) -> Option<&[String]> {
        self.video_decoders
            .iter()
            .find(|d| d.name == decoder)
            .map(|d| d.hw_configs.as_slice())
    }
}

/// A selected stream and the decoder feeding from it.
pub(crate) struct ActiveStream {
    pub index: usize,
    pub time_base: TimeBase,
    pub decoder: Box<dyn Decoder>,
}

/// One open container.
///
/// Owned by the controller; moved into the decode thread while it runs and
/// handed back on join.
pub struct StreamSession {
    pub(crate) container: Box<dyn Container>,
    pub(crate) video: Option<ActiveStream>,
    pub(crate) audio: Option<ActiveStream>,
    info: MediaInfo,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("format", &self.info.format_name)
            .field("video", &self.video.as_ref().map(|s| s.index))
            .field("audio", &self.audio.as_ref().map(|s| s.index))
            .finish()
    }
}

/// Picks the first stream of `kind` whose decoder opens.
fn select_stream(
    container: &dyn Container,
    kind: StreamKind,
    preference: &DecoderPreference,
) -> Option<(StreamInfo, ActiveStream)> {
    for stream in container.streams().iter().filter(|s| s.kind == kind) {
        match container.open_decoder(stream.index, preference) {
            Ok(decoder) => {
                tracing::debug!(
                    "Selected {:?} stream {} ({}) with decoder {}",
                    kind,
                    stream.index,
                    stream.codec_id,
                    decoder.name()
                );
                return Some((
                    stream.clone(),
                    ActiveStream {
                        index: stream.index,
                        time_base: stream.time_base,
                        decoder,
                    },
                ));
            }
            Err(e) => {
                tracing::warn!(
                    "Could not open decoder for {:?} stream {}: {}",
                    kind,
                    stream.index,
                    e
                );
            }
        }
    }
    None
}

impl StreamSession {
    /// Selects the best video and audio streams and opens their decoders.
    ///
    /// `preference` applies to the video decoder only. Fails when neither a
    /// video nor an audio stream can be decoded.
    pub fn open(
        container: Box<dyn Container>,
        preference: &DecoderPreference,
    ) -> Result<Self, PipelineError> {
        let count =
            |kind: StreamKind| container.streams().iter().filter(|s| s.kind == kind).count();
        let (video_streams, audio_streams, subtitle_streams) = (
            count(StreamKind::Video),
            count(StreamKind::Audio),
            count(StreamKind::Subtitle),
        );

        let video = select_stream(container.as_ref(), StreamKind::Video, preference);
        let audio = select_stream(
            container.as_ref(),
            StreamKind::Audio,
            &DecoderPreference::default(),
        );
        if video.is_none() && audio.is_none() {
            return Err(PipelineError::OpenFailed(format!(
                "no decodable video or audio stream in {} container",
                container.format_name()
            )));
        }

        let info = MediaInfo {
            format_name: container.format_name().to_string(),
            duration: container.duration(),
            video_streams,
            audio_streams,
            subtitle_streams,
            video_encoding: video.as_ref().map(|(s, _)| s.codec_id.clone()),
            audio_encoding: audio.as_ref().map(|(s, _)| s.codec_id.clone()),
            video_codec: video
                .as_ref()
                .and_then(|(s, _)| container.codec_long_name(s.index)),
            audio_codec: audio
                .as_ref()
                .and_then(|(s, _)| container.codec_long_name(s.index)),
            video_decoders: video
                .as_ref()
                .map(|(s, _)| container.available_decoders(s.index))
                .unwrap_or_default(),
            sample_rate: audio.as_ref().and_then(|(s, _)| s.sample_rate),
            channels: audio.as_ref().and_then(|(s, _)| s.channels),
        };

        tracing::info!(
            "Opened {} container: {} video, {} audio, {} subtitle streams",
            info.format_name,
            video_streams,
            audio_streams,
            subtitle_streams
        );

        Ok(Self {
            container,
            video: video.map(|(_, active)| active),
            audio: audio.map(|(_, active)| active),
            info,
        })
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    /// Seeks the container backward to `target` seconds and flushes both
    /// decoders.
    ///
    /// The audio stream is tried first and the video stream second. When
    /// neither accepts the seek the read position is left unchanged, but the
    /// decoders are still flushed.
    pub(crate) fn seek(&mut self, target: f64) -> Result<(), PipelineError> {
        let candidates: Vec<(usize, TimeBase)> = [self.audio.as_ref(), self.video.as_ref()]
            .into_iter()
            .flatten()
            .map(|s| (s.index, s.time_base))
            .collect();

        // Decoders are flushed either way so a drained decoder accepts input again
        let mut last_error = None;
        for (index, time_base) in candidates {
            match self.container.seek(index, time_base.from_seconds(target)) {
                Ok(()) => {
                    self.flush_decoders();
                    tracing::debug!("Seeked to {target:.3}s on stream {index}");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Seek to {target:.3}s rejected on stream {index}: {e}");
                    last_error = Some(e);
                }
            }
        }
        self.flush_decoders();
        Err(match last_error {
            Some(e) => PipelineError::from(e),
            None => PipelineError::SeekFailed("no seekable stream".to_string()),
        })
    }

    pub(crate) fn flush_decoders(&mut self) {
        for stream in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            stream.decoder.flush();
        }
    }
}
