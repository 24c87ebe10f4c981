//! Background demux/decode loop.
//!
//! The worker reads packets, routes them to the selected video or audio
//! decoder, converts pictures into [`FrameInfo`]s pushed onto the bounded
//! [`FrameQueue`] and writes audio into the [`AudioRing`]. Backpressure from
//! the queue paces the whole loop at presentation speed.
//!
//! Stop is observed at every loop head and at every queue wait, since
//! closing the queue wakes a blocked push. Seeks are picked up from the
//! queue at the loop head.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::audio_ring::AudioRing;
use crate::config::PlaybackConfig;
use crate::container::{AudioSamples, ContainerError, DecodedFrame, Packet, RawAudioFrame};
use crate::controller::SharedState;
use crate::convert::{frame_to_info, Conversion};
use crate::error::PipelineError;
use crate::frame::FrameInfo;
use crate::frame_queue::{FrameQueue, PushOutcome};
use crate::hw_transfer::HardwareTransfer;
use crate::session::StreamSession;

/// How the worker exited.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    /// The stream ended and the end-of-stream marker was queued
    EndOfStream,
    /// Stop was requested
    Stopped,
    /// An unrecoverable error terminated decoding
    Failed(PipelineError),
}

/// Notifications from the decode thread to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A seek could not be honored; decoding continued from the current position
    SeekFailed(PipelineError),
    /// Decoding hit an unsupported format and stopped
    Fatal(PipelineError),
    /// The thread is about to exit
    Finished(WorkerExit),
}

/// Shared handles the worker runs against.
pub(crate) struct WorkerContext {
    pub queue: Arc<FrameQueue>,
    /// Absent when there is no audio stream or no audio engine
    pub ring: Option<Arc<AudioRing>>,
    pub state: Arc<SharedState>,
    pub events: Sender<WorkerEvent>,
    pub transfers: HardwareTransfer,
    pub config: PlaybackConfig,
}

/// Spawns the decode thread. The session is handed back when it is joined.
pub(crate) fn spawn(
    session: StreamSession,
    context: WorkerContext,
) -> Result<JoinHandle<StreamSession>, PipelineError> {
    thread::Builder::new()
        .name("avsync-decode".into())
        .spawn(move || {
            let mut session = session;
            let exit = DecodeWorker::new(&mut session, &context).run();
            match &exit {
                WorkerExit::Failed(e) => {
                    tracing::error!("Decode thread terminated: {e}");
                    context.queue.close();
                    let _ = context.events.send(WorkerEvent::Fatal(e.clone()));
                }
                WorkerExit::EndOfStream => tracing::debug!("Decode thread reached end of stream"),
                WorkerExit::Stopped => tracing::debug!("Decode thread stopped"),
            }
            let _ = context.events.send(WorkerEvent::Finished(exit));
            session
        })
        .map_err(|e| PipelineError::Thread(format!("Failed to spawn decode thread: {e}")))
}

/// Poll interval while audio alone paces decoding.
const RING_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Whether the loop should keep going after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

/// How a wait on the audio ring ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingWait {
    Ready,
    SeekPending,
    Closed,
}

struct DecodeWorker<'a> {
    session: &'a mut StreamSession,
    ctx: &'a WorkerContext,
    /// Pictures earlier than this are dropped after a seek
    video_skip_before: Option<f64>,
    /// Audio ending before this is dropped after a seek
    audio_skip_before: Option<f64>,
    /// Reused for pictures that carry no timestamp
    last_video_pts: f64,
}

impl<'a> DecodeWorker<'a> {
    fn new(session: &'a mut StreamSession, ctx: &'a WorkerContext) -> Self {
        Self {
            session,
            ctx,
            video_skip_before: None,
            audio_skip_before: None,
            last_video_pts: 0.0,
        }
    }

    fn stop_requested(&self) -> bool {
        self.ctx.state.is_stopped() || self.ctx.queue.is_closed()
    }

    /// Without a video stream the frame queue never fills, so the audio
    /// ring's free space is the only backpressure.
    fn audio_paced(&self) -> bool {
        self.session.video.is_none()
    }

    /// Sleeps until `ready` holds, giving up on stop or a pending seek.
    fn wait_for_ring(&self, ready: impl Fn() -> bool) -> RingWait {
        loop {
            if ready() {
                return RingWait::Ready;
            }
            if self.stop_requested() {
                return RingWait::Closed;
            }
            if self.ctx.queue.has_pending_seek() {
                return RingWait::SeekPending;
            }
            thread::sleep(RING_POLL_INTERVAL);
        }
    }

    fn run(&mut self) -> WorkerExit {
        loop {
            if self.stop_requested() {
                return WorkerExit::Stopped;
            }
            if let Some(target) = self.ctx.queue.take_pending_seek() {
                self.seek(target);
            }

            let packet = match self.session.container.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => match self.finish_stream() {
                    Some(exit) => return exit,
                    None => continue,
                },
                Err(e) if e.is_transient() => {
                    tracing::trace!("Packet read not ready, retrying");
                    thread::sleep(self.ctx.config.read_retry_backoff);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Packet read failed, treating as end of stream: {e}");
                    match self.finish_stream() {
                        Some(exit) => return exit,
                        None => continue,
                    }
                }
            };

            let step = if self.is_video(&packet) {
                self.decode_video(&packet)
            } else if self.is_audio(&packet) {
                self.decode_audio(&packet)
            } else {
                Ok(Flow::Continue)
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Closed) => return WorkerExit::Stopped,
                Err(e) => return WorkerExit::Failed(e),
            }
        }
    }

    fn is_video(&self, packet: &Packet) -> bool {
        self.session
            .video
            .as_ref()
            .is_some_and(|s| s.index == packet.stream_index)
    }

    fn is_audio(&self, packet: &Packet) -> bool {
        self.session
            .audio
            .as_ref()
            .is_some_and(|s| s.index == packet.stream_index)
    }

    fn seek(&mut self, target: f64) {
        tracing::debug!("Decode thread seeking to {target:.3}s");
        if let Err(e) = self.session.seek(target) {
            tracing::warn!("Seek to {target:.3}s failed, continuing from current position: {e}");
            let _ = self.ctx.events.send(WorkerEvent::SeekFailed(e));
        }
        if let Some(ring) = &self.ctx.ring {
            ring.flush();
        }
        let tolerance = self.ctx.config.seek_tolerance.as_secs_f64();
        self.video_skip_before = Some(target - tolerance);
        self.audio_skip_before = Some(target);
        self.last_video_pts = target.max(0.0);
    }

    /// Drains both decoders and queues the end-of-stream marker.
    ///
    /// Returns None when a seek arrived meanwhile and reading should resume.
    fn finish_stream(&mut self) -> Option<WorkerExit> {
        tracing::debug!("End of input, draining decoders");
        if let Some(video) = self.session.video.as_mut() {
            if let Err(e) = video.decoder.send_eof() {
                tracing::warn!("Video decoder rejected end of stream: {e}");
            }
            match self.drain_video() {
                Ok((Flow::Closed, _)) => return Some(WorkerExit::Stopped),
                Ok((Flow::Continue, _)) => {}
                Err(e) => return Some(WorkerExit::Failed(e)),
            }
        }
        if let Some(ring) = self.ctx.ring.clone() {
            if let Some(audio) = self.session.audio.as_mut() {
                if let Err(e) = audio.decoder.send_eof() {
                    tracing::warn!("Audio decoder rejected end of stream: {e}");
                }
                match self.drain_audio(&ring) {
                    Ok(Flow::Closed) => return Some(WorkerExit::Stopped),
                    Ok(Flow::Continue) => {}
                    Err(e) => return Some(WorkerExit::Failed(e)),
                }
                // The marker stops playback, so audio-only streams hold it
                // back until the mixer has played out the ring
                if self.audio_paced() {
                    match self.wait_for_ring(|| ring.ready_frames() == 0) {
                        RingWait::Ready => {}
                        RingWait::SeekPending => return None,
                        RingWait::Closed => return Some(WorkerExit::Stopped),
                    }
                }
            }
        }

        match self.ctx.queue.push(FrameInfo::end_of_stream()) {
            PushOutcome::Queued => Some(WorkerExit::EndOfStream),
            PushOutcome::Closed => Some(WorkerExit::Stopped),
            PushOutcome::SeekPending => None,
        }
    }

    fn decode_video(&mut self, packet: &Packet) -> Result<Flow, PipelineError> {
        loop {
            let Some(video) = self.session.video.as_mut() else {
                return Ok(Flow::Continue);
            };
            match video.decoder.send_packet(packet) {
                Ok(()) => break,
                Err(ContainerError::Again) => {
                    // Decoder is full: take its output, then resubmit
                    let (flow, drained) = self.drain_video()?;
                    if flow == Flow::Closed || self.ctx.queue.has_pending_seek() {
                        return Ok(flow);
                    }
                    if drained == 0 {
                        tracing::warn!("Video decoder stalled, dropping packet");
                        return Ok(Flow::Continue);
                    }
                }
                Err(e) => {
                    let err = PipelineError::from(e);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    tracing::warn!("Skipping video packet: {err}");
                    return Ok(Flow::Continue);
                }
            }
        }
        self.drain_video().map(|(flow, _)| flow)
    }

    /// Receives every picture the video decoder is willing to emit.
    ///
    /// Returns the flow and the number of pictures received.
    fn drain_video(&mut self) -> Result<(Flow, usize), PipelineError> {
        let mut received = 0;
        loop {
            let Some(video) = self.session.video.as_mut() else {
                return Ok((Flow::Continue, received));
            };
            let time_base = video.time_base;
            let frame = match video.decoder.receive_frame() {
                Ok(Some(DecodedFrame::Video(frame))) => frame,
                Ok(Some(DecodedFrame::Audio(_))) => continue,
                Ok(None) | Err(ContainerError::Again) => return Ok((Flow::Continue, received)),
                Err(e) => {
                    tracing::warn!("Skipping undecodable video frame: {e}");
                    return Ok((Flow::Continue, received));
                }
            };
            received += 1;

            // Negative times are reserved for the end-of-stream marker
            let pts = frame
                .pts
                .map_or(self.last_video_pts, |pts| time_base.to_seconds(pts))
                .max(0.0);
            self.last_video_pts = pts;

            if let Some(skip_before) = self.video_skip_before {
                if pts < skip_before {
                    tracing::trace!("Dropping pre-seek picture at {pts:.3}s");
                    continue;
                }
                self.video_skip_before = None;
            }

            let info = match frame_to_info(frame, pts, &self.ctx.transfers)? {
                Conversion::Frame(info) => info,
                Conversion::Discarded(e) => {
                    tracing::warn!("Discarding picture at {pts:.3}s: {e}");
                    continue;
                }
            };

            match self.ctx.queue.push(info) {
                PushOutcome::Queued => {}
                PushOutcome::SeekPending => return Ok((Flow::Continue, received)),
                PushOutcome::Closed => return Ok((Flow::Closed, received)),
            }
        }
    }

    fn decode_audio(&mut self, packet: &Packet) -> Result<Flow, PipelineError> {
        // Without an engine nothing pulls audio, so it is not decoded
        let Some(ring) = self.ctx.ring.clone() else {
            return Ok(Flow::Continue);
        };
        let Some(audio) = self.session.audio.as_mut() else {
            return Ok(Flow::Continue);
        };

        let mut sent = audio.decoder.send_packet(packet);
        if matches!(sent, Err(ContainerError::Again)) {
            if self.drain_audio(&ring)? == Flow::Closed {
                return Ok(Flow::Closed);
            }
            if let Some(audio) = self.session.audio.as_mut() {
                sent = audio.decoder.send_packet(packet);
            }
        }
        if let Err(e) = sent {
            let err = PipelineError::from(e);
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!("Skipping audio packet: {err}");
            return Ok(Flow::Continue);
        }

        self.drain_audio(&ring)
    }

    fn drain_audio(&mut self, ring: &AudioRing) -> Result<Flow, PipelineError> {
        loop {
            let Some(audio) = self.session.audio.as_mut() else {
                return Ok(Flow::Continue);
            };
            let time_base = audio.time_base;
            match audio.decoder.receive_frame() {
                Ok(Some(DecodedFrame::Audio(frame))) => {
                    let start = frame.pts.map(|pts| time_base.to_seconds(pts));
                    if self.write_audio(ring, frame, start)? == Flow::Closed {
                        return Ok(Flow::Closed);
                    }
                }
                Ok(Some(DecodedFrame::Video(_))) => {}
                Ok(None) | Err(ContainerError::Again) => return Ok(Flow::Continue),
                Err(e) => {
                    tracing::warn!("Skipping undecodable audio frame: {e}");
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    fn write_audio(
        &mut self,
        ring: &AudioRing,
        frame: RawAudioFrame,
        start: Option<f64>,
    ) -> Result<Flow, PipelineError> {
        if frame.channels != ring.channels() || frame.sample_rate != ring.source_rate() {
            return Err(PipelineError::FatalFormat(format!(
                "audio layout changed to {} ch @ {} Hz (ring expects {} ch @ {} Hz)",
                frame.channels,
                frame.sample_rate,
                ring.channels(),
                ring.source_rate()
            )));
        }

        if let (Some(skip_before), Some(start)) = (self.audio_skip_before, start) {
            if start + frame.duration_seconds() <= skip_before {
                tracing::trace!("Dropping pre-seek audio at {start:.3}s");
                return Ok(Flow::Continue);
            }
            self.audio_skip_before = None;
        }

        if self.audio_paced() {
            let needed = frame.frames.min(ring.capacity_frames());
            match self.wait_for_ring(|| ring.writer_space() >= needed) {
                RingWait::Ready => {}
                RingWait::SeekPending => return Ok(Flow::Continue),
                RingWait::Closed => return Ok(Flow::Closed),
            }
        }

        let written = match &frame.samples {
            AudioSamples::PlanarF32(planes) => ring.write_planar(planes, frame.frames),
            AudioSamples::InterleavedF32(samples) => ring.write_interleaved(samples),
            AudioSamples::Other(name) => {
                return Err(PipelineError::FatalFormat(format!("sample format {name}")));
            }
        };
        tracing::trace!("Wrote {written}/{} audio frames", frame.frames);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_ring::RingSetup;
    use crate::container::{DecoderPreference, StreamKind};
    use crate::controller::PlaybackState;
    use crate::synthetic::{
        SyntheticAudio, SyntheticConfig, SyntheticContainer, SyntheticPixels,
        SyntheticSampleLayout,
    };
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    struct Harness {
        queue: Arc<FrameQueue>,
        ring: Option<Arc<AudioRing>>,
        state: Arc<SharedState>,
        events: Receiver<WorkerEvent>,
        handle: JoinHandle<StreamSession>,
    }

    impl Harness {
        fn start(config: SyntheticConfig, with_ring: bool) -> Self {
            let audio = config.audio.clone();
            let Ok(session) = StreamSession::open(
                Box::new(SyntheticContainer::new(config)),
                &DecoderPreference::default(),
            ) else {
                panic!("synthetic container should open");
            };
            let queue = Arc::new(FrameQueue::new(2));
            let ring = audio.filter(|_| with_ring).map(|audio| {
                Arc::new(AudioRing::new(RingSetup {
                    channels: audio.channels,
                    source_rate: audio.sample_rate,
                    target_rate: audio.sample_rate,
                    buffering_ms: 1000,
                    min_frames: 0,
                }))
            });
            let state = Arc::new(SharedState::new());
            state.set(PlaybackState::Playing);
            let (tx, rx) = crossbeam_channel::unbounded();
            let context = WorkerContext {
                queue: Arc::clone(&queue),
                ring: ring.clone(),
                state: Arc::clone(&state),
                events: tx,
                transfers: HardwareTransfer::default(),
                config: PlaybackConfig::default(),
            };
            let Ok(handle) = spawn(session, context) else {
                panic!("decode thread should spawn");
            };
            Self {
                queue,
                ring,
                state,
                events: rx,
                handle,
            }
        }

        fn pop(&self) -> FrameInfo {
            let Some(frame) = self.queue.pop_timeout(Duration::from_secs(5)) else {
                panic!("no frame within 5s");
            };
            frame
        }

        fn stop(self) -> (StreamSession, Vec<WorkerEvent>) {
            let state = Arc::clone(&self.state);
            self.queue
                .close_with(|| state.set(PlaybackState::Stopped));
            let session = self.handle.join().expect("decode thread panicked");
            (session, self.events.try_iter().collect())
        }
    }

    #[test]
    fn test_frames_arrive_in_order_until_end_of_stream() {
        let harness = Harness::start(SyntheticConfig::new(Duration::from_millis(500)), false);
        let mut times = Vec::new();
        loop {
            let frame = harness.pop();
            if frame.is_end_of_stream() {
                break;
            }
            assert!(harness.queue.len() <= 2);
            times.push(frame.pts());
        }
        assert_eq!(times.len(), 15);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));

        let (_, events) = harness.stop();
        assert!(events.contains(&WorkerEvent::Finished(WorkerExit::EndOfStream)));
    }

    #[test]
    fn test_stop_wakes_blocked_producer() {
        let harness = Harness::start(SyntheticConfig::new(Duration::from_secs(10)), false);
        while !harness.queue.is_full() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let (_, events) = harness.stop();
        assert!(events.contains(&WorkerEvent::Finished(WorkerExit::Stopped)));
    }

    #[test]
    fn test_audio_only_waits_for_ring_space_and_playout() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(3)).without_video(),
            true,
        );
        let Some(ring) = harness.ring.clone() else {
            panic!("audio ring expected");
        };
        while ring.writer_space() >= 1024 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.metrics().dropped_frames, 0);
        assert!(harness.queue.is_empty(), "marker held while audio is buffered");
        assert!(harness.events.try_recv().is_err());

        let mut buffer = vec![crate::audio::StereoFrame::SILENCE; 4096];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let end = loop {
            ring.mix(&mut buffer);
            if let Some(frame) = harness.queue.try_pop() {
                break frame;
            }
            assert!(std::time::Instant::now() < deadline, "marker missing after playout");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(end.is_end_of_stream());
        assert_eq!(ring.metrics().total_written, 3 * 48000);
        assert_eq!(ring.ready_frames(), 0);

        let (_, events) = harness.stop();
        assert!(events.contains(&WorkerEvent::Finished(WorkerExit::EndOfStream)));
    }

    #[test]
    fn test_stop_releases_audio_paced_worker() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(10)).without_video(),
            true,
        );
        let Some(ring) = harness.ring.clone() else {
            panic!("audio ring expected");
        };
        while ring.writer_space() >= 1024 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let (_, events) = harness.stop();
        assert!(events.contains(&WorkerEvent::Finished(WorkerExit::Stopped)));
    }

    #[test]
    fn test_seek_drops_pre_seek_pictures() {
        let harness = Harness::start(SyntheticConfig::new(Duration::from_secs(10)), true);
        let _ = harness.pop();
        harness.queue.clear_and_seek(5.3);

        let first = harness.pop();
        assert!(first.pts() >= 5.3 - 0.001, "got {}", first.pts());
        assert!(first.pts() < 5.3 + 1.0 / 30.0);
        let _ = harness.stop();
    }

    #[test]
    fn test_failed_seek_is_reported_and_decoding_continues() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(2))
                .with_rejected_seeks(vec![StreamKind::Audio, StreamKind::Video]),
            false,
        );
        let _ = harness.pop();
        harness.queue.clear_and_seek(1.0);
        let frame = harness.pop();
        assert!(frame.pts() >= 1.0 - 0.001);

        let (_, events) = harness.stop();
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::SeekFailed(PipelineError::SeekFailed(_)))));
    }

    #[test]
    fn test_transient_errors_are_absorbed() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_millis(500))
                .with_transient_reads(4)
                .with_corrupt_frames(vec![3, 7])
                .with_decoder_delay(2),
            false,
        );
        let mut count = 0;
        while !harness.pop().is_end_of_stream() {
            count += 1;
        }
        assert_eq!(count, 13, "two corrupt frames skipped, delayed frames drained");
        let _ = harness.stop();
    }

    #[test]
    fn test_unsupported_pixel_format_is_fatal() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(2))
                .with_pixel_switch(4, SyntheticPixels::Other("yuv444p10le".to_string())),
            false,
        );
        for _ in 0..4 {
            assert!(!harness.pop().is_end_of_stream());
        }
        let Ok(WorkerEvent::Fatal(err)) = harness.events.recv_timeout(Duration::from_secs(5))
        else {
            panic!("expected a fatal event");
        };
        assert!(matches!(err, PipelineError::FatalFormat(_)));
        assert!(harness.queue.is_closed());
        let _ = harness.stop();
    }

    #[test]
    fn test_unsupported_sample_format_is_fatal() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(2)).with_audio(Some(SyntheticAudio {
                layout: SyntheticSampleLayout::Other("s24p".to_string()),
                ..SyntheticAudio::default()
            })),
            true,
        );
        let Ok(WorkerEvent::Fatal(PipelineError::FatalFormat(msg))) =
            harness.events.recv_timeout(Duration::from_secs(5))
        else {
            panic!("expected a fatal format event");
        };
        assert!(msg.contains("s24p"));
        let _ = harness.stop();
    }

    #[test]
    fn test_audio_reaches_ring() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_secs(1)).with_audio(Some(SyntheticAudio {
                layout: SyntheticSampleLayout::Interleaved,
                ..SyntheticAudio::default()
            })),
            true,
        );
        while !harness.pop().is_end_of_stream() {}
        let Some(ring) = harness.ring.clone() else {
            panic!("ring expected");
        };
        assert_eq!(ring.metrics().total_written, 48_000);
        let _ = harness.stop();
    }

    #[test]
    fn test_hardware_frames_are_transferred() {
        let harness = Harness::start(
            SyntheticConfig::new(Duration::from_millis(200))
                .with_pixels(SyntheticPixels::Surface(crate::hw_transfer::SurfaceKind::D3d11)),
            false,
        );
        let frame = harness.pop();
        assert_eq!(frame.format(), Some(crate::frame::PixelFormat::Nv12));
        let _ = harness.stop();
    }
}
