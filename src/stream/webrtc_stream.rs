//! Stream fed by a WHIP peer connection

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::{StatefulStream, StreamError};
use crate::media::pipeline::{pipe_track, split_inputs};
use crate::media::rtp_track::RtpTrackDemuxerReader;
use crate::media::DemuxerReader;
use crate::pipe::{byte_pipe, PipeCloser, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
use crate::processor::{FfmpegHlsProcessor, HlsSettings, MediaProcessor, ProcessorKind};
use crate::web::hls_router::{HlsRouter, RouteId};
use crate::webrtc::track::TrackCodec;

/// Builds the stream for a new WHIP session
pub type StreamAllocator =
    Arc<dyn Fn() -> Result<WebrtcStatefulStream, StreamError> + Send + Sync>;

/// Allocator producing streams with one ffmpeg HLS processor each
pub fn hls_allocator(settings: HlsSettings, router: Arc<HlsRouter>) -> StreamAllocator {
    Arc::new(move || {
        if find_program(&settings.ffmpeg_path).is_none() {
            return Err(StreamError::Allocation(format!(
                "transcoder {} not found",
                settings.ffmpeg_path
            )));
        }
        let processor: Arc<dyn MediaProcessor> =
            Arc::new(FfmpegHlsProcessor::new(settings.clone()));
        Ok(WebrtcStatefulStream::new(vec![processor], Some(router.clone())))
    })
}

/// Resolve a program name the way a shell would
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

pub struct WebrtcStatefulStream {
    id: Uuid,
    audio: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    video: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    /// Writing ends, taken by the first track of each kind
    audio_writer: Mutex<Option<PipeWriter>>,
    video_writer: Mutex<Option<PipeWriter>>,
    /// (video, audio) reading ends, taken by `ingest`
    readers: Mutex<Option<(PipeReader, PipeReader)>>,
    closers: [PipeCloser; 2],
    processors: Vec<Arc<dyn MediaProcessor>>,
    hls_router: Option<Arc<HlsRouter>>,
    routes: Mutex<Vec<RouteId>>,
    closed: CancellationToken,
    destroyed: AtomicBool,
}

impl WebrtcStatefulStream {
    pub fn new(processors: Vec<Arc<dyn MediaProcessor>>, hls_router: Option<Arc<HlsRouter>>) -> Self {
        let (video_writer, video_reader, video_closer) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (audio_writer, audio_reader, audio_closer) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            audio: RwLock::new(None),
            video: RwLock::new(None),
            audio_writer: Mutex::new(Some(audio_writer)),
            video_writer: Mutex::new(Some(video_writer)),
            readers: Mutex::new(Some((video_reader, audio_reader))),
            closers: [video_closer, audio_closer],
            processors,
            hls_router,
            routes: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.audio.read().clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.video.read().clone()
    }

    pub fn set_audio_track(&self, track: Arc<TrackLocalStaticRTP>) {
        *self.audio.write() = Some(track);
    }

    pub fn set_video_track(&self, track: Arc<TrackLocalStaticRTP>) {
        *self.video.write() = Some(track);
    }

    /// Published tracks, audio first
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.audio_track()
            .into_iter()
            .chain(self.video_track())
            .collect()
    }

    /// Fires when the stream is destroyed
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn pipe_opus_remote_track(&self, cancel: CancellationToken, track: Arc<TrackRemote>) {
        self.pipe_opus(cancel, Box::new(RtpTrackDemuxerReader::new(track)))
            .await
    }

    pub async fn pipe_vp8_remote_track(&self, cancel: CancellationToken, track: Arc<TrackRemote>) {
        self.pipe_vp8(cancel, Box::new(RtpTrackDemuxerReader::new(track)))
            .await
    }

    pub async fn pipe_h264_remote_track(&self, cancel: CancellationToken, track: Arc<TrackRemote>) {
        self.pipe_h264(cancel, Box::new(RtpTrackDemuxerReader::new(track)))
            .await
    }

    /// Republish Opus RTP and mux it into WebM on the audio pipe
    pub async fn pipe_opus(&self, cancel: CancellationToken, source: Box<dyn DemuxerReader>) {
        let target = self.audio_writer.lock().take();
        self.pipe(TrackCodec::Opus, cancel, source, self.audio_track(), target)
            .await
    }

    /// Republish VP8 RTP and mux it into WebM on the video pipe
    pub async fn pipe_vp8(&self, cancel: CancellationToken, source: Box<dyn DemuxerReader>) {
        let target = self.video_writer.lock().take();
        self.pipe(TrackCodec::Vp8, cancel, source, self.video_track(), target)
            .await
    }

    /// Republish H.264 RTP and write it as Annex-B on the video pipe
    pub async fn pipe_h264(&self, cancel: CancellationToken, source: Box<dyn DemuxerReader>) {
        let target = self.video_writer.lock().take();
        self.pipe(TrackCodec::H264, cancel, source, self.video_track(), target)
            .await
    }

    async fn pipe(
        &self,
        codec: TrackCodec,
        cancel: CancellationToken,
        source: Box<dyn DemuxerReader>,
        local: Option<Arc<TrackLocalStaticRTP>>,
        target: Option<PipeWriter>,
    ) {
        let cancel = self.link(&cancel);
        let label = format!("{:?}-{}", codec, self.id).to_lowercase();
        pipe_track(codec, &label, cancel, source, local, target).await;
    }

    /// Child of `parent` that is also cancelled when the stream is destroyed
    fn link(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let linked = token.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        token
    }

    fn unregister_routes(&self) {
        let routes = std::mem::take(&mut *self.routes.lock());
        if let Some(router) = &self.hls_router {
            for id in routes {
                router.unregister(id);
            }
        }
    }
}

#[async_trait]
impl StatefulStream for WebrtcStatefulStream {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn ingest(&self, cancel: CancellationToken) {
        let session = self.link(&cancel);
        let Some((video, audio)) = self.readers.lock().take() else {
            tracing::warn!("[{}] Stream is already ingesting or destroyed", self.id);
            return;
        };
        tracing::info!(
            "[{}] Ingestion started with {} processor(s)",
            self.id,
            self.processors.len()
        );

        let inputs = split_inputs(self.processors.len(), video, audio, &session);
        let mut tasks = JoinSet::new();
        for (processor, (video, audio)) in self.processors.iter().zip(inputs) {
            if processor.kind() == ProcessorKind::Hls {
                if let Some(router) = &self.hls_router {
                    self.routes.lock().push(router.register(processor.clone()));
                }
            }

            let processor = processor.clone();
            let session = session.clone();
            let id = self.id;
            tasks.spawn(async move {
                match processor.transcode(session.clone(), video, audio).await {
                    Ok(()) => tracing::info!("[{}] {:?} processor finished", id, processor.kind()),
                    Err(e) => {
                        tracing::error!("[{}] {:?} processor failed: {}", id, processor.kind(), e)
                    }
                }
                // A processor that stops ends the session
                session.cancel();
            });
        }

        session.cancelled().await;
        while tasks.join_next().await.is_some() {}
        self.unregister_routes();
        tracing::info!("[{}] Ingestion process stopped", self.id);
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[{}] Destroying stream", self.id);
        self.closed.cancel();

        self.unregister_routes();
        for processor in self.processors.iter().rev() {
            processor.destroy();
        }
        for closer in &self.closers {
            closer.close();
        }
        drop(self.video_writer.lock().take());
        drop(self.audio_writer.lock().take());
        drop(self.readers.lock().take());
        drop(self.video.write().take());
        drop(self.audio.write().take());
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn as_webrtc(&self) -> Option<&WebrtcStatefulStream> {
        Some(self)
    }
}
