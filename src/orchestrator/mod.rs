//! Legacy HLS-only ingest path
//!
//! An [`Orchestrator`] accepts exactly one [`Control`] for its lifetime. On
//! [`Orchestrator::start`] it creates the local tracks and the video/audio
//! pipes, hands them to the control (which feeds them from its peer
//! connection) and runs the control's media processors on the other end.
//! Teardown goes through the orchestrator's own [`Shutdown`] registry.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::AppError;
use crate::media::pipeline::split_inputs;
use crate::pipe::{byte_pipe, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
use crate::processor::{MediaProcessor, ProcessorKind};
use crate::shutdown::Shutdown;
use crate::web::hls_router::HlsRouter;

pub mod whip_control;

pub use whip_control::WhipControl;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("control already assigned")]
    AlreadyAssigned,

    #[error("no control registered")]
    NoControl,

    #[error("orchestrator is {0:?}, cannot start")]
    InvalidState(OrchestratorState),

    #[error("control failed: {0}")]
    Control(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::AlreadyAssigned => AppError::AlreadyAssigned,
            e => AppError::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    ControlRegistered,
    Running,
    Stopped,
}

/// Writing ends handed to the control
pub struct StreamPipes {
    pub video: PipeWriter,
    pub audio: PipeWriter,
}

/// Local tracks republishing the ingest
#[derive(Clone)]
pub struct WebrtcTracks {
    pub audio: Arc<TrackLocalStaticRTP>,
    pub video: Arc<TrackLocalStaticRTP>,
}

impl WebrtcTracks {
    pub fn new(stream_id: &str) -> Self {
        let track = |mime: &str, id: &str| {
            Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                stream_id.to_owned(),
            ))
        };
        Self {
            audio: track(MIME_TYPE_OPUS, "audio"),
            video: track(MIME_TYPE_H264, "video"),
        }
    }
}

/// Source of an orchestrated stream
pub trait Control: Send + Sync {
    /// Start feeding `pipes` and `tracks`. Must not block.
    fn start_stream(&self, pipes: StreamPipes, tracks: WebrtcTracks) -> Result<(), OrchestratorError>;

    fn media_processors(&self) -> Vec<Arc<dyn MediaProcessor>>;
}

pub struct Orchestrator {
    name: String,
    shutdown: Arc<Shutdown>,
    hls_router: Arc<HlsRouter>,
    control: Mutex<Option<Arc<dyn Control>>>,
    state: Mutex<OrchestratorState>,
    tracks: RwLock<Option<WebrtcTracks>>,
    processors_done: CancellationToken,
}

impl Orchestrator {
    pub fn new(name: impl Into<String>, hls_router: Arc<HlsRouter>) -> Self {
        Self {
            name: name.into(),
            shutdown: Arc::new(Shutdown::new()),
            hls_router,
            control: Mutex::new(None),
            state: Mutex::new(OrchestratorState::Idle),
            tracks: RwLock::new(None),
            processors_done: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    /// Teardown registry of this orchestrator
    pub fn shutdown(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn tracks(&self) -> Option<WebrtcTracks> {
        self.tracks.read().clone()
    }

    /// Fires once every media processor has returned
    pub fn processors_done(&self) -> CancellationToken {
        self.processors_done.clone()
    }

    /// Assign the control. Only the first registration succeeds.
    pub fn register_control(&self, control: Arc<dyn Control>) -> Result<(), OrchestratorError> {
        let mut slot = self.control.lock();
        if slot.is_some() {
            return Err(OrchestratorError::AlreadyAssigned);
        }
        *slot = Some(control);
        *self.state.lock() = OrchestratorState::ControlRegistered;
        tracing::info!("[{}] Control registered", self.name);
        Ok(())
    }

    /// Start the control and launch the media processors.
    ///
    /// Returns once the processors are spawned.
    pub fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let control = self
            .control
            .lock()
            .clone()
            .ok_or(OrchestratorError::NoControl)?;
        {
            let mut state = self.state.lock();
            if *state != OrchestratorState::ControlRegistered {
                return Err(OrchestratorError::InvalidState(*state));
            }
            *state = OrchestratorState::Running;
        }

        let tracks = WebrtcTracks::new(&self.name);
        *self.tracks.write() = Some(tracks.clone());

        let (video_writer, video_reader, video_closer) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (audio_writer, audio_reader, audio_closer) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        self.shutdown.add_task(move || {
            video_closer.close();
            audio_closer.close();
        });

        let pipes = StreamPipes {
            video: video_writer,
            audio: audio_writer,
        };
        if let Err(e) = control.start_stream(pipes, tracks) {
            tracing::warn!("[{}] Start stream error: {}", self.name, e);
        }

        let processors = control.media_processors();
        for processor in &processors {
            let processor = processor.clone();
            self.shutdown.add_task(move || processor.destroy());
        }

        tracing::info!("[{}] Starting {} media processor(s)", self.name, processors.len());
        tokio::spawn(Arc::clone(self).run_media_processors(processors, video_reader, audio_reader));
        Ok(())
    }

    async fn run_media_processors(
        self: Arc<Self>,
        processors: Vec<Arc<dyn MediaProcessor>>,
        video: PipeReader,
        audio: PipeReader,
    ) {
        let cancel = self.shutdown.token();
        let inputs = split_inputs(processors.len(), video, audio, &cancel);

        let mut tasks = JoinSet::new();
        for (processor, (video, audio)) in processors.into_iter().zip(inputs) {
            if processor.kind() == ProcessorKind::Hls {
                let route = self.hls_router.register(processor.clone());
                let router = self.hls_router.clone();
                self.shutdown.add_task(move || {
                    router.unregister(route);
                });
            }

            let cancel = cancel.clone();
            let name = self.name.clone();
            tasks.spawn(async move {
                if let Err(e) = processor.transcode(cancel, video, audio).await {
                    tracing::error!("[{}] Error was caught in media processor: {}", name, e);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("[{}] Media processors finished", self.name);
        self.processors_done.cancel();
    }

    /// Tear everything down through the shutdown registry. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == OrchestratorState::Stopped {
                return;
            }
            *state = OrchestratorState::Stopped;
        }
        tracing::info!("[{}] Stopping orchestrator", self.name);
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::StubProcessor;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Control handing the pipes back to the test
    #[derive(Default)]
    struct TestControl {
        processors: Vec<Arc<StubProcessor>>,
        pipes: Mutex<Option<StreamPipes>>,
    }

    impl Control for TestControl {
        fn start_stream(&self, pipes: StreamPipes, _tracks: WebrtcTracks) -> Result<(), OrchestratorError> {
            *self.pipes.lock() = Some(pipes);
            Ok(())
        }

        fn media_processors(&self) -> Vec<Arc<dyn MediaProcessor>> {
            self.processors
                .iter()
                .map(|p| p.clone() as Arc<dyn MediaProcessor>)
                .collect()
        }
    }

    fn orchestrator() -> (Arc<Orchestrator>, Arc<HlsRouter>) {
        let router = Arc::new(HlsRouter::new());
        (Arc::new(Orchestrator::new("legacy-test", router.clone())), router)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_second_control_is_rejected() {
        let (orchestrator, _) = orchestrator();
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);

        orchestrator
            .register_control(Arc::new(TestControl::default()))
            .unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::ControlRegistered);
        assert!(matches!(
            orchestrator.register_control(Arc::new(TestControl::default())),
            Err(OrchestratorError::AlreadyAssigned)
        ));
        assert!(matches!(
            AppError::from(OrchestratorError::AlreadyAssigned),
            AppError::AlreadyAssigned
        ));
    }

    #[tokio::test]
    async fn test_start_requires_control() {
        let (orchestrator, _) = orchestrator();
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::NoControl)));
    }

    #[tokio::test]
    async fn test_start_feeds_processors_and_stop_tears_down() {
        let (orchestrator, router) = orchestrator();
        let stub = Arc::new(StubProcessor::default());
        let control = Arc::new(TestControl {
            processors: vec![stub.clone()],
            ..Default::default()
        });
        orchestrator.register_control(control.clone()).unwrap();

        orchestrator.start().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert!(orchestrator.tracks().is_some());
        assert!(matches!(
            orchestrator.start(),
            Err(OrchestratorError::InvalidState(OrchestratorState::Running))
        ));

        let pipes = control.pipes.lock().take().unwrap();
        pipes.video.write(Bytes::from_static(b"video")).await.unwrap();
        pipes.audio.write(Bytes::from_static(b"audio")).await.unwrap();
        wait_for(|| stub.video_bytes() == b"video" && stub.audio_bytes() == b"audio").await;
        wait_for(|| router.is_active()).await;

        orchestrator.stop();
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert!(!router.is_active());
        assert_eq!(stub.destroy_count(), 1);
        assert!(pipes.video.is_closed());

        tokio::time::timeout(Duration::from_secs(1), orchestrator.processors_done().cancelled())
            .await
            .unwrap();
        assert_eq!(stub.transcodes.load(Ordering::SeqCst), 1);

        // Stop is idempotent
        orchestrator.stop();
        assert_eq!(stub.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_processor_completes_phase() {
        let (orchestrator, _) = orchestrator();
        let stub = Arc::new(StubProcessor::failing());
        orchestrator
            .register_control(Arc::new(TestControl {
                processors: vec![stub.clone()],
                ..Default::default()
            }))
            .unwrap();

        orchestrator.start().unwrap();
        tokio::time::timeout(Duration::from_secs(1), orchestrator.processors_done().cancelled())
            .await
            .unwrap();
        // A finished processor does not stop the orchestrator by itself
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
    }
}
