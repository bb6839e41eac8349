//! Process-wide slot holding the one active ingest stream

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use super::{StatefulStream, StreamAllocator, StreamError, WebrtcStatefulStream};
use crate::shutdown::{Shutdown, TaskId};
use crate::webrtc::track::{kind_from_mime, local_track_for, TrackCodec};

/// Callback for every remote track received on the ingest peer connection
pub type WebrtcTrackHandler = Arc<dyn Fn(Arc<TrackRemote>) + Send + Sync>;

/// What a WHIP session needs to wire its peer connection into the stream
pub struct IngestSession {
    pub stream_id: Uuid,
    pub on_track: WebrtcTrackHandler,
    /// Cancelled when the session ends, for whatever reason
    pub cancel: CancellationToken,
}

struct ActiveStream {
    stream: Arc<WebrtcStatefulStream>,
    cancel: CancellationToken,
    tasks: [TaskId; 2],
}

pub struct StatefulStreamGlobal {
    active: Mutex<Option<ActiveStream>>,
    allocator: StreamAllocator,
    shutdown: Arc<Shutdown>,
    fail_fast: bool,
}

impl StatefulStreamGlobal {
    pub fn new(allocator: StreamAllocator, shutdown: Arc<Shutdown>, fail_fast: bool) -> Self {
        Self {
            active: Mutex::new(None),
            allocator,
            shutdown,
            fail_fast,
        }
    }

    /// Replace the active stream with a fresh one and start ingesting.
    ///
    /// The previous stream is destroyed before the new one is allocated. If
    /// allocation fails the slot stays empty.
    pub fn handle_webrtc(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<IngestSession, StreamError> {
        let (stream, cancel) = {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                tracing::info!("[{}] Superseded by a new ingest session", previous.stream.id());
                self.release(previous);
            }

            let stream = Arc::new((self.allocator)()?);
            let cancel = parent.child_token();

            let destroy_task = {
                let stream = stream.clone();
                self.shutdown.add_task(move || stream.destroy())
            };
            let cancel_task = {
                let cancel = cancel.clone();
                self.shutdown.add_task(move || cancel.cancel())
            };

            *active = Some(ActiveStream {
                stream: stream.clone(),
                cancel: cancel.clone(),
                tasks: [destroy_task, cancel_task],
            });
            (stream, cancel)
        };
        tracing::info!("[{}] Ingest stream allocated", stream.id());

        let registry = Arc::clone(self);
        let driver_stream = stream.clone();
        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            driver_stream.ingest(driver_cancel.clone()).await;
            driver_cancel.cancel();
            driver_stream.destroy();

            let was_current = registry.release_if_current(driver_stream.id());
            if was_current && registry.fail_fast {
                tracing::warn!(
                    "[{}] Ingest session ended, shutting down (fail fast)",
                    driver_stream.id()
                );
                registry.shutdown.trigger();
            }
        });

        Ok(IngestSession {
            stream_id: stream.id(),
            on_track: track_handler(stream, cancel.clone()),
            cancel,
        })
    }

    /// Currently active stream, if any
    pub fn get_stateful_stream(&self) -> Option<Arc<dyn StatefulStream>> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.stream.clone() as Arc<dyn StatefulStream>)
    }

    pub fn has_active_stream(&self) -> bool {
        self.active.lock().is_some()
    }

    fn release_if_current(&self, id: Uuid) -> bool {
        let mut active = self.active.lock();
        match active.take() {
            Some(current) if current.stream.id() == id => {
                self.release(current);
                true
            }
            other => {
                *active = other;
                false
            }
        }
    }

    fn release(&self, active: ActiveStream) {
        active.cancel.cancel();
        active.stream.destroy();
        for task in active.tasks {
            self.shutdown.remove_task(task);
        }
    }
}

fn track_handler(stream: Arc<WebrtcStatefulStream>, cancel: CancellationToken) -> WebrtcTrackHandler {
    Arc::new(move |track: Arc<TrackRemote>| {
        let parameters = track.codec();
        let mime = parameters.capability.mime_type.clone();

        let (Some(kind), Some(codec)) = (kind_from_mime(&mime), TrackCodec::from_mime(&mime)) else {
            tracing::error!(
                "[{}] Unsupported codec {} on track ssrc={}, ending session",
                stream.id(),
                mime,
                track.ssrc()
            );
            cancel.cancel();
            return;
        };
        tracing::info!("[{}] Received {} track ssrc={}", stream.id(), mime, track.ssrc());

        let label = format!("ingest-{}", stream.id());
        match kind {
            RTPCodecType::Audio if stream.audio_track().is_none() => {
                stream.set_audio_track(local_track_for(parameters.capability, kind, &label))
            }
            RTPCodecType::Video if stream.video_track().is_none() => {
                stream.set_video_track(local_track_for(parameters.capability, kind, &label))
            }
            _ => {}
        }

        let stream = stream.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match codec {
                TrackCodec::Opus => stream.pipe_opus_remote_track(cancel, track).await,
                TrackCodec::Vp8 => stream.pipe_vp8_remote_track(cancel, track).await,
                TrackCodec::H264 => stream.pipe_h264_remote_track(cancel, track).await,
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{rtp_bytes, VecReader};
    use crate::processor::testing::StubProcessor;
    use crate::processor::MediaProcessor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn stub_allocator(failing: bool) -> StreamAllocator {
        Arc::new(move || {
            let stub = if failing {
                StubProcessor::failing()
            } else {
                StubProcessor::default()
            };
            let processor: Arc<dyn MediaProcessor> = Arc::new(stub);
            Ok(WebrtcStatefulStream::new(vec![processor], None))
        })
    }

    fn registry(allocator: StreamAllocator, fail_fast: bool) -> (Arc<StatefulStreamGlobal>, Arc<Shutdown>) {
        let shutdown = Arc::new(Shutdown::new());
        let registry = Arc::new(StatefulStreamGlobal::new(allocator, shutdown.clone(), fail_fast));
        (registry, shutdown)
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

    #[tokio::test]
    async fn test_new_session_destroys_previous() {
        let (registry, shutdown) = registry(stub_allocator(false), false);
        let parent = CancellationToken::new();

        let first = registry.handle_webrtc(&parent).unwrap();
        let first_stream = registry.get_stateful_stream().unwrap();
        assert_eq!(first_stream.id(), first.stream_id);

        let second = registry.handle_webrtc(&parent).unwrap();
        assert!(first_stream.is_destroyed());
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        let current = registry.get_stateful_stream().unwrap();
        assert_eq!(current.id(), second.stream_id);
        assert!(!current.is_destroyed());
        assert!(current.as_webrtc().is_some());

        // Only the current stream keeps shutdown tasks
        assert_eq!(shutdown.pending_tasks(), 2);
    }

    #[tokio::test]
    async fn test_allocation_failure_leaves_slot_empty() {
        let fail = Arc::new(AtomicBool::new(false));
        let allocator: StreamAllocator = {
            let fail = fail.clone();
            Arc::new(move || {
                if fail.load(Ordering::SeqCst) {
                    return Err(StreamError::Allocation("no transcoder".to_string()));
                }
                Ok(WebrtcStatefulStream::new(vec![], None))
            })
        };
        let (registry, shutdown) = registry(allocator, false);
        let parent = CancellationToken::new();

        registry.handle_webrtc(&parent).unwrap();
        let previous = registry.get_stateful_stream().unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            registry.handle_webrtc(&parent),
            Err(StreamError::Allocation(_))
        ));
        assert!(previous.is_destroyed());
        assert!(!registry.has_active_stream());
        assert_eq!(shutdown.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancel_clears_slot() {
        let (registry, _shutdown) = registry(stub_allocator(false), false);
        let parent = CancellationToken::new();

        registry.handle_webrtc(&parent).unwrap();
        let stream = registry.get_stateful_stream().unwrap();

        parent.cancel();
        wait_for(|| !registry.has_active_stream()).await;
        assert!(stream.is_destroyed());
    }

    #[tokio::test]
    async fn test_shutdown_destroys_active_stream() {
        let (registry, shutdown) = registry(stub_allocator(false), false);
        let session = registry.handle_webrtc(&CancellationToken::new()).unwrap();
        let stream = registry.get_stateful_stream().unwrap();

        shutdown.trigger();
        assert!(stream.is_destroyed());
        assert!(session.cancel.is_cancelled());
        wait_for(|| !registry.has_active_stream()).await;
    }

    #[tokio::test]
    async fn test_fail_fast_triggers_shutdown() {
        let (registry, shutdown) = registry(stub_allocator(true), true);
        registry.handle_webrtc(&CancellationToken::new()).unwrap();

        wait_for(|| shutdown.is_triggered()).await;
        assert!(!registry.has_active_stream());
    }

    #[tokio::test]
    async fn test_superseded_session_does_not_fail_fast() {
        let (registry, shutdown) = registry(stub_allocator(false), true);
        let parent = CancellationToken::new();

        registry.handle_webrtc(&parent).unwrap();
        registry.handle_webrtc(&parent).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!shutdown.is_triggered());
        assert!(registry.has_active_stream());
    }

    #[tokio::test]
    async fn test_stream_tracks_feed_processor() {
        let stub = Arc::new(StubProcessor::default());
        let allocator: StreamAllocator = {
            let stub = stub.clone();
            Arc::new(move || {
                let processor: Arc<dyn MediaProcessor> = stub.clone();
                Ok(WebrtcStatefulStream::new(vec![processor], None))
            })
        };
        let (registry, _shutdown) = registry(allocator, false);
        let session = registry.handle_webrtc(&CancellationToken::new()).unwrap();

        let stream = registry.get_stateful_stream().unwrap();
        let webrtc = stream.as_webrtc().unwrap();
        let packets = vec![rtp_bytes(1, 0, true, &[0x67, 0x42, 0xC0, 0x1F])];
        webrtc
            .pipe_h264(session.cancel.clone(), Box::new(VecReader::new(packets)))
            .await;

        wait_for(|| !stub.video_bytes().is_empty()).await;
        assert_eq!(stub.video_bytes(), vec![0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F]);
    }
}
