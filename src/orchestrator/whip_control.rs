//! Control driven by a WHIP peer connection (legacy `/api/consumer/whip`)

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::{Control, OrchestratorError, StreamPipes, WebrtcTracks};
use crate::media::pipeline::pipe_track;
use crate::media::rtp_track::RtpTrackDemuxerReader;
use crate::pipe::PipeWriter;
use crate::processor::MediaProcessor;
use crate::webrtc::track::TrackCodec;

pub struct WhipControl {
    pc: Arc<RTCPeerConnection>,
    processors: Vec<Arc<dyn MediaProcessor>>,
    cancel: CancellationToken,
}

impl WhipControl {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        processors: Vec<Arc<dyn MediaProcessor>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pc,
            processors,
            cancel,
        }
    }
}

/// Pipe and local track a legacy track of `codec` is written to
fn route_for(
    codec: Option<TrackCodec>,
    tracks: &WebrtcTracks,
    video: &Mutex<Option<PipeWriter>>,
    audio: &Mutex<Option<PipeWriter>>,
) -> Option<(TrackCodec, Arc<TrackLocalStaticRTP>, Option<PipeWriter>)> {
    match codec? {
        TrackCodec::Opus => Some((TrackCodec::Opus, tracks.audio.clone(), audio.lock().take())),
        TrackCodec::H264 => Some((TrackCodec::H264, tracks.video.clone(), video.lock().take())),
        // The legacy local video track is H.264 only
        TrackCodec::Vp8 => None,
    }
}

impl Control for WhipControl {
    fn start_stream(&self, pipes: StreamPipes, tracks: WebrtcTracks) -> Result<(), OrchestratorError> {
        let video = Arc::new(Mutex::new(Some(pipes.video)));
        let audio = Arc::new(Mutex::new(Some(pipes.audio)));
        let cancel = self.cancel.clone();

        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let mime = track.codec().capability.mime_type;
            tracing::info!("Establishing connection {} ssrc={}", mime, track.ssrc());

            match route_for(TrackCodec::from_mime(&mime), &tracks, &video, &audio) {
                Some((codec, local, target)) => {
                    let cancel = cancel.clone();
                    let label = format!("legacy-{:?}", codec).to_lowercase();
                    tokio::spawn(async move {
                        let source = Box::new(RtpTrackDemuxerReader::new(track));
                        pipe_track(codec, &label, cancel, source, Some(local), target).await;
                    });
                }
                None => tracing::warn!("Ignoring {} track on legacy WHIP session", mime),
            }
            Box::pin(async {})
        }));
        Ok(())
    }

    fn media_processors(&self) -> Vec<Arc<dyn MediaProcessor>> {
        self.processors.clone()
    }
}
