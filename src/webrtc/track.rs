//! Codec detection and local tracks republishing remote media

use std::sync::Arc;

use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Codecs the ingest pipeline can containerize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCodec {
    Opus,
    Vp8,
    H264,
}

impl TrackCodec {
    /// Match a codec MIME type, ignoring case
    pub fn from_mime(mime: &str) -> Option<Self> {
        [
            (MIME_TYPE_OPUS, TrackCodec::Opus),
            (MIME_TYPE_VP8, TrackCodec::Vp8),
            (MIME_TYPE_H264, TrackCodec::H264),
        ]
        .into_iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(mime))
        .map(|(_, codec)| codec)
    }

    pub fn kind(&self) -> RTPCodecType {
        match self {
            TrackCodec::Opus => RTPCodecType::Audio,
            TrackCodec::Vp8 | TrackCodec::H264 => RTPCodecType::Video,
        }
    }
}

/// Media kind from the MIME type prefix (`audio/...`, `video/...`)
pub fn kind_from_mime(mime: &str) -> Option<RTPCodecType> {
    let (prefix, _) = mime.split_once('/')?;
    if prefix.eq_ignore_ascii_case("audio") {
        Some(RTPCodecType::Audio)
    } else if prefix.eq_ignore_ascii_case("video") {
        Some(RTPCodecType::Video)
    } else {
        None
    }
}

/// Local track carrying the same codec as a received remote track
pub fn local_track_for(
    capability: RTCRtpCodecCapability,
    kind: RTPCodecType,
    stream_id: &str,
) -> Arc<TrackLocalStaticRTP> {
    let track_id = match kind {
        RTPCodecType::Audio => "audio",
        _ => "video",
    };
    Arc::new(TrackLocalStaticRTP::new(
        capability,
        track_id.to_string(),
        stream_id.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_mime() {
        assert_eq!(TrackCodec::from_mime("audio/opus"), Some(TrackCodec::Opus));
        assert_eq!(TrackCodec::from_mime("audio/OPUS"), Some(TrackCodec::Opus));
        assert_eq!(TrackCodec::from_mime("video/VP8"), Some(TrackCodec::Vp8));
        assert_eq!(TrackCodec::from_mime("video/h264"), Some(TrackCodec::H264));
        assert_eq!(TrackCodec::from_mime("video/VP9"), None);
        assert_eq!(TrackCodec::H264.kind(), RTPCodecType::Video);
    }

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(kind_from_mime("audio/PCMU"), Some(RTPCodecType::Audio));
        assert_eq!(kind_from_mime("Video/AV1"), Some(RTPCodecType::Video));
        assert_eq!(kind_from_mime("application/data"), None);
        assert_eq!(kind_from_mime("garbage"), None);
    }
}
