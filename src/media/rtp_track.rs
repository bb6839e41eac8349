//! RTP readers and writers bridging WebRTC tracks and byte pipes

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, Unmarshal};

use super::{DemuxerReader, MediaError, MediaWriter, Result};
use crate::pipe::{PipeReader, PipeWriter};

/// Parse a marshaled RTP packet
pub fn parse_rtp(mut data: &[u8]) -> Result<Packet> {
    Packet::unmarshal(&mut data).map_err(|e| MediaError::InvalidRtp(e.to_string()))
}

/// Reads RTP packets from a remote track and yields them marshaled
pub struct RtpTrackDemuxerReader {
    track: Arc<TrackRemote>,
}

impl RtpTrackDemuxerReader {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl DemuxerReader for RtpTrackDemuxerReader {
    async fn read(&mut self) -> Result<Bytes> {
        let (packet, _) = self.track.read_rtp().await.map_err(|e| match e {
            webrtc::Error::Rtp(e) => MediaError::InvalidRtp(e.to_string()),
            e => {
                tracing::debug!("Remote track ssrc={} read ended: {}", self.track.ssrc(), e);
                MediaError::Eof
            }
        })?;
        packet
            .marshal()
            .map_err(|e| MediaError::InvalidRtp(e.to_string()))
    }
}

/// Forwards raw RTP packets to a local track (republishing to subscribers)
pub struct RtpTrackMediaWriter {
    track: Arc<TrackLocalStaticRTP>,
}

impl RtpTrackMediaWriter {
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl MediaWriter for RtpTrackMediaWriter {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        self.track
            .write(packet)
            .await
            .map_err(|e| MediaError::Track(e.to_string()))
    }
}

/// Writes every input verbatim into a byte pipe
pub struct PipeMediaWriter {
    target: PipeWriter,
}

impl PipeMediaWriter {
    pub fn new(target: PipeWriter) -> Self {
        Self { target }
    }
}

#[async_trait]
impl MediaWriter for PipeMediaWriter {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        self.target
            .write_all(packet)
            .await
            .map_err(|_| MediaError::PipeClosed)
    }
}

/// Yields the chunks of a byte pipe, for fanning one pipe out to several
pub struct PipeDemuxerReader {
    source: PipeReader,
}

impl PipeDemuxerReader {
    pub fn new(source: PipeReader) -> Self {
        Self { source }
    }
}

#[async_trait]
impl DemuxerReader for PipeDemuxerReader {
    async fn read(&mut self) -> Result<Bytes> {
        match self.source.read_chunk().await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => Err(MediaError::Eof),
            Err(_) => Err(MediaError::PipeClosed),
        }
    }
}
