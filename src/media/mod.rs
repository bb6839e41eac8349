//! Demux/mux framework
//!
//! Media flows from a [`DemuxerReader`] (one RTP packet per read) through a
//! [`Demuxer`] that fans every packet out to a list of [`MediaWriter`] sinks.
//! A sink may be a [`Muxer`], which feeds a codec-specific [`MuxerWriter`]
//! whose container output is copied by [`MuxerOutput`] to further sinks.
//!
//! ```text
//! TrackRemote -> Demuxer -+-> RtpTrackMediaWriter (WHEP republish)
//!                         +-> Muxer(WebM writer) -> MuxerOutput -> PipeMediaWriter
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::pipe::PipeReader;

pub mod demuxer;
pub mod h264;
pub mod muxer;
pub mod opus;
pub mod pipeline;
pub mod rtp_track;
pub mod vp8;
pub mod webm;

pub use demuxer::Demuxer;
pub use muxer::{muxer, Muxer, MuxerOutput};

/// Errors of the demux/mux graph
#[derive(Error, Debug)]
pub enum MediaError {
    /// Source is exhausted
    #[error("end of stream")]
    Eof,

    #[error("pipe closed")]
    PipeClosed,

    #[error("invalid RTP packet: {0}")]
    InvalidRtp(String),

    #[error("sample has no data")]
    EmptySample,

    /// Writer has not seen enough input to initialise its output yet
    #[error("writer not ready")]
    NotReady,

    #[error("depacketize failed: {0}")]
    Depacketize(String),

    #[error("track error: {0}")]
    Track(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Errors after which a loop should stop instead of skipping one packet
    pub fn is_terminal(&self) -> bool {
        match self {
            MediaError::Eof | MediaError::PipeClosed => true,
            MediaError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Source of media packets
#[async_trait]
pub trait DemuxerReader: Send {
    /// Read one packet. `Err(MediaError::Eof)` ends the stream.
    async fn read(&mut self) -> Result<Bytes>;
}

/// Byte sink accepting one packet or container chunk per call
#[async_trait]
pub trait MediaWriter: Send {
    async fn write(&mut self, packet: &[u8]) -> Result<usize>;
}

/// Codec writer that turns RTP packets into a container byte stream
#[async_trait]
pub trait MuxerWriter: Send {
    async fn write(&mut self, packet: &[u8]) -> Result<usize>;

    /// Reading end of the container stream. Can be taken once.
    fn take_reader(&mut self) -> Option<PipeReader>;
}

#[async_trait]
impl<W: MediaWriter + ?Sized> MediaWriter for Box<W> {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        (**self).write(packet).await
    }
}
