//! Stateful ingest streams
//!
//! A stream is the live session of one broadcaster: the republished local
//! tracks, the video and audio byte pipes feeding the media processors, and
//! the processors themselves. [`StatefulStreamGlobal`] keeps at most one of
//! them alive per process.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod registry;
pub mod webrtc_stream;

pub use registry::{IngestSession, StatefulStreamGlobal, WebrtcTrackHandler};
pub use webrtc_stream::{hls_allocator, StreamAllocator, WebrtcStatefulStream};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to allocate stream: {0}")]
    Allocation(String),
}

#[async_trait]
pub trait StatefulStream: Send + Sync {
    fn id(&self) -> Uuid;

    /// Drive the media processors until `cancel` fires or one of them exits
    async fn ingest(&self, cancel: CancellationToken);

    /// Release pipes, processors and tracks. Idempotent.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;

    /// WebRTC capability, for consumers that need the republished tracks
    fn as_webrtc(&self) -> Option<&WebrtcStatefulStream> {
        None
    }
}
