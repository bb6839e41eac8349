//! External transcoder adapters
//!
//! A [`MediaProcessor`] consumes the containerized video and audio byte streams
//! of one ingest session and produces some output, currently HLS through
//! ffmpeg. Processors are created per session by the stream allocator.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pipe::PipeReader;

pub mod hls;

pub use hls::{FfmpegHlsProcessor, HlsSettings};

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("failed to spawn transcoder: {0}")]
    Spawn(String),

    #[error("named pipe error: {0}")]
    NamedPipe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder exited: {0}")]
    Exit(String),
}

/// What a processor produces; lets callers look for specific capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Hls,
}

/// Files served by the HLS egress routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsOutput {
    pub dir: PathBuf,
    pub manifest: PathBuf,
}

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    fn kind(&self) -> ProcessorKind;

    /// Run the transcoder until it exits or `cancel` fires.
    ///
    /// Cancellation is a normal stop and returns `Ok(())`.
    async fn transcode(
        &self,
        cancel: CancellationToken,
        video: PipeReader,
        audio: PipeReader,
    ) -> Result<(), ProcessorError>;

    /// Release everything the processor created. Idempotent.
    fn destroy(&self);

    /// Output location while the processor is producing HLS
    fn hls_output(&self) -> Option<HlsOutput> {
        None
    }
}
