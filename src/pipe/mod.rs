//! Byte pipes connecting the demux/mux graph to media processors

pub mod byte_pipe;
pub mod named;

pub use byte_pipe::{byte_pipe, PipeCloser, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
pub use named::NamedPipe;
