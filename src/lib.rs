//! stream-ingest - WebRTC broadcast ingest
//!
//! Accepts one WHIP publisher at a time, republishes its tracks to WHEP
//! subscribers and transcodes the media to HLS with an external ffmpeg.

pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod pipe;
pub mod processor;
pub mod shutdown;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
