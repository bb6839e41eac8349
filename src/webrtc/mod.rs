//! WebRTC plumbing shared by the WHIP and WHEP handlers
//!
//! Architecture:
//! ```text
//! Publisher --WHIP--> RTCPeerConnection --on_track--> StatefulStreamGlobal
//!                                                          |
//!                                      TrackLocalStaticRTP (republish)
//!                                                          |
//! Subscribers <--WHEP-- RTCPeerConnection <----------------+
//! ```
//!
//! All peer connections come from one [`IngestApi`], so they share the media
//! engine and the single ICE UDP port.

pub mod api;
pub mod config;
pub mod negotiation;
pub mod track;

pub use api::IngestApi;
pub use config::{TurnServer, WebRtcConfig};
pub use negotiation::{answer_offer, read_offer};
pub use track::{kind_from_mime, local_track_for, TrackCodec};
