//! Per-codec demux graphs from a remote track to local tracks and byte pipes

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::h264::RtpToH264MediaWriter;
use super::opus::RtpToWebmOpusMuxWriter;
use super::rtp_track::{PipeDemuxerReader, PipeMediaWriter, RtpTrackMediaWriter};
use super::vp8::RtpToWebmVp8MuxWriter;
use super::{muxer, Demuxer, DemuxerReader, MediaWriter, MuxerWriter};
use crate::pipe::{byte_pipe, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
use crate::webrtc::track::TrackCodec;

/// Sinks republishing raw RTP to `local`, if there is one
fn republish_sinks(local: Option<Arc<TrackLocalStaticRTP>>) -> Vec<Box<dyn MediaWriter>> {
    local
        .map(|track| Box::new(RtpTrackMediaWriter::new(track)) as Box<dyn MediaWriter>)
        .into_iter()
        .collect()
}

fn container_writer(codec: TrackCodec) -> Option<Box<dyn MuxerWriter>> {
    match codec {
        TrackCodec::Opus => Some(Box::new(RtpToWebmOpusMuxWriter::new())),
        TrackCodec::Vp8 => Some(Box::new(RtpToWebmVp8MuxWriter::new())),
        TrackCodec::H264 => None,
    }
}

/// Read `source` until it ends or `cancel` fires.
///
/// Every packet is republished to `local` and converted for `target`: Opus
/// and VP8 go through a WebM muxer, H.264 is written as Annex-B. Returns the
/// number of packets read.
pub async fn pipe_track(
    codec: TrackCodec,
    label: &str,
    cancel: CancellationToken,
    source: Box<dyn DemuxerReader>,
    local: Option<Arc<TrackLocalStaticRTP>>,
    target: Option<PipeWriter>,
) -> u64 {
    let mut sinks = republish_sinks(local);
    match (target, container_writer(codec)) {
        (Some(target), Some(writer)) => {
            let output: Vec<Box<dyn MediaWriter>> = vec![Box::new(PipeMediaWriter::new(target))];
            match muxer(format!("{}-mux", label), writer, output) {
                Ok((input, output)) => {
                    tokio::spawn(output.run(cancel.clone()));
                    sinks.push(Box::new(input));
                }
                Err(e) => tracing::warn!("[{}] {:?} muxer unavailable: {}", label, codec, e),
            }
        }
        (Some(target), None) => sinks.push(Box::new(RtpToH264MediaWriter::new(target))),
        (None, _) => {
            tracing::warn!("[{}] {:?} pipe already has a writer, republishing only", label, codec)
        }
    }

    tracing::info!("[{}] Piping {:?} track to {} sink(s)", label, codec, sinks.len());
    let packets = Demuxer::new(label, source, sinks).demux(cancel).await;
    tracing::info!("[{}] {:?} track stopped after {} packets", label, codec, packets);
    packets
}

/// Give each of `count` consumers its own copy of the video and audio streams.
///
/// A single consumer reads the pipes directly. With no consumers the pipes are
/// drained so writers never stall on a full pipe.
pub fn split_inputs(
    count: usize,
    video: PipeReader,
    audio: PipeReader,
    cancel: &CancellationToken,
) -> Vec<(PipeReader, PipeReader)> {
    if count == 1 {
        return vec![(video, audio)];
    }
    let videos = fan_out("video-fanout", video, count, cancel);
    let audios = fan_out("audio-fanout", audio, count, cancel);
    videos.into_iter().zip(audios).collect()
}

fn fan_out(name: &str, source: PipeReader, count: usize, cancel: &CancellationToken) -> Vec<PipeReader> {
    let mut sinks: Vec<Box<dyn MediaWriter>> = Vec::with_capacity(count);
    let mut readers = Vec::with_capacity(count);
    for _ in 0..count {
        let (writer, reader, _) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        sinks.push(Box::new(PipeMediaWriter::new(writer)));
        readers.push(reader);
    }
    // Container bytes cannot be skipped, so a slow consumer holds the others back
    let demuxer = Demuxer::new(name, Box::new(PipeDemuxerReader::new(source)), sinks).lossless();
    tokio::spawn(demuxer.demux(cancel.clone()));
    readers
}
