//! VP8 RTP to WebM video muxing

use std::time::Duration;

use async_trait::async_trait;
use rtp::codecs::vp8::Vp8Packet;
use webrtc::media::io::sample_builder::SampleBuilder;

use super::rtp_track::parse_rtp;
use super::webm::{block_timestamp, SimpleBlockWriter, TrackEntry};
use super::{MediaError, MuxerWriter, Result};
use crate::pipe::{byte_pipe, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};

pub const VP8_CLOCK_RATE: u32 = 90_000;
const JITTER_DEPTH: u16 = 10;

const KEYFRAME_START_CODE: [u8; 3] = [0x9D, 0x01, 0x2A];

/// Whether a reassembled VP8 frame is a keyframe (P bit of the frame tag clear)
pub fn is_keyframe(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b & 0x01 == 0)
}

/// Width and height from a VP8 keyframe header (RFC 6386 section 9.1).
///
/// Returns `None` for interframes and truncated or malformed headers.
pub fn keyframe_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    if !is_keyframe(frame) || frame.len() < 10 || frame[3..6] != KEYFRAME_START_CODE {
        return None;
    }
    let raw = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
    let width = raw & 0x3FFF;
    let height = (raw >> 16) & 0x3FFF;
    Some((width, height))
}

/// Reassembles VP8 RTP into frames and emits them as a WebM video stream.
///
/// The WebM track needs the frame size, so nothing is written until the first
/// keyframe; until then every write fails with [`MediaError::NotReady`]. A
/// frame is only complete once the first packet of the next one arrives.
pub struct RtpToWebmVp8MuxWriter {
    builder: SampleBuilder<Vp8Packet>,
    webm: Option<SimpleBlockWriter>,
    timestamp: Duration,
    writer: PipeWriter,
    reader: Option<PipeReader>,
}

impl Default for RtpToWebmVp8MuxWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpToWebmVp8MuxWriter {
    pub fn new() -> Self {
        let (writer, reader, _) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        Self {
            builder: SampleBuilder::new(JITTER_DEPTH, Vp8Packet::default(), VP8_CLOCK_RATE),
            webm: None,
            timestamp: Duration::ZERO,
            writer,
            reader: Some(reader),
        }
    }

    /// Frame size taken from the first keyframe, once seen
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let track = self.webm.as_ref()?.tracks().first()?;
        match track.kind {
            super::webm::TrackKind::Video { width, height } => Some((width, height)),
            _ => None,
        }
    }
}

#[async_trait]
impl MuxerWriter for RtpToWebmVp8MuxWriter {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        self.builder.push(parse_rtp(packet)?);

        let mut written = 0;
        let mut samples = 0;
        while let Some(sample) = self.builder.pop() {
            samples += 1;
            let keyframe = is_keyframe(&sample.data);

            if self.webm.is_none() {
                let Some((width, height)) = keyframe_dimensions(&sample.data) else {
                    continue;
                };
                tracing::info!("VP8 keyframe {}x{}, starting WebM output", width, height);
                self.webm = Some(SimpleBlockWriter::new(vec![TrackEntry::vp8(width, height)]));
            }
            let Some(webm) = self.webm.as_mut() else {
                continue;
            };

            self.timestamp += sample.duration;
            let block = webm.write_block(1, keyframe, block_timestamp(self.timestamp), &sample.data);
            written += self
                .writer
                .write(block)
                .await
                .map_err(|_| MediaError::PipeClosed)?;
        }

        if self.webm.is_none() {
            return Err(MediaError::NotReady);
        }
        if samples == 0 {
            return Err(MediaError::EmptySample);
        }
        Ok(written)
    }

    fn take_reader(&mut self) -> Option<PipeReader> {
        self.reader.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::rtp_bytes;

    /// Single-packet VP8 keyframe of the given size
    fn keyframe_payload(width: u16, height: u16) -> Vec<u8> {
        let mut payload = vec![0x10, 0x00, 0x00, 0x00, 0x9D, 0x01, 0x2A];
        payload.extend_from_slice(&width.to_le_bytes());
        payload.extend_from_slice(&height.to_le_bytes());
        payload.extend_from_slice(&[0xAB; 4]);
        payload
    }

    fn interframe_payload() -> Vec<u8> {
        vec![0x10, 0x01, 0x22, 0x33, 0x44]
    }

    #[test]
    fn test_keyframe_dimensions() {
        let frame = &keyframe_payload(640, 480)[1..];
        assert!(is_keyframe(frame));
        assert_eq!(keyframe_dimensions(frame), Some((640, 480)));

        // Scaling bits are not part of the size
        let frame = &keyframe_payload(1280 | 0x4000, 720 | 0x8000)[1..];
        assert_eq!(keyframe_dimensions(frame), Some((1280, 720)));

        assert_eq!(keyframe_dimensions(&interframe_payload()[1..]), None);
        assert_eq!(keyframe_dimensions(&[0x00, 0x00, 0x00, 0x00]), None);
    }

    #[tokio::test]
    async fn test_not_ready_until_keyframe() {
        let mut writer = RtpToWebmVp8MuxWriter::new();
        let mut reader = writer.take_reader().unwrap();

        // Interframes 1..=3, then the keyframe that closes frame 3
        for seq in 1u16..=4 {
            let payload = if seq == 4 {
                keyframe_payload(320, 240)
            } else {
                interframe_payload()
            };
            let result = writer
                .write(&rtp_bytes(seq, seq as u32 * 3000, true, &payload))
                .await;
            assert!(matches!(result, Err(MediaError::NotReady)));
        }
        assert_eq!(writer.dimensions(), None);

        // The next frame completes the keyframe and starts the output
        writer
            .write(&rtp_bytes(5, 15000, true, &interframe_payload()))
            .await
            .unwrap();
        assert_eq!(writer.dimensions(), Some((320, 240)));

        // Delta frames are accepted from now on
        writer
            .write(&rtp_bytes(6, 18000, true, &interframe_payload()))
            .await
            .unwrap();

        let first = reader.read_chunk().await.unwrap().unwrap();
        let keyframe = &keyframe_payload(320, 240)[1..];
        assert!(first.ends_with(keyframe));
        assert_eq!(first[first.len() - keyframe.len() - 1], 0x80);

        let second = reader.read_chunk().await.unwrap().unwrap();
        assert!(second.ends_with(&interframe_payload()[1..]));
        assert_eq!(second[second.len() - 5], 0x00);
    }

    #[tokio::test]
    async fn test_frame_spanning_packets_is_reassembled() {
        let mut writer = RtpToWebmVp8MuxWriter::new();
        let mut reader = writer.take_reader().unwrap();
        let keyframe = keyframe_payload(640, 360);

        // Keyframe split across two packets; only the first carries the S bit
        let (head, rest) = keyframe.split_at(8);
        let mut tail = vec![0x00];
        tail.extend_from_slice(rest);
        assert!(writer.write(&rtp_bytes(10, 3000, false, head)).await.is_err());
        assert!(writer.write(&rtp_bytes(11, 3000, true, &tail)).await.is_err());
        writer
            .write(&rtp_bytes(12, 6000, true, &interframe_payload()))
            .await
            .unwrap();

        assert_eq!(writer.dimensions(), Some((640, 360)));
        let first = reader.read_chunk().await.unwrap().unwrap();
        assert!(first.ends_with(&keyframe[1..]));
    }
}
