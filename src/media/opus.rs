//! Opus RTP to WebM audio muxing

use std::time::Duration;

use async_trait::async_trait;
use rtp::codecs::opus::OpusPacket;
use webrtc::media::io::sample_builder::SampleBuilder;

use super::rtp_track::parse_rtp;
use super::webm::{block_timestamp, SimpleBlockWriter, TrackEntry};
use super::{MediaError, MuxerWriter, Result};
use crate::pipe::{byte_pipe, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};

pub const OPUS_CLOCK_RATE: u32 = 48_000;
/// Packets held back for reordering before a gap is given up on
pub const JITTER_DEPTH: u16 = 10;

/// Reassembles Opus RTP into frames and emits them as a WebM audio stream.
///
/// A frame is complete once the packet after it arrives, since its duration
/// is the distance to the next RTP timestamp.
pub struct RtpToWebmOpusMuxWriter {
    builder: SampleBuilder<OpusPacket>,
    webm: SimpleBlockWriter,
    timestamp: Duration,
    writer: PipeWriter,
    reader: Option<PipeReader>,
}

impl Default for RtpToWebmOpusMuxWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpToWebmOpusMuxWriter {
    pub fn new() -> Self {
        let (writer, reader, _) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        Self {
            builder: SampleBuilder::new(JITTER_DEPTH, OpusPacket, OPUS_CLOCK_RATE),
            webm: SimpleBlockWriter::new(vec![TrackEntry::opus()]),
            timestamp: Duration::ZERO,
            writer,
            reader: Some(reader),
        }
    }

    /// Running stream position of the last written frame
    pub fn position(&self) -> Duration {
        self.timestamp
    }
}

#[async_trait]
impl MuxerWriter for RtpToWebmOpusMuxWriter {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        self.builder.push(parse_rtp(packet)?);

        let mut written = 0;
        let mut samples = 0;
        while let Some(sample) = self.builder.pop() {
            samples += 1;
            if sample.prev_dropped_packets > 0 {
                tracing::debug!("Opus jitter buffer dropped {} packets", sample.prev_dropped_packets);
            }
            self.timestamp += sample.duration;
            let block = self
                .webm
                .write_block(1, true, block_timestamp(self.timestamp), &sample.data);
            written += self
                .writer
                .write(block)
                .await
                .map_err(|_| MediaError::PipeClosed)?;
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
    use crate::media::testing::{rtp_bytes, rtp_packet};
    use crate::media::webm::ids;
    use webrtc::media::Sample;

    /// Timestamp field of a SimpleBlock at the end of `chunk`
    fn block_relative_ts(chunk: &[u8], payload_len: usize) -> i16 {
        let at = chunk.len() - payload_len - 3;
        i16::from_be_bytes([chunk[at], chunk[at + 1]])
    }

    fn assert_near(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(diff < Duration::from_micros(10), "{:?} != {:?}", actual, expected);
    }

    fn opus(seq: u16) -> rtp::packet::Packet {
        rtp_packet(seq, seq as u32 * 960, true, &[0xFC, seq as u8])
    }

    fn drain(builder: &mut SampleBuilder<OpusPacket>) -> Vec<Sample> {
        std::iter::from_fn(|| builder.pop()).collect()
    }

    #[tokio::test]
    async fn test_frames_become_blocks_with_running_timestamp() {
        let mut writer = RtpToWebmOpusMuxWriter::new();
        let mut reader = writer.take_reader().unwrap();

        // Nothing is complete until the following packet shows up
        assert!(matches!(
            writer.write(&rtp_bytes(0, 0, true, &[0xFC, 0])).await,
            Err(MediaError::EmptySample)
        ));
        for seq in 1u16..4 {
            writer
                .write(&rtp_bytes(seq, seq as u32 * 960, true, &[0xFC, seq as u8]))
                .await
                .unwrap();
        }
        assert_near(writer.position(), 60);

        // First chunk carries the stream header before the first block
        let first = reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..4], &ids::EBML.to_be_bytes());
        assert_eq!(block_relative_ts(&first, 2), 0);
        assert_eq!(&first[first.len() - 2..], &[0xFC, 0]);

        let second = reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(block_relative_ts(&second, 2), 20);
        assert_eq!(second[second.len() - 3], 0x80);
        let third = reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(block_relative_ts(&third, 2), 40);
        assert_eq!(&third[third.len() - 2..], &[0xFC, 2]);
    }

    #[tokio::test]
    async fn test_gap_holds_frames_until_filled() {
        let mut writer = RtpToWebmOpusMuxWriter::new();
        let _reader = writer.take_reader();

        assert!(matches!(
            writer.write(&rtp_bytes(1, 0, true, &[0xFC, 1])).await,
            Err(MediaError::EmptySample)
        ));
        // Gap at seq 2: frame 1 cannot be closed yet
        assert!(matches!(
            writer.write(&rtp_bytes(3, 1920, true, &[0xFC, 3])).await,
            Err(MediaError::EmptySample)
        ));
        // Filling the gap releases frames 1 and 2
        assert!(writer.write(&rtp_bytes(2, 960, true, &[0xFC, 2])).await.is_ok());
        assert_near(writer.position(), 40);
    }

    #[test]
    fn test_reorders_within_window() {
        let mut builder = SampleBuilder::new(JITTER_DEPTH, OpusPacket, OPUS_CLOCK_RATE);
        let mut order = Vec::new();
        for seq in [1u16, 3, 4, 2, 5, 6] {
            builder.push(opus(seq));
            order.extend(drain(&mut builder).iter().map(|s| s.data[1]));
        }
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_loss_beyond_window_does_not_stall() {
        let mut builder = SampleBuilder::new(JITTER_DEPTH, OpusPacket, OPUS_CLOCK_RATE);
        let mut samples = Vec::new();
        for seq in (1u16..=20).filter(|s| *s != 5) {
            builder.push(opus(seq));
            samples.extend(drain(&mut builder));
        }
        let order: Vec<u8> = samples.iter().map(|s| s.data[1]).collect();

        assert!(order.starts_with(&[1, 2, 3]));
        assert!(!order.contains(&5));
        assert!(order.iter().any(|&id| id > 5));
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(samples.iter().any(|s| s.prev_dropped_packets > 0));

        // The frame before the hole spans it, so the timeline keeps its length
        let before_gap = samples.iter().find(|s| s.data[1] == 4).unwrap();
        assert_near(before_gap.duration, 40);
    }

    #[tokio::test]
    async fn test_invalid_rtp_is_rejected() {
        let mut writer = RtpToWebmOpusMuxWriter::new();
        assert!(matches!(
            writer.write(&[0x80]).await,
            Err(MediaError::InvalidRtp(_))
        ));
    }
}
