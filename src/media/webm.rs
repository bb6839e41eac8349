//! Streaming WebM (Matroska subset) writer
//!
//! Output is produced strictly front to back so it can go straight into a pipe:
//! the Segment and every Cluster use the EBML "unknown size" marker and no
//! Cues/SeekHead are written. Timestamps are milliseconds (TimecodeScale 1ms).

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const NAME: u32 = 0x536E;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
}

/// Nanoseconds per timestamp unit
pub const TIMECODE_SCALE_NS: u64 = 1_000_000;

/// Keyframes open a new cluster once the current one spans this long
const CLUSTER_TARGET_MS: u64 = 1_000;

const SIMPLE_BLOCK_KEYFRAME: u8 = 0x80;

/// Unknown-size marker, 8-byte form
const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Debug, Clone, PartialEq)]
pub enum TrackKind {
    Video { width: u32, height: u32 },
    Audio { sampling_frequency: f64, channels: u8 },
}

impl TrackKind {
    fn track_type(&self) -> u64 {
        match self {
            TrackKind::Video { .. } => 1,
            TrackKind::Audio { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackEntry {
    pub number: u64,
    pub uid: u64,
    pub name: String,
    pub codec_id: String,
    pub codec_private: Option<Bytes>,
    /// Nanoseconds per frame, when constant
    pub default_duration: Option<u64>,
    pub kind: TrackKind,
}

impl TrackEntry {
    /// Stereo 48 kHz Opus with 20 ms frames
    pub fn opus() -> Self {
        Self {
            number: 1,
            uid: 12345,
            name: "Audio".to_string(),
            codec_id: "A_OPUS".to_string(),
            codec_private: Some(opus_head(2, 48000)),
            default_duration: Some(20_000_000),
            kind: TrackKind::Audio {
                sampling_frequency: 48000.0,
                channels: 2,
            },
        }
    }

    pub fn vp8(width: u32, height: u32) -> Self {
        Self {
            number: 1,
            uid: 67890,
            name: "Video".to_string(),
            codec_id: "V_VP8".to_string(),
            codec_private: None,
            default_duration: None,
            kind: TrackKind::Video { width, height },
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut entry = BytesMut::new();
        put_uint(&mut entry, ids::TRACK_NUMBER, self.number);
        put_uint(&mut entry, ids::TRACK_UID, self.uid);
        put_uint(&mut entry, ids::TRACK_TYPE, self.kind.track_type());
        put_string(&mut entry, ids::CODEC_ID, &self.codec_id);
        put_string(&mut entry, ids::NAME, &self.name);
        if let Some(private) = &self.codec_private {
            put_binary(&mut entry, ids::CODEC_PRIVATE, private);
        }
        if let Some(duration) = self.default_duration {
            put_uint(&mut entry, ids::DEFAULT_DURATION, duration);
        }

        let mut settings = BytesMut::new();
        match self.kind {
            TrackKind::Video { width, height } => {
                put_uint(&mut settings, ids::PIXEL_WIDTH, width as u64);
                put_uint(&mut settings, ids::PIXEL_HEIGHT, height as u64);
                put_binary(&mut entry, ids::VIDEO, &settings);
            }
            TrackKind::Audio {
                sampling_frequency,
                channels,
            } => {
                put_float(&mut settings, ids::SAMPLING_FREQUENCY, sampling_frequency);
                put_uint(&mut settings, ids::CHANNELS, channels as u64);
                put_binary(&mut entry, ids::AUDIO, &settings);
            }
        }

        put_binary(buf, ids::TRACK_ENTRY, &entry);
    }
}

/// `OpusHead` identification header (RFC 7845 section 5.1)
fn opus_head(channels: u8, input_rate: u32) -> Bytes {
    let mut head = BytesMut::with_capacity(19);
    head.put_slice(b"OpusHead");
    head.put_u8(1);
    head.put_u8(channels);
    head.put_u16_le(0);
    head.put_u32_le(input_rate);
    head.put_i16_le(0);
    head.put_u8(0);
    head.freeze()
}

/// Writes a single-segment WebM stream of SimpleBlocks
#[derive(Debug)]
pub struct SimpleBlockWriter {
    tracks: Vec<TrackEntry>,
    header_written: bool,
    cluster_start: Option<u64>,
}

impl SimpleBlockWriter {
    pub fn new(tracks: Vec<TrackEntry>) -> Self {
        Self {
            tracks,
            header_written: false,
            cluster_start: None,
        }
    }

    pub fn tracks(&self) -> &[TrackEntry] {
        &self.tracks
    }

    /// Encode one frame. The first call also emits the stream header, and a
    /// Cluster header precedes the block whenever a new cluster starts.
    pub fn write_block(
        &mut self,
        track_number: u64,
        keyframe: bool,
        timestamp_ms: u64,
        data: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(data.len() + 64);
        if !self.header_written {
            self.write_header(&mut buf);
            self.header_written = true;
        }

        let cluster_start = match self.cluster_start {
            Some(start) if !self.needs_new_cluster(start, keyframe, timestamp_ms) => start,
            _ => {
                put_id(&mut buf, ids::CLUSTER);
                buf.put_slice(&UNKNOWN_SIZE);
                put_uint(&mut buf, ids::TIMESTAMP, timestamp_ms);
                self.cluster_start = Some(timestamp_ms);
                timestamp_ms
            }
        };

        let relative = (timestamp_ms - cluster_start) as i16;
        let mut block = BytesMut::with_capacity(data.len() + 4);
        put_vint(&mut block, track_number);
        block.put_i16(relative);
        block.put_u8(if keyframe { SIMPLE_BLOCK_KEYFRAME } else { 0 });
        block.put_slice(data);
        put_binary(&mut buf, ids::SIMPLE_BLOCK, &block);

        buf.freeze()
    }

    fn needs_new_cluster(&self, start: u64, keyframe: bool, timestamp_ms: u64) -> bool {
        if timestamp_ms < start {
            return true;
        }
        let elapsed = timestamp_ms - start;
        elapsed > i16::MAX as u64 || (keyframe && elapsed >= CLUSTER_TARGET_MS)
    }

    fn write_header(&self, buf: &mut BytesMut) {
        let mut ebml = BytesMut::new();
        put_uint(&mut ebml, ids::EBML_VERSION, 1);
        put_uint(&mut ebml, ids::EBML_READ_VERSION, 1);
        put_uint(&mut ebml, ids::EBML_MAX_ID_LENGTH, 4);
        put_uint(&mut ebml, ids::EBML_MAX_SIZE_LENGTH, 8);
        put_string(&mut ebml, ids::DOC_TYPE, "webm");
        put_uint(&mut ebml, ids::DOC_TYPE_VERSION, 4);
        put_uint(&mut ebml, ids::DOC_TYPE_READ_VERSION, 2);
        put_binary(buf, ids::EBML, &ebml);

        put_id(buf, ids::SEGMENT);
        buf.put_slice(&UNKNOWN_SIZE);

        let mut info = BytesMut::new();
        put_uint(&mut info, ids::TIMECODE_SCALE, TIMECODE_SCALE_NS);
        put_string(&mut info, ids::MUXING_APP, env!("CARGO_PKG_NAME"));
        put_string(&mut info, ids::WRITING_APP, env!("CARGO_PKG_NAME"));
        put_binary(buf, ids::INFO, &info);

        let mut tracks = BytesMut::new();
        for track in &self.tracks {
            track.encode(&mut tracks);
        }
        put_binary(buf, ids::TRACKS, &tracks);
    }
}

/// Bytes needed to encode `value` as an EBML variable-size integer
pub fn vint_length(value: u64) -> usize {
    // All-ones is reserved for "unknown", hence the strict comparison
    (1..=8)
        .find(|n| value < (1u64 << (7 * n)) - 1)
        .unwrap_or(8)
}

pub fn put_vint(buf: &mut BytesMut, value: u64) {
    let len = vint_length(value);
    let marked = value | (1u64 << (7 * len));
    buf.put_slice(&marked.to_be_bytes()[8 - len..]);
}

fn put_id(buf: &mut BytesMut, id: u32) {
    let len = match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    buf.put_slice(&id.to_be_bytes()[4 - len..]);
}

fn put_binary(buf: &mut BytesMut, id: u32, data: &[u8]) {
    put_id(buf, id);
    put_vint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_uint(buf: &mut BytesMut, id: u32, value: u64) {
    let len = ((64 - value.leading_zeros() as usize) + 7) / 8;
    let len = len.max(1);
    put_binary(buf, id, &value.to_be_bytes()[8 - len..]);
}

fn put_float(buf: &mut BytesMut, id: u32, value: f64) {
    put_binary(buf, id, &value.to_be_bytes());
}

fn put_string(buf: &mut BytesMut, id: u32, value: &str) {
    put_binary(buf, id, value.as_bytes());
}

/// Block timestamp for a stream position, rounded to the nearest millisecond
pub fn block_timestamp(position: Duration) -> u64 {
    ((position.as_micros() + 500) / 1000) as u64
}
