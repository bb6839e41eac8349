//! Muxer: codec writer input plus a copy loop for its container output

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{MediaError, MediaWriter, MuxerWriter, Result};
use crate::pipe::PipeReader;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Write side of a muxer; plugs into a [`super::Demuxer`] as a sink
pub struct Muxer {
    writer: Box<dyn MuxerWriter>,
}

/// Copy loop moving container bytes from the muxer writer to its sinks
pub struct MuxerOutput {
    name: String,
    reader: PipeReader,
    sinks: Vec<Box<dyn MediaWriter>>,
}

/// Split a muxer writer into its input and output halves
pub fn muxer(
    name: impl Into<String>,
    mut writer: Box<dyn MuxerWriter>,
    sinks: Vec<Box<dyn MediaWriter>>,
) -> Result<(Muxer, MuxerOutput)> {
    let reader = writer.take_reader().ok_or(MediaError::PipeClosed)?;
    Ok((
        Muxer { writer },
        MuxerOutput {
            name: name.into(),
            reader,
            sinks,
        },
    ))
}

#[async_trait]
impl MediaWriter for Muxer {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        self.writer.write(packet).await
    }
}

impl MuxerOutput {
    /// Copy until the writer side is gone, the pipe is closed or `cancel` fires.
    ///
    /// Returns the number of bytes copied.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let throttler = LogThrottler::default();
        let mut copied = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.reader.read_chunk() => res,
            };
            let chunk = match chunk {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    tracing::debug!("[{}] muxer output drained", self.name);
                    break;
                }
                Err(e) => {
                    tracing::debug!("[{}] muxer pipe closed: {}", self.name, e);
                    break;
                }
            };
            copied += chunk.len() as u64;

            for (i, sink) in self.sinks.iter_mut().enumerate() {
                if let Err(e) = sink.write(&chunk).await {
                    let key = format!("sink-{}", i);
                    warn_throttled!(throttler, &key, "[{}] muxer sink {} failed: {}", self.name, i, e);
                }
            }
        }
        tracing::info!("[{}] muxer stopped after {} bytes", self.name, copied);
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::CollectWriter;
    use crate::pipe::{byte_pipe, PipeWriter};
    use bytes::Bytes;
    use std::time::Duration;

    /// Prefixes every packet with a marker byte
    struct TagWriter {
        writer: PipeWriter,
        reader: Option<PipeReader>,
    }

    impl TagWriter {
        fn new() -> Self {
            let (writer, reader, _) = byte_pipe(8);
            Self {
                writer,
                reader: Some(reader),
            }
        }
    }

    #[async_trait]
    impl MuxerWriter for TagWriter {
        async fn write(&mut self, packet: &[u8]) -> Result<usize> {
            let mut out = vec![0xAA];
            out.extend_from_slice(packet);
            Ok(self.writer.write(Bytes::from(out)).await?)
        }

        fn take_reader(&mut self) -> Option<PipeReader> {
            self.reader.take()
        }
    }

    #[tokio::test]
    async fn test_output_reaches_all_sinks() {
        let a = CollectWriter::default();
        let b = CollectWriter::default();
        let (mut input, output) = muxer(
            "test",
            Box::new(TagWriter::new()),
            vec![Box::new(a.clone()), Box::new(b.clone())],
        )
        .unwrap();

        let handle = tokio::spawn(output.run(CancellationToken::new()));
        for i in 0u8..3 {
            input.write(&[i]).await.unwrap();
        }
        drop(input);

        let copied = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copied, 6);
        let expected: Vec<Bytes> = (0u8..3).map(|i| Bytes::from(vec![0xAA, i])).collect();
        assert_eq!(a.packets(), expected);
        assert_eq!(b.packets(), expected);
    }

    #[tokio::test]
    async fn test_reader_can_only_be_taken_once() {
        let mut writer = TagWriter::new();
        assert!(writer.take_reader().is_some());
        assert!(muxer("test", Box::new(writer), vec![]).is_err());
    }
}
