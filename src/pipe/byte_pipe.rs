//! In-process byte pipe
//!
//! A bounded single-producer/single-consumer channel of byte chunks. The
//! writer suspends while the buffer is full, the reader suspends while it is
//! empty. Dropping the writer ends the stream (the reader sees EOF after
//! draining); closing through [`PipeCloser`] fails both ends immediately so
//! that a blocked copy loop returns promptly.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default number of in-flight chunks
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// Writing end of a byte pipe
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Reading end of a byte pipe
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    pending: Bytes,
}

/// Handle that closes both ends of a pipe
#[derive(Debug, Clone)]
pub struct PipeCloser {
    closed: CancellationToken,
}

/// Create a byte pipe holding at most `capacity` chunks in flight
pub fn byte_pipe(capacity: usize) -> (PipeWriter, PipeReader, PipeCloser) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        PipeWriter {
            tx,
            closed: closed.clone(),
        },
        PipeReader {
            rx,
            closed: closed.clone(),
            pending: Bytes::new(),
        },
        PipeCloser { closed },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

impl PipeWriter {
    /// Hand a chunk to the reader, waiting while the pipe is full.
    ///
    /// Empty chunks are accepted and dropped.
    pub async fn write(&self, data: Bytes) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(broken_pipe());
        }
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(broken_pipe()),
            res = self.tx.send(data) => res.map(|_| len).map_err(|_| broken_pipe()),
        }
    }

    /// Copy a slice into the pipe
    pub async fn write_all(&self, data: &[u8]) -> io::Result<usize> {
        self.write(Bytes::copy_from_slice(data)).await
    }

    /// Whether the pipe was closed or the reader went away
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

impl PipeReader {
    /// Receive the next chunk.
    ///
    /// Returns `Ok(None)` once the writer is gone and everything was drained,
    /// `Err(BrokenPipe)` if the pipe was closed.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        if self.closed.is_cancelled() {
            return Err(broken_pipe());
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(broken_pipe()),
            chunk = self.rx.recv() => Ok(chunk),
        }
    }

    /// Read into `buf`, returning 0 at EOF
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut chunk = match self.read_chunk().await? {
            Some(chunk) => chunk,
            None => return Ok(0),
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.pending = chunk.split_off(n);
        Ok(n)
    }
}

impl PipeCloser {
    /// Close both ends; pending and future operations fail with `BrokenPipe`
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (writer, mut reader, _closer) = byte_pipe(4);
        writer.write_all(b"one").await.unwrap();
        writer.write_all(b"two").await.unwrap();
        drop(writer);

        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), "one");
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), "two");
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remainder() {
        let (writer, mut reader, _closer) = byte_pipe(4);
        writer.write_all(b"abcdef").await.unwrap();
        drop(writer);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_reader() {
        let (_writer, mut reader, closer) = byte_pipe(4);
        let handle = tokio::spawn(async move { reader.read_chunk().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();

        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader was not released")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_writer() {
        let (writer, _reader, closer) = byte_pipe(1);
        writer.write_all(b"fill").await.unwrap();
        let handle = tokio::spawn(async move { writer.write_all(b"blocked").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();

        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer was not released")
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_write_after_reader_dropped_fails() {
        let (writer, reader, _closer) = byte_pipe(4);
        drop(reader);
        assert!(writer.is_closed());
        assert!(writer.write_all(b"x").await.is_err());
    }
}
