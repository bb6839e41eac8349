//! Packet fan-out

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{DemuxerReader, MediaError, MediaWriter};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Packets queued per sink before the slow sink starts losing them
pub const SINK_QUEUE_DEPTH: usize = 256;

/// Reads packets from one source and hands each to every sink.
///
/// Every sink is driven by its own task behind a bounded queue, so a sink
/// that stops consuming (a stalled transcoder pipe) loses packets instead of
/// holding up the others. A [`lossless`](Demuxer::lossless) demuxer waits for
/// queue space instead, for byte streams that cannot skip a chunk.
pub struct Demuxer {
    name: String,
    reader: Box<dyn DemuxerReader>,
    sinks: Vec<Box<dyn MediaWriter>>,
    throttler: Arc<LogThrottler>,
    lossless: bool,
}

impl Demuxer {
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn DemuxerReader>,
        sinks: Vec<Box<dyn MediaWriter>>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            sinks,
            throttler: Arc::new(LogThrottler::default()),
            lossless: false,
        }
    }

    /// Wait for a full sink instead of dropping the packet
    pub fn lossless(mut self) -> Self {
        self.lossless = true;
        self
    }

    /// Run until the source ends or `cancel` fires.
    ///
    /// A failing or full sink only loses the current packet; the other sinks
    /// still get it and the loop keeps going. After the source ends the sinks
    /// drain what is queued, unless `cancel` fires first. Returns the number of
    /// packets read.
    pub async fn demux(mut self, cancel: CancellationToken) -> u64 {
        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(self.sinks.len());
        for (i, sink) in std::mem::take(&mut self.sinks).into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(SINK_QUEUE_DEPTH);
            queues.push(tx);
            workers.spawn(drive_sink(
                self.name.clone(),
                i,
                sink,
                rx,
                self.throttler.clone(),
            ));
        }

        let mut packets = 0u64;
        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.reader.read() => res,
            };

            let packet = match packet {
                Ok(packet) => packet,
                Err(MediaError::Eof) => {
                    tracing::debug!("[{}] source ended", self.name);
                    break;
                }
                Err(e) if e.is_terminal() => {
                    tracing::debug!("[{}] source closed: {}", self.name, e);
                    break;
                }
                Err(e) => {
                    warn_throttled!(self.throttler, "read", "[{}] read failed: {}", self.name, e);
                    continue;
                }
            };
            packets += 1;

            for (i, queue) in queues.iter().enumerate() {
                if self.lossless {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        // A closed queue means the sink task is gone
                        _ = queue.send(packet.clone()) => {}
                    }
                    continue;
                }
                match queue.try_send(packet.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn_throttled!(
                        self.throttler,
                        &format!("full-{}", i),
                        "[{}] sink {} is behind, dropping packet",
                        self.name,
                        i
                    ),
                    // The sink task is gone; nothing left to deliver to
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        drop(queues);
        let drained = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = async { while workers.join_next().await.is_some() {} } => true,
        };
        if !drained {
            workers.abort_all();
        }
        tracing::info!("[{}] demuxer stopped after {} packets", self.name, packets);
        packets
    }
}

async fn drive_sink(
    name: String,
    index: usize,
    mut sink: Box<dyn MediaWriter>,
    mut queue: mpsc::Receiver<Bytes>,
    throttler: Arc<LogThrottler>,
) {
    let key = format!("sink-{}", index);
    while let Some(packet) = queue.recv().await {
        match sink.write(&packet).await {
            Ok(_) => {}
            Err(MediaError::NotReady | MediaError::EmptySample) => {
                tracing::trace!("[{}] sink {} skipped packet", name, index)
            }
            Err(e) if e.is_terminal() => {
                tracing::debug!("[{}] sink {} closed: {}", name, index, e);
                break;
            }
            Err(e) => warn_throttled!(throttler, &key, "[{}] sink {} write failed: {}", name, index, e),
        }
    }
}
