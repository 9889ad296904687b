//! Single-producer/single-consumer byte pipe (spec §4.H, §5, §9 "Pipes are single-producer/
//! single-consumer ... with bounded buffering so producers block when consumers fall behind").
//!
//! Built on `tokio::sync::mpsc::channel<Bytes>`: the channel carries whole per-chunk `Bytes`
//! buffers rather than individual bytes — the natural Tokio-idiomatic shape for "bounded
//! buffering, producer blocks when consumer falls behind", and one level up from what
//! `rde_core::BatchTx`/`BatchRx` already are (a bounded `mpsc` channel of produced units).
//! `PipeReader` exposes `read_exact`-style consumption so the writer controller's "minimum
//! slice length currently available across all pipes" logic (spec §4.I) can operate on however
//! many whole chunks have arrived plus a partial remainder.

use bytes::{Buf, Bytes};
use nexus_core::{NexusError, NexusResult};
use tokio::sync::mpsc;

/// Create a bounded pipe. `capacity` is the number of in-flight chunk buffers the channel will
/// hold before the writer blocks (spec §5 back-pressure).
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PipeWriter { tx }, PipeReader { rx, pending: Bytes::new() })
}

/// Producer half. Dropping it (or calling `fail`) completes the pipe; a reader observes
/// end-of-stream once all buffered chunks have been drained.
pub struct PipeWriter {
    tx: mpsc::Sender<PipeItem>,
}

enum PipeItem {
    Chunk(Bytes),
    Err(NexusError),
}

impl PipeWriter {
    /// Send one chunk of bytes. Suspends until the reader has room (spec §5 suspension point:
    /// "pipe reads and writes").
    pub async fn write_chunk(&self, chunk: Bytes) -> NexusResult<()> {
        self.tx
            .send(PipeItem::Chunk(chunk))
            .await
            .map_err(|_| NexusError::Internal("pipe reader dropped before write completed".into()))
    }

    /// Complete the pipe with an error (spec §4.H "pipe-based streams carry errors by
    /// completing the pipe with an error"). The reader's next read observes this error once it
    /// has drained any chunks already in flight.
    pub async fn fail(self, err: NexusError) {
        let _ = self.tx.send(PipeItem::Err(err)).await;
    }
}

/// Consumer half.
pub struct PipeReader {
    rx: mpsc::Receiver<PipeItem>,
    pending: Bytes,
}

impl PipeReader {
    /// Number of bytes immediately available without suspending (already-received chunks plus
    /// the current partial remainder).
    pub fn available(&self) -> usize {
        self.pending.len()
    }

    /// Read exactly `out.len()` bytes, suspending as needed for more chunks to arrive. Returns
    /// `Ok(0)` only when `out` is empty. Returns the propagated error if the writer `fail`ed,
    /// or `NexusError::Internal` if the writer was dropped with fewer bytes than requested.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> NexusResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pending.is_empty() {
                self.fetch_next().await?;
            }
            let take = (out.len() - filled).min(self.pending.len());
            self.pending.copy_to_slice(&mut out[filled..filled + take]);
            filled += take;
        }
        Ok(())
    }

    /// Returns the number of bytes currently available without suspending, fetching at least
    /// one more chunk if none are buffered and the pipe has not yet completed. Used by the
    /// writer controller to compute "the minimum slice length currently available across all
    /// pipes" (spec §4.I) without over-reading ahead of other pipes in the same file window.
    pub async fn available_or_fetch(&mut self) -> NexusResult<usize> {
        if self.pending.is_empty() {
            match self.rx.try_recv() {
                Ok(PipeItem::Chunk(chunk)) => self.pending = chunk,
                Ok(PipeItem::Err(err)) => return Err(err),
                Err(mpsc::error::TryRecvError::Empty) => {
                    match self.rx.recv().await {
                        Some(PipeItem::Chunk(chunk)) => self.pending = chunk,
                        Some(PipeItem::Err(err)) => return Err(err),
                        None => return Ok(0),
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(0),
            }
        }
        Ok(self.pending.len())
    }

    async fn fetch_next(&mut self) -> NexusResult<()> {
        match self.rx.recv().await {
            Some(PipeItem::Chunk(chunk)) => {
                self.pending = chunk;
                Ok(())
            }
            Some(PipeItem::Err(err)) => Err(err),
            None => Err(NexusError::Internal("pipe closed before the requested bytes arrived".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_exact_across_chunk_boundaries() {
        let (writer, mut reader) = pipe(4);
        writer.write_chunk(Bytes::from_static(&[1, 2, 3])).await.unwrap();
        writer.write_chunk(Bytes::from_static(&[4, 5])).await.unwrap();

        let mut out = [0u8; 4];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let mut out2 = [0u8; 1];
        reader.read_exact(&mut out2).await.unwrap();
        assert_eq!(out2, [5]);
    }

    #[tokio::test]
    async fn fail_propagates_to_reader() {
        let (writer, mut reader) = pipe(4);
        writer.write_chunk(Bytes::from_static(&[1])).await.unwrap();
        writer.fail(NexusError::Internal("boom".into())).await;

        let mut out = [0u8; 1];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [1]);

        let mut out2 = [0u8; 1];
        let err = reader.read_exact(&mut out2).await.unwrap_err();
        assert!(matches!(err, NexusError::Internal(_)));
    }

    #[tokio::test]
    async fn back_pressure_blocks_producer_when_reader_lags() {
        let (writer, mut reader) = pipe(1);
        writer.write_chunk(Bytes::from_static(&[1])).await.unwrap();
        let writer_task = tokio::spawn(async move {
            writer.write_chunk(Bytes::from_static(&[2])).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer_task.is_finished(), "second write should block until the reader drains");

        let mut out = [0u8; 1];
        reader.read_exact(&mut out).await.unwrap();
        writer_task.await.unwrap();
    }
}
