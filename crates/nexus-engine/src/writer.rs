//! Writer controller (spec §4.I): the file-period loop that demultiplexes the scheduler's
//! per-item pipes into one pluggable `DataWriter` sink, file by file.
//!
//! Mirrors `SourceControllerHandle`'s lifecycle shape (mutex-guarded state machine, poison on
//! any plugin error) since the writer side of the pipeline has the identical "plugin boundary,
//! discard-on-failure" contract as the source side (spec §7 `ContextInit`/`ExtensionRuntime`).

use std::sync::Arc;

use nexus_core::{CatalogItem, DataWriter, NexusError, NexusResult, PluginContext};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipe::PipeReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    New,
    Initialized,
    Poisoned,
    Disposed,
}

struct WriterInner {
    writer: Box<dyn DataWriter>,
    state: WriterState,
}

/// Drives one `DataWriter` plugin through its `open`/`write`/`close` lifecycle across a
/// `[begin, end)` window partitioned into `file_period_ticks`-aligned files (spec §4.I).
pub struct WriterController {
    type_id: String,
    inner: Mutex<WriterInner>,
}

impl WriterController {
    pub fn new(type_id: impl Into<String>, writer: Box<dyn DataWriter>) -> Arc<Self> {
        Arc::new(WriterController {
            type_id: type_id.into(),
            inner: Mutex::new(WriterInner { writer, state: WriterState::New }),
        })
    }

    pub async fn initialize(&self, configuration: Value, resource_locator: Option<String>) -> NexusResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != WriterState::New {
            return Err(NexusError::Internal(format!(
                "writer controller {} initialized twice (state {:?})",
                self.type_id, inner.state
            )));
        }
        let ctx = PluginContext { configuration, resource_locator };
        match inner.writer.set_context(ctx).await {
            Ok(()) => {
                inner.state = WriterState::Initialized;
                info!(writer = %self.type_id, "writer controller initialized");
                Ok(())
            }
            Err(e) => {
                inner.state = WriterState::Poisoned;
                Err(NexusError::ContextInit(format!("{}: {e}", self.type_id)))
            }
        }
    }

    /// Run the file-period loop: for each `file_period_ticks`-aligned window in `[begin, end)`,
    /// open the writer, repeatedly drain the minimum slice currently available across every
    /// item's pipe and hand it to `write`, then `close`. Runs to completion (calling `close`)
    /// even on error or cancellation (spec §5 "guaranteed release on all exit paths").
    pub async fn run(
        &self,
        begin: i64,
        end: i64,
        sample_period_ticks: u64,
        file_period_ticks: u64,
        requests: Vec<(CatalogItem, PipeReader)>,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<f64>>,
    ) -> NexusResult<()> {
        validate_writer_preconditions(begin, end, sample_period_ticks, file_period_ticks, &requests)?;

        let items: Vec<CatalogItem> = requests.iter().map(|(item, _)| item.clone()).collect();
        let mut readers: Vec<PipeReader> = requests.into_iter().map(|(_, r)| r).collect();
        let total_ticks = (end - begin) as f64;

        let result = self
            .run_loop(begin, end, sample_period_ticks, file_period_ticks, &items, &mut readers, &cancel, &progress, total_ticks)
            .await;

        if let Err(e) = &result {
            warn!(writer = %self.type_id, error = %e, "writer controller run terminating early");
        }
        // "complete all pipe readers": dropping them disconnects each pipe's receiver half so
        // any still-blocked producer observes a closed channel rather than hanging forever.
        drop(readers);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        begin: i64,
        end: i64,
        sample_period_ticks: u64,
        file_period_ticks: u64,
        items: &[CatalogItem],
        readers: &mut [PipeReader],
        cancel: &CancellationToken,
        progress: &Option<mpsc::Sender<f64>>,
        total_ticks: f64,
    ) -> NexusResult<()> {
        let mut consumed_ticks: i64 = 0;
        let mut cursor = begin;

        while cursor < end {
            if cancel.is_cancelled() {
                return Err(NexusError::Cancelled);
            }
            let file_begin = cursor;
            let file_end = end.min(file_begin + file_period_ticks as i64);
            let file_len_elements = ((file_end - file_begin) / sample_period_ticks as i64) as u64;

            self.open_file(file_begin, file_period_ticks, sample_period_ticks, items).await?;

            let mut file_offset: u64 = 0;
            while file_offset < file_len_elements {
                if cancel.is_cancelled() {
                    let _ = self.close_file().await;
                    return Err(NexusError::Cancelled);
                }

                let mut min_elements = usize::MAX;
                for reader in readers.iter_mut() {
                    let available_bytes = reader.available_or_fetch().await?;
                    min_elements = min_elements.min(available_bytes / 8);
                }
                if min_elements == 0 {
                    let _ = self.close_file().await;
                    return Err(NexusError::Internal(
                        "a pipe completed before the expected number of samples arrived".into(),
                    ));
                }
                let remaining = (file_len_elements - file_offset) as usize;
                let take = min_elements.min(remaining);

                let mut samples = Vec::with_capacity(items.len());
                for (item, reader) in items.iter().zip(readers.iter_mut()) {
                    let mut buf = vec![0u8; take * 8];
                    reader.read_exact(&mut buf).await?;
                    let values: Vec<f64> = buf.chunks_exact(8).map(|c| f64::from_ne_bytes(c.try_into().unwrap())).collect();
                    samples.push((item.clone(), values));
                }

                self.write_samples(file_offset, samples).await?;

                file_offset += take as u64;
                consumed_ticks += take as i64 * sample_period_ticks as i64;

                if let Some(tx) = progress {
                    // consumed_ticks already counts every tick written so far, including this
                    // file's partial progress, so it equals (prior files + relative*current).
                    let _ = tx.send(consumed_ticks as f64 / total_ticks).await;
                }
            }

            self.close_file().await?;
            cursor = file_end;
        }
        Ok(())
    }

    async fn open_file(
        &self,
        file_begin_ticks: i64,
        file_period_ticks: u64,
        sample_period_ticks: u64,
        items: &[CatalogItem],
    ) -> NexusResult<()> {
        let mut guard = self.inner.lock().await;
        require_initialized(&self.type_id, &guard)?;
        if let Err(e) = guard.writer.open(file_begin_ticks, file_period_ticks, sample_period_ticks, items).await {
            guard.state = WriterState::Poisoned;
            error!(writer = %self.type_id, error = %e, "writer open failed; controller poisoned");
            return Err(NexusError::ExtensionRuntime { source_id: self.type_id.clone(), message: e.to_string() });
        }
        Ok(())
    }

    async fn write_samples(&self, file_offset: u64, samples: Vec<(CatalogItem, Vec<f64>)>) -> NexusResult<()> {
        let mut guard = self.inner.lock().await;
        require_initialized(&self.type_id, &guard)?;
        if let Err(e) = guard.writer.write(file_offset, samples).await {
            guard.state = WriterState::Poisoned;
            error!(writer = %self.type_id, error = %e, "writer write failed; controller poisoned");
            return Err(NexusError::ExtensionRuntime { source_id: self.type_id.clone(), message: e.to_string() });
        }
        Ok(())
    }

    async fn close_file(&self) -> NexusResult<()> {
        let mut guard = self.inner.lock().await;
        if let Err(e) = guard.writer.close().await {
            guard.state = WriterState::Poisoned;
            error!(writer = %self.type_id, error = %e, "writer close failed; controller poisoned");
            return Err(NexusError::ExtensionRuntime { source_id: self.type_id.clone(), message: e.to_string() });
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = WriterState::Disposed;
    }
}

fn require_initialized(type_id: &str, inner: &WriterInner) -> NexusResult<()> {
    match inner.state {
        WriterState::Initialized => Ok(()),
        WriterState::Poisoned => Err(NexusError::Internal(format!("writer controller {type_id} is poisoned by a prior error"))),
        other => Err(NexusError::Internal(format!("writer controller {type_id} used before initialization (state {other:?})"))),
    }
}

fn validate_writer_preconditions(
    begin: i64,
    end: i64,
    sample_period_ticks: u64,
    file_period_ticks: u64,
    requests: &[(CatalogItem, PipeReader)],
) -> NexusResult<()> {
    if requests.is_empty() {
        return Err(NexusError::Validation("writer controller run called with no requests".into()));
    }
    if end <= begin {
        return Err(NexusError::Validation("writer controller window must be non-empty".into()));
    }
    if begin % sample_period_ticks as i64 != 0 {
        return Err(NexusError::Validation("writer controller begin is not aligned to sample_period".into()));
    }
    if file_period_ticks % sample_period_ticks != 0 {
        return Err(NexusError::Validation("file_period must be a multiple of sample_period".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nexus_core::model::{Catalog, NexusDataType, Representation, RepresentationKind, Resource};
    use std::sync::Arc as StdArc;
    use std::sync::Mutex as StdMutex;

    use crate::pipe::pipe;

    struct RecordingWriter {
        opened: StdArc<StdMutex<Vec<(i64, u64)>>>,
        written: StdArc<StdMutex<Vec<(u64, usize)>>>,
        closed: StdArc<StdMutex<u32>>,
    }

    #[async_trait]
    impl DataWriter for RecordingWriter {
        async fn set_context(&mut self, _ctx: PluginContext) -> NexusResult<()> {
            Ok(())
        }
        async fn open(&mut self, file_begin_ticks: i64, file_period_ticks: u64, _sample_period_ticks: u64, _items: &[CatalogItem]) -> NexusResult<()> {
            self.opened.lock().unwrap().push((file_begin_ticks, file_period_ticks));
            Ok(())
        }
        async fn write(&mut self, file_offset: u64, samples: Vec<(CatalogItem, Vec<f64>)>) -> NexusResult<()> {
            self.written.lock().unwrap().push((file_offset, samples[0].1.len()));
            Ok(())
        }
        async fn close(&mut self) -> NexusResult<()> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn item() -> CatalogItem {
        let catalog = StdArc::new(Catalog::new("/c").unwrap());
        let resource = StdArc::new(Resource::new("r"));
        let representation = StdArc::new(Representation {
            data_type: NexusDataType::F64,
            sample_period_ticks: 10_000_000,
            kind: RepresentationKind::Original,
            parameters: None,
        });
        CatalogItem { catalog, resource, representation, parameters: None }
    }

    #[tokio::test]
    async fn scenario_file_boundaries_match_two_files() {
        let opened = StdArc::new(StdMutex::new(Vec::new()));
        let written = StdArc::new(StdMutex::new(Vec::new()));
        let closed = StdArc::new(StdMutex::new(0u32));
        let controller = WriterController::new(
            "recording",
            Box::new(RecordingWriter { opened: opened.clone(), written: written.clone(), closed: closed.clone() }),
        );
        controller.initialize(Value::Null, None).await.unwrap();

        let sample_period = 10_000_000u64; // 1s
        let file_period = 5 * sample_period; // 5s files
        let begin = 0i64;
        let end = 10 * sample_period as i64; // two files

        let (writer_half, reader_half) = pipe(16);
        tokio::spawn(async move {
            for i in 0..10u8 {
                writer_half.write_chunk(bytes::Bytes::copy_from_slice(&(i as f64).to_ne_bytes())).await.unwrap();
            }
        });

        let cancel = CancellationToken::new();
        controller
            .run(begin, end, sample_period, file_period, vec![(item(), reader_half)], cancel, None)
            .await
            .unwrap();

        assert_eq!(*opened.lock().unwrap(), vec![(0, file_period), (file_period as i64, file_period)]);
        assert_eq!(*closed.lock().unwrap(), 2);
        let total_written: usize = written.lock().unwrap().iter().map(|(_, n)| n).sum();
        assert_eq!(total_written, 10);
    }

    #[tokio::test]
    async fn progress_reaches_one_at_completion() {
        let opened = StdArc::new(StdMutex::new(Vec::new()));
        let written = StdArc::new(StdMutex::new(Vec::new()));
        let closed = StdArc::new(StdMutex::new(0u32));
        let controller = WriterController::new(
            "recording",
            Box::new(RecordingWriter { opened, written, closed }),
        );
        controller.initialize(Value::Null, None).await.unwrap();

        let sample_period = 10_000_000u64;
        let file_period = 4 * sample_period;
        let begin = 0i64;
        let end = 4 * sample_period as i64;

        let (writer_half, reader_half) = pipe(16);
        tokio::spawn(async move {
            for i in 0..4u8 {
                writer_half.write_chunk(bytes::Bytes::copy_from_slice(&(i as f64).to_ne_bytes())).await.unwrap();
            }
        });

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        controller
            .run(begin, end, sample_period, file_period, vec![(item(), reader_half)], cancel, Some(tx))
            .await
            .unwrap();

        let mut last = 0.0;
        while let Ok(v) = rx.try_recv() {
            last = v;
        }
        assert!((last - 1.0).abs() < 1e-9);
    }
}
