//! Read scheduler (spec §4.H): cross-source pipelined `read` over chunked sub-periods with
//! back-pressure. This is the teacher's `rde-cli::main` pipeline-wiring logic (channels +
//! `CancellationToken` + `tokio::spawn` fan-out) lifted out of a binary and generalized into a
//! reusable library, the way `rde-tx`'s operators generalize ad hoc stream processing.

use std::sync::Arc;

use nexus_core::{CatalogItemRequest, NexusError, NexusResult, ReadRequest};
use nexus_storage::{CacheEngine, MemoryTracker};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::decorate;
use crate::controller::SourceControllerHandle;
use crate::pipe::{pipe, PipeReader, PipeWriter};

/// One request in a reading group: the resolved item plus the pipe its decoded `f64` output
/// should be written to (spec §4.H).
pub struct ReadSlot {
    pub request: CatalogItemRequest,
    pub writer: PipeWriter,
}

/// A set of requests sharing one source controller, scheduled together (glossary "Reading
/// group"). Within a group, reads and cache writes are sequential; across groups they run in
/// parallel (spec §5).
pub struct DataReadingGroup {
    pub controller: Arc<SourceControllerHandle>,
    pub slots: Vec<ReadSlot>,
}

/// Fixed byte overhead added atop the computed buffer sizes when sizing a memory tracker grant
/// (spec §4.H: "the bytes required by the group's raw buffers plus its cache buffers plus a
/// constant overhead"). Covers per-chunk bookkeeping, not tuned to any particular workload.
const CHUNK_OVERHEAD_BYTES: usize = 4096;

/// Chunk multiplier ceiling: caps how many multiples of the group's smallest common period one
/// chunk may span, so a very generous memory ceiling doesn't produce an unboundedly large
/// single chunk that defeats pipelining.
const MAX_CHUNK_MULTIPLIER: u64 = 4096;

pub struct ReadScheduler {
    tracker: Arc<MemoryTracker>,
    cache: Arc<CacheEngine>,
}

impl ReadScheduler {
    pub fn new(tracker: Arc<MemoryTracker>, cache: Arc<CacheEngine>) -> Arc<Self> {
        Arc::new(ReadScheduler { tracker, cache })
    }

    /// Spawn a single-item stream read (spec §4.H `read_as_stream`), returning a `PipeReader`
    /// whose byte stream is `count(elements) * 8` bytes of native-endian `f64`. The producer
    /// task is cancelled (via `cancel`) if the reader drops the returned handle.
    pub fn read_as_stream(
        self: Arc<Self>,
        begin: i64,
        end: i64,
        controller: Arc<SourceControllerHandle>,
        request: CatalogItemRequest,
        cancel: CancellationToken,
    ) -> PipeReader {
        let (writer, reader) = pipe(8);
        let scheduler = self;
        tokio::spawn(async move {
            let group = DataReadingGroup { controller, slots: vec![ReadSlot { request, writer }] };
            if let Err(e) = scheduler.read(begin, end, vec![group], cancel, None).await {
                warn!(error = %e, "read_as_stream producer task failed");
            }
        });
        reader
    }

    /// The multiplexed form (spec §4.H `read`) used by the writer controller: drives every
    /// group concurrently, each internally sequential. `progress` receives this call's
    /// fractional contribution to the overall `[0,1]` progress range once per chunk, across
    /// every group (spec §8: "summed progress over all chunks equals 1").
    pub async fn read(
        self: Arc<Self>,
        begin: i64,
        end: i64,
        groups: Vec<DataReadingGroup>,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<f64>>,
    ) -> NexusResult<()> {
        if groups.is_empty() {
            return Err(NexusError::Validation("read called with no reading groups".into()));
        }
        if end <= begin {
            return Err(NexusError::Validation("read window must be non-empty".into()));
        }

        let group_count = groups.len();
        let mut handles = Vec::with_capacity(group_count);
        for group in groups {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_group(begin, end, group, cancel, progress).await
            }));
        }

        // First-error-wins (spec §7): surface the first failure, but let every group's task
        // actually finish so pipes complete and resources release deterministically.
        let mut first_err = None;
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| NexusError::Internal(format!("reading group task panicked: {e}")))
                .and_then(|inner| inner);
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_group(
        &self,
        begin: i64,
        end: i64,
        mut group: DataReadingGroup,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<f64>>,
    ) -> NexusResult<()> {
        if group.slots.is_empty() {
            return Err(NexusError::Validation("reading group has no requests".into()));
        }

        let result = self.run_group_inner(begin, end, &mut group, &cancel, &progress).await;
        if let Err(e) = &result {
            for slot in group.slots {
                slot.writer.fail(e.clone()).await;
            }
        }
        result
    }

    async fn run_group_inner(
        &self,
        begin: i64,
        end: i64,
        group: &mut DataReadingGroup,
        cancel: &CancellationToken,
        progress: &Option<mpsc::Sender<f64>>,
    ) -> NexusResult<()> {
        let total_ticks = (end - begin) as f64;
        let base_unit = common_period(group);
        let file_period_ticks = self.cache.file_period_ticks() as i64;

        let mut cursor = begin;
        while cursor < end {
            if cancel.is_cancelled() {
                return Err(NexusError::Cancelled);
            }

            let next_file_boundary = self.cache.align_file_begin(cursor) + file_period_ticks;
            let max_chunk_end = end.min(next_file_boundary);
            let bytes_per_unit = bytes_per_period_unit(group, base_unit);
            let max_multiplier = ((max_chunk_end - cursor) as u64 / base_unit).max(1).min(MAX_CHUNK_MULTIPLIER);
            let min_bytes = bytes_per_unit + CHUNK_OVERHEAD_BYTES;

            if min_bytes as u64 > self.tracker.ceiling() {
                return Err(NexusError::ResourceExhaustion {
                    requested_min: min_bytes,
                });
            }

            let grant = self
                .tracker
                .clone()
                .register_allocation(
                    min_bytes,
                    bytes_per_unit * max_multiplier as usize + CHUNK_OVERHEAD_BYTES,
                    cancel,
                )
                .await?;

            let affordable_multiplier = ((grant.actual().saturating_sub(CHUNK_OVERHEAD_BYTES)) / bytes_per_unit.max(1))
                .max(1) as u64;
            let multiplier = affordable_multiplier.min(max_multiplier);
            let chunk_end = (cursor + multiplier as i64 * base_unit as i64).min(max_chunk_end);

            debug!(cursor, chunk_end, multiplier, "scheduler chunk");
            self.process_chunk(cursor, chunk_end, group, cancel).await?;
            drop(grant);

            if let Some(tx) = progress {
                let fraction = (chunk_end - cursor) as f64 / total_ticks;
                let _ = tx.send(fraction).await;
            }

            cursor = chunk_end;
        }
        Ok(())
    }

    async fn process_chunk(
        &self,
        chunk_begin: i64,
        chunk_end: i64,
        group: &mut DataReadingGroup,
        cancel: &CancellationToken,
    ) -> NexusResult<()> {
        for slot in &mut group.slots {
            if cancel.is_cancelled() {
                return Err(NexusError::Cancelled);
            }
            let output_period = slot.request.item.representation.sample_period_ticks;
            let output_len = ((chunk_end - chunk_begin) / output_period as i64) as usize;
            let item_id = slot.request.item.item_id();

            let mut output_buf = vec![0.0f64; output_len];
            let gaps = self.cache.read(&item_id, output_period, chunk_begin, &mut output_buf).await?;

            for &(gap_begin, gap_end) in &gaps {
                let raw_period = raw_period_of(&slot.request);
                let raw_dtype = raw_dtype_of(&slot.request);
                let element_count = ((gap_end - gap_begin) / raw_period as i64) as usize;
                let mut raw_requests = vec![ReadRequest {
                    item: slot
                        .request
                        .base_item
                        .clone()
                        .unwrap_or_else(|| slot.request.item.clone()),
                    data: vec![0u8; element_count * raw_dtype.element_size()],
                    status: vec![0u8; element_count],
                }];

                group.controller.read_raw(gap_begin, gap_end, &mut raw_requests).await?;

                let output_gap_len = ((gap_end - gap_begin) / output_period as i64) as usize;
                let decoded = decorate(
                    &slot.request,
                    &raw_requests[0].data,
                    &raw_requests[0].status,
                    gap_begin,
                    output_gap_len,
                )?;

                let offset = ((gap_begin - chunk_begin) / output_period as i64) as usize;
                output_buf[offset..offset + decoded.len()].copy_from_slice(&decoded);
            }

            if !gaps.is_empty() {
                self.cache.update(&item_id, output_period, chunk_begin, &output_buf, &gaps).await?;
            }

            let mut bytes = Vec::with_capacity(output_buf.len() * 8);
            for v in &output_buf {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            slot.writer.write_chunk(bytes.into()).await?;
        }
        Ok(())
    }
}

/// The period at which raw bytes are actually produced by the source for this request: the
/// base representation's period if set (aggregated/resampled), else the item's own period
/// (`Original`, spec §4.D).
fn raw_period_of(request: &CatalogItemRequest) -> u64 {
    request
        .base_item
        .as_ref()
        .map(|b| b.representation.sample_period_ticks)
        .unwrap_or(request.item.representation.sample_period_ticks)
}

fn raw_dtype_of(request: &CatalogItemRequest) -> nexus_core::NexusDataType {
    request
        .base_item
        .as_ref()
        .map(|b| b.representation.data_type)
        .unwrap_or(request.item.representation.data_type)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// The smallest chunk-period unit a group's chunks must be a multiple of: the LCM of every
/// slot's raw base period and output period, so every slot's cache window and raw-read window
/// align on chunk boundaries (spec §4.H: "`P_base` = lcm of base periods").
fn common_period(group: &DataReadingGroup) -> u64 {
    group.slots.iter().fold(1u64, |acc, slot| {
        lcm(lcm(acc, raw_period_of(&slot.request)), slot.request.item.representation.sample_period_ticks)
    })
}

/// Total bytes (raw input buffers + cache/output buffers) needed for one `period_unit`-ticks
/// slice of every slot in the group.
fn bytes_per_period_unit(group: &DataReadingGroup, period_unit: u64) -> usize {
    group
        .slots
        .iter()
        .map(|slot| {
            let raw_period = raw_period_of(&slot.request);
            let raw_elems = (period_unit / raw_period).max(1) as usize;
            let raw_bytes = raw_elems * raw_dtype_of(&slot.request).element_size();

            let output_period = slot.request.item.representation.sample_period_ticks;
            let output_elems = (period_unit / output_period).max(1) as usize;
            let output_bytes = output_elems * 8;

            raw_bytes + output_bytes
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nexus_core::model::{Catalog, CatalogItem, NexusDataType, Representation, Resource};
    use nexus_core::tree::CatalogRegistration;
    use nexus_core::{Catalog as _Catalog, DataSource, PluginContext, RepresentationKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use tempfile::TempDir;

    struct CountingSource {
        reads: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn set_context(&mut self, _ctx: PluginContext) -> NexusResult<()> {
            Ok(())
        }
        async fn get_catalog_registrations(&self, _path: &str) -> NexusResult<Vec<CatalogRegistration>> {
            Ok(vec![])
        }
        async fn enrich_catalog(&self, catalog: Catalog) -> NexusResult<Catalog> {
            Ok(catalog)
        }
        async fn get_time_range(&self, _catalog_id: &str) -> NexusResult<(i64, i64)> {
            Ok((0, 0))
        }
        async fn get_availability(&self, _catalog_id: &str, _begin: i64, _end: i64) -> NexusResult<Vec<f64>> {
            Ok(vec![])
        }
        async fn read(&mut self, begin: i64, _end: i64, requests: &mut [ReadRequest]) -> NexusResult<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let period = requests[0].item.representation.sample_period_ticks as i64;
            for req in requests {
                for (i, s) in req.status.iter_mut().enumerate() {
                    *s = 1;
                    let v = ((begin / period) as usize + i) as f64;
                    req.data[i * 8..(i + 1) * 8].copy_from_slice(&v.to_ne_bytes());
                }
            }
            Ok(())
        }
    }

    fn original_item(period_ticks: u64) -> CatalogItem {
        let catalog = StdArc::new(_Catalog::new("/c").unwrap());
        let resource = StdArc::new(Resource::new("r"));
        let representation = StdArc::new(Representation {
            data_type: NexusDataType::F64,
            sample_period_ticks: period_ticks,
            kind: RepresentationKind::Original,
            parameters: None,
        });
        CatalogItem { catalog, resource, representation, parameters: None }
    }

    #[tokio::test]
    async fn scenario_cache_fill_then_repeat_skips_source_read() {
        let dir = TempDir::new().unwrap();
        let cache = StdArc::new(CacheEngine::new(dir.path(), 24 * 60 * 60 * 10_000_000));
        let tracker = MemoryTracker::new(1024 * 1024);
        let scheduler = ReadScheduler::new(tracker, cache);

        let reads = StdArc::new(AtomicUsize::new(0));
        let controller =
            SourceControllerHandle::new("counting", Box::new(CountingSource { reads: reads.clone() }));
        controller.initialize(serde_json::Value::Null, None).await.unwrap();

        let period = 3_600 * 10_000_000u64; // 1h
        let begin = 0i64;
        let end = 24 * 3_600 * 10_000_000i64; // 24h

        let item = original_item(period);
        let request = CatalogItemRequest::new(item, None).unwrap();
        let cancel = CancellationToken::new();
        let reader = scheduler.clone().read_as_stream(begin, end, controller.clone(), request.clone(), cancel.clone());
        let total_bytes = 24 * 8;
        let mut buf = vec![0u8; total_bytes];
        let mut reader = reader;
        reader.read_exact(&mut buf).await.unwrap();
        assert!(reads.load(Ordering::SeqCst) >= 1);

        let reads_before_repeat = reads.load(Ordering::SeqCst);
        let reader2 = scheduler.read_as_stream(begin, end, controller, request, cancel);
        let mut buf2 = vec![0u8; total_bytes];
        let mut reader2 = reader2;
        reader2.read_exact(&mut buf2).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), reads_before_repeat, "repeat read must not invoke source again");
        assert_eq!(buf, buf2);
    }

    #[tokio::test]
    async fn progress_sums_to_one() {
        let dir = TempDir::new().unwrap();
        let cache = StdArc::new(CacheEngine::new(dir.path(), 24 * 60 * 60 * 10_000_000));
        // Ceiling comfortably clears `bytes_per_unit + CHUNK_OVERHEAD_BYTES` (the per-chunk
        // minimum) but is well under the whole-range request, forcing several small chunks.
        let tracker = MemoryTracker::new(4200);
        let scheduler = ReadScheduler::new(tracker, cache);

        let reads = StdArc::new(AtomicUsize::new(0));
        let controller =
            SourceControllerHandle::new("counting", Box::new(CountingSource { reads: reads.clone() }));
        controller.initialize(serde_json::Value::Null, None).await.unwrap();

        let period = 10_000_000u64; // 1s
        let begin = 0i64;
        let end = 10 * period as i64;
        let item = original_item(period);
        let request = CatalogItemRequest::new(item, None).unwrap();
        let (writer, mut reader) = pipe(64);
        let group = DataReadingGroup { controller, slots: vec![ReadSlot { request, writer }] };
        let (tx, mut rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move { scheduler.read(begin, end, vec![group], cancel, Some(tx)).await });

        let mut total = vec![0u8; 10 * 8];
        reader.read_exact(&mut total).await.unwrap();
        handle.await.unwrap().unwrap();

        let mut sum = 0.0;
        while let Ok(frac) = rx.try_recv() {
            sum += frac;
        }
        assert!((sum - 1.0).abs() < 1e-9, "progress summed to {sum}");
    }
}
