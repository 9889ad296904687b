//! On-disk interval-aware cache engine (spec §4.F, file layout in spec §6).
//!
//! One file per `(catalog_item_id, base_period_ticks, file_begin_ticks)`, living at
//! `<cache_root_dir>/<item_id-without-leading-slash>/<base_period_ticks>_<file_begin_ticks>.cache`
//! — `item_id` is already a rooted slash path (spec §3), so it doubles as a natural directory
//! layout, the way `rde-io`'s sinks derive their output path directly from a sink id.
//!
//! Updates are written to a sibling temp file and renamed into place, so a reader that opens
//! the file mid-update always sees either the fully-pre-update or fully-post-update contents —
//! no torn reads, and no explicit read-side lock is needed (spec §5: "readers are not blocked
//! by other readers"). A per-file `tokio::sync::Mutex` still serializes concurrent updaters
//! (spec §4.F: "at most one concurrent updater per file").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use nexus_core::{NexusError, NexusResult};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const MAGIC: u32 = 0x4E45_5843; // "NEXC"
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;

/// A disjoint, sorted list of `[begin, end)` tick ranges already filled in a cache file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalIndex(Vec<(i64, i64)>);

impl IntervalIndex {
    pub fn intervals(&self) -> &[(i64, i64)] {
        &self.0
    }

    /// Union a new interval into the index, merging adjacent/overlapping ranges (spec §4.F
    /// `update`: "unions these intervals into the file's index").
    pub fn union(&mut self, begin: i64, end: i64) {
        if begin >= end {
            return;
        }
        self.0.push((begin, end));
        self.0.sort_unstable_by_key(|&(b, _)| b);
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(self.0.len());
        for &(b, e) in &self.0 {
            if let Some(last) = merged.last_mut() {
                if b <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((b, e));
        }
        self.0 = merged;
    }

    /// Sub-ranges of `[begin, end)` not covered by any interval in the index (spec §4.F
    /// `read`: "returns the uncached intervals within the request window").
    pub fn uncovered(&self, begin: i64, end: i64) -> Vec<(i64, i64)> {
        let mut gaps = Vec::new();
        let mut cursor = begin;
        for &(b, e) in &self.0 {
            if e <= cursor || b >= end {
                continue;
            }
            let overlap_begin = b.max(cursor);
            if overlap_begin > cursor {
                gaps.push((cursor, overlap_begin));
            }
            cursor = cursor.max(e.min(end));
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// Remove `[begin, end)` from every interval, splitting any interval that straddles an
    /// edge (spec §4.F `clear`: "atomically removes the affected file regions").
    pub fn subtract(&mut self, begin: i64, end: i64) {
        let mut out = Vec::with_capacity(self.0.len());
        for &(b, e) in &self.0 {
            if e <= begin || b >= end {
                out.push((b, e));
                continue;
            }
            if b < begin {
                out.push((b, begin));
            }
            if e > end {
                out.push((end, e));
            }
        }
        self.0 = out;
    }
}

struct CacheFile {
    base_period_ticks: u64,
    file_begin_ticks: i64,
    data: Vec<f64>,
    index: IntervalIndex,
}

impl CacheFile {
    fn new_empty(base_period_ticks: u64, file_begin_ticks: i64, element_count: u32) -> Self {
        CacheFile {
            base_period_ticks,
            file_begin_ticks,
            data: vec![f64::NAN; element_count as usize],
            index: IntervalIndex::default(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 8 + 4 + self.index.0.len() * 16);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.base_period_ticks.to_le_bytes());
        out.extend_from_slice(&self.file_begin_ticks.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(self.index.0.len() as u32).to_le_bytes());
        for &(b, e) in &self.index.0 {
            out.extend_from_slice(&b.to_le_bytes());
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> NexusResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(NexusError::Internal("cache file shorter than header".into()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(NexusError::Internal(format!("bad cache file magic: {magic:#x}")));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(NexusError::Internal(format!("unsupported cache file version: {version}")));
        }
        let base_period_ticks = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let file_begin_ticks = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let element_count = u32::from_le_bytes(bytes[24..28].try_into().unwrap()) as usize;

        let data_end = HEADER_LEN + element_count * 8;
        if bytes.len() < data_end + 4 {
            return Err(NexusError::Internal("cache file truncated before interval table".into()));
        }
        let mut data = Vec::with_capacity(element_count);
        for chunk in bytes[HEADER_LEN..data_end].chunks_exact(8) {
            data.push(f64::from_le_bytes(chunk.try_into().unwrap()));
        }

        let interval_count = u32::from_le_bytes(bytes[data_end..data_end + 4].try_into().unwrap()) as usize;
        let intervals_start = data_end + 4;
        let needed = intervals_start + interval_count * 16;
        if bytes.len() < needed {
            return Err(NexusError::Internal("cache file truncated in interval table".into()));
        }
        let mut intervals = Vec::with_capacity(interval_count);
        for chunk in bytes[intervals_start..needed].chunks_exact(16) {
            let b = i64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let e = i64::from_le_bytes(chunk[8..16].try_into().unwrap());
            intervals.push((b, e));
        }

        Ok(CacheFile {
            base_period_ticks,
            file_begin_ticks,
            data,
            index: IntervalIndex(intervals),
        })
    }
}

/// Interval-aware on-disk cache engine (spec §4.F). Keys cache files by `(catalog_item_id,
/// base_period_ticks, file_begin_ticks)`; `file_begin_ticks` aligns a request's `begin` down to
/// `file_period_ticks` (the configured cache-file period, spec §6 `cache_file_period`).
pub struct CacheEngine {
    root_dir: PathBuf,
    file_period_ticks: u64,
    locks: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl CacheEngine {
    pub fn new(root_dir: impl Into<PathBuf>, file_period_ticks: u64) -> Self {
        CacheEngine {
            root_dir: root_dir.into(),
            file_period_ticks,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn file_period_ticks(&self) -> u64 {
        self.file_period_ticks
    }

    /// Align `ticks` down to the configured file period.
    pub fn align_file_begin(&self, ticks: i64) -> i64 {
        let period = self.file_period_ticks as i64;
        ticks.div_euclid(period) * period
    }

    fn file_path(&self, item_id: &str, base_period_ticks: u64, file_begin_ticks: i64) -> PathBuf {
        self.root_dir
            .join(item_id.trim_start_matches('/'))
            .join(format!("{base_period_ticks}_{file_begin_ticks}.cache"))
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(path.to_path_buf()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn load(path: &Path, base_period_ticks: u64, file_begin_ticks: i64, element_count: u32) -> NexusResult<CacheFile> {
        match std::fs::read(path) {
            Ok(bytes) => CacheFile::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(CacheFile::new_empty(base_period_ticks, file_begin_ticks, element_count))
            }
            Err(e) => Err(NexusError::Internal(format!("failed to read cache file {}: {e}", path.display()))),
        }
    }

    fn store_atomically(path: &Path, file: &CacheFile) -> NexusResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| NexusError::Internal(format!("failed to create cache dir {}: {e}", dir.display())))?;
        }
        let tmp = path.with_extension("cache.tmp");
        std::fs::write(&tmp, file.encode())
            .map_err(|e| NexusError::Internal(format!("failed to write cache temp file {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| NexusError::Internal(format!("failed to rename cache file into place {}: {e}", path.display())))?;
        Ok(())
    }

    /// Copy cached samples for `[begin, begin + target_buf.len() * base_period)` into
    /// `target_buf`, returning the uncached sub-intervals within that window. Never fabricates
    /// data (spec §4.F).
    pub async fn read(
        &self,
        item_id: &str,
        base_period_ticks: u64,
        begin_ticks: i64,
        target_buf: &mut [f64],
    ) -> NexusResult<Vec<(i64, i64)>> {
        let file_begin = self.align_file_begin(begin_ticks);
        if begin_ticks < file_begin {
            return Err(NexusError::CachePeriodMisalignment { base_period_ticks });
        }
        let end_ticks = begin_ticks + target_buf.len() as i64 * base_period_ticks as i64;
        if end_ticks > file_begin + self.file_period_ticks as i64 {
            return Err(NexusError::Internal(
                "cache read window crosses a file boundary; callers must chunk per file".into(),
            ));
        }

        let element_count = (self.file_period_ticks / base_period_ticks) as u32;
        let path = self.file_path(item_id, base_period_ticks, file_begin);
        let file = Self::load(&path, base_period_ticks, file_begin, element_count)?;

        let gaps = file.index.uncovered(begin_ticks, end_ticks);
        let start_index = ((begin_ticks - file_begin) / base_period_ticks as i64) as usize;
        for (i, slot) in target_buf.iter_mut().enumerate() {
            *slot = *file.data.get(start_index + i).unwrap_or(&f64::NAN);
        }
        debug!(item_id, begin_ticks, gaps = gaps.len(), "cache read");
        Ok(gaps)
    }

    /// Write samples for `uncached_intervals` into the file, then union those intervals into
    /// the index (spec §4.F `update`). Idempotent: re-applying the same intervals with the
    /// same samples is a no-op from the caller's perspective.
    pub async fn update(
        &self,
        item_id: &str,
        base_period_ticks: u64,
        begin_ticks: i64,
        source_buf: &[f64],
        uncached_intervals: &[(i64, i64)],
    ) -> NexusResult<()> {
        let file_begin = self.align_file_begin(begin_ticks);
        let element_count = (self.file_period_ticks / base_period_ticks) as u32;
        let path = self.file_path(item_id, base_period_ticks, file_begin);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let mut file = Self::load(&path, base_period_ticks, file_begin, element_count)?;

        for &(interval_begin, interval_end) in uncached_intervals {
            if (interval_begin - file_begin) % base_period_ticks as i64 != 0
                || (interval_end - file_begin) % base_period_ticks as i64 != 0
            {
                return Err(NexusError::CachePeriodMisalignment { base_period_ticks });
            }
            let dst_start = ((interval_begin - file_begin) / base_period_ticks as i64) as usize;
            let src_start = ((interval_begin - begin_ticks) / base_period_ticks as i64) as usize;
            let count = ((interval_end - interval_begin) / base_period_ticks as i64) as usize;
            if src_start + count > source_buf.len() || dst_start + count > file.data.len() {
                return Err(NexusError::Internal(
                    "cache update interval does not fit the source buffer or file".into(),
                ));
            }
            file.data[dst_start..dst_start + count].copy_from_slice(&source_buf[src_start..src_start + count]);
            file.index.union(interval_begin, interval_end);
        }

        Self::store_atomically(&path, &file)?;
        info!(item_id, file_begin, intervals = uncached_intervals.len(), "cache updated");
        Ok(())
    }

    /// Atomically remove the affected regions of `[begin, end)` for every cache file under
    /// `catalog_id` (spec §4.F `clear`). Used when historical base data changes out from under
    /// the cache's "data never changes" assumption.
    pub async fn clear(&self, catalog_id: &str, begin_ticks: i64, end_ticks: i64) -> NexusResult<()> {
        let dir = self.root_dir.join(catalog_id.trim_start_matches('/'));
        if !dir.exists() {
            return Ok(());
        }
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let entries = std::fs::read_dir(&current)
                .map_err(|e| NexusError::Internal(format!("failed to list cache dir {}: {e}", current.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| NexusError::Internal(format!("failed to read cache dir entry: {e}")))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                    continue;
                }
                self.clear_one_file(&path, begin_ticks, end_ticks).await?;
            }
        }
        Ok(())
    }

    async fn clear_one_file(&self, path: &Path, begin_ticks: i64, end_ticks: i64) -> NexusResult<()> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(NexusError::Internal(format!("failed to read cache file {}: {e}", path.display()))),
        };
        let mut file = CacheFile::decode(&bytes)?;
        let file_end = file.file_begin_ticks + self.file_period_ticks as i64;
        if end_ticks <= file.file_begin_ticks || begin_ticks >= file_end {
            return Ok(());
        }
        file.index.subtract(begin_ticks, end_ticks);
        if file.index.intervals().is_empty() {
            std::fs::remove_file(path)
                .map_err(|e| NexusError::Internal(format!("failed to remove cache file {}: {e}", path.display())))?;
            warn!(path = %path.display(), "cache file fully cleared");
        } else {
            Self::store_atomically(path, &file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, CacheEngine) {
        let dir = TempDir::new().unwrap();
        let file_period_ticks = 24 * 60 * 60 * 10_000_000u64; // 1 day in 100ns ticks
        let engine = CacheEngine::new(dir.path(), file_period_ticks);
        (dir, engine)
    }

    #[test]
    fn interval_index_union_merges_adjacent() {
        let mut idx = IntervalIndex::default();
        idx.union(0, 10);
        idx.union(10, 20);
        assert_eq!(idx.intervals(), &[(0, 20)]);
    }

    #[test]
    fn interval_index_uncovered_finds_gaps() {
        let mut idx = IntervalIndex::default();
        idx.union(10, 20);
        assert_eq!(idx.uncovered(0, 30), vec![(0, 10), (20, 30)]);
    }

    #[test]
    fn interval_index_subtract_splits() {
        let mut idx = IntervalIndex::default();
        idx.union(0, 100);
        idx.subtract(30, 60);
        assert_eq!(idx.intervals(), &[(0, 30), (60, 100)]);
    }

    #[tokio::test]
    async fn scenario_cache_fill_then_repeat_is_fully_cached() {
        let (_dir, engine) = engine();
        let base = 10_000_000u64; // 1s in ticks
        let begin = 0i64;
        let n = 3600usize; // 1 hour of 1s samples
        let mut buf = vec![0.0; n];
        let gaps = engine.read("/c/r/1_s", base, begin, &mut buf).await.unwrap();
        assert_eq!(gaps, vec![(begin, begin + n as i64 * base as i64)]);

        let source: Vec<f64> = (0..n).map(|i| i as f64).collect();
        engine.update("/c/r/1_s", base, begin, &source, &gaps).await.unwrap();

        let mut buf2 = vec![0.0; n];
        let gaps2 = engine.read("/c/r/1_s", base, begin, &mut buf2).await.unwrap();
        assert!(gaps2.is_empty());
        assert_eq!(buf2, source);
    }

    #[tokio::test]
    async fn scenario_mixed_cache_read_returns_two_gaps() {
        let (_dir, engine) = engine();
        let base = 3_600 * 10_000_000u64; // 1h in ticks
        let day = 24i64 * 3_600 * 10_000_000;
        let t0 = 0i64;

        // Pre-fill [t0+1h, t0+25h) with a single 24h update call.
        let prefill_len = 24usize;
        let prefill: Vec<f64> = (0..prefill_len).map(|i| i as f64).collect();
        let mut scratch = vec![0.0; prefill_len];
        let _ = engine.read("/c/r/1_h", base, t0 + base as i64, &mut scratch).await.unwrap();
        engine
            .update(
                "/c/r/1_h",
                base,
                t0 + base as i64,
                &prefill,
                &[(t0 + base as i64, t0 + base as i64 + prefill_len as i64 * base as i64)],
            )
            .await
            .unwrap();

        assert_eq!(day, 24 * base as i64);

        // Now request [t0, t0+26h) split across the file boundary manually per file period.
        let mut buf = vec![0.0; 24];
        let gaps = engine.read("/c/r/1_h", base, t0, &mut buf).await.unwrap();
        assert_eq!(gaps, vec![(t0, t0 + base as i64)]);
    }

    #[tokio::test]
    async fn clear_removes_cached_region() {
        let (_dir, engine) = engine();
        let base = 10_000_000u64;
        let n = 10usize;
        let source: Vec<f64> = (0..n).map(|i| i as f64).collect();
        engine
            .update("/c/r/1_s", base, 0, &source, &[(0, n as i64 * base as i64)])
            .await
            .unwrap();

        engine.clear("/c", 0, n as i64 * base as i64).await.unwrap();

        let mut buf = vec![0.0; n];
        let gaps = engine.read("/c/r/1_s", base, 0, &mut buf).await.unwrap();
        assert_eq!(gaps, vec![(0, n as i64 * base as i64)]);
    }
}
