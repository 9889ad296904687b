//! Data source and data writer plugin contracts (spec §4.D, §4.I, §6).
//!
//! These are the only traits a third-party extension has to implement. The core never reaches
//! into a plugin's internals beyond this surface — the "object-safe façade" design note in
//! spec §9: a plugin's strongly-typed configuration lives behind `set_context`'s JSON blob,
//! never behind a generic type parameter on the trait itself, so `Box<dyn DataSource>` stays
//! dyn-compatible the way `rde_core::Source`/`Sink` do for `rde-cli`'s pipeline wiring.

use crate::error::NexusResult;
use crate::model::CatalogItem;
use crate::tree::CatalogRegistration;
use async_trait::async_trait;
use serde_json::Value;

/// Context handed to a plugin at `set_context` time: its decoded configuration blob plus a
/// resource locator, if the registration carried one (spec §3 `DataSourceDescriptor`).
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub configuration: Value,
    pub resource_locator: Option<String>,
}

/// One read request slot (spec §4.D). The scheduler pre-sizes and zeroes `data`/`status`
/// before calling `read`; the source fills them in place. Postcondition enforced by the
/// controller, not the source: every status byte is 0 or 1, and invalid samples' data bytes
/// are zeroed before any transformation sees them.
pub struct ReadRequest {
    pub item: CatalogItem,
    pub data: Vec<u8>,
    pub status: Vec<u8>,
}

impl ReadRequest {
    pub fn element_count(&self) -> usize {
        self.status.len()
    }
}

/// A pluggable time-series data source (spec §6).
///
/// State machine obligations are enforced by the caller (the source controller in
/// nexus-engine), not by the trait itself: `initialize` is called exactly once before any
/// other method, and no method is called after a `read` returns an error.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Receive this source's decoded configuration. Called exactly once, before any other
    /// method. An error here means the instance must be discarded (spec §7 `ContextInit`).
    async fn set_context(&mut self, ctx: PluginContext) -> NexusResult<()>;

    /// List the catalog registrations this source exposes directly under `path`.
    async fn get_catalog_registrations(&self, path: &str) -> NexusResult<Vec<CatalogRegistration>>;

    /// Enrich a catalog produced by an earlier pipeline stage. For the first stage this is
    /// called with an empty catalog of the same id.
    async fn enrich_catalog(&self, catalog: crate::model::Catalog) -> NexusResult<crate::model::Catalog>;

    /// The time range for which this source can serve data for `catalog_id`.
    async fn get_time_range(&self, catalog_id: &str) -> NexusResult<(i64, i64)>;

    /// Availability fraction in `[0, 1]` per uniform step across `[begin, end)`.
    async fn get_availability(&self, catalog_id: &str, begin: i64, end: i64) -> NexusResult<Vec<f64>>;

    /// Fill `requests` with raw samples for `[begin, end)`. Preconditions (enforced by the
    /// controller before this is ever called): every item's base-representation sample
    /// period divides `end - begin`; `(begin, end)` is aligned to that period; each buffer is
    /// sized exactly `element_count * element_size`/`element_count`.
    async fn read(&mut self, begin: i64, end: i64, requests: &mut [ReadRequest]) -> NexusResult<()>;

    /// Pure function: migrate an old configuration JSON blob to the current schema. Default
    /// is the identity function (no upgrade needed). Must be idempotent and side-effect free.
    fn upgrade_source_configuration(&self, old: Value) -> NexusResult<Value> {
        Ok(old)
    }
}

/// A pluggable sink the writer controller (spec §4.I) drives through one file-period loop.
#[async_trait]
pub trait DataWriter: Send + Sync {
    async fn set_context(&mut self, ctx: PluginContext) -> NexusResult<()>;

    /// Begin a new file spanning `[file_begin, file_begin + file_period_ticks)` at
    /// `sample_period_ticks` resolution, for exactly the given items.
    async fn open(
        &mut self,
        file_begin_ticks: i64,
        file_period_ticks: u64,
        sample_period_ticks: u64,
        items: &[CatalogItem],
    ) -> NexusResult<()>;

    /// Write `samples` for each item at `file_offset` (sample index from file start). Called
    /// with the minimum slice length currently available across all of the file window's
    /// pipes, so multi-byte values are never split across writes.
    async fn write(&mut self, file_offset: u64, samples: Vec<(CatalogItem, Vec<f64>)>) -> NexusResult<()>;

    async fn close(&mut self) -> NexusResult<()>;
}
