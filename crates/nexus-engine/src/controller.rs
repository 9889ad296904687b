//! Source controller (spec §4.D): drives exactly one pluggable `DataSource`, decorating its
//! raw reads into the final `f64` output via the numeric kernels in `nexus-kernels`.
//!
//! State machine: `New -> Initialized -> {Reading*} -> Disposed`; any error inside `read`
//! transitions to `Poisoned`, after which every further call fails fast (spec §4.D). Mirrors
//! `rde-core::Source`'s lifecycle contract, generalized with an explicit state enum because the
//! teacher's `Source::run` is fire-and-forget while a catalog-backed controller is called
//! repeatedly across many chunked reads.

use std::sync::Arc;

use async_trait::async_trait;
use nexus_core::{
    CatalogItem, CatalogItemRequest, DataSource, NexusDataType, NexusError, NexusResult,
    PluginContext, ReadRequest, RepresentationKind,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    New,
    Initialized,
    Poisoned,
    Disposed,
}

/// Wraps an `Arc<dyn DataSource>`-like boxed source plus its lifecycle state behind a
/// `tokio::sync::Mutex` (spec §5: "reads and cache writes are sequential within one reading
/// group" — one mutex per controller serializes `read` calls naturally; spec §4.D's state
/// machine lives here rather than on the trait, so plugins stay simple).
pub struct SourceControllerHandle {
    type_id: String,
    inner: Mutex<ControllerInner>,
}

struct ControllerInner {
    source: Box<dyn DataSource>,
    state: ControllerState,
}

impl SourceControllerHandle {
    pub fn new(type_id: impl Into<String>, source: Box<dyn DataSource>) -> Arc<Self> {
        Arc::new(SourceControllerHandle {
            type_id: type_id.into(),
            inner: Mutex::new(ControllerInner { source, state: ControllerState::New }),
        })
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Decode the registration's configuration JSON, run `upgrade_source_configuration` exactly
    /// once, then call `set_context` (spec §4.D `initialize`). Any failure transitions to
    /// `Poisoned` immediately — the controller must not be usable afterwards.
    pub async fn initialize(&self, configuration: Value, resource_locator: Option<String>) -> NexusResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ControllerState::New {
            return Err(NexusError::Internal(format!(
                "controller {} initialized twice (state {:?})",
                self.type_id, inner.state
            )));
        }

        let upgraded = inner.source.upgrade_source_configuration(configuration).map_err(|e| {
            inner.state = ControllerState::Poisoned;
            NexusError::ConfigUpgrade(format!("{}: {e}", self.type_id))
        })?;

        let ctx = PluginContext { configuration: upgraded, resource_locator };
        match inner.source.set_context(ctx).await {
            Ok(()) => {
                inner.state = ControllerState::Initialized;
                info!(source = %self.type_id, "source controller initialized");
                Ok(())
            }
            Err(e) => {
                inner.state = ControllerState::Poisoned;
                Err(NexusError::ContextInit(format!("{}: {e}", self.type_id)))
            }
        }
    }

    async fn require_initialized<'a>(
        &self,
        inner: &'a mut ControllerInner,
    ) -> NexusResult<&'a mut ControllerInner> {
        match inner.state {
            ControllerState::Initialized => Ok(inner),
            ControllerState::Poisoned => Err(NexusError::Internal(format!(
                "controller {} is poisoned by a prior error",
                self.type_id
            ))),
            other => Err(NexusError::Internal(format!(
                "controller {} used before initialization (state {other:?})",
                self.type_id
            ))),
        }
    }

    pub async fn get_catalog_registrations(&self, path: &str) -> NexusResult<Vec<nexus_core::CatalogRegistration>> {
        let mut guard = self.inner.lock().await;
        let inner = self.require_initialized(&mut guard).await?;
        inner.source.get_catalog_registrations(path).await
    }

    /// Feed `previous` (the prior pipeline stage's catalog, or an empty catalog for stage 0)
    /// into this source's `enrich_catalog` hook, then re-sanitize (spec §4.B).
    pub async fn enrich_catalog(
        &self,
        previous: nexus_core::Catalog,
        stage_index: u32,
    ) -> NexusResult<nexus_core::Catalog> {
        let mut guard = self.inner.lock().await;
        let inner = self.require_initialized(&mut guard).await?;
        let mut enriched = inner.source.enrich_catalog(previous).await?;
        nexus_core::model::sanitize(&mut enriched, stage_index, &self.type_id);
        Ok(enriched)
    }

    pub async fn get_time_range(&self, catalog_id: &str) -> NexusResult<(i64, i64)> {
        let mut guard = self.inner.lock().await;
        let inner = self.require_initialized(&mut guard).await?;
        inner.source.get_time_range(catalog_id).await
    }

    pub async fn get_availability(&self, catalog_id: &str, begin: i64, end: i64) -> NexusResult<Vec<f64>> {
        let mut guard = self.inner.lock().await;
        let inner = self.require_initialized(&mut guard).await?;
        inner.source.get_availability(catalog_id, begin, end).await
    }

    /// Validate preconditions (spec §4.D), call the underlying source's `read`, zero any
    /// invalid samples' data bytes, and poison the controller on any failure so subsequent
    /// calls fail fast.
    pub async fn read_raw(&self, begin: i64, end: i64, requests: &mut [ReadRequest]) -> NexusResult<()> {
        let mut guard = self.inner.lock().await;
        {
            let inner = self.require_initialized(&mut guard).await?;
            validate_read_preconditions(begin, end, requests)?;
            if let Err(e) = inner.source.read(begin, end, requests).await {
                inner.state = ControllerState::Poisoned;
                error!(source = %self.type_id, error = %e, "source read failed; controller poisoned");
                return Err(NexusError::ExtensionRuntime {
                    source_id: self.type_id.clone(),
                    message: e.to_string(),
                });
            }
        }
        enforce_read_postconditions(requests);
        Ok(())
    }

    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = ControllerState::Disposed;
    }
}

fn validate_read_preconditions(begin: i64, end: i64, requests: &[ReadRequest]) -> NexusResult<()> {
    if requests.is_empty() {
        return Err(NexusError::Validation("read called with an empty request set".into()));
    }
    if end <= begin {
        return Err(NexusError::Validation("read window must be non-empty".into()));
    }
    for req in requests {
        let period = req.item.representation.sample_period_ticks as i64;
        if (end - begin) % period != 0 {
            return Err(NexusError::Validation(format!(
                "read window does not divide evenly by base period for {}",
                req.item.item_id()
            )));
        }
        if begin % period != 0 {
            return Err(NexusError::Validation(format!(
                "read window is not aligned to base period for {}",
                req.item.item_id()
            )));
        }
        let element_count = ((end - begin) / period) as usize;
        let element_size = req.item.representation.data_type.element_size();
        if req.data.len() != element_count * element_size {
            return Err(NexusError::Validation(format!(
                "data buffer size mismatch for {}: expected {} got {}",
                req.item.item_id(),
                element_count * element_size,
                req.data.len()
            )));
        }
        if req.status.len() != element_count {
            return Err(NexusError::Validation(format!(
                "status buffer size mismatch for {}: expected {} got {}",
                req.item.item_id(),
                element_count,
                req.status.len()
            )));
        }
    }
    Ok(())
}

/// Zero invalid samples' data bytes before any transformation sees them (spec §4.D
/// postcondition: "invalid samples' data bytes are unspecified but MUST be zeroed").
fn enforce_read_postconditions(requests: &mut [ReadRequest]) {
    for req in requests {
        let element_size = req.item.representation.data_type.element_size();
        for (i, &status) in req.status.iter().enumerate() {
            if status != 0 && status != 1 {
                warn!(
                    item = %req.item.item_id(),
                    status,
                    "source returned a status byte outside {{0,1}}; treating as invalid"
                );
            }
            if status == 0 {
                req.data[i * element_size..(i + 1) * element_size].fill(0);
            }
        }
    }
}

/// Step-2..4 of spec §4.D's read pipeline: convert raw bytes to `f64` and apply resampling or
/// aggregation against the base representation, producing the representation's own-period
/// output. `request.base_item` identifies the raw representation driving the read; `None` means
/// `Original`, where conversion alone suffices.
pub fn decorate(
    request: &CatalogItemRequest,
    raw_data: &[u8],
    raw_status: &[u8],
    output_begin_ticks: i64,
    output_len: usize,
) -> NexusResult<Vec<f64>> {
    let kind = request.item.representation.kind;
    let dtype_for_conversion = request
        .base_item
        .as_ref()
        .map(|b| b.representation.data_type)
        .unwrap_or(request.item.representation.data_type);

    match kind {
        RepresentationKind::Original => {
            let element_count = raw_status.len();
            let mut converted = vec![0.0f64; element_count];
            nexus_kernels::convert_to_f64(raw_data, raw_status, dtype_for_conversion, &mut converted)?;
            if converted.len() != output_len {
                return Err(NexusError::Internal(
                    "Original read produced an unexpected element count".into(),
                ));
            }
            Ok(converted)
        }
        RepresentationKind::Resampled => {
            let element_count = raw_status.len();
            let mut converted = vec![0.0f64; element_count];
            nexus_kernels::convert_to_f64(raw_data, raw_status, dtype_for_conversion, &mut converted)?;
            let base = request
                .base_item
                .as_ref()
                .ok_or_else(|| NexusError::Internal("Resampled request missing base_item".into()))?;
            let base_period = base.representation.sample_period_ticks;
            let target_period = request.item.representation.sample_period_ticks;
            if base_period % target_period != 0 && target_period % base_period != 0 {
                return Err(NexusError::Validation(
                    "resample periods are not an integer ratio of one another".into(),
                ));
            }
            let ratio = (base_period / target_period) as usize;
            if ratio == 0 || base_period != target_period * ratio as u64 {
                return Err(NexusError::Validation("resample ratio must be a positive integer".into()));
            }
            let base_window_begin = base.item_id_window_begin(output_begin_ticks, base_period);
            let skip_leading = ((output_begin_ticks - base_window_begin) / target_period as i64) as usize;
            let mut out = vec![0.0f64; output_len];
            nexus_kernels::resample(&converted, ratio, skip_leading, &mut out)?;
            Ok(out)
        }
        _ => {
            let base = request
                .base_item
                .as_ref()
                .ok_or_else(|| NexusError::Internal("aggregation request missing base_item".into()))?;
            let base_period = base.representation.sample_period_ticks;
            let target_period = request.item.representation.sample_period_ticks;
            if target_period % base_period != 0 {
                return Err(NexusError::Validation(
                    "aggregation target period is not a multiple of the base period".into(),
                ));
            }
            let ratio = (target_period / base_period) as usize;
            if ratio < 2 {
                return Err(NexusError::Validation("aggregation ratio must be at least 2".into()));
            }
            let mut out = vec![0.0f64; output_len];
            nexus_kernels::aggregate(
                raw_data,
                raw_status,
                dtype_for_conversion,
                kind,
                ratio,
                &mut out,
            )?;
            Ok(out)
        }
    }
}

/// Helper: the base-period-aligned window start at or before `ticks`, used to compute a
/// resample's leading-skip offset (spec §4.D: "boundary offset is computed so that the output
/// begins exactly at the requested `begin`").
trait BaseWindowAlign {
    fn item_id_window_begin(&self, ticks: i64, base_period: u64) -> i64;
}

impl BaseWindowAlign for CatalogItem {
    fn item_id_window_begin(&self, ticks: i64, base_period: u64) -> i64 {
        let period = base_period as i64;
        ticks.div_euclid(period) * period
    }
}

/// Convenience for the scheduler: decode a `NexusDataType` element size, used when sizing raw
/// read buffers for a base representation.
pub fn element_size_for(dtype: NexusDataType) -> usize {
    dtype.element_size()
}
