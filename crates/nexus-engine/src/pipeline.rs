//! Pipeline facade (spec §4.J, supplemental): wires an ordered sequence of
//! `SourceControllerHandle`s into one `CatalogProvider` the catalog tree can mount. Each stage
//! sees the catalog enriched (and sanitized) by every stage before it, per spec §3's "each
//! subsequent source sees the enriched catalog produced by the previous".
//!
//! Grounded in `rde-cli::main`'s sequential operator wiring, generalized from a one-shot batch
//! pipeline into a request-driven provider the tree can call repeatedly.

use std::sync::Arc;

use async_trait::async_trait;
use nexus_core::tree::{CatalogProvider, CatalogRegistration};
use nexus_core::{Catalog, NexusResult};
use tracing::debug;

use crate::controller::SourceControllerHandle;

/// One user's ordered pipeline of initialized source controllers (spec §3 `Pipeline`, §4.J).
pub struct PipelineRunner {
    id: String,
    stages: Vec<Arc<SourceControllerHandle>>,
}

impl PipelineRunner {
    pub fn new(id: impl Into<String>, stages: Vec<Arc<SourceControllerHandle>>) -> Arc<Self> {
        Arc::new(PipelineRunner { id: id.into(), stages })
    }

    pub fn stages(&self) -> &[Arc<SourceControllerHandle>] {
        &self.stages
    }
}

#[async_trait]
impl CatalogProvider for PipelineRunner {
    fn provider_id(&self) -> &str {
        &self.id
    }

    /// Union every stage's registrations under `path`. A later stage naming the same path as
    /// an earlier one is a legitimate re-registration (e.g. adding a link); the tree's own
    /// first-registered-wins rule arbitrates duplicates at mount time, not here.
    async fn list_children(&self, path: &str) -> NexusResult<Vec<CatalogRegistration>> {
        let mut children = Vec::new();
        for stage in &self.stages {
            children.extend(stage.get_catalog_registrations(path).await?);
        }
        Ok(children)
    }

    /// Fold `enrich_catalog` across every stage in order, starting from an empty catalog at
    /// `catalog_id` (spec §3, §4.B). Each stage's output is already sanitized by
    /// `SourceControllerHandle::enrich_catalog` before the next stage sees it.
    async fn get_catalog(&self, catalog_id: &str) -> NexusResult<Catalog> {
        let mut catalog = Catalog::new(catalog_id)?;
        for (stage_index, stage) in self.stages.iter().enumerate() {
            debug!(pipeline = %self.id, stage = stage.type_id(), stage_index, "enriching catalog");
            catalog = stage.enrich_catalog(catalog, stage_index as u32).await?;
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::model::{NexusDataType, Representation, RepresentationKind, Resource};
    use nexus_core::{DataSource, PluginContext, ReadRequest};

    struct StageSource {
        resource_id: &'static str,
    }

    #[async_trait]
    impl DataSource for StageSource {
        async fn set_context(&mut self, _ctx: PluginContext) -> NexusResult<()> {
            Ok(())
        }
        async fn get_catalog_registrations(&self, _path: &str) -> NexusResult<Vec<CatalogRegistration>> {
            Ok(vec![])
        }
        async fn enrich_catalog(&self, mut catalog: Catalog) -> NexusResult<Catalog> {
            let resource = Resource::new(self.resource_id).with_representation(Representation {
                data_type: NexusDataType::F64,
                sample_period_ticks: 10_000_000,
                kind: RepresentationKind::Original,
                parameters: None,
            })?;
            catalog.resources.insert(self.resource_id.into(), resource);
            Ok(catalog)
        }
        async fn get_time_range(&self, _catalog_id: &str) -> NexusResult<(i64, i64)> {
            Ok((0, 0))
        }
        async fn get_availability(&self, _catalog_id: &str, _begin: i64, _end: i64) -> NexusResult<Vec<f64>> {
            Ok(vec![])
        }
        async fn read(&mut self, _begin: i64, _end: i64, _requests: &mut [ReadRequest]) -> NexusResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn later_stages_see_earlier_stages_resources() {
        let stage_a = SourceControllerHandle::new("a", Box::new(StageSource { resource_id: "a_res" }));
        let stage_b = SourceControllerHandle::new("b", Box::new(StageSource { resource_id: "b_res" }));
        stage_a.initialize(serde_json::Value::Null, None).await.unwrap();
        stage_b.initialize(serde_json::Value::Null, None).await.unwrap();

        let pipeline = PipelineRunner::new("alice-pipeline", vec![stage_a, stage_b]);
        let catalog = pipeline.get_catalog("/c").await.unwrap();
        assert!(catalog.resources.contains_key("a_res"));
        assert!(catalog.resources.contains_key("b_res"));
    }
}
