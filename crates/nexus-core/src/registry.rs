//! Pipelines and per-user pipeline registries (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `(type_id, resource_locator?, configuration)` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub type_id: String,
    #[serde(default)]
    pub resource_locator: Option<String>,
    pub configuration: Value,
}

/// A descriptor of how to fetch/build a plugin's extension code. External concern (spec §1)
/// — modeled only so a `DataSourceDescriptor` can name where its code notionally comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageReference {
    pub type_id: String,
    pub version: String,
    pub source: String,
}

/// An ordered sequence of descriptors owned by a user; each subsequent source sees the
/// enriched catalog produced by the previous (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub descriptors: Vec<DataSourceDescriptor>,
    pub owner: String,
}

/// Holds one or more pipelines per user (spec §3 "owned by a user"). The Non-goals exclude
/// multi-tenant *isolation*, not the bookkeeping itself — see SPEC_FULL.md §3.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    by_owner: HashMap<String, Vec<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        PipelineRegistry::default()
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.by_owner
            .entry(pipeline.owner.clone())
            .or_default()
            .push(pipeline);
    }

    pub fn pipelines_for(&self, owner: &str) -> &[Pipeline] {
        self.by_owner.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &Pipeline> {
        self.by_owner.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_groups_pipelines_by_owner() {
        let mut registry = PipelineRegistry::new();
        registry.register(Pipeline {
            descriptors: vec![],
            owner: "alice".into(),
        });
        registry.register(Pipeline {
            descriptors: vec![],
            owner: "alice".into(),
        });
        registry.register(Pipeline {
            descriptors: vec![],
            owner: "bob".into(),
        });
        assert_eq!(registry.pipelines_for("alice").len(), 2);
        assert_eq!(registry.pipelines_for("bob").len(), 1);
        assert_eq!(registry.pipelines_for("carol").len(), 0);
    }
}
