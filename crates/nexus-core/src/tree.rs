//! Catalog tree: mount points, transient vs static children, softlinks (spec §4.C).

use crate::error::{NexusError, NexusResult};
use crate::model::{Catalog, CatalogItem, CatalogItemRequest, ParameterType};
use crate::path::ResourcePath;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// `(path, title?, is_transient, link_target?)` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRegistration {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub link_target: Option<String>,
    /// Visibility/release flag (spec 4.C: "never reads"). Filters listings only.
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_true() -> bool {
    true
}

/// Tie-break provenance for registrations mounting the same path (spec 4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provenance {
    /// Admin-supplied mounts always win ties.
    Admin,
    /// Anything else; among these, first-registered wins.
    Source,
}

/// Object-safe façade a catalog tree node mounts against. Implemented by whatever owns the
/// source controller lifecycle (nexus-engine's `SourceControllerHandle`); kept abstract here
/// so the tree itself never needs to know about plugin initialization or read pipelines.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Stable identifier for this provider, used only for logging/diagnostics.
    fn provider_id(&self) -> &str;

    /// List the registrations this provider exposes directly under `path`.
    async fn list_children(&self, path: &str) -> NexusResult<Vec<CatalogRegistration>>;

    /// Produce the (already pipeline-merged, sanitized) catalog for `catalog_id`.
    async fn get_catalog(&self, catalog_id: &str) -> NexusResult<Catalog>;
}

struct MountedNode {
    registration: CatalogRegistration,
    provenance: Provenance,
    registration_order: u64,
    provider: Arc<dyn CatalogProvider>,
    /// Cached children for static registrations; `None` for transient ones (always
    /// re-fetched) and for nodes not yet listed.
    cached_children: Option<Vec<CatalogRegistration>>,
}

/// Immutable tree snapshot, swapped in atomically (spec §5: "copy-on-write... in-flight
/// reads continue against the tree they resolved against").
#[derive(Default)]
struct TreeSnapshot {
    nodes: IndexMap<String, MountedNode>,
}

/// The catalog tree: resolves resource paths against mounted sources, respecting link
/// targets and visibility flags.
pub struct CatalogTree {
    snapshot: ArcSwap<TreeSnapshot>,
    next_registration_order: std::sync::atomic::AtomicU64,
}

impl Default for CatalogTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogTree {
    pub fn new() -> Self {
        CatalogTree {
            snapshot: ArcSwap::new(Arc::new(TreeSnapshot::default())),
            next_registration_order: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Mount `registration` at its path, owned by `provider`. `is_admin_supplied` selects
    /// provenance for the tie-break rule (spec 4.C): admin mounts win outright; among
    /// non-admin mounts, first-registered wins; later duplicates at the same path are
    /// dropped with a (non-fatal) warning.
    pub async fn mount(
        &self,
        registration: CatalogRegistration,
        provider: Arc<dyn CatalogProvider>,
        is_admin_supplied: bool,
    ) -> NexusResult<()> {
        let provenance = if is_admin_supplied {
            Provenance::Admin
        } else {
            Provenance::Source
        };
        let order = self
            .next_registration_order
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let children = if registration.is_transient {
            None
        } else {
            Some(provider.list_children(&registration.path).await?)
        };

        // Copy-on-write: build the new snapshot from the old one, then swap atomically.
        let old = self.snapshot.load();
        let mut nodes = IndexMap::new();
        for (path, node) in old.nodes.iter() {
            nodes.insert(
                path.clone(),
                MountedNode {
                    registration: node.registration.clone(),
                    provenance: node.provenance,
                    registration_order: node.registration_order,
                    provider: node.provider.clone(),
                    cached_children: node.cached_children.clone(),
                },
            );
        }

        let path = registration.path.clone();
        let new_node = MountedNode {
            registration,
            provenance,
            registration_order: order,
            provider,
            cached_children: children,
        };

        match nodes.get(&path) {
            Some(existing) if existing.provenance == Provenance::Admin && provenance != Provenance::Admin => {
                warn!(path = %path, "dropping non-admin mount: admin-supplied registration already present");
            }
            Some(existing) if existing.provenance == provenance => {
                warn!(path = %path, provider = new_node.provider.provider_id(), "dropping duplicate mount: first-registered wins");
            }
            _ => {
                nodes.insert(path, new_node);
            }
        }

        self.snapshot.store(Arc::new(TreeSnapshot { nodes }));
        Ok(())
    }

    /// List the children registered directly under `path` (spec 4.C `list_children`).
    /// Transient entries are never memoized; they re-query their provider on every call.
    /// Filters out invisible registrations (visibility filters listings, never reads).
    pub async fn list_children(&self, path: &str) -> NexusResult<Vec<CatalogRegistration>> {
        let snapshot = self.snapshot.load();
        let node = snapshot
            .nodes
            .get(path)
            .ok_or_else(|| NexusError::NotFound(format!("no registration mounted at {path}")))?;

        let children = if node.registration.is_transient {
            node.provider.list_children(path).await?
        } else {
            match &node.cached_children {
                Some(cached) => cached.clone(),
                None => node.provider.list_children(path).await?,
            }
        };
        Ok(children.into_iter().filter(|c| c.visible).collect())
    }

    /// Resolve the owning provider for `catalog_id`, following link targets. A user with
    /// read permission may always fetch a non-visible catalog by id (spec 4.C).
    fn resolve_provider(&self, catalog_id: &str) -> NexusResult<Arc<dyn CatalogProvider>> {
        let snapshot = self.snapshot.load();
        let mut current = catalog_id.to_string();
        let mut hops = 0;
        loop {
            hops += 1;
            if hops > 32 {
                return Err(NexusError::Internal(format!(
                    "softlink resolution exceeded depth limit starting at {catalog_id}"
                )));
            }
            match snapshot.nodes.get(&current) {
                Some(node) => {
                    if let Some(target) = &node.registration.link_target {
                        current = target.clone();
                        continue;
                    }
                    return Ok(node.provider.clone());
                }
                None => {
                    return Err(NexusError::NotFound(format!("no catalog mounted at {current}")));
                }
            }
        }
    }

    /// Resolve a wire-format resource path into a `CatalogItemRequest` (spec 4.C `resolve`).
    pub async fn resolve(&self, raw_path: &str) -> NexusResult<CatalogItemRequest> {
        let parsed = ResourcePath::parse(raw_path)?;
        let provider = self.resolve_provider(&parsed.catalog_id)?;
        let catalog = provider.get_catalog(&parsed.catalog_id).await?;

        let resource = catalog
            .resources
            .get(&parsed.resource_id)
            .ok_or_else(|| NexusError::NotFound(format!("no resource {} in {}", parsed.resource_id, parsed.catalog_id)))?
            .clone();

        let kind = crate::model::RepresentationKind::from_snake_name(parsed.kind.as_deref())?;
        let representation = resource
            .representations
            .values()
            .find(|r| r.kind == kind && r.sample_period_ticks == parsed.period.0)
            .cloned()
            .ok_or_else(|| {
                NexusError::NotFound(format!(
                    "no representation matching {} in {}/{}",
                    parsed.period.render(),
                    parsed.catalog_id,
                    parsed.resource_id
                ))
            })?;

        let parameters = parsed.parameters.as_ref().map(params_to_json);
        validate_parameters(representation.parameters.as_ref(), parameters.as_ref())?;

        let item = CatalogItem {
            catalog: Arc::new(catalog.clone()),
            resource: Arc::new(resource.clone()),
            representation: Arc::new(representation.clone()),
            parameters,
        };

        let base_item = if kind == crate::model::RepresentationKind::Original {
            None
        } else {
            let base_period = parsed
                .base_period
                .ok_or_else(|| NexusError::Validation("aggregated/resampled path missing #base=".to_string()))?;
            let base_repr = resource
                .representations
                .values()
                .find(|r| r.kind == crate::model::RepresentationKind::Original && r.sample_period_ticks == base_period.0)
                .cloned()
                .ok_or_else(|| NexusError::NotFound(format!("no base representation at {}", base_period.render())))?;
            Some(CatalogItem {
                catalog: Arc::new(catalog.clone()),
                resource: Arc::new(resource.clone()),
                representation: Arc::new(base_repr),
                parameters: None,
            })
        };

        CatalogItemRequest::new(item, base_item)
    }
}

fn params_to_json(params: &IndexMap<String, String>) -> Value {
    let map: serde_json::Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}

fn validate_parameters(schema: Option<&crate::model::ParameterSchema>, supplied: Option<&Value>) -> NexusResult<()> {
    let Some(supplied_obj) = supplied.and_then(|v| v.as_object()) else {
        return Ok(());
    };
    let schema = schema.ok_or_else(|| {
        NexusError::Validation("representation accepts no parameters but some were supplied".to_string())
    })?;
    for (key, value) in supplied_obj {
        let spec = schema
            .get(key)
            .ok_or_else(|| NexusError::Validation(format!("unknown parameter: {key}")))?;
        match spec {
            ParameterType::InputInteger { min, max } => {
                let n: i64 = value
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| value.as_i64())
                    .ok_or_else(|| NexusError::Validation(format!("parameter {key} must be an integer")))?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(NexusError::Validation(format!("parameter {key} below minimum {min}")));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(NexusError::Validation(format!("parameter {key} above maximum {max}")));
                    }
                }
            }
            ParameterType::Select { options } => {
                let s = value.as_str().unwrap_or_default();
                if !options.iter().any(|o| o == s) {
                    return Err(NexusError::Validation(format!("parameter {key} must be one of {options:?}")));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NexusDataType, Representation, RepresentationKind, Resource};
    use std::sync::Mutex;

    struct FakeProvider {
        id: String,
        catalog: Catalog,
        children: Vec<CatalogRegistration>,
        list_calls: Mutex<u32>,
    }

    #[async_trait]
    impl CatalogProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            &self.id
        }
        async fn list_children(&self, _path: &str) -> NexusResult<Vec<CatalogRegistration>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.children.clone())
        }
        async fn get_catalog(&self, _catalog_id: &str) -> NexusResult<Catalog> {
            Ok(self.catalog.clone())
        }
    }

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new("/c").unwrap();
        let resource = Resource::new("r")
            .with_representation(Representation {
                data_type: NexusDataType::F64,
                sample_period_ticks: 10_000_000,
                kind: RepresentationKind::Original,
                parameters: None,
            })
            .unwrap();
        catalog.resources.insert("r".into(), resource);
        catalog
    }

    #[tokio::test]
    async fn resolve_finds_original_representation() {
        let tree = CatalogTree::new();
        let provider = Arc::new(FakeProvider {
            id: "test".into(),
            catalog: sample_catalog(),
            children: vec![],
            list_calls: Mutex::new(0),
        });
        tree.mount(
            CatalogRegistration {
                path: "/c".into(),
                title: None,
                is_transient: false,
                link_target: None,
                visible: true,
            },
            provider,
            true,
        )
        .await
        .unwrap();

        let req = tree.resolve("/c/r/1_s").await.unwrap();
        assert_eq!(req.item.representation.kind, RepresentationKind::Original);
        assert!(req.base_item.is_none());
    }

    #[tokio::test]
    async fn transient_children_are_not_cached() {
        let tree = CatalogTree::new();
        let provider = Arc::new(FakeProvider {
            id: "test".into(),
            catalog: sample_catalog(),
            children: vec![],
            list_calls: Mutex::new(0),
        });
        tree.mount(
            CatalogRegistration {
                path: "/c".into(),
                title: None,
                is_transient: true,
                link_target: None,
                visible: true,
            },
            provider.clone(),
            true,
        )
        .await
        .unwrap();

        tree.list_children("/c").await.unwrap();
        tree.list_children("/c").await.unwrap();
        assert_eq!(*provider.list_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn admin_mount_wins_tie_break() {
        let tree = CatalogTree::new();
        let p1 = Arc::new(FakeProvider {
            id: "source".into(),
            catalog: sample_catalog(),
            children: vec![],
            list_calls: Mutex::new(0),
        });
        let mut other_catalog = sample_catalog();
        other_catalog.resources.clear();
        let p2 = Arc::new(FakeProvider {
            id: "admin".into(),
            catalog: other_catalog,
            children: vec![],
            list_calls: Mutex::new(0),
        });

        let reg = CatalogRegistration {
            path: "/c".into(),
            title: None,
            is_transient: true,
            link_target: None,
            visible: true,
        };
        tree.mount(reg.clone(), p2, true).await.unwrap();
        tree.mount(reg, p1, false).await.unwrap();

        let resolved = tree.resolve("/c/r/1_s").await;
        assert!(resolved.is_err(), "admin mount's empty catalog should win");
    }
}
