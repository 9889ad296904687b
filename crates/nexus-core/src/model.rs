//! Catalog model and merge semantics (spec §3, §4.B).

use crate::error::{NexusError, NexusResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Element data types a representation's raw bytes may be encoded as (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NexusDataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl NexusDataType {
    /// Encoded size in bytes of one element.
    pub const fn element_size(self) -> usize {
        match self {
            NexusDataType::U8 | NexusDataType::I8 => 1,
            NexusDataType::U16 | NexusDataType::I16 => 2,
            NexusDataType::U32 | NexusDataType::I32 | NexusDataType::F32 => 4,
            NexusDataType::U64 | NexusDataType::I64 | NexusDataType::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, NexusDataType::F32 | NexusDataType::F64)
    }
}

/// Representation kind (spec §3). `Original` carries no aggregation/resample semantics;
/// every other variant requires a `base_item` in its `CatalogItemRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepresentationKind {
    Original,
    Resampled,
    Mean,
    MeanPolarDeg,
    Min,
    Max,
    Std,
    Rms,
    MinBitwise,
    MaxBitwise,
    Sum,
}

impl RepresentationKind {
    /// Snake-case suffix used in derived representation ids (spec §3: `<period_unit>` for
    /// `Original` else `<period_unit>_<snake_kind>`).
    pub const fn snake_name(self) -> Option<&'static str> {
        match self {
            RepresentationKind::Original => None,
            RepresentationKind::Resampled => Some("resampled"),
            RepresentationKind::Mean => Some("mean"),
            RepresentationKind::MeanPolarDeg => Some("mean_polar_deg"),
            RepresentationKind::Min => Some("min"),
            RepresentationKind::Max => Some("max"),
            RepresentationKind::Std => Some("std"),
            RepresentationKind::Rms => Some("rms"),
            RepresentationKind::MinBitwise => Some("min_bitwise"),
            RepresentationKind::MaxBitwise => Some("max_bitwise"),
            RepresentationKind::Sum => Some("sum"),
        }
    }

    pub fn from_snake_name(name: Option<&str>) -> NexusResult<Self> {
        Ok(match name {
            None => RepresentationKind::Original,
            Some("resampled") => RepresentationKind::Resampled,
            Some("mean") => RepresentationKind::Mean,
            Some("mean_polar_deg") => RepresentationKind::MeanPolarDeg,
            Some("min") => RepresentationKind::Min,
            Some("max") => RepresentationKind::Max,
            Some("std") => RepresentationKind::Std,
            Some("rms") => RepresentationKind::Rms,
            Some("min_bitwise") => RepresentationKind::MinBitwise,
            Some("max_bitwise") => RepresentationKind::MaxBitwise,
            Some("sum") => RepresentationKind::Sum,
            Some(other) => {
                return Err(NexusError::InvalidPath(format!("unknown representation kind: {other}")))
            }
        })
    }

    /// `true` for the six reducers that skip `NaN` inputs (spec §4.D step 4).
    pub const fn skips_nan(self) -> bool {
        matches!(
            self,
            RepresentationKind::Mean
                | RepresentationKind::MeanPolarDeg
                | RepresentationKind::Min
                | RepresentationKind::Max
                | RepresentationKind::Std
                | RepresentationKind::Rms
                | RepresentationKind::Sum
        )
    }

    pub const fn is_bitwise(self) -> bool {
        matches!(self, RepresentationKind::MinBitwise | RepresentationKind::MaxBitwise)
    }

    pub const fn is_aggregation(self) -> bool {
        !matches!(self, RepresentationKind::Original | RepresentationKind::Resampled)
    }
}

/// Parameter schema entries for representations that accept caller-supplied parameters
/// (spec §3: `{name -> {type: "input-integer"|"select", ...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParameterType {
    #[serde(rename = "input-integer")]
    InputInteger { min: Option<i64>, max: Option<i64> },
    #[serde(rename = "select")]
    Select { options: Vec<String> },
}

pub type ParameterSchema = IndexMap<String, ParameterType>;

/// One view of a resource at a given sample period and semantic kind (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub data_type: NexusDataType,
    pub sample_period_ticks: u64,
    pub kind: RepresentationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterSchema>,
}

impl Representation {
    /// Derived id: `<period_unit>` for `Original`, else `<period_unit>_<snake_kind>`.
    pub fn id(&self) -> String {
        let period = crate::path::PeriodTicks(self.sample_period_ticks).render();
        match self.kind.snake_name() {
            Some(suffix) => format!("{period}_{suffix}"),
            None => period,
        }
    }
}

/// A named channel owning one or more representations (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    pub representations: IndexMap<String, Representation>,
}

impl Resource {
    pub fn new(id: impl Into<String>) -> Self {
        Resource {
            id: id.into(),
            properties: None,
            representations: IndexMap::new(),
        }
    }

    /// Insert a representation, keyed by its derived id. Fails if the id already exists
    /// with different contents (representation ids must be unique per spec §3 invariant).
    pub fn with_representation(mut self, repr: Representation) -> NexusResult<Self> {
        let id = repr.id();
        if let Some(existing) = self.representations.get(&id) {
            if *existing != repr {
                return Err(NexusError::RepresentationConflict {
                    catalog_id: String::new(),
                    resource_id: self.id.clone(),
                    representation_id: id,
                });
            }
        } else {
            self.representations.insert(id, repr);
        }
        Ok(self)
    }
}

/// A namespace of related time-series resources, identified by a rooted slash-path
/// (spec §3). Invariant: `id` matches `^(/[A-Za-z_][A-Za-z_0-9]*)+$`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    pub resources: IndexMap<String, Resource>,
}

impl Catalog {
    pub fn new(id: impl Into<String>) -> NexusResult<Self> {
        let id = id.into();
        if !is_valid_catalog_id(&id) {
            return Err(NexusError::InvalidPath(format!("invalid catalog id: {id}")));
        }
        Ok(Catalog {
            id,
            properties: None,
            resources: IndexMap::new(),
        })
    }
}

fn is_valid_catalog_id(id: &str) -> bool {
    if !id.starts_with('/') {
        return false;
    }
    let segments: Vec<&str> = id.split('/').skip(1).collect();
    if segments.is_empty() {
        return false;
    }
    segments.iter().all(|s| {
        let mut chars = s.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Deep-merge of JSON properties: objects recurse, arrays concatenate, scalars prefer `b`
/// (spec §4.B).
fn merge_json(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(ao), Value::Object(bo)) => {
            let mut out = serde_json::Map::new();
            for (k, av) in ao {
                match bo.get(k) {
                    Some(bv) => {
                        out.insert(k.clone(), merge_json(av, bv));
                    }
                    None => {
                        out.insert(k.clone(), av.clone());
                    }
                }
            }
            for (k, bv) in bo {
                if !ao.contains_key(k) {
                    out.insert(k.clone(), bv.clone());
                }
            }
            Value::Object(out)
        }
        (Value::Array(aa), Value::Array(ba)) => {
            let mut out = aa.clone();
            out.extend(ba.clone());
            Value::Array(out)
        }
        _ => b.clone(),
    }
}

fn merge_properties(a: &Option<Value>, b: &Option<Value>) -> Option<Value> {
    match (a, b) {
        (Some(av), Some(bv)) => Some(merge_json(av, bv)),
        (Some(av), None) => Some(av.clone()),
        (None, Some(bv)) => Some(bv.clone()),
        (None, None) => None,
    }
}

/// Merge two representations with the same id: they must compare equal, or merging fails
/// with `RepresentationConflict` (spec §4.B).
fn merge_representation(
    catalog_id: &str,
    resource_id: &str,
    repr_id: &str,
    a: &Representation,
    b: &Representation,
) -> NexusResult<Representation> {
    if a == b {
        Ok(a.clone())
    } else {
        Err(NexusError::RepresentationConflict {
            catalog_id: catalog_id.to_string(),
            resource_id: resource_id.to_string(),
            representation_id: repr_id.to_string(),
        })
    }
}

fn merge_resource(catalog_id: &str, a: &Resource, b: &Resource) -> NexusResult<Resource> {
    if a.id != b.id {
        return Err(NexusError::Internal(format!(
            "merge_resource called with mismatched ids: {} vs {}",
            a.id, b.id
        )));
    }
    let mut representations = IndexMap::new();
    for (id, repr) in &a.representations {
        let merged = match b.representations.get(id) {
            Some(other) => merge_representation(catalog_id, &a.id, id, repr, other)?,
            None => repr.clone(),
        };
        representations.insert(id.clone(), merged);
    }
    for (id, repr) in &b.representations {
        if !a.representations.contains_key(id) {
            representations.insert(id.clone(), repr.clone());
        }
    }
    Ok(Resource {
        id: a.id.clone(),
        properties: merge_properties(&a.properties, &b.properties),
        representations,
    })
}

/// Structural merge of two catalogs (spec §4.B). Ids must match; properties deep-merge;
/// resources union by id with per-resource merge; representations union by id and must
/// compare equal when both present.
///
/// Commutative for catalogs that share no conflicting representations (spec §8): property
/// merge is pointwise-commutative only for object/scalar keys present in one side (array
/// concatenation order does depend on argument order by construction — callers that need a
/// specific array order should pass arguments in that order deliberately).
pub fn merge(a: &Catalog, b: &Catalog) -> NexusResult<Catalog> {
    if a.id != b.id {
        return Err(NexusError::Validation(format!(
            "cannot merge catalogs with different ids: {} vs {}",
            a.id, b.id
        )));
    }
    let mut resources = IndexMap::new();
    for (id, res) in &a.resources {
        let merged = match b.resources.get(id) {
            Some(other) => merge_resource(&a.id, res, other)?,
            None => res.clone(),
        };
        resources.insert(id.clone(), merged);
    }
    for (id, res) in &b.resources {
        if !a.resources.contains_key(id) {
            resources.insert(id.clone(), res.clone());
        }
    }
    Ok(Catalog {
        id: a.id.clone(),
        properties: merge_properties(&a.properties, &b.properties),
        resources,
    })
}

/// Reserved catalog metadata properties (spec §6).
pub mod reserved_keys {
    pub const README: &str = "readme";
    pub const LICENSE: &str = "license";
    pub const DESCRIPTION: &str = "description";
    pub const WARNING: &str = "warning";
    pub const UNIT: &str = "unit";
    pub const GROUPS: &str = "groups";
    pub const ORIGINAL_NAME: &str = "original-name";
    pub const PIPELINE_POSITION: &str = "nexus.pipeline-position";
    pub const VERSION: &str = "nexus.version";
    pub const PIPELINE: &str = "nexus.pipeline";
}

/// Re-sanitize a catalog after it has flowed through pipeline stage `stage_index` of a
/// source identified by `source_type_id` (spec §4.B: "the *only* implicit mutation").
///
/// Sets, per resource: `original-name` (defaults to the resource's current id if absent),
/// `nexus.pipeline-position` (the stage index), and deduplicates `groups`. Sets, on the
/// catalog: `nexus.version` (bumped by one) and appends `source_type_id` to `nexus.pipeline`.
///
/// Open question resolved here (spec §4.D names `get_catalog`'s per-stage `enrich_catalog`
/// call as the place sanitization matters, but never specifies the exact derivation of
/// `nexus.pipeline-position`): this implementation treats it as "the index of the pipeline
/// stage that most recently produced this resource", not a monotonically-merged maximum,
/// since a later stage's `enrich_catalog` output is by construction the newest view of that
/// resource.
pub fn sanitize(catalog: &mut Catalog, stage_index: u32, source_type_id: &str) {
    for resource in catalog.resources.values_mut() {
        let props = resource
            .properties
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = props {
            map.entry(reserved_keys::ORIGINAL_NAME.to_string())
                .or_insert_with(|| Value::String(resource.id.clone()));
            map.insert(
                reserved_keys::PIPELINE_POSITION.to_string(),
                Value::Number(stage_index.into()),
            );
            if let Some(Value::Array(groups)) = map.get_mut(reserved_keys::GROUPS) {
                let mut seen = std::collections::HashSet::new();
                groups.retain(|g| seen.insert(g.as_str().map(str::to_string)));
            }
        }
    }

    let props = catalog
        .properties
        .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(map) = props {
        let next_version = match map.get(reserved_keys::VERSION) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) + 1,
            _ => 1,
        };
        map.insert(
            reserved_keys::VERSION.to_string(),
            Value::Number(next_version.into()),
        );
        let pipeline_entry = match map.get_mut(reserved_keys::PIPELINE) {
            Some(Value::Array(arr)) => arr,
            _ => {
                map.insert(reserved_keys::PIPELINE.to_string(), Value::Array(Vec::new()));
                match map.get_mut(reserved_keys::PIPELINE).unwrap() {
                    Value::Array(arr) => arr,
                    _ => unreachable!(),
                }
            }
        };
        pipeline_entry.push(Value::String(source_type_id.to_string()));
    }
}

/// `(Catalog, Resource, Representation, parameters?)` resolved against the tree (spec §3).
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub catalog: Arc<Catalog>,
    pub resource: Arc<Resource>,
    pub representation: Arc<Representation>,
    pub parameters: Option<Value>,
}

impl CatalogItem {
    /// Canonical path: `{catalog.id}/{resource.id}/{representation.id}[(k=v,...)]`.
    pub fn canonical_path(&self) -> String {
        let mut out = format!(
            "{}/{}/{}",
            self.catalog.id,
            self.resource.id,
            self.representation.id()
        );
        if let Some(Value::Object(params)) = &self.parameters {
            if !params.is_empty() {
                out.push('(');
                let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
                out.push_str(&rendered.join(","));
                out.push(')');
            }
        }
        out
    }

    /// A stable key identifying this item independent of parameters, used by the cache
    /// engine (spec §4.F: `(catalog_item_id, base_period, file_begin)`).
    pub fn item_id(&self) -> String {
        format!("{}/{}/{}", self.catalog.id, self.resource.id, self.representation.id())
    }
}

/// `(item, base_item?, container)` (spec §3). `base_item` is set iff the representation's
/// kind is not `Original` — it identifies the raw representation driving reads.
#[derive(Debug, Clone)]
pub struct CatalogItemRequest {
    pub item: CatalogItem,
    pub base_item: Option<CatalogItem>,
}

impl CatalogItemRequest {
    pub fn new(item: CatalogItem, base_item: Option<CatalogItem>) -> NexusResult<Self> {
        let needs_base = item.representation.kind != RepresentationKind::Original;
        if needs_base && base_item.is_none() {
            return Err(NexusError::Validation(format!(
                "representation kind {:?} requires a base item",
                item.representation.kind
            )));
        }
        if !needs_base && base_item.is_some() {
            return Err(NexusError::Validation(
                "Original representation must not carry a base item".to_string(),
            ));
        }
        Ok(CatalogItemRequest { item, base_item })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repr(kind: RepresentationKind, period_ticks: u64) -> Representation {
        Representation {
            data_type: NexusDataType::F64,
            sample_period_ticks: period_ticks,
            kind,
            parameters: None,
        }
    }

    #[test]
    fn representation_id_derivation() {
        let original = repr(RepresentationKind::Original, 10_000_000);
        assert_eq!(original.id(), "1_s");
        let mean = repr(RepresentationKind::Mean, 600_000_000);
        assert_eq!(mean.id(), "1_min_mean");
    }

    #[test]
    fn merge_is_commutative_for_non_conflicting_catalogs() {
        let mut a = Catalog::new("/c").unwrap();
        let mut ra = Resource::new("r1");
        ra = ra.with_representation(repr(RepresentationKind::Original, 10_000_000)).unwrap();
        a.resources.insert("r1".into(), ra);

        let mut b = Catalog::new("/c").unwrap();
        let rb = Resource::new("r2");
        b.resources.insert("r2".into(), rb);

        let ab = merge(&a, &b).unwrap();
        let ba = merge(&b, &a).unwrap();
        assert_eq!(ab.resources.len(), ba.resources.len());
        assert_eq!(ab.resources.get("r1"), ba.resources.get("r1"));
        assert_eq!(ab.resources.get("r2"), ba.resources.get("r2"));
    }

    #[test]
    fn merge_rejects_conflicting_representations() {
        let mut a = Catalog::new("/c").unwrap();
        let ra = Resource::new("r1")
            .with_representation(repr(RepresentationKind::Original, 10_000_000))
            .unwrap();
        a.resources.insert("r1".into(), ra);

        let mut b = Catalog::new("/c").unwrap();
        let rb = Resource::new("r1")
            .with_representation(repr(RepresentationKind::Original, 20_000_000))
            .unwrap();
        b.resources.insert("r1".into(), rb);

        assert!(matches!(
            merge(&a, &b),
            Err(NexusError::RepresentationConflict { .. })
        ));
    }

    #[test]
    fn sanitize_sets_reserved_properties() {
        let mut catalog = Catalog::new("/c").unwrap();
        catalog.resources.insert("r1".into(), Resource::new("r1"));
        sanitize(&mut catalog, 0, "csv");
        let r1 = &catalog.resources["r1"];
        let props = r1.properties.as_ref().unwrap();
        assert_eq!(props["original-name"], Value::String("r1".into()));
        assert_eq!(props["nexus.pipeline-position"], Value::Number(0.into()));
        let catalog_props = catalog.properties.as_ref().unwrap();
        assert_eq!(catalog_props["nexus.version"], Value::Number(1.into()));
        assert_eq!(catalog_props["nexus.pipeline"], Value::Array(vec![Value::String("csv".into())]));
    }
}
