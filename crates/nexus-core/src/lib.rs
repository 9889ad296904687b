//! # Nexus Core
//!
//! Domain model and plugin contracts for the Nexus time-series data access engine: the
//! resource path codec, the immutable catalog model and its merge semantics, the
//! copy-on-write catalog tree, the `DataSource`/`DataWriter` plugin traits, the shared error
//! taxonomy, and layered configuration.
//!
//! Everything in this crate is synchronous domain logic plus the handful of `async_trait`
//! contracts the engine drives. The pipelined, back-pressured machinery that actually walks
//! these types (source controller, cache engine, read scheduler, writer controller) lives in
//! `nexus-engine` and `nexus-storage`.

pub mod config;
pub mod error;
pub mod model;
pub mod path;
pub mod plugin;
pub mod registry;
pub mod tree;

pub use error::{NexusError, NexusResult};
pub use model::{
    Catalog, CatalogItem, CatalogItemRequest, NexusDataType, ParameterSchema, ParameterType,
    Representation, RepresentationKind, Resource,
};
pub use path::{PeriodTicks, ResourcePath};
pub use plugin::{DataSource, DataWriter, PluginContext, ReadRequest};
pub use registry::{DataSourceDescriptor, PackageReference, Pipeline, PipelineRegistry};
pub use tree::{CatalogProvider, CatalogRegistration, CatalogTree};
