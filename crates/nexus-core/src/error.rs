//! Error taxonomy shared across every Nexus crate.
//!
//! There is exactly one error enum for the whole engine, the way `rde_core::RdeError` is the
//! one error type shared by `rde-io` and `rde-tx`. Kinds, not hierarchies: callers match on
//! `NexusError` variants directly rather than downcasting through a trait object.

use thiserror::Error;

/// Errors surfaced anywhere in the Nexus data access engine.
///
/// Propagation policy (spec §7): `Validation` and `NotFound` are recovered locally at API
/// boundaries; everything else propagates to the caller. Nothing here is retried inside the
/// core — retry policy belongs to whoever calls in.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NexusError {
    /// Path parse failures, period misalignment, buffer size mismatches, missing parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Catalog, resource, representation, or cache region not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A source or writer refused to initialize; the instance must be discarded.
    #[error("context initialization failed: {0}")]
    ContextInit(String),

    /// A plugin's `upgrade_configuration` hook failed or produced invalid JSON.
    #[error("configuration upgrade failed: {0}")]
    ConfigUpgrade(String),

    /// A source or writer raised an error during `read`/`write`. Fails only the owning group.
    #[error("extension runtime error in '{source_id}': {message}")]
    ExtensionRuntime { source_id: String, message: String },

    /// The memory tracker could not grant even the minimum requested allocation in time.
    #[error("resource exhausted: requested at least {requested_min} bytes")]
    ResourceExhaustion { requested_min: usize },

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// An invariant was broken. Always fatal; forces the owning controller to `Poisoned`.
    #[error("internal error: {0}")]
    Internal(String),

    /// Two pipeline stages declared the same representation id with incompatible contents.
    #[error(
        "representation conflict in {catalog_id}/{resource_id}/{representation_id}"
    )]
    RepresentationConflict {
        catalog_id: String,
        resource_id: String,
        representation_id: String,
    },

    /// A resource path failed to parse against the wire-format grammar (spec §6).
    #[error("invalid resource path: {0}")]
    InvalidPath(String),

    /// A cache operation's period boundaries were not integer multiples of the base period.
    #[error("cache period misalignment: base period is {base_period_ticks} ticks")]
    CachePeriodMisalignment { base_period_ticks: u64 },
}

pub type NexusResult<T> = Result<T, NexusError>;
