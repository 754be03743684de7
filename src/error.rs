//! Error taxonomy for orchestration operations
//!
//! Backends and analyzers report their own failures as `anyhow::Error`; the
//! core wraps them here with the entity and operation they belong to.

use thiserror::Error;

use crate::entities::{ItemType, Uid};
use crate::status::EntityStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Analyzer lifecycle stage that raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerStage {
    Initialize,
    PerExperiment,
    Filter,
    SelectSimulationData,
    Finalize,
}

impl std::fmt::Display for AnalyzerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AnalyzerStage::Initialize => "initialize",
            AnalyzerStage::PerExperiment => "per_experiment",
            AnalyzerStage::Filter => "filter",
            AnalyzerStage::SelectSimulationData => "select_simulation_data",
            AnalyzerStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Orchestration error types
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// Attempt to change the uid of an item that already exists on a platform
    #[error("{kind} {uid} has already been created; its uid cannot change to {requested}")]
    ImmutableIdentity {
        kind: ItemType,
        uid: Uid,
        requested: Uid,
    },

    /// Child already belongs to a different parent
    #[error("{kind} {child} already belongs to {existing_parent}; cannot move it under {requested_parent}")]
    InvalidHierarchy {
        kind: ItemType,
        child: Uid,
        existing_parent: Uid,
        requested_parent: Uid,
    },

    /// Creation rejected by the backend
    #[error("Platform rejected creation of {kind} {uid}: {source:#}")]
    BackendCreate {
        kind: ItemType,
        uid: Uid,
        source: anyhow::Error,
    },

    /// Operation attempted on an item that is not on the platform yet
    #[error("{kind} {uid} has not been created on a platform")]
    NotCreated { kind: ItemType, uid: Uid },

    /// Hierarchy query has no answer for this item
    #[error("{kind} {uid} is a top-level item and has no parent")]
    TopLevelItem { kind: ItemType, uid: Uid },

    /// Requested file is absent
    #[error("Asset '{filename}' not found on {kind} {uid}")]
    AssetNotFound {
        kind: ItemType,
        uid: Uid,
        filename: String,
    },

    /// An analyzer callback failed
    #[error("Analyzer '{analyzer}' failed in {stage}: {source:#}")]
    AnalyzerStage {
        analyzer: String,
        stage: AnalyzerStage,
        source: anyhow::Error,
    },

    /// Status change not permitted by the lifecycle
    #[error("{kind} {uid} cannot move from {} to {to}", status_label(.from))]
    InvalidTransition {
        kind: ItemType,
        uid: Uid,
        from: Option<EntityStatus>,
        to: EntityStatus,
    },

    /// Any other backend call failure
    #[error("Platform {operation} failed for {kind} {uid}: {source:#}")]
    Backend {
        operation: &'static str,
        kind: ItemType,
        uid: Uid,
        source: anyhow::Error,
    },

    /// An entity-level creation hook failed
    #[error("{stage} hook failed for {kind} {uid}: {source:#}")]
    HookFailed {
        stage: &'static str,
        kind: ItemType,
        uid: Uid,
        source: anyhow::Error,
    },

    /// Asset with the same filename already in the collection
    #[error("Asset '{0}' is already present in the collection")]
    DuplicateAsset(String),

    /// No platform registered under the requested name
    #[error("Unknown platform '{requested}'. Registered platforms: {}", .available.join(", "))]
    UnknownPlatform {
        requested: String,
        available: Vec<String>,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session's worker pool has been shut down
    #[error("Worker pool has been shut down")]
    PoolClosed,

    /// A batch task panicked before producing a result
    #[error("Batch task panicked: {0}")]
    TaskPanicked(String),
}

fn status_label(status: &Option<EntityStatus>) -> String {
    status.map_or_else(|| "NONE".to_string(), |s| s.to_string())
}
