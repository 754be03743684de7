//! Configuration for an orchestration session
//!
//! This module centralizes the tunable constants used throughout the crate and
//! the `SessionConfig` callers build to open a [`Session`](crate::session::Session).

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

// ============================================================================
// Identity Configuration
// ============================================================================

/// Number of SHA-256 digest bytes kept for a content-hash uid
///
/// Sixteen bytes fill a UUID exactly, so computed and backend-issued ids share
/// one representation.
pub const UID_HASH_BYTES: usize = 16;

// ============================================================================
// Progress Reporting Configuration
// ============================================================================

/// Template for batch progress bars; `{msg}` carries the batch label
pub const PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {msg:24} [{bar:30.cyan/blue}] {pos}/{len} ({percent}%)";

pub const PROGRESS_CHARS: &str = "=>-";

// ============================================================================
// Filesystem Platform Configuration
// ============================================================================

/// Per-item metadata record
pub const METADATA_FILE: &str = "metadata.json";

/// Directory holding an experiment's or simulation's assets
pub const ASSETS_DIR: &str = "Assets";

/// Directory mapping uids to item directories
pub const INDEX_DIR: &str = ".index";

/// Marker written when an item is submitted for execution
pub const JOB_SUBMITTED_FILE: &str = "job_submitted";

/// Status written by the external scheduler: `0` done, `-1` failed, `100` running
pub const JOB_STATUS_FILE: &str = "job_status.txt";

/// Exit code written by the external scheduler when the job process ends
pub const EXIT_CODE_FILE: &str = "exit_code.txt";

/// Marker recording a cancellation request
pub const CANCEL_REQUESTED_FILE: &str = "cancel_requested";

/// Generated per-simulation parameter file
pub const SIMULATION_CONFIG_FILE: &str = "config.json";

/// Maximum length of the cleaned name prefix on item directories
pub const MAX_DIR_NAME_LEN: usize = 64;

// ============================================================================
// Session Configuration
// ============================================================================

/// Backend selection, resolved through a
/// [`PlatformRegistry`](crate::platform::PlatformRegistry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Registered platform name, matched case-insensitively
    pub kind: String,
    /// Backend-specific options
    #[serde(default)]
    pub options: serde_json::Value,
}

impl PlatformConfig {
    pub fn new(kind: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            options,
        }
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "OrchestrationError"))]
pub struct SessionConfig {
    /// Size of the worker pool shared by every batch call of the session
    #[builder(default = "default_concurrency()")]
    pub concurrency_limit: usize,
    /// Show progress bars for batch operations
    #[builder(default = "true")]
    pub progress: bool,
    #[builder(setter(into))]
    pub platform: PlatformConfig,
}

impl SessionConfigBuilder {
    fn validate(&self) -> Result<()> {
        if self.concurrency_limit == Some(0) {
            return Err(OrchestrationError::InvalidConfig(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<derive_builder::UninitializedFieldError> for OrchestrationError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        OrchestrationError::InvalidConfig(err.to_string())
    }
}

impl SessionConfig {
    /// Check a config that was assembled without the builder
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Available parallelism of the host, or 1 when it cannot be determined
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
