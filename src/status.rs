//! Item lifecycle
//!
//! `NONE → CREATED → COMMISSIONED → RUNNING → {DONE, FAILED, CANCELED}`.
//! An item without a status has never been created. Statuses only change
//! through [`advance`], which the session calls from its create, run and
//! refresh paths.

use serde::{Deserialize, Serialize};

use crate::entities::Entity;
use crate::error::{OrchestrationError, Result};

/// Status of a suite, experiment or simulation on its platform
///
/// Variants are declared in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    /// The platform resource exists
    Created,
    /// Submitted for execution
    Commissioned,
    Running,
    Done,
    Failed,
    Canceled,
}

impl EntityStatus {
    /// Whether no further transitions are possible
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            EntityStatus::Done | EntityStatus::Failed | EntityStatus::Canceled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    ///
    /// A job may finish between two refreshes, so a commissioned item can be
    /// observed directly in a terminal state.
    pub const fn can_transition_to(self, next: EntityStatus) -> bool {
        use EntityStatus::*;
        matches!(
            (self, next),
            (Created, Commissioned)
                | (Commissioned, Running)
                | (Commissioned, Done)
                | (Commissioned, Failed)
                | (Commissioned, Canceled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityStatus::Created => "CREATED",
            EntityStatus::Commissioned => "COMMISSIONED",
            EntityStatus::Running => "RUNNING",
            EntityStatus::Done => "DONE",
            EntityStatus::Failed => "FAILED",
            EntityStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Status observation returned by a backend's `refresh_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: EntityStatus,
    /// Process exit code, once the job has finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StatusReport {
    pub fn new(status: EntityStatus) -> Self {
        Self {
            status,
            exit_code: None,
        }
    }

    /// Report for a finished job, classified by its exit code
    pub fn exited(exit_code: i32) -> Self {
        let status = if exit_code == 0 {
            EntityStatus::Done
        } else {
            EntityStatus::Failed
        };
        Self {
            status,
            exit_code: Some(exit_code),
        }
    }

    /// Status implied by the report alone
    ///
    /// A recorded exit code takes precedence over the reported status, except
    /// for `CANCELED`: a backend that reports a cancellation has recorded it.
    pub fn observed(&self) -> EntityStatus {
        match (self.status, self.exit_code) {
            (EntityStatus::Canceled, _) => EntityStatus::Canceled,
            (_, Some(0)) => EntityStatus::Done,
            (_, Some(_)) => EntityStatus::Failed,
            (status, None) => status,
        }
    }

    /// Final status once the backend-recorded cancellation intent is known
    ///
    /// A failure is reported as `CANCELED` when a cancellation was recorded,
    /// regardless of the process exit code.
    pub fn resolve(&self, cancellation_recorded: bool) -> EntityStatus {
        match self.observed() {
            EntityStatus::Failed if cancellation_recorded => EntityStatus::Canceled,
            status => status,
        }
    }
}

/// Validate a transition without applying it
///
/// A repeated status is always accepted.
pub fn check_transition(current: Option<EntityStatus>, next: EntityStatus) -> bool {
    match current {
        None => next == EntityStatus::Created,
        Some(current) if current == next => true,
        Some(current) => current.can_transition_to(next),
    }
}

/// Whether `next` is an out-of-date observation of an item already at `current`
///
/// Backends may lag behind a submission and report an earlier non-terminal state.
pub fn is_stale(current: EntityStatus, next: EntityStatus) -> bool {
    !next.is_terminal() && next < current
}

/// Move an item to `next`, enforcing the lifecycle
///
/// Returns whether the status changed.
pub(crate) fn advance<E: Entity>(entity: &mut E, next: EntityStatus) -> Result<bool> {
    let current = entity.status();
    if current == Some(next) {
        return Ok(false);
    }
    if !check_transition(current, next) {
        return Err(OrchestrationError::InvalidTransition {
            kind: E::KIND,
            uid: entity.uid(),
            from: current,
            to: next,
        });
    }
    entity.header_mut().set_status(next);
    Ok(true)
}
