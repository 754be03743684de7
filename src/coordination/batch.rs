use std::any::Any;

use crate::error::OrchestrationError;
use crate::telemetry::ProgressStats;

/// Results of one batch call, in input order
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<T>,
    pub stats: ProgressStats,
}

impl<T> BatchReport<T> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_results(self) -> Vec<T> {
        self.results
    }
}

impl<R, X> BatchReport<Result<R, X>> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }
}

/// A failed batch slot
///
/// The item is handed back so that the caller keeps ownership of it; it is
/// only missing when the task panicked.
#[derive(Debug)]
pub struct ItemFailure<T> {
    pub item: Option<T>,
    pub error: OrchestrationError,
}

impl<T> ItemFailure<T> {
    pub fn new(item: T, error: OrchestrationError) -> Self {
        Self {
            item: Some(item),
            error,
        }
    }
}

impl<T> From<OrchestrationError> for ItemFailure<T> {
    fn from(error: OrchestrationError) -> Self {
        Self { item: None, error }
    }
}

impl<T> std::fmt::Display for ItemFailure<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// Human-readable panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
