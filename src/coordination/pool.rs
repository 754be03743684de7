use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::batch::{BatchReport, panic_message};
use crate::error::{OrchestrationError, Result};
use crate::telemetry::{TelemetryEvent, spawn_progress_tracker};

/// Bounded pool shared by every batch call of a session
///
/// Backend calls hold a permit for their duration, so at most `limit` of them
/// run at once across all concurrent batches. Each batch additionally keeps at
/// most `limit` of its own tasks in flight.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
    progress: bool,
}

impl WorkerPool {
    pub fn new(limit: usize, progress: bool) -> Result<Self> {
        if limit == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            progress,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot; fails once the pool has been shut down
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| OrchestrationError::PoolClosed)
    }

    /// Stop handing out slots. Calls already holding one finish normally.
    pub fn shutdown(&self) {
        if !self.semaphore.is_closed() {
            debug!("Shutting down worker pool");
            self.semaphore.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Run `op` over every item and collect the outcomes in input order
    ///
    /// Failures stay in their own slot: a failing or panicking item never
    /// cancels the others.
    pub async fn execute<T, R, X, F, Fut>(
        &self,
        label: &str,
        items: Vec<T>,
        op: F,
    ) -> BatchReport<std::result::Result<R, X>>
    where
        T: Send + 'static,
        R: Send + 'static,
        X: From<OrchestrationError> + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, X>> + Send + 'static,
    {
        let total = items.len();
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let tracker =
            spawn_progress_tracker(label.to_string(), total, self.progress && total > 0, telemetry_rx);

        let op = Arc::new(op);
        let mut slots: Vec<Option<std::result::Result<R, X>>> = (0..total).map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            if self.is_closed() {
                slots[index] = Some(Err(X::from(OrchestrationError::PoolClosed)));
                continue;
            }

            // Wait if we've reached the concurrency limit
            while join_set.len() >= self.limit {
                if let Some(joined) = join_set.join_next().await {
                    store_outcome(label, &mut slots, joined);
                }
            }

            let op = Arc::clone(&op);
            let telemetry_tx = telemetry_tx.clone();
            join_set.spawn(async move {
                let _ = telemetry_tx.send(TelemetryEvent::ItemStarted);
                let started = Instant::now();
                let outcome = AssertUnwindSafe((*op)(item)).catch_unwind().await;
                let _ = telemetry_tx.send(TelemetryEvent::ItemCompleted {
                    ok: matches!(outcome, Ok(Ok(_))),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                (index, outcome)
            });
        }

        // Wait for remaining tasks
        while let Some(joined) = join_set.join_next().await {
            store_outcome(label, &mut slots, joined);
        }

        // Close the channel so the tracker drains and returns
        drop(telemetry_tx);
        let stats = tracker.await.unwrap_or_default();

        let results = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(X::from(OrchestrationError::TaskPanicked(
                        "task ended without reporting a result".to_string(),
                    )))
                })
            })
            .collect();

        BatchReport { results, stats }
    }
}

type TaskOutcome<R, X> = (
    usize,
    std::result::Result<std::result::Result<R, X>, Box<dyn std::any::Any + Send>>,
);

fn store_outcome<R, X: From<OrchestrationError>>(
    label: &str,
    slots: &mut [Option<std::result::Result<R, X>>],
    joined: std::result::Result<TaskOutcome<R, X>, tokio::task::JoinError>,
) {
    match joined {
        Ok((index, Ok(result))) => slots[index] = Some(result),
        Ok((index, Err(payload))) => {
            let message = panic_message(payload.as_ref());
            warn!("{} item {} panicked: {}", label, index, message);
            slots[index] = Some(Err(X::from(OrchestrationError::TaskPanicked(message))));
        }
        // Unreachable unless the runtime aborts the task; the slot stays empty
        Err(e) => warn!("{} task failed to join: {:#}", label, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let pool = WorkerPool::new(4, false).unwrap();
        let items: Vec<u64> = (0..12).collect();

        let report = pool
            .execute("Ordering", items, |n| async move {
                // Later items finish first
                tokio::time::sleep(Duration::from_millis(24 - 2 * n)).await;
                Ok::<u64, OrchestrationError>(n * 10)
            })
            .await;

        let values: Vec<u64> = report.results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..12).map(|n| n * 10).collect::<Vec<_>>());
        assert_eq!(report.stats.items_completed, 12);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let pool = WorkerPool::new(3, false).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let counters = (Arc::clone(&in_flight), Arc::clone(&max_seen));
        let report = pool
            .execute("Throttle", (0..20).collect::<Vec<u32>>(), move |_| {
                let (in_flight, max_seen) = (Arc::clone(&counters.0), Arc::clone(&counters.1));
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), OrchestrationError>(())
                }
            })
            .await;

        assert!(report.all_succeeded());
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let pool = WorkerPool::new(2, false).unwrap();
        let report = pool
            .execute("Panics", vec![1, 2, 3], |n| async move {
                if n == 2 {
                    panic!("item two exploded");
                }
                Ok::<i32, OrchestrationError>(n)
            })
            .await;

        assert_eq!(report.len(), 3);
        assert_eq!(*report.results[0].as_ref().unwrap(), 1);
        assert!(matches!(
            &report.results[1],
            Err(OrchestrationError::TaskPanicked(message)) if message.contains("exploded")
        ));
        assert_eq!(*report.results[2].as_ref().unwrap(), 3);
        assert_eq!(report.stats.items_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_new_work() {
        let pool = WorkerPool::new(2, false).unwrap();
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire().await,
            Err(OrchestrationError::PoolClosed)
        ));

        let report = pool
            .execute("Closed", vec![1, 2], |n| async move {
                Ok::<i32, OrchestrationError>(n)
            })
            .await;
        assert_eq!(report.failed(), 2);
        assert!(
            report
                .results
                .iter()
                .all(|r| matches!(r, Err(OrchestrationError::PoolClosed)))
        );
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(matches!(
            WorkerPool::new(0, false),
            Err(OrchestrationError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let pool = WorkerPool::new(1, true).unwrap();
        let report = pool
            .execute("Nothing", Vec::<u8>::new(), |n| async move {
                Ok::<u8, OrchestrationError>(n)
            })
            .await;
        assert!(report.is_empty());
    }
}
