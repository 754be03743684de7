use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{PROGRESS_CHARS, PROGRESS_TEMPLATE};

/// Telemetry events sent from batch tasks to the progress tracker
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A task acquired its pool slot and started its backend call
    ItemStarted,
    /// A task finished, successfully or not
    ItemCompleted { ok: bool, duration_ms: u64 },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProgressStats {
    pub items_started: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub item_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::ItemStarted => {
                self.items_started += 1;
            }
            TelemetryEvent::ItemCompleted { ok, duration_ms } => {
                self.items_completed += 1;
                if !ok {
                    self.items_failed += 1;
                }
                self.item_durations_ms.push(*duration_ms);
            }
        }
    }

    /// Calculate percentile from item durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.item_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.item_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

/// Install the global `tracing` subscriber
///
/// Only the first call installs a subscriber; later calls are ignored.
/// Returns whether this call installed it.
pub fn init_logging(quiet: bool) -> bool {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("simsuite=warn")
    } else {
        EnvFilter::new("simsuite=info")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Spawn the task that folds telemetry into stats and drives the progress bar
///
/// The task ends once every sender has been dropped and returns the final stats.
pub(crate) fn spawn_progress_tracker(
    label: String,
    total: usize,
    show_bar: bool,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> JoinHandle<ProgressStats> {
    let bar = show_bar.then(|| {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(PROGRESS_CHARS);
        bar.set_style(style);
        bar.set_message(label.clone());
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    });

    tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);
            if let Some(ref bar) = bar {
                bar.set_position(stats.items_completed as u64);
            }
        }

        if let Some(bar) = bar {
            bar.finish();
        }

        let (p50, p90, p99) = stats.get_percentiles();
        if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
            info!(
                "{}: {} items, {} failed (p50: {}ms, p90: {}ms, p99: {}ms)",
                label, stats.items_completed, stats.items_failed, p50, p90, p99
            );
        }

        stats
    })
}
