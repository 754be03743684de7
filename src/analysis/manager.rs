use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use super::{Analyzer, SimulationData};
use crate::coordination::panic_message;
use crate::entities::{Entity, Experiment, Uid};
use crate::error::{AnalyzerStage, OrchestrationError, Result};
use crate::session::Session;

/// Result of one analyzer over the whole analysis
#[derive(Debug)]
pub struct AnalyzerOutcome {
    pub analyzer: String,
    /// The `finalize` result, or the error that made the analyzer fail
    pub result: Result<Value>,
    /// Simulations excluded because their map step failed
    pub failed_simulations: Vec<(Uid, OrchestrationError)>,
}

/// Map step for one simulation and every analyzer that selected it
struct MapJob {
    experiment: Arc<Experiment>,
    simulation: usize,
    analyzers: Vec<usize>,
}

/// Runs analyzers over the simulations of one or more experiments
///
/// The map stage shares the session's worker pool with batch operations.
pub struct AnalyzeManager {
    session: Session,
    experiments: Vec<Arc<Experiment>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl AnalyzeManager {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            experiments: Vec::new(),
            analyzers: Vec::new(),
        }
    }

    pub fn add_experiment(&mut self, experiment: Experiment) -> &mut Self {
        self.experiments.push(Arc::new(experiment));
        self
    }

    pub fn add_analyzer(&mut self, analyzer: impl Analyzer + 'static) -> &mut Self {
        self.analyzers.push(Arc::new(analyzer));
        self
    }

    /// Add an analyzer the caller keeps a handle to
    pub fn add_shared_analyzer(&mut self, analyzer: Arc<dyn Analyzer>) -> &mut Self {
        self.analyzers.push(analyzer);
        self
    }

    pub fn experiments(&self) -> &[Arc<Experiment>] {
        &self.experiments
    }

    /// Run every analyzer and return one outcome per analyzer, in order
    ///
    /// A failing or panicking analyzer never affects the others. `destroy` is
    /// called on every analyzer before returning; its failures are only logged.
    pub async fn analyze(&self) -> Vec<AnalyzerOutcome> {
        let count = self.analyzers.len();
        let names: Vec<String> = self.analyzers.iter().map(|a| a.uid()).collect();
        let mut fatal: Vec<Option<OrchestrationError>> = (0..count).map(|_| None).collect();

        info!(
            "Analyzing {} experiments with {} analyzers",
            self.experiments.len(),
            count
        );

        for (index, analyzer) in self.analyzers.iter().enumerate() {
            if let Err(error) = guarded(&names[index], AnalyzerStage::Initialize, || {
                analyzer.initialize()
            }) {
                warn!("{}", error);
                fatal[index] = Some(error);
            }
        }

        // Experiment hooks and filters, sequential in input order
        let mut jobs = Vec::new();
        for experiment in &self.experiments {
            for (index, analyzer) in self.analyzers.iter().enumerate() {
                if fatal[index].is_some() {
                    continue;
                }
                if let Err(error) = guarded(&names[index], AnalyzerStage::PerExperiment, || {
                    analyzer.per_experiment(experiment)
                }) {
                    warn!("{}", error);
                    fatal[index] = Some(error);
                }
            }

            for (position, simulation) in experiment.simulations().iter().enumerate() {
                let mut selected = Vec::new();
                for index in 0..count {
                    if fatal[index].is_some() {
                        continue;
                    }
                    let analyzer = &self.analyzers[index];
                    let wanted = guarded(&names[index], AnalyzerStage::Filter, || {
                        Ok(analyzer.filter(simulation))
                    });
                    match wanted {
                        Ok(true) => selected.push(index),
                        Ok(false) => {}
                        Err(error) => {
                            warn!("{}", error);
                            fatal[index] = Some(error);
                        }
                    }
                }
                if !selected.is_empty() {
                    jobs.push(MapJob {
                        experiment: Arc::clone(experiment),
                        simulation: position,
                        analyzers: selected,
                    });
                }
            }
        }

        let job_simulations: Vec<Uid> = jobs
            .iter()
            .map(|job| job.experiment.simulations()[job.simulation].uid())
            .collect();
        let job_analyzers: Vec<Vec<usize>> = jobs.iter().map(|job| job.analyzers.clone()).collect();

        // Map stage
        let session = self.session.clone();
        let analyzers = Arc::new(self.analyzers.clone());
        let report = self
            .session
            .pool()
            .execute("Analyzing Simulations", jobs, move |job: MapJob| {
                let session = session.clone();
                let analyzers = Arc::clone(&analyzers);
                async move { Ok::<_, OrchestrationError>(map_simulation(&session, &analyzers, job).await) }
            })
            .await;

        let mut selected: Vec<Vec<(Uid, Value)>> = (0..count).map(|_| Vec::new()).collect();
        let mut failures: Vec<Vec<(Uid, OrchestrationError)>> =
            (0..count).map(|_| Vec::new()).collect();

        for ((result, uid), indices) in report
            .results
            .into_iter()
            .zip(job_simulations)
            .zip(job_analyzers)
        {
            match result {
                Ok(outcomes) => {
                    for (index, outcome) in outcomes {
                        match outcome {
                            Ok(value) => selected[index].push((uid, value)),
                            Err(error) => {
                                warn!("Excluding simulation {} from '{}': {}", uid, names[index], error);
                                failures[index].push((uid, error));
                            }
                        }
                    }
                }
                Err(error) => {
                    let message = error.to_string();
                    for index in indices {
                        failures[index].push((uid, OrchestrationError::TaskPanicked(message.clone())));
                    }
                }
            }
        }

        // Reduce stage
        let mut outcomes = Vec::with_capacity(count);
        for (index, analyzer) in self.analyzers.iter().enumerate() {
            let result = match fatal[index].take() {
                Some(error) => Err(error),
                None => {
                    let all_data = SimulationData::new(std::mem::take(&mut selected[index]));
                    guarded(&names[index], AnalyzerStage::Finalize, || analyzer.finalize(&all_data))
                }
            };
            if let Err(error) = &result {
                warn!("{}", error);
            }
            outcomes.push(AnalyzerOutcome {
                analyzer: names[index].clone(),
                result,
                failed_simulations: std::mem::take(&mut failures[index]),
            });
        }

        for (index, analyzer) in self.analyzers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| analyzer.destroy())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Analyzer '{}' failed to clean up: {:#}", names[index], e),
                Err(payload) => warn!(
                    "Analyzer '{}' panicked during clean up: {}",
                    names[index],
                    panic_message(payload.as_ref())
                ),
            }
        }

        info!(
            "Analysis complete: {} of {} analyzers succeeded",
            outcomes.iter().filter(|o| o.result.is_ok()).count(),
            count
        );
        outcomes
    }
}

fn stage_error(analyzer: &str, stage: AnalyzerStage, source: anyhow::Error) -> OrchestrationError {
    OrchestrationError::AnalyzerStage {
        analyzer: analyzer.to_string(),
        stage,
        source,
    }
}

/// Run one analyzer callback, reporting a panic as a failure of that stage
fn guarded<T>(
    analyzer: &str,
    stage: AnalyzerStage,
    callback: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result.map_err(|source| stage_error(analyzer, stage, source)),
        Err(payload) => Err(stage_error(
            analyzer,
            stage,
            anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

async fn map_simulation(
    session: &Session,
    analyzers: &[Arc<dyn Analyzer>],
    job: MapJob,
) -> Vec<(usize, Result<Value>)> {
    let mut outcomes = Vec::with_capacity(job.analyzers.len());
    for &index in &job.analyzers {
        let outcome = select_data(session, &analyzers[index], &job.experiment, job.simulation).await;
        outcomes.push((index, outcome));
    }
    outcomes
}

/// Fetch the analyzer's files and run its selection off the async runtime
async fn select_data(
    session: &Session,
    analyzer: &Arc<dyn Analyzer>,
    experiment: &Arc<Experiment>,
    position: usize,
) -> Result<Value> {
    let simulation = &experiment.simulations()[position];
    let filenames = analyzer.filenames();

    let mut data = BTreeMap::new();
    if !filenames.is_empty() {
        for (filename, content) in session.get_assets(simulation, &filenames).await? {
            data.insert(filename, content?);
        }
    }

    let _permit = session.pool().acquire().await?;
    let name = analyzer.uid();
    let analyzer = Arc::clone(analyzer);
    let experiment = Arc::clone(experiment);
    tokio::task::spawn_blocking(move || {
        analyzer.select_simulation_data(&data, &experiment.simulations()[position])
    })
    .await
    .map_err(|e| OrchestrationError::TaskPanicked(format!("{name} select_simulation_data: {e}")))?
    .map_err(|source| stage_error(&name, AnalyzerStage::SelectSimulationData, source))
}
