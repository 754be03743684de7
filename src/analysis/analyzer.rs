use std::collections::BTreeMap;

use serde_json::Value;

use crate::entities::{Experiment, Simulation, Uid};

/// A map-reduce stage over simulation outputs
///
/// Callbacks take `&self`: `select_simulation_data` runs concurrently for
/// many simulations, so any state an analyzer accumulates must sit behind its
/// own synchronization.
pub trait Analyzer: Send + Sync {
    /// Name reported in outcomes and errors
    fn uid(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }

    /// Files fetched for every selected simulation
    fn filenames(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once before the first experiment
    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per experiment, in input order, before its simulations are mapped
    fn per_experiment(&self, _experiment: &Experiment) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether this analyzer wants `simulation`
    fn filter(&self, _simulation: &Simulation) -> bool {
        true
    }

    /// Map step: reduce one simulation's files to the data kept for `finalize`
    fn select_simulation_data(
        &self,
        data: &BTreeMap<String, Vec<u8>>,
        simulation: &Simulation,
    ) -> anyhow::Result<Value>;

    /// Reduce step, called once with every successfully selected simulation
    fn finalize(&self, all_data: &SimulationData) -> anyhow::Result<Value>;

    /// Release resources; called after `finalize` whatever its outcome
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Selected data per simulation, in experiment then simulation order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationData {
    entries: Vec<(Uid, Value)>,
}

impl SimulationData {
    pub fn new(entries: Vec<(Uid, Value)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, simulation: &Uid) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(uid, _)| uid == simulation)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uid, &Value)> {
        self.entries.iter().map(|(uid, value)| (uid, value))
    }

    pub fn uids(&self) -> impl Iterator<Item = &Uid> {
        self.entries.iter().map(|(uid, _)| uid)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, value)| value)
    }
}
