use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{
    Asset, AssetCollection, Entity, EntityHeader, HasChildren, ItemType, Simulation, Suite,
    SweepBuilder, Uid, check_parent,
};
use crate::error::Result;
use crate::platform::{ItemBackend, Platform};
use crate::session::Session;
use crate::status::{self, EntityStatus};

/// A named unit of work: simulations sharing a set of assets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(flatten)]
    header: EntityHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent_id: Option<Uid>,
    #[serde(default)]
    assets: AssetCollection,
    #[serde(default)]
    pub(crate) simulations: Vec<Simulation>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
        self.relink_children();
    }

    pub fn assets(&self) -> &AssetCollection {
        &self.assets
    }

    /// Add an asset shared by every simulation of the experiment
    pub fn add_asset(&mut self, asset: Asset, fail_on_duplicate: bool) -> Result<()> {
        self.assets.add_asset(asset, fail_on_duplicate)?;
        self.relink_children();
        Ok(())
    }

    pub fn remove_asset(&mut self, filename: &str) -> Option<Asset> {
        let removed = self.assets.remove(filename);
        if removed.is_some() {
            self.relink_children();
        }
        removed
    }

    pub fn simulations(&self) -> &[Simulation] {
        &self.simulations
    }

    /// Mutable access for in-place status refreshes
    pub fn simulations_mut(&mut self) -> &mut [Simulation] {
        &mut self.simulations
    }

    pub fn simulation(&self, uid: Uid) -> Option<&Simulation> {
        self.child(uid)
    }

    pub fn add_simulation(&mut self, simulation: Simulation) -> Result<()> {
        self.add_child(simulation)
    }

    /// Append every simulation generated by `sweep` from `base`
    pub fn add_sweep(&mut self, sweep: &SweepBuilder, base: &Simulation) -> Result<usize> {
        let generated = sweep.simulations(base);
        let count = generated.len();
        for simulation in generated {
            self.add_simulation(simulation)?;
        }
        Ok(count)
    }

    /// Counts of simulations per status; `None` counts uncreated simulations
    pub fn status_counts(&self) -> std::collections::BTreeMap<Option<EntityStatus>, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for simulation in &self.simulations {
            *counts.entry(simulation.status()).or_insert(0) += 1;
        }
        counts
    }
}

impl HasChildren for Experiment {
    type Child = Simulation;

    fn children(&self) -> &[Simulation] {
        &self.simulations
    }

    fn add_child(&mut self, mut child: Simulation) -> Result<()> {
        let uid = self.uid();
        check_parent(&child, uid)?;
        child.parent_id = Some(uid);
        self.simulations.push(child);
        Ok(())
    }
}

impl super::sealed::Sealed for Experiment {
    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

#[async_trait]
impl Entity for Experiment {
    const KIND: ItemType = ItemType::Experiment;
    type Parent = Suite;

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn identity(&self) -> Value {
        json!({
            "name": self.name,
            "parent_id": self.parent_id,
            "assets": self.assets.fingerprint(),
        })
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn parent_id(&self) -> Option<Uid> {
        self.parent_id
    }

    fn backend(platform: &dyn Platform) -> &dyn ItemBackend<Self> {
        platform.experiments()
    }

    fn relink_children(&mut self) {
        let uid = self.uid();
        for simulation in &mut self.simulations {
            simulation.parent_id = Some(uid);
        }
    }

    /// Creates every simulation that is not on the platform yet
    async fn prepare_children(&mut self, session: &Session) -> Result<()> {
        if self.simulations.iter().all(|s| s.is_created()) {
            return Ok(());
        }
        let simulations = std::mem::take(&mut self.simulations);
        let (simulations, errors) = session.create_children(simulations).await;
        self.simulations = simulations;
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    /// The platform submitted the simulations together with the experiment
    async fn commission_children(&mut self, _session: &Session) -> Result<()> {
        for simulation in &mut self.simulations {
            if simulation.status() == Some(EntityStatus::Created) {
                status::advance(simulation, EntityStatus::Commissioned)?;
            }
        }
        debug!(
            "Commissioned {} simulations of experiment {}",
            self.simulations.len(),
            self.uid()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;

    #[test]
    fn test_add_simulation_links_parent() {
        let mut experiment = Experiment::named("exp");
        experiment.add_simulation(Simulation::named("a")).unwrap();
        experiment.add_simulation(Simulation::named("b")).unwrap();

        let uid = experiment.uid();
        assert_eq!(experiment.simulations().len(), 2);
        assert!(experiment.simulations().iter().all(|s| s.parent_id() == Some(uid)));

        let first = experiment.simulations()[0].uid();
        assert_eq!(experiment.simulation(first).unwrap().name(), Some("a"));
        assert!(experiment.simulation(Uid::new_v4()).is_none());
    }

    #[test]
    fn test_add_simulation_owned_elsewhere() {
        let mut first = Experiment::named("first");
        let mut second = Experiment::named("second");
        first.add_simulation(Simulation::named("a")).unwrap();

        let moved = first.simulations()[0].clone();
        let err = second.add_simulation(moved).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidHierarchy { existing_parent, requested_parent, .. }
                if existing_parent == first.uid() && requested_parent == second.uid()
        ));
        assert!(second.simulations().is_empty());
    }

    #[test]
    fn test_children_follow_parent_uid_changes() {
        let mut experiment = Experiment::named("exp");
        experiment.add_simulation(Simulation::named("a")).unwrap();

        experiment.set_tag("phase", "2");
        assert_eq!(experiment.simulations()[0].parent_id(), Some(experiment.uid()));

        let issued = Uid::new_v4();
        experiment.set_uid(issued).unwrap();
        assert_eq!(experiment.simulations()[0].parent_id(), Some(issued));
    }

    #[test]
    fn test_status_counts() {
        let mut experiment = Experiment::named("exp");
        for name in ["a", "b", "c"] {
            experiment.add_simulation(Simulation::named(name)).unwrap();
        }
        for simulation in &mut experiment.simulations_mut()[..2] {
            status::advance(simulation, EntityStatus::Created).unwrap();
        }
        status::advance(&mut experiment.simulations_mut()[0], EntityStatus::Commissioned).unwrap();

        let counts = experiment.status_counts();
        assert_eq!(counts.get(&None), Some(&1));
        assert_eq!(counts.get(&Some(EntityStatus::Created)), Some(&1));
        assert_eq!(counts.get(&Some(EntityStatus::Commissioned)), Some(&1));
        assert_eq!(counts.values().sum::<usize>(), 3);
    }

    #[test]
    fn test_identity_excludes_children() {
        let mut experiment = Experiment::named("exp");
        let before = experiment.uid();
        experiment.add_simulation(Simulation::named("a")).unwrap();
        assert_eq!(experiment.uid(), before);

        experiment.add_asset(Asset::new("shared.txt", "x"), true).unwrap();
        assert_ne!(experiment.uid(), before);
    }
}
