use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Entity, EntityHeader, Experiment, HasChildren, ItemType, Uid, check_parent};
use crate::error::Result;
use crate::platform::{ItemBackend, Platform};
use crate::session::Session;

/// Top-level grouping of experiments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Suite {
    #[serde(flatten)]
    header: EntityHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    pub(crate) experiments: Vec<Experiment>,
}

impl Suite {
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

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
        self.relink_children();
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn experiments_mut(&mut self) -> &mut [Experiment] {
        &mut self.experiments
    }

    pub fn experiment(&self, uid: Uid) -> Option<&Experiment> {
        self.child(uid)
    }

    pub fn add_experiment(&mut self, experiment: Experiment) -> Result<()> {
        self.add_child(experiment)
    }
}

impl HasChildren for Suite {
    type Child = Experiment;

    fn children(&self) -> &[Experiment] {
        &self.experiments
    }

    fn add_child(&mut self, mut child: Experiment) -> Result<()> {
        let uid = self.uid();
        check_parent(&child, uid)?;
        child.parent_id = Some(uid);
        child.relink_children();
        self.experiments.push(child);
        Ok(())
    }
}

impl super::sealed::Sealed for Suite {
    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

#[async_trait]
impl Entity for Suite {
    const KIND: ItemType = ItemType::Suite;
    type Parent = Suite;

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn identity(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
        })
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn parent_id(&self) -> Option<Uid> {
        None
    }

    fn backend(platform: &dyn Platform) -> &dyn ItemBackend<Self> {
        platform.suites()
    }

    fn relink_children(&mut self) {
        let uid = self.uid();
        for experiment in &mut self.experiments {
            experiment.parent_id = Some(uid);
            experiment.relink_children();
        }
    }

    /// Creates every experiment, then every simulation of each experiment
    async fn prepare_children(&mut self, session: &Session) -> Result<()> {
        let prepared = self
            .experiments
            .iter()
            .all(|e| e.is_created() && e.simulations().iter().all(|s| s.is_created()));
        if prepared {
            return Ok(());
        }

        let experiments = std::mem::take(&mut self.experiments);
        let (experiments, errors) = session.create_children(experiments).await;
        self.experiments = experiments;
        if let Some(first) = errors.into_iter().next() {
            return Err(first);
        }

        let mut first_error = None;
        for experiment in &mut self.experiments {
            if let Err(e) = experiment.prepare_children(session).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs every experiment; their simulations already exist
    async fn commission_children(&mut self, session: &Session) -> Result<()> {
        let experiments = std::mem::take(&mut self.experiments);
        let (experiments, errors) = session.run_children(experiments).await;
        self.experiments = experiments;
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Simulation;

    #[test]
    fn test_relink_cascades_to_simulations() {
        let mut experiment = Experiment::named("exp");
        experiment.add_simulation(Simulation::named("a")).unwrap();

        let mut suite = Suite::named("suite");
        suite.add_experiment(experiment).unwrap();

        let experiment = &suite.experiments()[0];
        assert_eq!(experiment.parent_id(), Some(suite.uid()));
        assert_eq!(experiment.simulations()[0].parent_id(), Some(experiment.uid()));

        suite.set_uid(Uid::new_v4()).unwrap();
        let experiment = &suite.experiments()[0];
        assert_eq!(experiment.parent_id(), Some(suite.uid()));
        assert_eq!(experiment.simulations()[0].parent_id(), Some(experiment.uid()));
        assert!(suite.experiment(experiment.uid()).is_some());
    }

    #[test]
    fn test_suite_identity_ignores_experiments() {
        let mut suite = Suite::named("suite");
        let before = suite.uid();
        suite.add_experiment(Experiment::named("exp")).unwrap();
        assert_eq!(suite.uid(), before);
        assert_eq!(suite.parent_id(), None);
    }
}
