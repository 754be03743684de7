use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Asset, AssetCollection, Entity, EntityHeader, Experiment, ItemType, Uid};
use crate::config::SIMULATION_CONFIG_FILE;
use crate::error::Result;
use crate::platform::{ItemBackend, Platform};

/// One concrete unit of execution within an experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Simulation {
    #[serde(flatten)]
    header: EntityHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent_id: Option<Uid>,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default)]
    assets: AssetCollection,
}

impl Simulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Fresh simulation with the user-defined fields of `template`
    ///
    /// Ids, status and parent are not carried over.
    pub fn from_template(template: &Simulation) -> Self {
        Self {
            header: template.header.detached(),
            name: template.name.clone(),
            parent_id: None,
            parameters: template.parameters.clone(),
            command: template.command.clone(),
            assets: template.assets.clone(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn set_command(&mut self, command: impl Into<String>) {
        self.command = Some(command.into());
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Set a parameter, returning the previous value
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.parameters.insert(name.into(), value.into())
    }

    pub fn update_parameters<I, K>(&mut self, parameters: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (name, value) in parameters {
            self.parameters.insert(name.into(), value);
        }
    }

    pub fn assets(&self) -> &AssetCollection {
        &self.assets
    }

    pub fn add_asset(&mut self, asset: Asset, fail_on_duplicate: bool) -> Result<()> {
        self.assets.add_asset(asset, fail_on_duplicate)
    }

    /// `config.json` payload describing the parameters
    fn parameter_file(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&json!({ "parameters": self.parameters }))
            .context("Failed to serialize simulation parameters")
    }
}

impl super::sealed::Sealed for Simulation {
    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

impl Entity for Simulation {
    const KIND: ItemType = ItemType::Simulation;
    type Parent = Experiment;

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn identity(&self) -> Value {
        json!({
            "name": self.name,
            "parent_id": self.parent_id,
            "parameters": self.parameters,
            "command": self.command,
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
        platform.simulations()
    }

    /// Writes the parameters to `config.json` so the job can read them
    fn pre_creation(&mut self) -> anyhow::Result<()> {
        if self.parameters.is_empty() {
            return Ok(());
        }
        let content = self.parameter_file()?;
        self.assets
            .add_asset(Asset::new(SIMULATION_CONFIG_FILE, content), false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_creation_writes_parameter_file() {
        let mut sim = Simulation::named("run");
        sim.set_parameter("beta", json!(0.25));
        sim.pre_creation().unwrap();

        let asset = sim.assets().get(SIMULATION_CONFIG_FILE).unwrap();
        let parsed: Value = serde_json::from_slice(&asset.content).unwrap();
        assert_eq!(parsed, json!({"parameters": {"beta": 0.25}}));

        // Running it again replaces the file instead of failing
        sim.set_parameter("beta", json!(0.5));
        sim.pre_creation().unwrap();
        assert_eq!(sim.assets().len(), 1);
        let asset = sim.assets().get(SIMULATION_CONFIG_FILE).unwrap();
        let parsed: Value = serde_json::from_slice(&asset.content).unwrap();
        assert_eq!(parsed["parameters"]["beta"], json!(0.5));
    }

    #[test]
    fn test_no_parameter_file_without_parameters() {
        let mut sim = Simulation::new();
        sim.pre_creation().unwrap();
        assert!(sim.assets().is_empty());
    }

    #[test]
    fn test_template_drops_platform_state() {
        let mut template = Simulation::named("base");
        template.set_parameter("a", json!(1));
        template.set_tag("group", "g1");
        template.set_uid(Uid::new_v4()).unwrap();

        let copy = Simulation::from_template(&template);
        assert_eq!(copy.header().explicit_uid(), None);
        assert_eq!(copy.get_parameter("a"), Some(&json!(1)));
        assert_eq!(copy.tags().get("group").map(String::as_str), Some("g1"));
        assert_ne!(copy.uid(), template.uid());
    }

    #[test]
    fn test_update_parameters() {
        let mut sim = Simulation::new();
        sim.update_parameters([("a", json!(1)), ("b", json!("x"))]);
        assert_eq!(sim.parameters().len(), 2);
        assert_eq!(sim.set_parameter("a", 2), Some(json!(1)));
    }
}
