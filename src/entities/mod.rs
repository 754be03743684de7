//! Suite / experiment / simulation hierarchy
//!
//! A suite owns its experiments and an experiment owns its simulations. A
//! child only records its parent's uid, so the ownership graph stays a tree.
//! Every item is identified by an explicit uid once a platform has issued
//! one, and by a content hash of its identity fields before that.

mod assets;
mod experiment;
mod identity;
mod simulation;
mod suite;
mod sweep;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use assets::{Asset, AssetCollection};
pub use experiment::Experiment;
pub use identity::content_uid;
pub use simulation::Simulation;
pub use suite::Suite;
pub use sweep::SweepBuilder;

use crate::error::{OrchestrationError, Result};
use crate::platform::{ItemBackend, Platform};
use crate::session::Session;
use crate::status::EntityStatus;

pub type Uid = uuid::Uuid;

/// Backend-side key/value metadata
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Suite,
    Experiment,
    Simulation,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemType::Suite => "Suite",
            ItemType::Experiment => "Experiment",
            ItemType::Simulation => "Simulation",
        };
        f.write_str(name)
    }
}

/// Fields shared by every item kind
///
/// Status and ids are only written by this crate; callers read them through
/// the [`Entity`] accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityHeader {
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    uid: Option<Uid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: Tags,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<EntityStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,

    // Transient: never hashed, never persisted
    #[serde(skip)]
    last_refreshed: Option<DateTime<Utc>>,
    #[serde(skip)]
    exit_code: Option<i32>,
}

impl EntityHeader {
    pub fn explicit_uid(&self) -> Option<Uid> {
        self.uid
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Time of the last successful status refresh
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    /// Exit code seen by the last status refresh
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn restore_uid(&mut self, uid: Option<Uid>) {
        self.uid = uid;
    }

    pub(crate) fn set_platform_id(&mut self, platform_id: String) {
        self.platform_id = Some(platform_id);
    }

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        self.status = Some(status);
    }

    pub(crate) fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }

    pub(crate) fn record_refresh(&mut self, exit_code: Option<i32>) {
        self.last_refreshed = Some(Utc::now());
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
    }

    /// Clear everything a platform assigned, keeping only the tags
    pub(crate) fn detached(&self) -> Self {
        Self {
            tags: self.tags.clone(),
            ..Self::default()
        }
    }
}

/// Lightweight projection of an item for backend stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub kind: ItemType,
    pub id: Uid,
    #[serde(default)]
    pub platform_id: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

pub(crate) mod sealed {
    use super::EntityHeader;

    /// Write access to the header, kept out of reach of other crates
    pub trait Sealed {
        fn header_mut(&mut self) -> &mut EntityHeader;
    }
}

/// Behaviour shared by suites, experiments and simulations
///
/// Status and ids are read-only outside this crate:
///
/// ```compile_fail
/// use simsuite::entities::{Entity, Simulation};
///
/// let mut simulation = Simulation::new();
/// let _ = simulation.header_mut();
/// ```
#[async_trait]
pub trait Entity:
    sealed::Sealed + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ItemType;

    /// Kind returned by `get_parent`; a suite names itself and never has one
    type Parent: Entity;

    fn header(&self) -> &EntityHeader;

    /// Identity-relevant fields, excluding the header and any children
    fn identity(&self) -> serde_json::Value;

    fn name(&self) -> Option<&str>;

    fn parent_id(&self) -> Option<Uid>;

    /// Operations for this kind on `platform`
    fn backend(platform: &dyn Platform) -> &dyn ItemBackend<Self>;

    /// Validation and derived fields, run before the platform call
    fn pre_creation(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_creation(&mut self) {
        self.header_mut().set_created_at(Utc::now());
    }

    /// Re-point children at this item's current uid
    fn relink_children(&mut self) {}

    /// Make sure every child exists on the platform before this item runs
    async fn prepare_children(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Propagate a successful run to the children
    async fn commission_children(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn uid(&self) -> Uid {
        self.header().uid.unwrap_or_else(|| {
            identity::content_uid(
                Self::KIND,
                self.header().platform_id.as_deref(),
                &self.header().tags,
                &self.identity(),
            )
        })
    }

    /// Assign an explicit uid
    ///
    /// Re-assigning the current value is a no-op. Any other value is rejected
    /// once the item exists on a platform.
    fn set_uid(&mut self, uid: Uid) -> Result<()> {
        if self.header().uid == Some(uid) {
            return Ok(());
        }
        if self.is_created() {
            return Err(OrchestrationError::ImmutableIdentity {
                kind: Self::KIND,
                uid: self.uid(),
                requested: uid,
            });
        }
        self.header_mut().uid = Some(uid);
        self.relink_children();
        Ok(())
    }

    fn status(&self) -> Option<EntityStatus> {
        self.header().status
    }

    fn is_created(&self) -> bool {
        self.header().status.is_some()
    }

    fn platform_id(&self) -> Option<&str> {
        self.header().platform_id.as_deref()
    }

    fn tags(&self) -> &Tags {
        &self.header().tags
    }

    fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>)
    where
        Self: Sized,
    {
        self.header_mut().tags.insert(key.into(), value.into());
        self.relink_children();
    }

    fn remove_tag(&mut self, key: &str) -> Option<String> {
        let removed = self.header_mut().tags.remove(key);
        if removed.is_some() {
            self.relink_children();
        }
        removed
    }

    fn metadata(&self) -> EntityMetadata {
        EntityMetadata {
            kind: Self::KIND,
            id: self.uid(),
            platform_id: self.header().platform_id.clone(),
            tags: self.header().tags.clone(),
        }
    }
}

/// Items that own an ordered sequence of children
pub trait HasChildren: Entity {
    type Child: Entity;

    fn children(&self) -> &[Self::Child];

    /// Link `child` to this item and append it
    ///
    /// Fails with `InvalidHierarchy` when the child already names another parent.
    fn add_child(&mut self, child: Self::Child) -> Result<()>;

    fn child(&self, uid: Uid) -> Option<&Self::Child> {
        self.children().iter().find(|child| child.uid() == uid)
    }
}

/// Reject a child that already belongs to a different parent
pub(crate) fn check_parent<C: Entity>(child: &C, parent: Uid) -> Result<()> {
    match child.parent_id() {
        Some(existing) if existing != parent => Err(OrchestrationError::InvalidHierarchy {
            kind: C::KIND,
            child: child.uid(),
            existing_parent: existing,
            requested_parent: parent,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::sealed::Sealed;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uid_is_stable_across_reads() {
        let mut sim = Simulation::new();
        sim.set_parameter("a", json!(1));
        assert_eq!(sim.uid(), sim.uid());
    }

    #[test]
    fn test_identical_items_hash_identically() {
        let mut a = Simulation::named("run");
        let mut b = Simulation::named("run");
        a.set_parameter("x", json!(0.5));
        b.set_parameter("x", json!(0.5));
        a.set_tag("owner", "lab");
        b.set_tag("owner", "lab");
        assert_eq!(a.uid(), b.uid());

        b.set_parameter("x", json!(0.6));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_transient_fields_do_not_change_uid() {
        let mut sim = Simulation::named("run");
        let before = sim.uid();
        sim.header_mut().record_refresh(Some(3));
        assert_eq!(sim.uid(), before);
        assert_eq!(sim.header().exit_code(), Some(3));
    }

    #[test]
    fn test_set_uid_before_and_after_creation() {
        let mut sim = Simulation::new();
        let first = Uid::new_v4();
        let second = Uid::new_v4();

        sim.set_uid(first).unwrap();
        sim.set_uid(second).unwrap();
        assert_eq!(sim.uid(), second);

        sim.header_mut().set_status(EntityStatus::Created);
        sim.set_uid(second).unwrap();
        let err = sim.set_uid(first).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::ImmutableIdentity { requested, .. } if requested == first
        ));
        assert_eq!(sim.uid(), second);
    }

    #[test]
    fn test_remove_tag_relinks_children() {
        let mut experiment = Experiment::named("exp");
        experiment.set_tag("phase", "1");
        experiment.add_simulation(Simulation::named("a")).unwrap();
        let tagged = experiment.uid();

        assert_eq!(experiment.remove_tag("phase"), Some("1".to_string()));
        assert_ne!(experiment.uid(), tagged);
        assert_eq!(experiment.simulations()[0].parent_id(), Some(experiment.uid()));
        assert_eq!(experiment.remove_tag("phase"), None);
        assert!(experiment.tags().is_empty());
    }

    #[test]
    fn test_metadata_projection() {
        let mut experiment = Experiment::named("sweep");
        experiment
            .add_asset(Asset::new("model.bin", vec![0u8; 1024]), true)
            .unwrap();
        experiment.set_tag("study", "calibration");

        let metadata = experiment.metadata();
        assert_eq!(metadata.kind, ItemType::Experiment);
        assert_eq!(metadata.id, experiment.uid());
        assert_eq!(metadata.platform_id, None);
        assert_eq!(metadata.tags.get("study").map(String::as_str), Some("calibration"));

        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("assets").is_none());
    }

    #[test]
    fn test_header_serialization_skips_transients() {
        let mut sim = Simulation::named("run");
        sim.header_mut().record_refresh(Some(1));
        let json = serde_json::to_value(&sim).unwrap();
        assert!(json.get("exit_code").is_none());
        assert!(json.get("last_refreshed").is_none());
        assert!(json.get("status").is_none());

        let parsed: Simulation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.uid(), sim.uid());
    }
}
