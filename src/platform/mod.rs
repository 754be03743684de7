//! Backend contract
//!
//! A backend implements [`ItemBackend`] once per item kind and exposes the
//! three implementations through [`Platform`]. The session threads every call
//! through the same create/run/refresh pipeline, so backends only supply the
//! platform-specific step of each stage.

mod file;
mod registry;

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use file::{FileJobPlatform, FileJobSpecification, clean_name};
pub use registry::{PlatformRegistry, PlatformSpecification};

use crate::entities::{Entity, Experiment, ItemType, Simulation, Suite, Uid};
use crate::status::StatusReport;

/// Backend-native representation of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformItem {
    /// Id issued by the backend
    pub id: Uid,
    pub kind: ItemType,
    /// Backend instance owning the item
    pub platform_id: String,
    /// Whatever the backend stores for the item
    pub raw: serde_json::Value,
}

/// Platform operations for one item kind
#[async_trait]
pub trait ItemBackend<E: Entity>: Send + Sync {
    /// Materialize `entity` and issue its id
    async fn platform_create(&self, entity: &E) -> anyhow::Result<PlatformItem>;

    /// Upload the entity's assets; called after the id has been assigned
    async fn send_assets(&self, entity: &E) -> anyhow::Result<()>;

    /// Submit or start execution. Must not upload assets.
    async fn platform_run_item(&self, entity: &E) -> anyhow::Result<()>;

    async fn post_run_item(&self, _entity: &E) -> anyhow::Result<()> {
        Ok(())
    }

    async fn refresh_status(&self, entity: &E) -> anyhow::Result<StatusReport>;

    /// Whether a cancellation has been recorded for the item's job
    async fn cancellation_recorded(&self, _entity: &E) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Read the requested files; missing files are absent from the result
    async fn get_assets(
        &self,
        entity: &E,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>>;

    async fn list_assets(&self, entity: &E) -> anyhow::Result<Vec<String>>;

    /// Parent in the backend's hierarchy, `None` for top-level items
    async fn get_parent(&self, entity: &E) -> anyhow::Result<Option<PlatformItem>>;

    /// Convert a backend-native item into an entity
    ///
    /// The default expects `raw` to be a serialized entity and fills in the
    /// id and platform from the item.
    fn to_entity(&self, item: PlatformItem) -> anyhow::Result<E> {
        let PlatformItem {
            id,
            kind,
            platform_id,
            raw,
        } = item;
        anyhow::ensure!(
            kind == E::KIND,
            "Cannot convert {kind} {id} into a {}",
            E::KIND
        );
        let mut entity: E = serde_json::from_value(raw)
            .with_context(|| format!("Failed to decode {kind} {id}"))?;
        let header = entity.header_mut();
        header.restore_uid(Some(id));
        header.set_platform_id(platform_id);
        Ok(entity)
    }
}

/// An execution environment: the operations for each item kind
pub trait Platform: Send + Sync {
    /// Identifier stamped on every item this platform creates
    fn platform_id(&self) -> &str;

    fn suites(&self) -> &dyn ItemBackend<Suite>;

    fn experiments(&self) -> &dyn ItemBackend<Experiment>;

    fn simulations(&self) -> &dyn ItemBackend<Simulation>;
}
