//! In-memory platform with fault injection, shared by the test modules

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::entities::{Entity, Experiment, ItemType, Simulation, Suite, Uid};
use crate::platform::{ItemBackend, Platform, PlatformItem};
use crate::status::{EntityStatus, StatusReport};

struct StoredItem {
    kind: ItemType,
    raw: Value,
}

#[derive(Default)]
struct State {
    items: HashMap<Uid, StoredItem>,
    files: HashMap<Uid, HashMap<String, Vec<u8>>>,
    fail_create: HashSet<String>,
    fail_send: HashSet<String>,
    statuses: HashMap<Uid, StatusReport>,
    cancelled: HashSet<Uid>,
    submitted: Vec<Uid>,
    events: Vec<String>,
}

pub(crate) struct MemoryPlatform {
    platform_id: String,
    delay: Duration,
    state: Mutex<State>,
    create_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Counts a backend call as in flight until dropped
struct InFlight<'a>(&'a MemoryPlatform);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Every create and run call sleeps for `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            platform_id: "memory".to_string(),
            delay,
            state: Mutex::new(State::default()),
            create_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn fail_create_for(&self, name: &str) {
        self.state.lock().unwrap().fail_create.insert(name.to_string());
    }

    pub fn fail_send_assets_for(&self, name: &str) {
        self.state.lock().unwrap().fail_send.insert(name.to_string());
    }

    pub fn set_status(&self, uid: Uid, report: StatusReport) {
        self.state.lock().unwrap().statuses.insert(uid, report);
    }

    pub fn record_cancel(&self, uid: Uid) {
        self.state.lock().unwrap().cancelled.insert(uid);
    }

    pub fn put_file(&self, uid: Uid, filename: &str, content: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .files
            .entry(uid)
            .or_default()
            .insert(filename.to_string(), content.into());
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<Uid> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn stored(&self, uid: Uid) -> bool {
        self.state.lock().unwrap().items.contains_key(&uid)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn log(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

fn label<E: Entity>(entity: &E) -> String {
    entity
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| entity.uid().to_string())
}

#[async_trait]
impl<E: Entity> ItemBackend<E> for MemoryPlatform {
    async fn platform_create(&self, entity: &E) -> anyhow::Result<PlatformItem> {
        let _guard = self.enter();
        self.pause().await;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let name = label(entity);
        if self.state.lock().unwrap().fail_create.contains(&name) {
            bail!("injected create failure for {name}");
        }

        let id = Uid::new_v4();
        let mut raw = serde_json::to_value(entity)?;
        if let Value::Object(fields) = &mut raw {
            fields.insert("id".into(), json!(id));
            fields.insert("platform_id".into(), json!(self.platform_id));
            fields.insert("status".into(), json!(EntityStatus::Created));
        }
        self.state.lock().unwrap().items.insert(
            id,
            StoredItem {
                kind: E::KIND,
                raw: raw.clone(),
            },
        );
        self.log(format!("create:{}:{}", E::KIND, name));

        Ok(PlatformItem {
            id,
            kind: E::KIND,
            platform_id: self.platform_id.clone(),
            raw,
        })
    }

    async fn send_assets(&self, entity: &E) -> anyhow::Result<()> {
        let name = label(entity);
        if self.state.lock().unwrap().fail_send.contains(&name) {
            bail!("injected upload failure for {name}");
        }
        self.log(format!("send_assets:{}:{}", E::KIND, name));
        Ok(())
    }

    async fn platform_run_item(&self, entity: &E) -> anyhow::Result<()> {
        let _guard = self.enter();
        self.pause().await;
        self.state.lock().unwrap().submitted.push(entity.uid());
        self.log(format!("run:{}:{}", E::KIND, label(entity)));
        Ok(())
    }

    async fn refresh_status(&self, entity: &E) -> anyhow::Result<StatusReport> {
        let _guard = self.enter();
        let state = self.state.lock().unwrap();
        let uid = entity.uid();
        if let Some(report) = state.statuses.get(&uid) {
            return Ok(*report);
        }
        if state.submitted.contains(&uid) {
            Ok(StatusReport::new(EntityStatus::Commissioned))
        } else {
            Ok(StatusReport::new(EntityStatus::Created))
        }
    }

    async fn cancellation_recorded(&self, entity: &E) -> anyhow::Result<bool> {
        self.log(format!("cancel_check:{}:{}", E::KIND, label(entity)));
        Ok(self.state.lock().unwrap().cancelled.contains(&entity.uid()))
    }

    async fn get_assets(
        &self,
        entity: &E,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        let _guard = self.enter();
        let state = self.state.lock().unwrap();
        let Some(files) = state.files.get(&entity.uid()) else {
            return Ok(HashMap::new());
        };
        Ok(filenames
            .iter()
            .filter_map(|name| files.get(name).map(|content| (name.clone(), content.clone())))
            .collect())
    }

    async fn list_assets(&self, entity: &E) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .files
            .get(&entity.uid())
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn get_parent(&self, entity: &E) -> anyhow::Result<Option<PlatformItem>> {
        let Some(parent) = entity.parent_id() else {
            return Ok(None);
        };
        let state = self.state.lock().unwrap();
        let Some(stored) = state.items.get(&parent) else {
            bail!("parent {parent} is not stored");
        };
        Ok(Some(PlatformItem {
            id: parent,
            kind: stored.kind,
            platform_id: self.platform_id.clone(),
            raw: stored.raw.clone(),
        }))
    }
}

impl Platform for MemoryPlatform {
    fn platform_id(&self) -> &str {
        &self.platform_id
    }

    fn suites(&self) -> &dyn ItemBackend<Suite> {
        self
    }

    fn experiments(&self) -> &dyn ItemBackend<Experiment> {
        self
    }

    fn simulations(&self) -> &dyn ItemBackend<Simulation> {
        self
    }
}
