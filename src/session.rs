//! Orchestration session
//!
//! A session pairs one platform with one worker pool. Every lifecycle
//! operation runs the same ordered stages regardless of backend:
//!
//! - create: `pre_creation` → `platform_create` → `send_assets` → `post_creation`
//! - run: implicit create → children created → `platform_run_item` → `post_run_item`
//! - refresh: `refresh_status` → cancellation re-check on failure → transition
//!
//! Single-item operations return their error directly; the `batch_*`
//! operations report each item's outcome in its own slot.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::coordination::{BatchReport, ItemFailure, WorkerPool};
use crate::entities::Entity;
use crate::error::{OrchestrationError, Result};
use crate::platform::{ItemBackend, Platform, PlatformItem, PlatformRegistry};
use crate::status::{self, EntityStatus};

/// Requested files of one item; each missing file holds `AssetNotFound`
pub type AssetMap = BTreeMap<String, Result<Vec<u8>>>;

/// Outcome of one slot of an entity batch
pub type ItemResult<E> = std::result::Result<E, ItemFailure<E>>;

/// Which creation hooks to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub pre_creation: bool,
    pub post_creation: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            pre_creation: true,
            post_creation: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ItemOperation {
    Create,
    Run,
    Refresh,
}

impl ItemOperation {
    fn verb(self) -> &'static str {
        match self {
            ItemOperation::Create => "Creating",
            ItemOperation::Run => "Commissioning",
            ItemOperation::Refresh => "Refreshing",
        }
    }
}

#[derive(Clone)]
pub struct Session {
    platform: Arc<dyn Platform>,
    pool: WorkerPool,
}

impl Session {
    pub fn new(platform: Arc<dyn Platform>, pool: WorkerPool) -> Self {
        Self { platform, pool }
    }

    /// Build the configured platform and a pool sized by `concurrency_limit`
    pub fn from_config(registry: &PlatformRegistry, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let platform = registry.create(&config.platform)?;
        let pool = WorkerPool::new(config.concurrency_limit, config.progress)?;
        info!(
            "Opened session on {} with {} workers",
            platform.platform_id(),
            config.concurrency_limit
        );
        Ok(Self { platform, pool })
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// End the session; later backend calls fail with `PoolClosed`
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn backend<E: Entity>(&self) -> &dyn ItemBackend<E> {
        E::backend(self.platform.as_ref())
    }

    /// Run a backend call inside a pool slot
    async fn call<T>(
        &self,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<anyhow::Result<T>> {
        let _permit = self.pool.acquire().await?;
        Ok(call.await)
    }

    // ============ Single-item operations ============

    /// Create `entity` on the platform with both hooks
    pub async fn create<E: Entity>(&self, entity: &mut E) -> Result<()> {
        self.create_with(entity, CreateOptions::default()).await
    }

    /// Create `entity` on the platform; a no-op once it has a status
    ///
    /// On failure the entity is left without a status and with its previous uid.
    pub async fn create_with<E: Entity>(&self, entity: &mut E, options: CreateOptions) -> Result<()> {
        if let Some(status) = entity.status() {
            debug!("{} {} is already {}", E::KIND, entity.uid(), status);
            return Ok(());
        }

        if options.pre_creation {
            entity
                .pre_creation()
                .map_err(|source| OrchestrationError::HookFailed {
                    stage: "pre_creation",
                    kind: E::KIND,
                    uid: entity.uid(),
                    source,
                })?;
        }

        let requested = entity.uid();
        let item = self
            .call(self.backend::<E>().platform_create(entity))
            .await?
            .map_err(|source| OrchestrationError::BackendCreate {
                kind: E::KIND,
                uid: requested,
                source,
            })?;

        let previous = entity.header().explicit_uid();
        entity.set_uid(item.id)?;

        let sent = match self.call(self.backend::<E>().send_assets(entity)).await {
            Ok(sent) => sent.map_err(|source| OrchestrationError::BackendCreate {
                kind: E::KIND,
                uid: item.id,
                source,
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            entity.header_mut().restore_uid(previous);
            entity.relink_children();
            return Err(e);
        }

        entity.header_mut().set_platform_id(item.platform_id);
        status::advance(entity, EntityStatus::Created)?;
        if options.post_creation {
            entity.post_creation();
        }

        debug!("Created {} {}", E::KIND, item.id);
        Ok(())
    }

    /// Submit `entity` for execution, creating it and its children first
    ///
    /// Items already commissioned are left untouched.
    pub async fn run_item<E: Entity>(&self, entity: &mut E) -> Result<()> {
        if entity.status().is_none() {
            self.create(entity).await?;
        }
        entity.prepare_children(self).await?;

        if entity.status() != Some(EntityStatus::Created) {
            debug!("{} {} has already been submitted", E::KIND, entity.uid());
            return Ok(());
        }

        let uid = entity.uid();
        self.call(self.backend::<E>().platform_run_item(entity))
            .await?
            .map_err(|source| OrchestrationError::Backend {
                operation: "run_item",
                kind: E::KIND,
                uid,
                source,
            })?;
        status::advance(entity, EntityStatus::Commissioned)?;

        self.call(self.backend::<E>().post_run_item(entity))
            .await?
            .map_err(|source| OrchestrationError::Backend {
                operation: "post_run_item",
                kind: E::KIND,
                uid,
                source,
            })?;
        entity.commission_children(self).await?;

        info!("Commissioned {} {}", E::KIND, uid);
        Ok(())
    }

    /// Query the platform and move `entity` to the observed status
    ///
    /// A failed job is reported as `CANCELED` when the platform has a
    /// cancellation on record. Terminal items are not queried again.
    pub async fn refresh_status<E: Entity>(&self, entity: &mut E) -> Result<EntityStatus> {
        let uid = entity.uid();
        let Some(current) = entity.status() else {
            return Err(OrchestrationError::NotCreated { kind: E::KIND, uid });
        };
        if current.is_terminal() {
            return Ok(current);
        }

        let backend_error = |operation| {
            move |source| OrchestrationError::Backend {
                operation,
                kind: E::KIND,
                uid,
                source,
            }
        };

        let report = self
            .call(self.backend::<E>().refresh_status(entity))
            .await?
            .map_err(backend_error("refresh_status"))?;

        let cancelled = if report.observed() == EntityStatus::Failed {
            self.call(self.backend::<E>().cancellation_recorded(entity))
                .await?
                .map_err(backend_error("cancellation_recorded"))?
        } else {
            false
        };

        let next = report.resolve(cancelled);
        entity.header_mut().record_refresh(report.exit_code);

        if status::is_stale(current, next) {
            debug!("Ignoring stale {} report for {} {}", next, E::KIND, uid);
            return Ok(current);
        }
        if status::advance(entity, next)? {
            debug!("{} {} moved from {} to {}", E::KIND, uid, current, next);
        }
        Ok(next)
    }

    /// Poll `refresh_status` until a terminal status or `max_polls` polls
    ///
    /// Polls at least once.
    pub async fn wait_until_done<E: Entity>(
        &self,
        entity: &mut E,
        poll_interval: Duration,
        max_polls: usize,
    ) -> Result<EntityStatus> {
        let mut status = self.refresh_status(entity).await?;
        let mut polls = 1;
        while !status.is_terminal() && polls < max_polls {
            tokio::time::sleep(poll_interval).await;
            status = self.refresh_status(entity).await?;
            polls += 1;
        }
        Ok(status)
    }

    /// Fetch the requested files of `entity`
    ///
    /// Missing files do not abort the request: each one gets an
    /// `AssetNotFound` entry and the others are still returned.
    pub async fn get_assets<E: Entity>(&self, entity: &E, filenames: &[String]) -> Result<AssetMap> {
        let uid = ensure_created(entity)?;
        let found = self
            .call(self.backend::<E>().get_assets(entity, filenames))
            .await?
            .map_err(|source| OrchestrationError::Backend {
                operation: "get_assets",
                kind: E::KIND,
                uid,
                source,
            })?;

        let mut assets = AssetMap::new();
        for filename in filenames {
            if assets.contains_key(filename) {
                continue;
            }
            let entry = found
                .get(filename)
                .cloned()
                .ok_or_else(|| OrchestrationError::AssetNotFound {
                    kind: E::KIND,
                    uid,
                    filename: filename.clone(),
                });
            assets.insert(filename.clone(), entry);
        }
        Ok(assets)
    }

    pub async fn list_assets<E: Entity>(&self, entity: &E) -> Result<Vec<String>> {
        let uid = ensure_created(entity)?;
        self.call(self.backend::<E>().list_assets(entity))
            .await?
            .map_err(|source| OrchestrationError::Backend {
                operation: "list_assets",
                kind: E::KIND,
                uid,
                source,
            })
    }

    /// Load the parent of `entity` from the platform
    ///
    /// Fails with `TopLevelItem` when the platform has no parent for it.
    pub async fn get_parent<E: Entity>(&self, entity: &E) -> Result<E::Parent> {
        let uid = ensure_created(entity)?;
        let parent = self
            .call(self.backend::<E>().get_parent(entity))
            .await?
            .map_err(|source| OrchestrationError::Backend {
                operation: "get_parent",
                kind: E::KIND,
                uid,
                source,
            })?;
        match parent {
            Some(item) => self.to_entity(item),
            None => Err(OrchestrationError::TopLevelItem { kind: E::KIND, uid }),
        }
    }

    /// Convert a backend-native item into an entity
    pub fn to_entity<E: Entity>(&self, item: PlatformItem) -> Result<E> {
        let uid = item.id;
        self.backend::<E>()
            .to_entity(item)
            .map_err(|source| OrchestrationError::Backend {
                operation: "to_entity",
                kind: E::KIND,
                uid,
                source,
            })
    }

    // ============ Batch operations ============

    pub async fn batch_create<E: Entity>(&self, entities: Vec<E>) -> BatchReport<ItemResult<E>> {
        self.batch_apply(ItemOperation::Create, entities).await
    }

    pub async fn batch_run<E: Entity>(&self, entities: Vec<E>) -> BatchReport<ItemResult<E>> {
        self.batch_apply(ItemOperation::Run, entities).await
    }

    pub async fn batch_refresh_status<E: Entity>(
        &self,
        entities: Vec<E>,
    ) -> BatchReport<ItemResult<E>> {
        self.batch_apply(ItemOperation::Refresh, entities).await
    }

    /// `get_assets` over many items; slot `i` belongs to `entities[i]`
    pub async fn batch_get_assets<E: Entity>(
        &self,
        entities: &[E],
        filenames: &[String],
    ) -> BatchReport<Result<AssetMap>> {
        let session = self.clone();
        let filenames: Arc<[String]> = filenames.into();
        let label = format!("Fetching {} assets", E::KIND);
        self.pool
            .execute(&label, entities.to_vec(), move |entity: E| {
                let session = session.clone();
                let filenames = Arc::clone(&filenames);
                async move { session.get_assets(&entity, &filenames).await }
            })
            .await
    }

    async fn batch_apply<E: Entity>(
        &self,
        operation: ItemOperation,
        entities: Vec<E>,
    ) -> BatchReport<ItemResult<E>> {
        let session = self.clone();
        let label = format!("{} {}s", operation.verb(), E::KIND);
        let report = self
            .pool
            .execute(&label, entities, move |mut entity: E| {
                let session = session.clone();
                async move {
                    let outcome = match operation {
                        ItemOperation::Create => session.create(&mut entity).await,
                        ItemOperation::Run => session.run_item(&mut entity).await,
                        ItemOperation::Refresh => session.refresh_status(&mut entity).await.map(|_| ()),
                    };
                    match outcome {
                        Ok(()) => Ok(entity),
                        Err(error) => {
                            warn!("{} {} failed: {}", E::KIND, entity.uid(), error);
                            Err(ItemFailure::new(entity, error))
                        }
                    }
                }
            })
            .await;

        if !report.all_succeeded() {
            warn!("{}: {} of {} items failed", label, report.failed(), report.len());
        }
        report
    }

    /// Create every child, keeping all of them in their original order
    pub(crate) async fn create_children<C: Entity>(
        &self,
        children: Vec<C>,
    ) -> (Vec<C>, Vec<OrchestrationError>) {
        self.children_batch(ItemOperation::Create, children).await
    }

    /// Run every child, keeping all of them in their original order
    pub(crate) async fn run_children<C: Entity>(
        &self,
        children: Vec<C>,
    ) -> (Vec<C>, Vec<OrchestrationError>) {
        self.children_batch(ItemOperation::Run, children).await
    }

    async fn children_batch<C: Entity>(
        &self,
        operation: ItemOperation,
        children: Vec<C>,
    ) -> (Vec<C>, Vec<OrchestrationError>) {
        // Fallback for slots whose task panicked and lost its item
        let originals = children.clone();
        let report = self.batch_apply(operation, children).await;

        let mut kept = Vec::with_capacity(originals.len());
        let mut errors = Vec::new();
        for (result, original) in report.results.into_iter().zip(originals) {
            match result {
                Ok(child) => kept.push(child),
                Err(ItemFailure { item, error }) => {
                    kept.push(item.unwrap_or(original));
                    errors.push(error);
                }
            }
        }
        (kept, errors)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("platform", &self.platform.platform_id())
            .field("pool", &self.pool)
            .finish()
    }
}

fn ensure_created<E: Entity>(entity: &E) -> Result<crate::entities::Uid> {
    let uid = entity.uid();
    if entity.is_created() {
        Ok(uid)
    } else {
        Err(OrchestrationError::NotCreated { kind: E::KIND, uid })
    }
}
