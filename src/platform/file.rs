//! Filesystem job platform
//!
//! Items are directories under a job root:
//!
//! ```text
//! {root}/.index/{uid}.json              uid -> item directory
//! {root}/{suite}/metadata.json
//! {root}/{suite}/{experiment}/Assets/...
//! {root}/{suite}/{experiment}/{simulation}/Assets/...
//! ```
//!
//! Execution is left to an external scheduler. Submission writes a
//! `job_submitted` marker; the scheduler reports back through
//! `job_status.txt` (`0` done, `-1` failed, `100` running) and optionally
//! `exit_code.txt`. A cancellation request is recorded as `cancel_requested`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ItemBackend, Platform, PlatformItem, PlatformSpecification};
use crate::config::{
    ASSETS_DIR, CANCEL_REQUESTED_FILE, EXIT_CODE_FILE, INDEX_DIR, JOB_STATUS_FILE,
    JOB_SUBMITTED_FILE, MAX_DIR_NAME_LEN, METADATA_FILE,
};
use crate::entities::{
    AssetCollection, Entity, EntityMetadata, Experiment, ItemType, Simulation, Suite, Uid,
};
use crate::status::{EntityStatus, StatusReport};

/// Files managed by the platform itself, never reported as assets
const CONTROL_FILES: [&str; 5] = [
    METADATA_FILE,
    JOB_SUBMITTED_FILE,
    JOB_STATUS_FILE,
    EXIT_CODE_FILE,
    CANCEL_REQUESTED_FILE,
];

/// Replace characters that are unsafe in directory names with `_` and drop
/// non-ASCII characters
pub fn clean_name(name: &str) -> String {
    const SPECIAL: &[char] = &[
        '/', '\\', ':', '\'', '"', '?', '<', '>', '*', '|', '\0', '(', ')', '[', ']', '`', ',',
        '!', '$', '&', ' ',
    ];
    name.chars()
        .filter(char::is_ascii)
        .map(|c| if SPECIAL.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Entry of the uid index
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    kind: ItemType,
    /// Item directory relative to the job root
    dir: PathBuf,
}

/// Contents of an item's `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    #[serde(flatten)]
    metadata: EntityMetadata,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<Uid>,
    created_at: String,
    /// Serialized entity without children or asset contents
    item: Value,
}

/// Job platform backed by a local (or shared) directory tree
#[derive(Debug, Clone)]
pub struct FileJobPlatform {
    root: PathBuf,
    platform_id: String,
    name_directories: bool,
}

impl FileJobPlatform {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let platform_id = format!("file://{}", root.display());
        Self {
            root,
            platform_id,
            name_directories: false,
        }
    }

    /// Prefix item directories with the cleaned item name
    pub fn with_named_directories(mut self, enabled: bool) -> Self {
        self.name_directories = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, uid: Uid) -> PathBuf {
        self.root.join(INDEX_DIR).join(format!("{uid}.json"))
    }

    async fn index_entry(&self, uid: Uid) -> anyhow::Result<IndexEntry> {
        let contents = fs::read_to_string(self.index_path(uid))
            .await
            .with_context(|| format!("Item {uid} is not on this platform"))?;
        serde_json::from_str(&contents).context("Failed to parse index entry")
    }

    /// Absolute directory of a created item
    pub async fn item_directory(&self, uid: Uid) -> anyhow::Result<PathBuf> {
        let entry = self.index_entry(uid).await?;
        Ok(self.root.join(entry.dir))
    }

    /// Record a cancellation request for the item's job
    pub async fn request_cancel(&self, uid: Uid) -> anyhow::Result<()> {
        let dir = self.item_directory(uid).await?;
        fs::write(dir.join(CANCEL_REQUESTED_FILE), Utc::now().to_rfc3339())
            .await
            .context("Failed to write cancellation marker")?;
        debug!("Cancellation requested for {uid}");
        Ok(())
    }

    async fn read_record(&self, uid: Uid) -> anyhow::Result<ItemRecord> {
        let dir = self.item_directory(uid).await?;
        let contents = fs::read_to_string(dir.join(METADATA_FILE))
            .await
            .context("Failed to read item metadata")?;
        serde_json::from_str(&contents).context("Failed to parse item metadata")
    }

    fn directory_name<E: Entity>(&self, entity: &E, id: Uid) -> String {
        match entity.name() {
            Some(name) if self.name_directories => {
                let mut prefix = clean_name(name);
                prefix.truncate(MAX_DIR_NAME_LEN);
                format!("{prefix}_{id}")
            }
            _ => id.to_string(),
        }
    }

    /// Relative directory of the parent, if the entity names one
    async fn parent_dir<E: Entity>(&self, entity: &E) -> anyhow::Result<Option<PathBuf>> {
        match entity.parent_id() {
            Some(parent) => {
                let entry = self.index_entry(parent).await.with_context(|| {
                    format!("Parent of {} must be created on this platform first", E::KIND)
                })?;
                Ok(Some(entry.dir))
            }
            None => Ok(None),
        }
    }

    /// Create the item directory, its metadata and its index entry
    async fn materialize<E: Entity>(&self, entity: &E) -> anyhow::Result<PlatformItem> {
        let id = Uuid::new_v4();
        let name = self.directory_name(entity, id);
        let relative = match self.parent_dir(entity).await? {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        };
        let dir = self.root.join(&relative);

        fs::create_dir_all(&dir)
            .await
            .context("Failed to create item directory")?;
        if E::KIND != ItemType::Suite {
            fs::create_dir_all(dir.join(ASSETS_DIR))
                .await
                .context("Failed to create assets directory")?;
        }

        let created_at = Utc::now().to_rfc3339();
        let mut item = serde_json::to_value(entity).context("Failed to serialize item")?;
        if let Value::Object(fields) = &mut item {
            for key in ["assets", "simulations", "experiments"] {
                fields.remove(key);
            }
            fields.insert("id".into(), json!(id));
            fields.insert("platform_id".into(), json!(self.platform_id));
            fields.insert("status".into(), json!(EntityStatus::Created));
            fields.insert("created_at".into(), json!(created_at));
        }

        let record = ItemRecord {
            metadata: EntityMetadata {
                kind: E::KIND,
                id,
                platform_id: Some(self.platform_id.clone()),
                tags: entity.tags().clone(),
            },
            name: entity.name().map(str::to_string),
            parent_id: entity.parent_id(),
            created_at,
            item: item.clone(),
        };
        let json =
            serde_json::to_string_pretty(&record).context("Failed to serialize item metadata")?;
        fs::write(dir.join(METADATA_FILE), json)
            .await
            .context("Failed to write item metadata")?;

        let index_dir = self.root.join(INDEX_DIR);
        fs::create_dir_all(&index_dir)
            .await
            .context("Failed to create index directory")?;
        let entry = IndexEntry {
            kind: E::KIND,
            dir: relative,
        };
        let json = serde_json::to_string_pretty(&entry).context("Failed to serialize index entry")?;
        fs::write(self.index_path(id), json)
            .await
            .context("Failed to write index entry")?;

        debug!("Created {} {} at {}", E::KIND, id, dir.display());
        Ok(PlatformItem {
            id,
            kind: E::KIND,
            platform_id: self.platform_id.clone(),
            raw: item,
        })
    }

    async fn write_assets(&self, uid: Uid, assets: &AssetCollection) -> anyhow::Result<()> {
        let assets_dir = self.item_directory(uid).await?.join(ASSETS_DIR);
        for asset in assets {
            let relative = checked_relative(&asset.filename)?;
            let path = assets_dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create asset directory")?;
            }
            fs::write(&path, &asset.content)
                .await
                .with_context(|| format!("Failed to write asset '{}'", asset.filename))?;
        }
        Ok(())
    }

    async fn submit(&self, uid: Uid) -> anyhow::Result<()> {
        let dir = self.item_directory(uid).await?;
        fs::write(dir.join(JOB_SUBMITTED_FILE), Utc::now().to_rfc3339())
            .await
            .context("Failed to write submission marker")
    }

    /// Status of a single job directory, with any recorded cancellation applied
    async fn job_status(&self, uid: Uid) -> anyhow::Result<StatusReport> {
        let dir = self.item_directory(uid).await?;

        let report = if let Some(code) = read_trimmed(&dir.join(EXIT_CODE_FILE)).await? {
            let code: i32 = code
                .parse()
                .with_context(|| format!("Invalid exit code '{code}' for {uid}"))?;
            StatusReport::exited(code)
        } else if let Some(status) = read_trimmed(&dir.join(JOB_STATUS_FILE)).await? {
            StatusReport::new(parse_job_status(&status)?)
        } else if exists(&dir.join(JOB_SUBMITTED_FILE)).await {
            StatusReport::new(EntityStatus::Commissioned)
        } else {
            StatusReport::new(EntityStatus::Created)
        };
        Ok(report)
    }

    async fn resolved_status(&self, uid: Uid) -> anyhow::Result<EntityStatus> {
        let report = self.job_status(uid).await?;
        let cancelled = self.cancel_recorded(uid).await?;
        Ok(report.resolve(cancelled))
    }

    async fn cancel_recorded(&self, uid: Uid) -> anyhow::Result<bool> {
        let dir = self.item_directory(uid).await?;
        Ok(exists(&dir.join(CANCEL_REQUESTED_FILE)).await)
    }

    async fn experiment_status(&self, experiment: &Experiment) -> anyhow::Result<StatusReport> {
        let mut statuses = Vec::new();
        for simulation in experiment.simulations().iter().filter(|s| s.is_created()) {
            statuses.push(self.resolved_status(simulation.uid()).await?);
        }
        if statuses.is_empty() {
            return self.job_status(experiment.uid()).await;
        }
        Ok(StatusReport::new(aggregate(&statuses)))
    }

    async fn read_files(
        &self,
        uid: Uid,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        let dir = self.item_directory(uid).await?;
        let mut files = HashMap::new();
        for filename in filenames {
            let Ok(relative) = checked_relative(filename) else {
                warn!("Ignoring asset request outside the item directory: {filename}");
                continue;
            };
            for candidate in [relative.clone(), Path::new(ASSETS_DIR).join(&relative)] {
                if is_hidden(&dir, &candidate).await {
                    continue;
                }
                let candidate = dir.join(candidate);
                match fs::read(&candidate).await {
                    Ok(content) => {
                        files.insert(filename.clone(), content);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to read '{}'", candidate.display()));
                    }
                }
            }
        }
        Ok(files)
    }

    /// Files under the item directory, excluding control files and child items
    async fn list_files(&self, uid: Uid) -> anyhow::Result<Vec<String>> {
        let dir = self.item_directory(uid).await?;
        let mut files = Vec::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(relative) = pending.pop() {
            let mut entries = fs::read_dir(dir.join(&relative))
                .await
                .context("Failed to list item directory")?;
            while let Some(entry) = entries.next_entry().await? {
                let path = relative.join(entry.file_name());
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    let is_child_item = exists(&entry.path().join(METADATA_FILE)).await;
                    if !is_child_item {
                        pending.push(path);
                    }
                } else if !(relative.as_os_str().is_empty()
                    && CONTROL_FILES.iter().any(|c| entry.file_name() == *c))
                {
                    files.push(to_slash_path(&path));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn parent_item(&self, uid: Uid) -> anyhow::Result<Option<PlatformItem>> {
        let record = self.read_record(uid).await?;
        let Some(parent) = record.parent_id else {
            return Ok(None);
        };
        let parent_record = self.read_record(parent).await?;
        let mut raw = parent_record.item;
        let status = self.resolved_status(parent).await?;
        if let Value::Object(fields) = &mut raw
            && status != EntityStatus::Created
        {
            fields.insert("status".into(), json!(status));
        }
        Ok(Some(PlatformItem {
            id: parent,
            kind: parent_record.metadata.kind,
            platform_id: self.platform_id.clone(),
            raw,
        }))
    }
}

/// Aggregate status of a parent from its children's statuses
fn aggregate(statuses: &[EntityStatus]) -> EntityStatus {
    if statuses.iter().all(|s| s.is_terminal()) {
        if statuses.contains(&EntityStatus::Failed) {
            EntityStatus::Failed
        } else if statuses.contains(&EntityStatus::Canceled) {
            EntityStatus::Canceled
        } else {
            EntityStatus::Done
        }
    } else if statuses
        .iter()
        .any(|s| *s == EntityStatus::Running || s.is_terminal())
    {
        EntityStatus::Running
    } else if statuses.contains(&EntityStatus::Commissioned) {
        EntityStatus::Commissioned
    } else {
        EntityStatus::Created
    }
}

fn parse_job_status(contents: &str) -> anyhow::Result<EntityStatus> {
    match contents {
        "0" => Ok(EntityStatus::Done),
        "-1" => Ok(EntityStatus::Failed),
        "100" => Ok(EntityStatus::Running),
        other => bail!("Unrecognized job status '{other}'"),
    }
}

/// Reject absolute paths and parent-directory components
fn checked_relative(filename: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(filename);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let normalized: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if !safe || normalized.as_os_str().is_empty() {
        bail!("Asset path '{filename}' must be relative and stay inside the item directory");
    }
    Ok(normalized)
}

/// Whether `relative` is a control file of the item or lies inside a child item
async fn is_hidden(dir: &Path, relative: &Path) -> bool {
    if relative.parent() == Some(Path::new(""))
        && CONTROL_FILES.iter().any(|c| relative.as_os_str() == *c)
    {
        return true;
    }
    for ancestor in relative.ancestors().skip(1) {
        if !ancestor.as_os_str().is_empty()
            && exists(&dir.join(ancestor).join(METADATA_FILE)).await
        {
            return true;
        }
    }
    false
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn read_trimmed(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read '{}'", path.display())),
    }
}

impl Platform for FileJobPlatform {
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

#[async_trait]
impl ItemBackend<Suite> for FileJobPlatform {
    async fn platform_create(&self, suite: &Suite) -> anyhow::Result<PlatformItem> {
        self.materialize(suite).await
    }

    async fn send_assets(&self, _suite: &Suite) -> anyhow::Result<()> {
        Ok(())
    }

    async fn platform_run_item(&self, suite: &Suite) -> anyhow::Result<()> {
        self.submit(suite.uid()).await
    }

    async fn refresh_status(&self, suite: &Suite) -> anyhow::Result<StatusReport> {
        let mut statuses = Vec::new();
        for experiment in suite.experiments().iter().filter(|e| e.is_created()) {
            let report = self.experiment_status(experiment).await?;
            let cancelled = self.cancel_recorded(experiment.uid()).await?;
            statuses.push(report.resolve(cancelled));
        }
        if statuses.is_empty() {
            return self.job_status(suite.uid()).await;
        }
        Ok(StatusReport::new(aggregate(&statuses)))
    }

    async fn cancellation_recorded(&self, suite: &Suite) -> anyhow::Result<bool> {
        self.cancel_recorded(suite.uid()).await
    }

    async fn get_assets(
        &self,
        suite: &Suite,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        self.read_files(suite.uid(), filenames).await
    }

    async fn list_assets(&self, suite: &Suite) -> anyhow::Result<Vec<String>> {
        self.list_files(suite.uid()).await
    }

    async fn get_parent(&self, _suite: &Suite) -> anyhow::Result<Option<PlatformItem>> {
        Ok(None)
    }
}

#[async_trait]
impl ItemBackend<Experiment> for FileJobPlatform {
    async fn platform_create(&self, experiment: &Experiment) -> anyhow::Result<PlatformItem> {
        self.materialize(experiment).await
    }

    async fn send_assets(&self, experiment: &Experiment) -> anyhow::Result<()> {
        self.write_assets(experiment.uid(), experiment.assets()).await
    }

    /// Submits the experiment together with every created simulation
    async fn platform_run_item(&self, experiment: &Experiment) -> anyhow::Result<()> {
        self.submit(experiment.uid()).await?;
        for simulation in experiment.simulations().iter().filter(|s| s.is_created()) {
            self.submit(simulation.uid()).await?;
        }
        Ok(())
    }

    async fn refresh_status(&self, experiment: &Experiment) -> anyhow::Result<StatusReport> {
        self.experiment_status(experiment).await
    }

    async fn cancellation_recorded(&self, experiment: &Experiment) -> anyhow::Result<bool> {
        self.cancel_recorded(experiment.uid()).await
    }

    async fn get_assets(
        &self,
        experiment: &Experiment,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        self.read_files(experiment.uid(), filenames).await
    }

    async fn list_assets(&self, experiment: &Experiment) -> anyhow::Result<Vec<String>> {
        self.list_files(experiment.uid()).await
    }

    async fn get_parent(&self, experiment: &Experiment) -> anyhow::Result<Option<PlatformItem>> {
        self.parent_item(experiment.uid()).await
    }
}

#[async_trait]
impl ItemBackend<Simulation> for FileJobPlatform {
    async fn platform_create(&self, simulation: &Simulation) -> anyhow::Result<PlatformItem> {
        if simulation.parent_id().is_none() {
            bail!("Simulations must belong to an experiment on the file platform");
        }
        self.materialize(simulation).await
    }

    async fn send_assets(&self, simulation: &Simulation) -> anyhow::Result<()> {
        self.write_assets(simulation.uid(), simulation.assets()).await
    }

    async fn platform_run_item(&self, simulation: &Simulation) -> anyhow::Result<()> {
        self.submit(simulation.uid()).await
    }

    async fn refresh_status(&self, simulation: &Simulation) -> anyhow::Result<StatusReport> {
        self.job_status(simulation.uid()).await
    }

    async fn cancellation_recorded(&self, simulation: &Simulation) -> anyhow::Result<bool> {
        self.cancel_recorded(simulation.uid()).await
    }

    async fn get_assets(
        &self,
        simulation: &Simulation,
        filenames: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        self.read_files(simulation.uid(), filenames).await
    }

    async fn list_assets(&self, simulation: &Simulation) -> anyhow::Result<Vec<String>> {
        self.list_files(simulation.uid()).await
    }

    async fn get_parent(&self, simulation: &Simulation) -> anyhow::Result<Option<PlatformItem>> {
        self.parent_item(simulation.uid()).await
    }
}

/// Registry entry for [`FileJobPlatform`]
#[derive(Debug, Clone, Copy, Default)]
pub struct FileJobSpecification;

impl PlatformSpecification for FileJobSpecification {
    fn name(&self) -> &str {
        "file"
    }

    fn description(&self) -> &str {
        "Directory-tree job platform polled through status files written by an external scheduler"
    }

    fn example_configuration(&self) -> String {
        let example = json!({
            "job_directory": "/path/to/jobs",
            "name_directories": false,
        });
        serde_json::to_string_pretty(&example).unwrap_or_default()
    }

    fn create(&self, options: &Value) -> anyhow::Result<Arc<dyn Platform>> {
        let job_directory = options
            .get("job_directory")
            .and_then(Value::as_str)
            .context("Missing required option 'job_directory'")?;
        let name_directories = options
            .get("name_directories")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Arc::new(
            FileJobPlatform::new(job_directory).with_named_directories(name_directories),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("my experiment: v2"), "my_experiment__v2");
        assert_eq!(clean_name("a/b\\c"), "a_b_c");
        assert_eq!(clean_name("naïve"), "nave");
        assert_eq!(clean_name("plain-name_1.0"), "plain-name_1.0");
    }

    #[test]
    fn test_parse_job_status() {
        assert_eq!(parse_job_status("0").unwrap(), EntityStatus::Done);
        assert_eq!(parse_job_status("-1").unwrap(), EntityStatus::Failed);
        assert_eq!(parse_job_status("100").unwrap(), EntityStatus::Running);
        assert!(parse_job_status("42").is_err());
    }

    #[test]
    fn test_aggregate() {
        use EntityStatus::*;
        assert_eq!(aggregate(&[Done, Done]), Done);
        assert_eq!(aggregate(&[Done, Failed, Canceled]), Failed);
        assert_eq!(aggregate(&[Done, Canceled]), Canceled);
        assert_eq!(aggregate(&[Done, Commissioned]), Running);
        assert_eq!(aggregate(&[Commissioned, Commissioned]), Commissioned);
        assert_eq!(aggregate(&[Created, Created]), Created);
    }

    #[test]
    fn test_checked_relative() {
        assert!(checked_relative("output/result.json").is_ok());
        assert!(checked_relative("../escape").is_err());
        assert!(checked_relative("/etc/passwd").is_err());
        assert!(checked_relative("").is_err());
        assert!(checked_relative("./").is_err());
        assert_eq!(
            checked_relative("./output.txt").unwrap(),
            PathBuf::from("output.txt")
        );
    }

    #[tokio::test]
    async fn test_control_files_and_child_items_are_hidden() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path();
        fs::create_dir_all(dir.join("child")).await.unwrap();
        fs::write(dir.join("child").join(METADATA_FILE), "{}").await.unwrap();
        fs::create_dir_all(dir.join("results")).await.unwrap();

        assert!(is_hidden(dir, Path::new(METADATA_FILE)).await);
        assert!(is_hidden(dir, Path::new(JOB_STATUS_FILE)).await);
        assert!(is_hidden(dir, Path::new("child/output.txt")).await);
        assert!(!is_hidden(dir, Path::new("results/output.txt")).await);
        assert!(!is_hidden(dir, Path::new("results/metadata.json")).await);
        assert!(!is_hidden(dir, Path::new("output.txt")).await);
    }
}
