use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::{FileJobSpecification, Platform};
use crate::config::PlatformConfig;
use crate::error::{OrchestrationError, Result};

/// Factory for one backend type
pub trait PlatformSpecification: Send + Sync {
    /// Registry key, matched case-insensitively
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Options accepted by `create`, as an example JSON document
    fn example_configuration(&self) -> String;

    fn create(&self, options: &serde_json::Value) -> anyhow::Result<Arc<dyn Platform>>;
}

/// Backends available to `Session::from_config`
#[derive(Default)]
pub struct PlatformRegistry {
    specifications: BTreeMap<String, Arc<dyn PlatformSpecification>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the backends shipped in this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileJobSpecification));
        registry
    }

    /// Register a backend, replacing any previous one with the same name
    pub fn register(&mut self, specification: Arc<dyn PlatformSpecification>) {
        let key = specification.name().to_ascii_lowercase();
        self.specifications.insert(key, specification);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PlatformSpecification>> {
        self.specifications.get(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.specifications.keys().cloned().collect()
    }

    /// Build the platform named by `config.kind`
    pub fn create(&self, config: &PlatformConfig) -> Result<Arc<dyn Platform>> {
        let specification =
            self.get(&config.kind)
                .ok_or_else(|| OrchestrationError::UnknownPlatform {
                    requested: config.kind.clone(),
                    available: self.names(),
                })?;

        info!("Creating {} platform", specification.name());
        specification.create(&config.options).map_err(|e| {
            OrchestrationError::InvalidConfig(format!(
                "{} platform options: {e:#}",
                specification.name()
            ))
        })
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = PlatformRegistry::with_defaults();
        assert!(registry.get("file").is_some());
        assert!(registry.get("FILE").is_some());
        assert_eq!(registry.names(), vec!["file".to_string()]);
    }

    #[test]
    fn test_unknown_platform_lists_available() {
        let registry = PlatformRegistry::with_defaults();
        let err = registry
            .create(&PlatformConfig::new("slurm", json!({})))
            .err()
            .unwrap();
        match err {
            OrchestrationError::UnknownPlatform {
                requested,
                available,
            } => {
                assert_eq!(requested, "slurm");
                assert_eq!(available, vec!["file".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_create_file_platform() {
        let temp_dir = TempDir::new().unwrap();
        let registry = PlatformRegistry::with_defaults();
        let config = PlatformConfig::new(
            "File",
            json!({"job_directory": temp_dir.path().to_str().unwrap()}),
        );
        let platform = registry.create(&config).unwrap();
        assert!(platform.platform_id().starts_with("file://"));
    }

    #[test]
    fn test_invalid_options() {
        let registry = PlatformRegistry::with_defaults();
        let err = registry
            .create(&PlatformConfig::new("file", json!({})))
            .err()
            .unwrap();
        assert!(matches!(err, OrchestrationError::InvalidConfig(_)));
    }

    #[test]
    fn test_example_configuration_parses() {
        let registry = PlatformRegistry::with_defaults();
        let spec = registry.get("file").unwrap();
        let example: serde_json::Value =
            serde_json::from_str(&spec.example_configuration()).unwrap();
        assert!(example.get("job_directory").is_some());
        assert!(!spec.description().is_empty());
    }
}
