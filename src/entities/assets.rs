use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OrchestrationError, Result};

/// Named file content attached to an experiment or a simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub filename: String,
    pub content: Vec<u8>,
    #[serde(skip)]
    hash: OnceLock<String>,
}

impl Asset {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            hash: OnceLock::new(),
        }
    }

    /// SHA-256 of the content, hex encoded
    pub fn content_hash(&self) -> &str {
        self.hash
            .get_or_init(|| format!("{:x}", Sha256::digest(&self.content)))
    }
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename && self.content_hash() == other.content_hash()
    }
}

impl Eq for Asset {}

/// Ordered set of assets, unique by filename
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetCollection {
    assets: Vec<Asset>,
}

impl AssetCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset, or replace the content of the one with the same filename
    ///
    /// A replaced asset keeps its position.
    pub fn add_asset(&mut self, asset: Asset, fail_on_duplicate: bool) -> Result<()> {
        match self.assets.iter_mut().find(|a| a.filename == asset.filename) {
            Some(_) if fail_on_duplicate => Err(OrchestrationError::DuplicateAsset(asset.filename)),
            Some(existing) => {
                *existing = asset;
                Ok(())
            }
            None => {
                self.assets.push(asset);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, filename: &str) -> Option<Asset> {
        let index = self.assets.iter().position(|a| a.filename == filename)?;
        Some(self.assets.remove(index))
    }

    pub fn get(&self, filename: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.filename == filename)
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.assets.iter().map(|a| a.filename.as_str()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Asset> {
        self.assets.iter()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Sorted (filename, content-hash) pairs
    pub fn fingerprint(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .assets
            .iter()
            .map(|a| (a.filename.clone(), a.content_hash().to_string()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl PartialEq for AssetCollection {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for AssetCollection {}

impl<'a> IntoIterator for &'a AssetCollection {
    type Item = &'a Asset;
    type IntoIter = std::slice::Iter<'a, Asset>;

    fn into_iter(self) -> Self::IntoIter {
        self.assets.iter()
    }
}

impl FromIterator<Asset> for AssetCollection {
    /// Later assets replace earlier ones with the same filename
    fn from_iter<I: IntoIterator<Item = Asset>>(iter: I) -> Self {
        let mut collection = Self::new();
        for asset in iter {
            // Replacement never fails
            let _ = collection.add_asset(asset, false);
        }
        collection
    }
}
