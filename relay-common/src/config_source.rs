//! # Config source
//!
//! Externally managed key/value settings, pulled by name whenever a pipeline needs them.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

/// A full set of settings as returned by a `ConfigSource`.
pub type Snapshot = HashMap<String, String>;

/// The value of the first of `keys` set to a non-empty string in `snapshot`.
/// Settings that go by several names list the preferred one first.
pub fn first_value<'s>(snapshot: &'s Snapshot, keys: &[&str]) -> Option<&'s str> {
    keys.iter()
        .filter_map(|key| snapshot.get(*key))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

#[derive(Error, Debug)]
pub enum ConfigSourceError {
    #[error("configuration {0:?} not found")]
    NotFound(String),
    #[error("failed to read configuration file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to parse configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current snapshot of the configuration called `name`.
    async fn snapshot(&self, name: &str) -> Result<Snapshot, ConfigSourceError>;
}

/// In-memory configurations, updated in place by whoever owns a clone.
#[derive(Clone, Default)]
pub struct StaticConfigSource {
    configurations: Arc<RwLock<HashMap<String, Snapshot>>>,
    fetches: Arc<AtomicUsize>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration called `name` as a whole.
    pub fn set(&self, name: &str, snapshot: Snapshot) {
        self.configurations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), snapshot);
    }

    /// Set a single key, creating the configuration if needed.
    pub fn insert(&self, name: &str, key: &str, value: &str) {
        self.configurations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn remove(&self, name: &str) {
        self.configurations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Number of snapshots served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn snapshot(&self, name: &str) -> Result<Snapshot, ConfigSourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        self.configurations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigSourceError::NotFound(name.to_owned()))
    }
}

/// Configurations kept in a JSON file of the form `{"<name>": {"<key>": "<value>"}}`.
/// The file is read again on every snapshot, so edits apply without a restart.
pub struct JsonFileConfigSource {
    path: PathBuf,
}

impl JsonFileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }
}

#[async_trait]
impl ConfigSource for JsonFileConfigSource {
    async fn snapshot(&self, name: &str) -> Result<Snapshot, ConfigSourceError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|error| ConfigSourceError::Io {
                    path: self.path.clone(),
                    error,
                })?;

        let mut configurations: HashMap<String, Snapshot> = serde_json::from_str(&contents)
            .map_err(|error| ConfigSourceError::Parse {
                path: self.path.clone(),
                error,
            })?;

        configurations
            .remove(name)
            .ok_or_else(|| ConfigSourceError::NotFound(name.to_owned()))
    }
}
