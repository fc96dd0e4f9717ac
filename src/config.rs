//! Engine settings.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `ITEMSTORE_*` environment variables (`ITEMSTORE_READER_THREADS=4`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(PathBuf),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database file; absent means an in-memory database.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub reader_threads: usize,
    /// Foreground jobs served in a row before a waiting background job.
    pub max_foreground_streak: usize,
    /// Trigger passes per write transaction.
    pub trigger_passes: usize,
    /// Cleared items are purged this many ICNs after their last change.
    pub purge_after_icns: u64,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            reader_threads: 2,
            max_foreground_streak: 8,
            trigger_passes: 2,
            purge_after_icns: 1000,
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Loads the settings, reading `file` when given and present.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("reader_threads", defaults.reader_threads as u64)?
            .set_default("max_foreground_streak", defaults.max_foreground_streak as u64)?
            .set_default("trigger_passes", defaults.trigger_passes as u64)?
            .set_default("purge_after_icns", defaults.purge_after_icns)?
            .set_default("busy_timeout_ms", defaults.busy_timeout_ms)?;
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).format(FileFormat::Toml).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("ITEMSTORE").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl From<PersistenceMode> for DatabaseConfig {
    fn from(mode: PersistenceMode) -> Self {
        match mode {
            PersistenceMode::InMemory => Self::in_memory(),
            PersistenceMode::File(path) => Self::file(path),
        }
    }
}
