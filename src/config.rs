use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Which storage engine backs the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Rocksdb,
}

/// What happens to the source file once its relocated copy is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocationStrategy {
    /// Remove the source after the destination is verified and recorded.
    Move,
    /// Leave the source in place.
    Copy,
    /// Hard link the destination to the source (byte copy if linking fails)
    /// and leave the source in place.
    Hardlink,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    #[serde(default = "default_destination_root")]
    pub destination_root: PathBuf,
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_relocation_strategy")]
    pub relocation_strategy: RelocationStrategy,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_notifier_buffer")]
    pub notifier_buffer: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_source_root() -> PathBuf {
    PathBuf::from("./import")
}

fn default_destination_root() -> PathBuf {
    PathBuf::from("./library")
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_database_path() -> PathBuf {
    PathBuf::from("audioshelf.db")
}

fn default_workers() -> usize {
    2
}

fn default_relocation_strategy() -> RelocationStrategy {
    RelocationStrategy::Move
}

fn default_extensions() -> Vec<String> {
    ["m4b", "m4a", "mp3", "flac", "ogg", "opus", "aac", "wma"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_notifier_buffer() -> usize {
    100
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            destination_root: default_destination_root(),
            storage_backend: default_storage_backend(),
            database_path: default_database_path(),
            workers: default_workers(),
            relocation_strategy: default_relocation_strategy(),
            ignore_patterns: Vec::new(),
            extensions: default_extensions(),
            notifier_buffer: default_notifier_buffer(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl AppConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Validation("workers must be at least 1".into()));
        }
        if self.notifier_buffer == 0 {
            return Err(Error::Validation(
                "notifier_buffer must be at least 1".into(),
            ));
        }
        if normalize(&self.source_root) == normalize(&self.destination_root) {
            return Err(Error::Validation(format!(
                "source_root and destination_root are the same directory: {}",
                self.source_root.display()
            )));
        }
        Ok(())
    }
}

/// Load `Config.toml` (optional) overlaid with `AUDIOSHELF_*` environment variables.
pub fn load_configuration() -> std::result::Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("AUDIOSHELF")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("extensions"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Lexically normalize a path: drop `.` components and fold `..` into its parent.
/// Does not touch the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
