use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RegistryError, Result};

/// Default number of concurrent pulls in the saver.
pub const DEFAULT_MAX_PULL_PROCS: usize = 5;

/// Default in-flight cap of the storage regulator.
pub const DEFAULT_MAX_THREADS: u64 = 100;

/// Lowest in-flight cap the storage regulator accepts.
pub const MIN_THREADS: u64 = 25;

/// Aggregate configuration for the registry subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub saver: SaverConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
}

impl RegistryConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: RegistryConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

/// How the saver moves content into the target directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveStrategyKind {
    /// Read through a pull-through proxy rooted at the target directory
    #[default]
    PullThrough,
    /// Copy each image into the target directory's local registry
    Copy,
}

/// Which images of a manifest list get copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CopySelection {
    /// Only the child matching the requested platform
    #[default]
    SystemImage,
    /// Every child plus the list itself
    All,
}

/// Image saver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Maximum concurrently active groups and remote transfers
    pub max_pull_procs: usize,

    pub strategy: SaveStrategyKind,

    /// Target platform, e.g. "linux/arm64". Host platform when unset.
    pub platform: Option<String>,

    /// List handling of the copy strategy
    pub selection: CopySelection,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            max_pull_procs: DEFAULT_MAX_PULL_PROCS,
            strategy: SaveStrategyKind::default(),
            platform: None,
            selection: CopySelection::default(),
        }
    }
}

/// Storage driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Driver name looked up in the driver factory
    pub driver: String,

    /// In-flight operation cap of the regulator
    pub max_threads: u64,

    /// Re-hash blobs on commit and reject digest mismatches
    pub verify_digests: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "filesystem".to_string(),
            max_threads: DEFAULT_MAX_THREADS,
            verify_digests: false,
        }
    }
}

impl StorageConfig {
    /// Regulator cap with the floor applied.
    pub fn effective_max_threads(&self) -> u64 {
        self.max_threads.max(MIN_THREADS)
    }
}

/// Embedded server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address. An ephemeral localhost port when unset.
    pub listen: Option<SocketAddr>,

    pub log_level: LogLevel,

    /// Emit one access log line per request
    pub access_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            log_level: LogLevel::Info,
            access_log: false,
        }
    }
}

/// Registry sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum concurrent per-tag copies
    pub max_procs: usize,

    /// Attempts per tag before giving up
    pub retries: u32,

    /// Liveness probe timeout in seconds
    pub probe_timeout_secs: u64,

    /// Fixed delay between retries in milliseconds
    pub retry_delay_ms: u64,

    pub selection: CopySelection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_procs: DEFAULT_MAX_PULL_PROCS,
            retries: 3,
            probe_timeout_secs: 3,
            retry_delay_ms: 1000,
            selection: CopySelection::default(),
        }
    }
}

impl SyncConfig {
    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(RegistryError::Config(format!("unknown log level: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.saver.max_pull_procs, 5);
        assert_eq!(config.saver.strategy, SaveStrategyKind::PullThrough);
        assert_eq!(config.storage.driver, "filesystem");
        assert_eq!(config.storage.max_threads, 100);
        assert!(!config.storage.verify_digests);
        assert_eq!(config.server.log_level, LogLevel::Info);
        assert!(config.server.listen.is_none());
        assert_eq!(config.sync.retries, 3);
        assert_eq!(config.sync.probe_timeout_secs, 3);
        assert_eq!(config.sync.selection, CopySelection::SystemImage);
    }

    #[test]
    fn test_max_threads_floor() {
        let config = StorageConfig {
            max_threads: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_max_threads(), 25);

        let config = StorageConfig {
            max_threads: 200,
            ..Default::default()
        };
        assert_eq!(config.effective_max_threads(), 200);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_from_path_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(
            &path,
            "saver:\n  max_pull_procs: 8\n  strategy: copy\nsync:\n  selection: all\nserver:\n  listen: 127.0.0.1:5050\n  log_level: debug\n",
        )
        .unwrap();

        let config = RegistryConfig::from_path(&path).unwrap();
        assert_eq!(config.saver.max_pull_procs, 8);
        assert_eq!(config.saver.strategy, SaveStrategyKind::Copy);
        assert_eq!(config.sync.selection, CopySelection::All);
        assert_eq!(config.sync.retries, 3);
        assert_eq!(config.server.log_level, LogLevel::Debug);
        assert_eq!(
            config.server.listen,
            Some("127.0.0.1:5050".parse().unwrap())
        );
        assert_eq!(config.storage.driver, "filesystem");
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = RegistryConfig::from_path(&dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }

    #[test]
    fn test_from_path_invalid_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "saver: [1, 2").unwrap();
        let result = RegistryConfig::from_path(&path);
        assert!(matches!(result, Err(RegistryError::Serialization(_))));
    }
}
