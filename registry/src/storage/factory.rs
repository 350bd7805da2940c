//! Name-keyed storage driver constructors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sealreg_core::config::{StorageConfig, DEFAULT_MAX_THREADS};
use sealreg_core::error::{RegistryError, Result};

use super::driver::StorageDriver;
use super::filesystem::{self, FilesystemDriver};
use super::inmemory::{self, InMemoryDriver};
use super::regulator::Regulator;

/// Parameters handed to a driver constructor.
#[derive(Debug, Clone)]
pub struct DriverParameters {
    pub root_directory: PathBuf,
    pub max_threads: u64,
}

impl DriverParameters {
    pub fn new(root_directory: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: root_directory.into(),
            max_threads: DEFAULT_MAX_THREADS,
        }
    }

    pub fn from_config(root_directory: impl Into<PathBuf>, config: &StorageConfig) -> Self {
        Self {
            root_directory: root_directory.into(),
            max_threads: config.effective_max_threads(),
        }
    }
}

type Constructor = Arc<dyn Fn(&DriverParameters) -> Result<Arc<dyn StorageDriver>> + Send + Sync>;

/// Explicit map from driver name to constructor, built by the caller.
#[derive(Clone, Default)]
pub struct DriverFactory {
    constructors: HashMap<String, Constructor>,
}

impl DriverFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the `filesystem` and `inmemory` drivers registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(filesystem::DRIVER_NAME, |params| {
            let driver = FilesystemDriver::new(params.root_directory.clone());
            Ok(Arc::new(Regulator::new(driver, params.max_threads)) as Arc<dyn StorageDriver>)
        });
        factory.register(inmemory::DRIVER_NAME, |_| {
            Ok(Arc::new(InMemoryDriver::new()) as Arc<dyn StorageDriver>)
        });
        factory
    }

    /// Register a constructor, replacing any previous one with that name.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&DriverParameters) -> Result<Arc<dyn StorageDriver>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: &DriverParameters) -> Result<Arc<dyn StorageDriver>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            RegistryError::Config(format!("unknown storage driver '{}'", name))
        })?;
        constructor(params)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverFactory")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_registered() {
        let factory = DriverFactory::with_defaults();
        assert_eq!(factory.names(), vec!["filesystem", "inmemory"]);
    }

    #[tokio::test]
    async fn test_create_filesystem() {
        let dir = TempDir::new().unwrap();
        let factory = DriverFactory::with_defaults();
        let driver = factory
            .create("filesystem", &DriverParameters::new(dir.path()))
            .unwrap();
        assert_eq!(driver.name(), "filesystem");

        driver.put_content("/x", b"1").await.unwrap();
        assert!(dir.path().join("x").exists());
    }

    #[test]
    fn test_unknown_driver() {
        let factory = DriverFactory::new();
        let result = factory.create("s3", &DriverParameters::new("/tmp"));
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }

    #[test]
    fn test_custom_registration() {
        let mut factory = DriverFactory::new();
        factory.register("scratch", |_| Ok(Arc::new(InMemoryDriver::new()) as Arc<dyn StorageDriver>));
        let driver = factory
            .create("scratch", &DriverParameters::new("/unused"))
            .unwrap();
        assert_eq!(driver.name(), "inmemory");
    }

    #[test]
    fn test_parameters_from_config() {
        let config = StorageConfig {
            max_threads: 10,
            ..Default::default()
        };
        let params = DriverParameters::from_config("/data", &config);
        assert_eq!(params.max_threads, 25);
    }
}
