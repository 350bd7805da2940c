//! Storage drivers and the registry layout built on them.

pub mod driver;
pub mod factory;
pub mod filesystem;
pub mod inmemory;
pub mod local;
pub mod paths;
pub mod regulator;

pub use driver::{BoxedReader, FileInfo, FileWriter, StorageDriver, WalkControl};
pub use factory::{DriverFactory, DriverParameters};
pub use filesystem::FilesystemDriver;
pub use inmemory::InMemoryDriver;
pub use local::{BlobUpload, LocalRegistry, StatsSnapshot, StorageStats};
pub use regulator::Regulator;
