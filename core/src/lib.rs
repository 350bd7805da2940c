//! Sealreg Core - Foundational Types
//!
//! Error taxonomy, configuration and the progress side channel shared by
//! the registry subsystem and the `sealreg` binary.

pub mod config;
pub mod error;
pub mod progress;

// Re-export commonly used types
pub use config::{
    CopySelection, LogLevel, RegistryConfig, SaveStrategyKind, SaverConfig, ServerConfig,
    StorageConfig, SyncConfig,
};
pub use error::{RegistryError, Result};
pub use progress::{ProgressEmitter, ProgressEvent, ProgressStatus};

/// Sealreg version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
