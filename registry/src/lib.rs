//! Sealreg Registry - Image Registry Subsystem
//!
//! Pulls, caches and replicates OCI and Docker images between remote
//! registries and a local content-addressable store.
//!
//! - [`reference`]: image name normalization
//! - [`auth`]: credential store reading and probing
//! - [`filter`]: name and tag filters
//! - [`manifest`]: manifest lists and platform selection
//! - [`storage`]: storage drivers and the on-disk distribution layout
//! - [`remote`]: Distribution API client
//! - [`proxy`]: pull-through cache
//! - [`server`]: embedded Distribution API server
//! - [`saver`]: concurrent image save
//! - [`copy`] and [`sync`]: registry to registry transfer
//! - [`images`]: listing and removal

pub mod auth;
pub mod copy;
pub mod endpoint;
pub mod filter;
pub mod images;
pub mod manifest;
pub mod proxy;
pub mod reference;
pub mod remote;
pub mod saver;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use auth::{AuthResolver, Credential, CredentialMap, CredentialStore, Scheme};
pub use copy::ImageCopier;
pub use endpoint::{BlobStream, ManifestPayload, RegistryEndpoint};
pub use filter::{Filter, FilterStrategy, FilterType};
pub use images::{list_images, remove_image};
pub use manifest::{BlobDescriptor, Platform};
pub use proxy::{ProxyConfig, ProxyRegistry, ProxyRepository};
pub use reference::ImageReference;
pub use remote::RemoteClient;
pub use saver::{ImageSaver, SaveStrategy};
pub use server::{RegistryServer, RunningServer};
pub use storage::{DriverFactory, LocalRegistry, StorageDriver};
pub use sync::{parse_registry_host, RegistrySync};
