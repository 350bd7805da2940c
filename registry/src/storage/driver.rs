//! Storage driver contract.
//!
//! Paths are `/`-separated keys rooted at `/`, e.g.
//! `/docker/registry/v2/blobs/sha256/ab/ab12.../data`.

use std::time::SystemTime;

use async_trait::async_trait;
use sealreg_core::error::{RegistryError, Result};
use tokio::io::AsyncRead;

/// Boxed reader returned by [`StorageDriver::reader`].
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata for a stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    /// Zero for directories
    pub size: u64,
    pub mod_time: SystemTime,
    pub is_dir: bool,
}

/// Returned by a walk callback to steer traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Do not descend into the directory just visited
    SkipDir,
}

/// Buffered writer handed out by [`StorageDriver::writer`].
///
/// `commit` flushes, syncs and closes. `cancel` closes and removes the
/// file. Writing after either fails with `AlreadyClosed`.
#[async_trait]
pub trait FileWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Bytes in the file, including any appended-to prefix.
    fn size(&self) -> u64;

    async fn commit(&mut self) -> Result<()>;

    async fn cancel(&mut self) -> Result<()>;

    /// Flush and close without marking the content committed.
    async fn close(&mut self) -> Result<()>;
}

/// A path-namespaced byte store.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_content(&self, path: &str) -> Result<Vec<u8>>;

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Open `path` for reading starting at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> Result<BoxedReader>;

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Direct children of a directory, as full paths.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    async fn move_path(&self, source: &str, dest: &str) -> Result<()>;

    /// Delete a file or a directory tree.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Visit every descendant of `path` in lexical order, depth first.
    async fn walk(
        &self,
        path: &str,
        f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
    ) -> Result<()>;
}

/// Walk built on `list` and `stat`, for drivers without a native walk.
pub async fn walk_fallback<D: StorageDriver + ?Sized>(
    driver: &D,
    path: &str,
    f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
) -> Result<()> {
    // reversed so that pop yields lexical order
    let mut pending = sorted_children(driver, path).await?;
    pending.reverse();
    while let Some(child) = pending.pop() {
        let info = match driver.stat(&child).await {
            Ok(info) => info,
            // removed between list and stat
            Err(RegistryError::PathNotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if f(&info) == WalkControl::Continue && info.is_dir {
            let children = match sorted_children(driver, &child).await {
                Ok(children) => children,
                Err(RegistryError::PathNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            pending.extend(children.into_iter().rev());
        }
    }
    Ok(())
}

async fn sorted_children<D: StorageDriver + ?Sized>(driver: &D, path: &str) -> Result<Vec<String>> {
    let mut children = driver.list(path).await?;
    children.sort();
    Ok(children)
}

/// Validate a storage path and return its components.
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == ".." || c.contains('\\')) {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    Ok(components)
}

/// Join a storage path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Write `content` through a fresh writer, cancelling on failure.
pub async fn write_all_committed(mut writer: Box<dyn FileWriter>, content: &[u8]) -> Result<()> {
    let result = match writer.write(content).await {
        Ok(_) => writer.commit().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        if let Err(cancel_err) = writer.cancel().await {
            tracing::warn!(error = %cancel_err, "Failed to cancel writer after error");
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_components() {
        assert_eq!(path_components("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(path_components("/").unwrap(), Vec::<&str>::new());
        assert_eq!(path_components("/a//b/").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_path_traversal_rejected() {
        assert!(matches!(
            path_components("/a/../../etc"),
            Err(RegistryError::InvalidPath(_))
        ));
        assert!(path_components("relative/path").is_err());
        assert!(path_components("/a/./b").is_err());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "docker"), "/docker");
        assert_eq!(join("/docker/", "registry"), "/docker/registry");
    }
}
