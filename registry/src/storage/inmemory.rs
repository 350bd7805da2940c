//! In-memory storage driver for tests and throwaway registries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use sealreg_core::error::{RegistryError, Result};

use super::driver::{
    path_components, walk_fallback, write_all_committed, BoxedReader, FileInfo, FileWriter,
    StorageDriver, WalkControl,
};

pub const DRIVER_NAME: &str = "inmemory";

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    mod_time: SystemTime,
}

type Files = Arc<RwLock<BTreeMap<String, Entry>>>;

/// Driver keeping files in a shared map. Directories are implied by keys.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDriver {
    files: Files,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize(path: &str) -> Result<String> {
    let components = path_components(path)?;
    Ok(format!("/{}", components.join("/")))
}

fn dir_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn is_dir(files: &BTreeMap<String, Entry>, path: &str) -> bool {
    let prefix = dir_prefix(path);
    files.range(prefix.clone()..).next().map_or(false, |(k, _)| k.starts_with(&prefix))
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        self.files
            .read()
            .get(&path)
            .map(|e| e.data.clone())
            .ok_or(RegistryError::PathNotFound(path))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
        let writer = self.writer(path, false).await?;
        write_all_committed(writer, content).await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxedReader> {
        let data = self.get_content(path).await?;
        if (data.len() as u64) < offset {
            return Err(RegistryError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        let tail = data[offset as usize..].to_vec();
        Ok(Box::new(std::io::Cursor::new(tail)))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
        let path = normalize(path)?;
        let existing = if append {
            self.files
                .read()
                .get(&path)
                .map(|e| e.data.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Box::new(InMemoryWriter {
            files: self.files.clone(),
            path,
            buffer: existing,
            closed: false,
            committed: false,
            cancelled: false,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = normalize(path)?;
        let files = self.files.read();
        if let Some(entry) = files.get(&path) {
            return Ok(FileInfo {
                path,
                size: entry.data.len() as u64,
                mod_time: entry.mod_time,
                is_dir: false,
            });
        }
        if path == "/" || is_dir(&files, &path) {
            return Ok(FileInfo {
                path,
                size: 0,
                mod_time: SystemTime::now(),
                is_dir: true,
            });
        }
        Err(RegistryError::PathNotFound(path))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize(path)?;
        let prefix = dir_prefix(&path);
        let files = self.files.read();

        let mut children: Vec<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(|child| format!("{}{}", prefix, child))
            .collect();
        children.dedup();

        if children.is_empty() && path != "/" {
            return Err(RegistryError::PathNotFound(path));
        }
        Ok(children)
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let source = normalize(source)?;
        let dest = normalize(dest)?;
        let mut files = self.files.write();

        if let Some(entry) = files.remove(&source) {
            files.insert(dest, entry);
            return Ok(());
        }

        let prefix = dir_prefix(&source);
        let moved: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(RegistryError::PathNotFound(source));
        }
        for key in moved {
            if let Some(entry) = files.remove(&key) {
                let suffix = &key[prefix.len()..];
                files.insert(format!("{}/{}", dest, suffix), entry);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let mut files = self.files.write();
        if files.remove(&path).is_some() {
            return Ok(());
        }
        let prefix = dir_prefix(&path);
        let before = files.len();
        files.retain(|k, _| !k.starts_with(&prefix));
        if files.len() == before {
            return Err(RegistryError::PathNotFound(path));
        }
        Ok(())
    }

    async fn walk(
        &self,
        path: &str,
        f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
    ) -> Result<()> {
        walk_fallback(self, path, f).await
    }
}

struct InMemoryWriter {
    files: Files,
    path: String,
    buffer: Vec<u8>,
    closed: bool,
    committed: bool,
    cancelled: bool,
}

impl InMemoryWriter {
    fn check_open(&self) -> Result<()> {
        if self.committed {
            Err(RegistryError::AlreadyCommitted)
        } else if self.cancelled {
            Err(RegistryError::AlreadyCancelled)
        } else if self.closed {
            Err(RegistryError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn store(&mut self) {
        let entry = Entry {
            data: std::mem::take(&mut self.buffer),
            mod_time: SystemTime::now(),
        };
        self.files.write().insert(self.path.clone(), entry);
    }
}

#[async_trait]
impl FileWriter for InMemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed || self.committed || self.cancelled {
            return Err(RegistryError::AlreadyClosed);
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.store();
        self.committed = true;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.check_open()?;
        self.buffer.clear();
        self.files.write().remove(&self.path);
        self.cancelled = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(RegistryError::AlreadyClosed);
        }
        if !self.committed && !self.cancelled {
            self.store();
        }
        self.closed = true;
        Ok(())
    }
}
