//! Local filesystem storage driver.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sealreg_core::error::{RegistryError, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use super::driver::{
    join, path_components, walk_fallback, write_all_committed, BoxedReader, FileInfo,
    FileWriter, StorageDriver, WalkControl,
};

pub const DRIVER_NAME: &str = "filesystem";

/// Driver storing every path as a file under a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let mut full = self.root.clone();
        for component in path_components(path)? {
            full.push(component);
        }
        Ok(full)
    }
}

/// `dir/.name.tmp-<uuid>` next to `full`.
fn temp_sibling(full: &Path) -> Option<PathBuf> {
    let name = full.file_name()?.to_string_lossy();
    Some(full.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple())))
}

fn not_found_or(path: &str, e: std::io::Error) -> RegistryError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RegistryError::PathNotFound(path.to_string())
    } else {
        RegistryError::StorageIo(format!("{}: {}", path, e))
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        tokio::fs::read(&full).await.map_err(|e| not_found_or(path, e))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
        let writer = self.writer(path, false).await?;
        write_all_committed(writer, content).await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxedReader> {
        let full = self.full_path(path)?;
        let mut file = File::open(&full).await.map_err(|e| not_found_or(path, e))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| not_found_or(path, e))?
            .len();
        if len < offset {
            return Err(RegistryError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }

        let pos = file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| not_found_or(path, e))?;
        if pos < offset {
            return Err(RegistryError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        Ok(Box::new(file))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| not_found_or(path, e))?;
        }

        if append {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&full)
                .await
                .map_err(|e| not_found_or(path, e))?;
            let offset = file
                .seek(std::io::SeekFrom::End(0))
                .await
                .map_err(|e| not_found_or(path, e))?;
            return Ok(Box::new(FilesystemWriter::new(file, full, None, offset)));
        }

        // fresh content goes to a hidden sibling and is renamed into place
        let temp = temp_sibling(&full).ok_or_else(|| RegistryError::InvalidPath(path.to_string()))?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .map_err(|e| not_found_or(path, e))?;
        Ok(Box::new(FilesystemWriter::new(file, full, Some(temp), 0)))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let full = self.full_path(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;
        Ok(FileInfo {
            path: path.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mod_time: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
            is_dir: meta.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.full_path(path)?;
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| not_found_or(path, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // in-flight writer temp files
            if name.starts_with('.') {
                continue;
            }
            keys.push(join(path, &name));
        }
        Ok(keys)
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let source_full = self.full_path(source)?;
        let dest_full = self.full_path(dest)?;

        if tokio::fs::metadata(&source_full).await.is_err() {
            return Err(RegistryError::PathNotFound(source.to_string()));
        }
        if let Some(parent) = dest_full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| not_found_or(dest, e))?;
        }
        tokio::fs::rename(&source_full, &dest_full)
            .await
            .map_err(|e| not_found_or(source, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| not_found_or(path, e))
    }

    async fn walk(
        &self,
        path: &str,
        f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
    ) -> Result<()> {
        walk_fallback(self, path, f).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Committed,
    Cancelled,
}

/// Buffered writer over a single file.
///
/// A non-append writer fills a temp sibling that replaces the target on
/// commit or close. An append writer extends the target in place.
pub struct FilesystemWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    temp: Option<PathBuf>,
    size: u64,
    state: WriterState,
}

impl FilesystemWriter {
    fn new(file: File, path: PathBuf, temp: Option<PathBuf>, size: u64) -> Self {
        Self {
            file: Some(BufWriter::new(file)),
            path,
            temp,
            size,
            state: WriterState::Open,
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Committed => Err(RegistryError::AlreadyCommitted),
            WriterState::Cancelled => Err(RegistryError::AlreadyCancelled),
            WriterState::Closed => Err(RegistryError::AlreadyClosed),
        }
    }

    async fn flush_and_close(&mut self, sync: bool) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(storage_err)?;
            if sync {
                file.get_ref().sync_all().await.map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Rename the temp file over the target.
    async fn publish(&mut self) -> Result<()> {
        if let Some(temp) = &self.temp {
            tokio::fs::rename(temp, &self.path).await.map_err(storage_err)?;
            self.temp = None;
        }
        Ok(())
    }
}

fn storage_err(e: std::io::Error) -> RegistryError {
    RegistryError::StorageIo(e.to_string())
}

#[async_trait]
impl FileWriter for FilesystemWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.state != WriterState::Open {
            return Err(RegistryError::AlreadyClosed);
        }
        let file = self.file.as_mut().ok_or(RegistryError::AlreadyClosed)?;
        file.write_all(buf).await.map_err(storage_err)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.flush_and_close(true).await?;
        self.publish().await?;
        self.state = WriterState::Committed;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.check_open()?;
        self.file = None;
        self.state = WriterState::Cancelled;
        let target = self.temp.take().unwrap_or_else(|| self.path.clone());
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Err(RegistryError::AlreadyClosed);
        }
        if self.state != WriterState::Open {
            return Ok(());
        }
        self.flush_and_close(false).await?;
        self.publish().await?;
        self.state = WriterState::Closed;
        Ok(())
    }
}
