//! Caps the number of in-flight driver operations.

use std::sync::Arc;

use async_trait::async_trait;
use sealreg_core::config::MIN_THREADS;
use sealreg_core::error::{RegistryError, Result};
use tokio::sync::{Semaphore, SemaphorePermit};

use super::driver::{
    walk_fallback, BoxedReader, FileInfo, FileWriter, StorageDriver, WalkControl,
};

/// Wraps a driver so that at most `limit` operations run at once.
///
/// Writers and readers handed out are not regulated once returned; only
/// opening them is.
pub struct Regulator<D> {
    inner: D,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl<D: StorageDriver> Regulator<D> {
    /// Wrap `inner`; `limit` is raised to the floor of 25.
    pub fn new(inner: D, limit: u64) -> Self {
        let limit = limit.max(MIN_THREADS) as usize;
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn enter(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|e| RegistryError::StorageIo(format!("regulator closed: {}", e)))
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for Regulator<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let _permit = self.enter().await?;
        self.inner.get_content(path).await
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
        let _permit = self.enter().await?;
        self.inner.put_content(path, content).await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxedReader> {
        let _permit = self.enter().await?;
        self.inner.reader(path, offset).await
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
        let _permit = self.enter().await?;
        self.inner.writer(path, append).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let _permit = self.enter().await?;
        self.inner.stat(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let _permit = self.enter().await?;
        self.inner.list(path).await
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let _permit = self.enter().await?;
        self.inner.move_path(source, dest).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let _permit = self.enter().await?;
        self.inner.delete(path).await
    }

    async fn walk(
        &self,
        path: &str,
        f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
    ) -> Result<()> {
        // each list and stat takes its own permit
        walk_fallback(self, path, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::inmemory::InMemoryDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Driver whose `stat` sleeps and records the peak concurrency.
    #[derive(Default)]
    struct SlowDriver {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        inner: InMemoryDriver,
    }

    #[async_trait]
    impl StorageDriver for SlowDriver {
        fn name(&self) -> &'static str {
            "slow"
        }
        async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.get_content(path).await
        }
        async fn put_content(&self, path: &str, content: &[u8]) -> Result<()> {
            self.inner.put_content(path, content).await
        }
        async fn reader(&self, path: &str, offset: u64) -> Result<BoxedReader> {
            self.inner.reader(path, offset).await
        }
        async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
            self.inner.writer(path, append).await
        }
        async fn stat(&self, path: &str) -> Result<FileInfo> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.stat(path).await
        }
        async fn list(&self, path: &str) -> Result<Vec<String>> {
            self.inner.list(path).await
        }
        async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
            self.inner.move_path(source, dest).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn walk(
            &self,
            path: &str,
            f: &mut (dyn for<'w> FnMut(&'w FileInfo) -> WalkControl + Send),
        ) -> Result<()> {
            self.inner.walk(path, f).await
        }
    }

    #[test]
    fn test_limit_floor() {
        assert_eq!(Regulator::new(InMemoryDriver::new(), 1).limit(), 25);
        assert_eq!(Regulator::new(InMemoryDriver::new(), 100).limit(), 100);
    }

    #[tokio::test]
    async fn test_caps_in_flight_operations() {
        let regulated = Arc::new(Regulator::new(SlowDriver::default(), 25));
        regulated.put_content("/f", b"x").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let d = regulated.clone();
            handles.push(tokio::spawn(async move { d.stat("/f").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let peak = regulated.inner().peak.load(Ordering::SeqCst);
        assert!(peak <= 25, "peak {} exceeded cap", peak);
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_delegates_name() {
        let regulated = Regulator::new(InMemoryDriver::new(), 25);
        assert_eq!(regulated.name(), "inmemory");
    }
}
