//! Process-wide "already ensured" cache.
//!
//! One `OnceCell` per key: concurrent first callers share a single
//! initialisation attempt, a successful attempt is remembered for the life
//! of the process, and a failed attempt leaves the cell empty so the next
//! caller tries again.
//!
//! Resources that can be rewritten (scheduler jobs) use
//! [`EnsureRegistry::ensure_version`] instead, which remembers the last
//! fingerprint written under a key and only skips a write that repeats it.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OnceCell};

static GLOBAL: Lazy<Arc<EnsureRegistry>> = Lazy::new(|| Arc::new(EnsureRegistry::new()));

#[derive(Debug, Default)]
pub struct EnsureRegistry {
    cells: DashMap<String, Arc<OnceCell<()>>>,
    writers: DashMap<String, Arc<Mutex<()>>>,
    versions: DashMap<String, u64>,
}

impl EnsureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every handle that is not given its own.
    pub fn global() -> Arc<EnsureRegistry> {
        GLOBAL.clone()
    }

    /// Run `init` unless `key` was already ensured. Returns `true` when this
    /// call performed the initialisation.
    pub async fn ensure<F, Fut>(&self, key: &str, init: F) -> anyhow::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let cell = self
            .cells
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();

        if cell.initialized() {
            return Ok(false);
        }

        let mut ran = false;
        cell.get_or_try_init(|| {
            ran = true;
            init()
        })
        .await?;
        Ok(ran)
    }

    /// Run `write` unless the last successful write under `key` carried
    /// `fingerprint`. Writers for one key are serialised; `force` always
    /// writes. Returns `true` when this call wrote.
    pub async fn ensure_version<F, Fut>(
        &self,
        key: &str,
        fingerprint: u64,
        force: bool,
        write: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let writer = self
            .writers
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = writer.lock().await;

        if !force && self.version(key) == Some(fingerprint) {
            return Ok(false);
        }

        // A failed write may have changed the remote side.
        self.versions.remove(key);
        write().await?;
        self.versions.insert(key.to_string(), fingerprint);
        Ok(true)
    }

    /// Fingerprint of the last successful [`EnsureRegistry::ensure_version`]
    /// write under `key`.
    pub fn version(&self, key: &str) -> Option<u64> {
        self.versions.get(key).map(|v| *v.value())
    }

    pub fn is_ensured(&self, key: &str) -> bool {
        self.cells
            .get(key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Forget a key so the next `ensure` runs again.
    pub fn invalidate(&self, key: &str) {
        self.cells.remove(key);
        self.versions.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_ensure_is_a_no_op() {
        let registry = EnsureRegistry::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            registry
                .ensure("q", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_ensured("q"));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let registry = EnsureRegistry::new();

        let first = registry
            .ensure("q", || async { Err(anyhow::anyhow!("permission denied")) })
            .await;
        assert!(first.is_err());
        assert!(!registry.is_ensured("q"));

        let second = registry.ensure("q", || async { Ok(()) }).await.unwrap();
        assert!(second);
    }

    #[tokio::test]
    async fn versions_skip_only_a_repeated_write() {
        let registry = EnsureRegistry::new();
        let counter = AtomicUsize::new(0);
        let writes = &counter;
        let write = move || async move {
            writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        assert!(registry.ensure_version("job", 1, false, write).await.unwrap());
        assert!(!registry.ensure_version("job", 1, false, write).await.unwrap());
        assert!(registry.ensure_version("job", 2, false, write).await.unwrap());
        assert!(registry.ensure_version("job", 1, false, write).await.unwrap());
        assert!(registry.ensure_version("job", 1, true, write).await.unwrap());

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(registry.version("job"), Some(1));
    }

    #[tokio::test]
    async fn failed_versioned_writes_are_retried() {
        let registry = EnsureRegistry::new();
        registry
            .ensure_version("job", 1, false, || async { Ok(()) })
            .await
            .unwrap();

        let failed = registry
            .ensure_version("job", 2, false, || async { Err(anyhow::anyhow!("unavailable")) })
            .await;
        assert!(failed.is_err());
        assert_eq!(registry.version("job"), None);

        let wrote = registry
            .ensure_version("job", 1, false, || async { Ok(()) })
            .await
            .unwrap();
        assert!(wrote);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_attempt() {
        let registry = Arc::new(EnsureRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .ensure("q", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
