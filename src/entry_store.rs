use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::future;
use tracing::instrument;

use crate::error::ListCacheError;
use crate::error::Result;
use crate::traits::EntryStore;
use crate::types::CachedEntry;

/// In-process [`EntryStore`] on top of a moka cache.
///
/// moka serializes `compute` operations per key, which is exactly the single-document transaction guarantee the
/// rebuild trigger depends on. The cache is unbounded: entries are never evicted, only superseded in place.
#[derive(Debug)]
pub struct MemoryEntryStore {
    entries: Cache<String, CachedEntry>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::with_name("cached lists")
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            entries: Cache::builder().name(name).build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get(&self, data_id: &str) -> Result<Option<CachedEntry>> {
        Ok(self.entries.get(data_id).await)
    }

    #[instrument(level = "trace", skip(self, entry), fields(data_id = %entry.data_id))]
    async fn put(&self, entry: CachedEntry) -> Result<()> {
        self.entries.insert(entry.data_id.clone(), entry).await;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, f))]
    async fn compute<F, T>(&self, data_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(Option<CachedEntry>) -> Result<(Op<CachedEntry>, T)> + Send,
        T: Send,
    {
        let mut outcome = None;

        self.entries
            .entry(data_id.to_string())
            .and_try_compute_with(|entry| {
                let op = f(entry.map(|e| e.into_value())).map(|(op, value)| {
                    outcome = Some(value);
                    op
                });
                future::ready(op)
            })
            .await?;

        // The closure always runs, so a missing outcome means it has failed and the error was returned above.
        outcome.ok_or_else(|| ListCacheError::backend(format!("computation for '{data_id}' produced no outcome")))
    }
}
