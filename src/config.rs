use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::rebuild::RebuildWorker;
use crate::rebuild::DEFAULT_BATCH_SIZE;
use crate::state::CacheState;
use crate::traits::EntryStore;
use crate::types::CachePagination;

/// Tunables of the cache, usually loaded from a JSON file. Every key is optional.
///
/// ```json
/// {
///     "processing_timeout_secs": 600,
///     "pagination": "sliced",
///     "rebuild_batch_size": 1000
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Consider a rebuild abandoned once it has been running this long. Unset means never.
    pub processing_timeout_secs: Option<u64>,

    /// How pages of cached snapshots are cut.
    pub pagination: CachePagination,

    /// Records read from the backing store per round trip when rebuilding.
    pub rebuild_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            processing_timeout_secs: None,
            pagination:              CachePagination::default(),
            rebuild_batch_size:      DEFAULT_BATCH_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_secs.map(Duration::from_secs)
    }

    pub fn apply_to_state<S: EntryStore>(&self, state: CacheState<S>) -> CacheState<S> {
        state.with_processing_timeout(self.processing_timeout())
    }

    pub fn apply_to_worker<S: EntryStore>(&self, worker: RebuildWorker<S>) -> RebuildWorker<S> {
        worker.with_batch_size(self.rebuild_batch_size)
    }
}
