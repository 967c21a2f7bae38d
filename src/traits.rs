use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use moka::ops::compute::Op;
use std::fmt::Debug;

use crate::error::Result;
use crate::query::ListQuery;
use crate::rebuild::RebuildJob;
use crate::types::CachedEntry;
use crate::types::Record;

/// Persistence for [`CachedEntry`] records, all keyed by `data_id` within a single logical collection.
#[async_trait]
pub trait EntryStore: Debug + Send + Sync + 'static {
    async fn get(&self, data_id: &str) -> Result<Option<CachedEntry>>;

    /// Last-writer-wins overwrite.
    async fn put(&self, entry: CachedEntry) -> Result<()>;

    /// Run `f` against the current state of one record as a single atomic transaction.
    ///
    /// `f` receives the stored entry (if any) and returns what to do with the record along with a value to hand back
    /// to the caller: [`Op::Put`] persists the new entry, [`Op::Nop`] leaves the record untouched. Two concurrent
    /// computations on the same `data_id` must never observe the same state. If `f` fails nothing is written.
    async fn compute<F, T>(&self, data_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(Option<CachedEntry>) -> Result<(Op<CachedEntry>, T)> + Send,
        T: Send;
}

/// The authoritative, cursor-paginated store the lists are built from.
#[async_trait]
pub trait BackingStore: Debug + Send + Sync + 'static {
    /// Fetch at most `limit` records selected by `query`, in key order, beginning at the record whose key is `start`
    /// (inclusive). `None` starts from the first record.
    async fn fetch(&self, query: &ListQuery, start: Option<&str>, limit: usize) -> Result<Vec<Record>>;
}

/// Fire-and-forget executor of rebuild jobs. There is no return channel: a job reports back by publishing the new
/// snapshot through the cache state.
#[async_trait]
pub trait JobRunner: Debug + Send + Sync + 'static {
    async fn submit(&self, job: RebuildJob) -> Result<()>;
}

pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
