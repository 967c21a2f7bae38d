//! The cache state machine.
//!
//! Per `data_id` an entry moves `ABSENT -> SEEDED_PROCESSING -> {VALID, STALE} <-> PROCESSING_REBUILD`. Nothing
//! here ever deletes an entry. Entering the processing state always goes through [`EntryStore::compute`], so two
//! callers can never both win the right to rebuild the same snapshot.

use chrono::DateTime;
use chrono::Utc;
use moka::ops::compute::Op;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;

use crate::error::ListCacheError;
use crate::error::Result;
use crate::traits::Clock;
use crate::traits::EntryStore;
use crate::traits::SystemClock;
use crate::types::CachedEntry;
use crate::types::EntryStatus;
use crate::types::Row;
use crate::types::KEY_COLUMN;

/// Outcome of the atomic rebuild decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildDecision {
    /// There was no entry; an empty one has been created in processing state.
    Seeded,
    /// An idle entry has been switched into processing state.
    Marked,
    /// The entry was processing for longer than the processing timeout and has been taken over.
    Reclaimed,
    /// Someone else is already rebuilding.
    AlreadyProcessing,
}

impl RebuildDecision {
    /// Whether the caller that got this decision must now submit the rebuild.
    pub fn should_build(&self) -> bool {
        !matches!(self, Self::AlreadyProcessing)
    }
}

pub struct CacheState<S>
where
    S: EntryStore,
{
    store:              Arc<S>,
    clock:              Arc<dyn Clock>,
    processing_timeout: Option<Duration>,
}

impl<S> CacheState<S>
where
    S: EntryStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock:              Arc::new(SystemClock),
            processing_timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Consider a rebuild abandoned once it has been processing for longer than `timeout`. Without a timeout a
    /// rebuild that died before publishing leaves its entry processing forever.
    pub fn with_processing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout
    }

    #[inline]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn fetch(&self, data_id: &str) -> Result<CachedEntry> {
        self.store
            .get(data_id)
            .await?
            .ok_or_else(|| ListCacheError::NotFound(data_id.to_string()))
    }

    // Entries processing since before the feature existed carry no start time; with a timeout configured they are
    // treated as abandoned.
    fn is_abandoned(&self, entry: &CachedEntry, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.processing_timeout
        else {
            return false;
        };
        entry.processing_since.is_none_or(|since| {
            (now - since)
                .to_std()
                .map_or(false, |elapsed| elapsed >= timeout)
        })
    }

    pub async fn exists(&self, data_id: &str) -> Result<bool> {
        Ok(self.store.get(data_id).await?.is_some())
    }

    pub async fn is_valid(&self, data_id: &str) -> Result<bool> {
        Ok(self.fetch(data_id).await?.is_fresh_at(self.now()))
    }

    pub async fn is_processing(&self, data_id: &str) -> Result<bool> {
        Ok(self.fetch(data_id).await?.is_processing)
    }

    /// Classify an entry with a single read. A fresh entry is reported as such even while being rebuilt.
    pub async fn status(&self, data_id: &str) -> Result<EntryStatus> {
        let Some(entry) = self.store.get(data_id).await?
        else {
            return Ok(EntryStatus::Absent);
        };
        let now = self.now();
        Ok(if entry.is_fresh_at(now) {
            EntryStatus::Fresh
        }
        else if entry.is_processing {
            EntryStatus::Processing {
                abandoned: self.is_abandoned(&entry, now),
            }
        }
        else {
            EntryStatus::Stale
        })
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn mark_processing(&self, data_id: &str) -> Result<()> {
        let now = self.now();
        self.store
            .compute(data_id, |entry| {
                let mut entry = entry.ok_or_else(|| ListCacheError::NotFound(data_id.to_string()))?;
                entry.is_processing = true;
                entry.processing_since = Some(now);
                Ok((Op::Put(entry), ()))
            })
            .await?;
        debug!("Marked '{data_id}' as processing");
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn seed_empty_processing(&self, data_id: &str) -> Result<()> {
        let now = self.now();
        self.store
            .compute(data_id, |entry| {
                if entry.is_some() {
                    return Err(ListCacheError::AlreadyExists(data_id.to_string()));
                }
                Ok((Op::Put(CachedEntry::seeded(data_id, now)), ()))
            })
            .await?;
        debug!("Seeded empty processing entry '{data_id}'");
        Ok(())
    }

    /// Publish a rebuilt snapshot. This is the only transition out of the processing state.
    ///
    /// Rows are de-duplicated by their [`KEY_COLUMN`]: the first row with a given key wins and the order is kept.
    #[instrument(level = "trace", skip(self, items), fields(items = items.len()))]
    pub async fn set_contents(&self, data_id: &str, items: Vec<Row>, valid_period: Duration) -> Result<()> {
        let period =
            chrono::Duration::from_std(valid_period).map_err(|_| ListCacheError::PeriodOutOfRange(valid_period))?;
        let items = remove_duplicates(items);
        let count = items.len();

        self.store
            .put(CachedEntry {
                data_id: data_id.to_string(),
                items,
                valid_through: Some(self.now() + period),
                is_processing: false,
                processing_since: None,
            })
            .await?;

        debug!("Published {count} item(s) for '{data_id}'");
        Ok(())
    }

    /// `limit` of `None` means everything after `start`. A `start` past the end yields no items.
    pub async fn get_items(&self, data_id: &str, start: usize, limit: Option<usize>) -> Result<Vec<Row>> {
        let entry = self.fetch(data_id).await?;
        Ok(entry
            .items
            .into_iter()
            .skip(start)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// The check-and-mark step of a rebuild trigger, as one transaction.
    #[instrument(level = "trace", skip(self))]
    pub async fn begin_rebuild(&self, data_id: &str) -> Result<RebuildDecision> {
        let now = self.now();
        let decision = self
            .store
            .compute(data_id, |entry| {
                Ok(match entry {
                    None => (Op::Put(CachedEntry::seeded(data_id, now)), RebuildDecision::Seeded),
                    Some(mut entry) => {
                        let decision = if !entry.is_processing {
                            RebuildDecision::Marked
                        }
                        else if self.is_abandoned(&entry, now) {
                            RebuildDecision::Reclaimed
                        }
                        else {
                            return Ok((Op::Nop, RebuildDecision::AlreadyProcessing));
                        };
                        entry.is_processing = true;
                        entry.processing_since = Some(now);
                        (Op::Put(entry), decision)
                    }
                })
            })
            .await?;

        debug!("Rebuild decision for '{data_id}': {decision:?}");
        Ok(decision)
    }
}

impl<S> Debug for CacheState<S>
where
    S: EntryStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheState")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("processing_timeout", &self.processing_timeout)
            .finish()
    }
}

fn remove_duplicates(items: Vec<Row>) -> Vec<Row> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| match item.get(KEY_COLUMN) {
            Some(key) => seen.insert(key.to_string()),
            None => true,
        })
        .collect()
}
