//! Rebuilding cached snapshots in the background.
//!
//! The flow is split in two. [`RebuildTrigger`] runs inside the request path: it takes the atomic decision and, only
//! when it wins, hands a [`RebuildJob`] to the configured [`JobRunner`]. [`RebuildWorker`] is what eventually runs the
//! job: it reads the query's records from the backing store, renders them and publishes the snapshot.

use async_trait::async_trait;
use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::cache::ListCache;
use crate::error::ListCacheError;
use crate::error::Result;
use crate::query::ListQuery;
use crate::registry::ListRegistry;
use crate::state::CacheState;
use crate::traits::BackingStore;
use crate::traits::EntryStore;
use crate::traits::JobRunner;

pub const JOB_VERSION: u32 = 1;

/// How many records a worker reads from the backing store per round trip unless told otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Everything a worker needs to rebuild one snapshot. Travels through the job runner as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebuildJob {
    pub version: u32,
    pub list_id: String,
    pub data_id: String,
    pub query:   ListQuery,
}

impl RebuildJob {
    pub fn new(list_id: impl Into<String>, data_id: impl Into<String>, query: ListQuery) -> Self {
        Self {
            version: JOB_VERSION,
            list_id: list_id.into(),
            data_id: data_id.into(),
            query,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        let job: Self = serde_json::from_str(payload)?;
        job.check_version()?;
        Ok(job)
    }

    fn check_version(&self) -> Result<()> {
        if self.version != JOB_VERSION {
            return Err(ListCacheError::UnsupportedJobVersion {
                found:    self.version,
                expected: JOB_VERSION,
            });
        }
        Ok(())
    }
}

/// Request-side half of a rebuild. Many callers may race through [`trigger()`](Self::trigger) for the same snapshot;
/// only one of them gets to submit a job.
#[fx_plus(child(ListCache<S>, rc_strong), sync, default(off))]
pub struct RebuildTrigger<S>
where
    S: EntryStore, {}

impl<S> RebuildTrigger<S>
where
    S: EntryStore,
{
    /// Returns `true` if this call submitted a rebuild job.
    ///
    /// The job is submitted after the state transaction has committed and is never re-submitted. If submission fails
    /// the entry stays in processing state.
    #[instrument(level = "debug", skip(self, query))]
    pub async fn trigger(&self, list_id: &str, data_id: &str, query: &ListQuery) -> Result<bool> {
        let cache = self.parent();

        let decision = cache.state().begin_rebuild(data_id).await?;
        if !decision.should_build() {
            debug!("[{}] Rebuild of '{data_id}' is already in flight", cache.name());
            return Ok(false);
        }

        cache
            .job_runner()
            .submit(RebuildJob::new(list_id, data_id, query.clone()))
            .await
            .inspect_err(|err| error!("[{}] Failed to submit rebuild of '{data_id}': {err}", cache.name()))?;

        debug!("[{}] Submitted rebuild of '{data_id}' ({decision:?})", cache.name());
        Ok(true)
    }

    /// Seed an empty processing entry unless somebody already did. `false` means the entry was there already.
    pub async fn try_seed(&self, data_id: &str) -> Result<bool> {
        match self.parent().state().seed_empty_processing(data_id).await {
            Ok(()) => Ok(true),
            Err(ListCacheError::AlreadyExists(_)) => {
                debug!("'{data_id}' has been seeded by someone else");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Executes rebuild jobs.
#[derive(Debug)]
pub struct RebuildWorker<S>
where
    S: EntryStore,
{
    state:         Arc<CacheState<S>>,
    registry:      Arc<ListRegistry>,
    backing_store: Arc<dyn BackingStore>,
    batch_size:    usize,
}

impl<S> RebuildWorker<S>
where
    S: EntryStore,
{
    pub fn new(state: Arc<CacheState<S>>, registry: Arc<ListRegistry>, backing_store: Arc<dyn BackingStore>) -> Self {
        Self {
            state,
            registry,
            backing_store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Rebuild and publish one snapshot. Returns the number of rows read from the store.
    #[instrument(level = "debug", skip(self, job), fields(list_id = %job.list_id, data_id = %job.data_id))]
    pub async fn run(&self, job: RebuildJob) -> Result<usize> {
        job.check_version()?;
        let descriptor = self.registry.get(&job.list_id)?;
        descriptor.check_query(&job.query)?;

        let mut items = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let mut batch = self
                .backing_store
                .fetch(&job.query, start.as_deref(), self.batch_size.saturating_add(1))
                .await?;

            let next = if batch.len() > self.batch_size {
                batch.pop().map(|r| r.key)
            }
            else {
                None
            };

            // The store is trusted to apply the query, but rows must never leak into a snapshot they don't belong to.
            items.extend(
                batch
                    .iter()
                    .filter(|r| job.query.matches(r))
                    .map(|r| descriptor.to_row(r)),
            );

            match next {
                Some(key) => start = Some(key),
                None => break,
            }
        }

        let count = items.len();
        self.state
            .set_contents(&job.data_id, items, descriptor.valid_period())
            .await?;
        debug!("Rebuilt '{}' with {count} row(s)", job.data_id);
        Ok(count)
    }
}

/// In-process job runner: every job is serialized as if it were going to an external queue and then executed on a
/// tokio task by a [`RebuildWorker`].
#[derive(Debug)]
pub struct LocalJobRunner<S>
where
    S: EntryStore,
{
    worker: Arc<RebuildWorker<S>>,
    tasks:  Mutex<Vec<JoinHandle<()>>>,
}

impl<S> LocalJobRunner<S>
where
    S: EntryStore,
{
    pub fn new(worker: RebuildWorker<S>) -> Self {
        Self {
            worker: Arc::new(worker),
            tasks:  Mutex::new(Vec::new()),
        }
    }

    /// Wait for every job submitted so far to finish.
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!("Rebuild task ended abnormally: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl<S> JobRunner for LocalJobRunner<S>
where
    S: EntryStore,
{
    async fn submit(&self, job: RebuildJob) -> Result<()> {
        let payload = job.to_json()?;
        let worker = Arc::clone(&self.worker);

        let task = tokio::spawn(async move {
            let outcome = match RebuildJob::from_json(&payload) {
                Ok(job) => worker.run(job).await,
                Err(err) => Err(err),
            };
            // Nobody is waiting for the outcome; the entry stays in processing state on failure.
            if let Err(err) = outcome {
                error!("Rebuild job failed: {err}; payload: {payload}");
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }
}
