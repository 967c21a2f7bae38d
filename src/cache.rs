use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::error::ListCacheError;
use crate::error::Result;
use crate::query::ListQuery;
use crate::rebuild::RebuildTrigger;
use crate::registry::ListDescriptor;
use crate::traits::BackingStore;
use crate::traits::EntryStore;
use crate::types::CachePagination;
use crate::types::EntryStatus;
use crate::types::NextCursor;
use crate::types::Page;
use crate::types::PageSource;
use crate::types::Row;
use crate::types::KEY_COLUMN;

/// Page-fetch front door for every registered list.
///
/// Whether a page comes from a cached snapshot or straight from the backing store is decided per list by its
/// descriptor. Cursors are record keys either way, so a page served by one side can be continued by the other. A cached list never blocks on a rebuild: when its snapshot is missing or stale,
/// [`get_page()`](Self::get_page) kicks off a rebuild and reports a miss so the caller can read from the store instead.
///
/// ```ignore
/// let cache = ListCache::builder()
///     .state(CacheState::new(Arc::new(MemoryEntryStore::new())))
///     .registry(registry)
///     .backing_store(backing_store)
///     .job_runner(job_runner)
///     .build()?;
///
/// let (page, source) = cache.fetch_page("projects", &query, None, 50).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`ListCache`].", "", "See [`ListCache::builder()`] method."),
        method_doc("Implement builder pattern for [`ListCache`]."),
    )
)]
pub struct ListCache<S>
where
    S: EntryStore,
{
    #[fieldx(builder(vis(pub), required, into), get(clone))]
    state: Arc<crate::state::CacheState<S>>,

    #[fieldx(builder(vis(pub), required, into), get(clone))]
    registry: Arc<crate::registry::ListRegistry>,

    #[fieldx(builder(vis(pub), required), get(clone))]
    backing_store: Arc<dyn BackingStore>,

    #[fieldx(builder(vis(pub), required), get(clone))]
    job_runner: Arc<dyn crate::traits::JobRunner>,

    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get(copy), default("cached lists"))]
    name: &'static str,

    #[fieldx(get(copy), default(CachePagination::WholeSnapshot))]
    pagination: CachePagination,
}

impl<S> ListCache<S>
where
    S: EntryStore,
{
    pub fn rebuild_trigger(&self) -> Result<RebuildTrigger<S>> {
        child_build!(self, RebuildTrigger<S>).map_err(ListCacheError::build("rebuild trigger"))
    }

    pub fn descriptor(&self, list_id: &str) -> Result<Arc<ListDescriptor>> {
        self.registry().get(list_id)
    }

    fn query_descriptor(&self, list_id: &str, query: &ListQuery) -> Result<Arc<ListDescriptor>> {
        let descriptor = self.descriptor(list_id)?;
        descriptor.check_query(query)?;
        Ok(descriptor)
    }

    pub fn data_id(&self, list_id: &str, query: &ListQuery) -> Result<String> {
        query.data_id(list_id)
    }

    /// Fetch a page of a list.
    ///
    /// For a cached list `Ok(None)` is a cache miss: the snapshot is missing, stale, or being rebuilt. Lists that are
    /// not cached always get their page from the backing store.
    #[instrument(level = "trace", skip(self, query))]
    pub async fn get_page(
        &self,
        list_id: &str,
        query: &ListQuery,
        start: Option<&str>,
        limit: usize,
    ) -> Result<Option<Page>> {
        let descriptor = self.query_descriptor(list_id, query)?;
        if descriptor.is_cached() {
            self.read_cached(&descriptor, query, start, limit).await
        }
        else {
            Ok(Some(self.read_store(&descriptor, query, start, limit).await?))
        }
    }

    /// Like [`get_page()`](Self::get_page) but a cache miss is answered from the backing store right away.
    #[instrument(level = "trace", skip(self, query))]
    pub async fn fetch_page(
        &self,
        list_id: &str,
        query: &ListQuery,
        start: Option<&str>,
        limit: usize,
    ) -> Result<(Page, PageSource)> {
        let descriptor = self.query_descriptor(list_id, query)?;
        if descriptor.is_cached() {
            if let Some(page) = self.read_cached(&descriptor, query, start, limit).await? {
                return Ok((page, PageSource::Cache));
            }
            debug!("[{}] Cache miss for list '{list_id}', falling back to the store", self.name());
        }
        Ok((self.read_store(&descriptor, query, start, limit).await?, PageSource::Store))
    }

    /// Read a page straight from the authoritative store. `start` is the key of the first record of the page.
    ///
    /// One record more than asked for is fetched to find out whether another page follows; if it does, its key is the
    /// next cursor. A zero `limit` yields an empty final page.
    pub async fn read_store(
        &self,
        descriptor: &ListDescriptor,
        query: &ListQuery,
        start: Option<&str>,
        limit: usize,
    ) -> Result<Page> {
        descriptor.check_query(query)?;
        if limit == 0 {
            return Ok(Page::done());
        }

        let mut records = self.backing_store().fetch(query, start, limit.saturating_add(1)).await?;

        let next = if records.len() > limit {
            records.truncate(limit.saturating_add(1));
            records
                .pop()
                .map_or(NextCursor::Done, |extra| NextCursor::More(extra.key))
        }
        else {
            NextCursor::Done
        };

        Ok(Page {
            items: records.iter().map(|r| descriptor.to_row(r)).collect(),
            next,
        })
    }

    async fn read_cached(
        &self,
        descriptor: &ListDescriptor,
        query: &ListQuery,
        start: Option<&str>,
        limit: usize,
    ) -> Result<Option<Page>> {
        let list_id = descriptor.list_id();
        let data_id = query.data_id(list_id)?;

        match self.state().status(&data_id).await? {
            EntryStatus::Fresh => Ok(Some(self.read_snapshot(&data_id, start, limit).await?)),
            EntryStatus::Processing { abandoned: false } => {
                debug!("[{}] '{data_id}' is being rebuilt", self.name());
                Ok(None)
            }
            status @ (EntryStatus::Absent | EntryStatus::Stale | EntryStatus::Processing { abandoned: true }) => {
                if let EntryStatus::Processing { .. } = status {
                    warn!("[{}] Rebuild of '{data_id}' looks abandoned, retrying", self.name());
                }
                // A failed trigger must not turn a miss into an error; the caller reads from the store either way.
                if let Err(err) = self.rebuild_trigger()?.trigger(list_id, &data_id, query).await {
                    error!("[{}] Could not trigger rebuild of '{data_id}': {err}", self.name());
                }
                Ok(None)
            }
        }
    }

    /// Cached rows are addressed by their [`KEY_COLUMN`]. A start key missing from the snapshot resumes at the first
    /// row past it, the way the store would.
    async fn read_snapshot(&self, data_id: &str, start: Option<&str>, limit: usize) -> Result<Page> {
        if limit == 0 {
            return Ok(Page::done());
        }

        let mut items = self.state().get_items(data_id, 0, None).await?;
        let offset = match start {
            None => 0,
            Some(start) => items
                .iter()
                .position(|row| row_key(row) == Some(start))
                .or_else(|| items.iter().position(|row| row_key(row).is_some_and(|key| key > start)))
                .unwrap_or(items.len()),
        };
        let mut items = items.split_off(offset);

        let next = match self.pagination() {
            CachePagination::WholeSnapshot => {
                items.truncate(limit);
                NextCursor::Done
            }
            CachePagination::Sliced if items.len() > limit => {
                let cursor = row_key(&items[limit]).map(str::to_string);
                items.truncate(limit);
                cursor.map_or(NextCursor::Done, NextCursor::More)
            }
            CachePagination::Sliced => NextCursor::Done,
        };

        Ok(Page { items, next })
    }
}

fn row_key(row: &Row) -> Option<&str> {
    row.get(KEY_COLUMN).and_then(|key| key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_store::MemoryEntryStore;
    use crate::registry::Column;
    use crate::registry::ListRegistry;
    use crate::state::CacheState;
    use crate::test::FailingJobRunner;
    use crate::test::ManualClock;
    use crate::test::MemoryBackingStore;
    use crate::test::RecordingJobRunner;
    use crate::traits::JobRunner;
    use crate::types::Record;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> Arc<ListRegistry> {
        ListRegistry::builder()
            .list(
                ListDescriptor::new("projects", "project")
                    .column(Column::key())
                    .column(Column::field("title", "title"))
                    .cached(Duration::from_secs(60)),
            )
            .list(ListDescriptor::new("orgs", "org").column(Column::key()))
            .build()
            .unwrap()
    }

    fn backing_store() -> Arc<MemoryBackingStore> {
        Arc::new(MemoryBackingStore::with_records(
            (1..=3)
                .map(|i| Record::new("project", format!("p{i}")).with_field("title", format!("Project {i}")))
                .chain((1..=3).map(|i| Record::new("org", format!("o{i}")))),
        ))
    }

    fn cache_with(job_runner: Arc<dyn JobRunner>, pagination: CachePagination) -> Arc<ListCache<MemoryEntryStore>> {
        ListCache::builder()
            .state(CacheState::new(Arc::new(MemoryEntryStore::new())))
            .registry(registry())
            .backing_store(backing_store())
            .job_runner(job_runner)
            .pagination(pagination)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn uncached_list_reads_store() {
        let runner = Arc::new(RecordingJobRunner::new());
        let cache = cache_with(runner.clone(), CachePagination::WholeSnapshot);
        let query = ListQuery::new("org");

        let page = cache.get_page("orgs", &query, None, 2).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next, NextCursor::More("o3".into()));

        let page = cache.get_page("orgs", &query, page.next.as_start(), 2).await.unwrap().unwrap();
        assert_eq!(page.items, vec![json!({"key": "o3"}).as_object().unwrap().clone()]);
        assert!(page.next.is_done());
        assert_eq!(runner.submitted(), 0);
    }

    #[tokio::test]
    async fn miss_triggers_single_rebuild() {
        let runner = Arc::new(RecordingJobRunner::new());
        let cache = cache_with(runner.clone(), CachePagination::WholeSnapshot);
        let query = ListQuery::new("project");

        assert!(cache.get_page("projects", &query, None, 10).await.unwrap().is_none());
        assert!(cache.get_page("projects", &query, None, 10).await.unwrap().is_none());

        let jobs = runner.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].list_id, "projects");
        assert_eq!(jobs[0].data_id, cache.data_id("projects", &query).unwrap());
        assert!(cache.state().is_processing(&jobs[0].data_id).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_page_falls_back_to_store() {
        let runner = Arc::new(RecordingJobRunner::new());
        let cache = cache_with(runner.clone(), CachePagination::WholeSnapshot);
        let query = ListQuery::new("project");

        let (page, source) = cache.fetch_page("projects", &query, None, 2).await.unwrap();
        assert_eq!(source, PageSource::Store);
        assert_eq!(page.items[0]["title"], json!("Project 1"));
        assert_eq!(page.next, NextCursor::More("p3".into()));
        assert_eq!(runner.submitted(), 1);
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served() {
        let runner = Arc::new(RecordingJobRunner::new());
        let cache = cache_with(runner.clone(), CachePagination::WholeSnapshot);
        let query = ListQuery::new("project");
        let data_id = cache.data_id("projects", &query).unwrap();

        let rows = (1..=3)
            .map(|i| json!({"key": format!("p{i}")}).as_object().unwrap().clone())
            .collect::<Vec<_>>();
        cache
            .state()
            .set_contents(&data_id, rows, Duration::from_secs(60))
            .await
            .unwrap();

        let (page, source) = cache.fetch_page("projects", &query, None, 10).await.unwrap();
        assert_eq!(source, PageSource::Cache);
        assert_eq!(page.items.len(), 3);
        assert!(page.next.is_done());

        let page = cache.get_page("projects", &query, Some("p3"), 10).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["key"], json!("p3"));

        // A key that is not in the snapshot resumes right after it.
        let page = cache.get_page("projects", &query, Some("p10"), 10).await.unwrap().unwrap();
        assert_eq!(page.items[0]["key"], json!("p2"));
        let page = cache.get_page("projects", &query, Some("zzz"), 10).await.unwrap().unwrap();
        assert!(page.items.is_empty());
        assert!(page.next.is_done());

        assert_eq!(runner.submitted(), 0);
    }

    #[tokio::test]
    async fn sliced_snapshot_pages() {
        let cache = cache_with(Arc::new(RecordingJobRunner::new()), CachePagination::Sliced);
        let query = ListQuery::new("project");
        let data_id = cache.data_id("projects", &query).unwrap();

        let rows = (0..5)
            .map(|i| json!({"key": format!("p{i}")}).as_object().unwrap().clone())
            .collect::<Vec<_>>();
        cache
            .state()
            .set_contents(&data_id, rows, Duration::from_secs(60))
            .await
            .unwrap();

        let page = cache.get_page("projects", &query, None, 2).await.unwrap().unwrap();
        assert_eq!(page.next, NextCursor::More("p2".into()));
        let page = cache.get_page("projects", &query, page.next.as_start(), 2).await.unwrap().unwrap();
        assert_eq!(page.items[0]["key"], json!("p2"));
        assert_eq!(page.next, NextCursor::More("p4".into()));
        let page = cache.get_page("projects", &query, page.next.as_start(), 2).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next.is_done());
    }

    #[tokio::test]
    async fn failed_submission_is_still_a_miss() {
        let cache = cache_with(Arc::new(FailingJobRunner), CachePagination::WholeSnapshot);
        let query = ListQuery::new("project");

        assert!(cache.get_page("projects", &query, None, 10).await.unwrap().is_none());
        let data_id = cache.data_id("projects", &query).unwrap();
        assert!(cache.state().is_processing(&data_id).await.unwrap());

        let trigger = cache.rebuild_trigger().unwrap();
        assert!(trigger.trigger("projects", &data_id, &query).await.is_ok_and(|submitted| !submitted));
    }

    #[tokio::test]
    async fn store_cursor_continues_in_snapshot() {
        let cache = cache_with(Arc::new(RecordingJobRunner::new()), CachePagination::Sliced);
        let query = ListQuery::new("project");

        let (first, source) = cache.fetch_page("projects", &query, None, 2).await.unwrap();
        assert_eq!(source, PageSource::Store);
        assert_eq!(first.next, NextCursor::More("p3".into()));

        let data_id = cache.data_id("projects", &query).unwrap();
        let rows = (1..=3)
            .map(|i| json!({"key": format!("p{i}")}).as_object().unwrap().clone())
            .collect::<Vec<_>>();
        cache
            .state()
            .set_contents(&data_id, rows, Duration::from_secs(60))
            .await
            .unwrap();

        let (second, source) = cache.fetch_page("projects", &query, first.next.as_start(), 2).await.unwrap();
        assert_eq!(source, PageSource::Cache);
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0]["key"], json!("p3"));
        assert!(second.next.is_done());
    }

    #[tokio::test]
    async fn snapshot_cursor_continues_in_store() {
        let clock = Arc::new(ManualClock::new());
        let cache = ListCache::builder()
            .state(CacheState::new(Arc::new(MemoryEntryStore::new())).with_clock(clock.clone()))
            .registry(registry())
            .backing_store(backing_store())
            .job_runner(Arc::new(RecordingJobRunner::new()))
            .pagination(CachePagination::Sliced)
            .build()
            .unwrap();
        let query = ListQuery::new("project");
        let data_id = cache.data_id("projects", &query).unwrap();
        let rows = (1..=3)
            .map(|i| json!({"key": format!("p{i}")}).as_object().unwrap().clone())
            .collect::<Vec<_>>();
        cache
            .state()
            .set_contents(&data_id, rows, Duration::from_secs(60))
            .await
            .unwrap();

        let (first, source) = cache.fetch_page("projects", &query, None, 2).await.unwrap();
        assert_eq!(source, PageSource::Cache);
        assert_eq!(first.next, NextCursor::More("p3".into()));

        clock.advance(Duration::from_secs(61));
        let (second, source) = cache.fetch_page("projects", &query, first.next.as_start(), 2).await.unwrap();
        assert_eq!(source, PageSource::Store);
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0]["key"], json!("p3"));
        assert!(second.next.is_done());
    }

    #[tokio::test]
    async fn limit_boundaries() {
        let cache = cache_with(Arc::new(RecordingJobRunner::new()), CachePagination::Sliced);
        let query = ListQuery::new("org");

        let page = cache.get_page("orgs", &query, None, 0).await.unwrap().unwrap();
        assert!(page.items.is_empty());
        assert!(page.next.is_done());

        let page = cache.get_page("orgs", &query, None, usize::MAX).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.next.is_done());

        let query = ListQuery::new("project");
        let data_id = cache.data_id("projects", &query).unwrap();
        let rows = (1..=3)
            .map(|i| json!({"key": format!("p{i}")}).as_object().unwrap().clone())
            .collect::<Vec<_>>();
        cache
            .state()
            .set_contents(&data_id, rows, Duration::from_secs(60))
            .await
            .unwrap();

        let page = cache.get_page("projects", &query, None, usize::MAX).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.next.is_done());
        let page = cache.get_page("projects", &query, None, 0).await.unwrap().unwrap();
        assert!(page.items.is_empty());
        assert!(page.next.is_done());
    }

    #[tokio::test]
    async fn query_for_another_entity_is_rejected() {
        let runner = Arc::new(RecordingJobRunner::new());
        let cache = cache_with(runner.clone(), CachePagination::WholeSnapshot);

        assert!(matches!(
            cache.fetch_page("projects", &ListQuery::new("org"), None, 10).await,
            Err(ListCacheError::QueryMismatch { .. })
        ));
        assert!(matches!(
            cache.get_page("orgs", &ListQuery::new("project"), None, 10).await,
            Err(ListCacheError::QueryMismatch { .. })
        ));
        assert_eq!(runner.submitted(), 0);
    }

    #[tokio::test]
    async fn unknown_list() {
        let cache = cache_with(Arc::new(RecordingJobRunner::new()), CachePagination::WholeSnapshot);
        assert!(matches!(
            cache.get_page("nope", &ListQuery::new("project"), None, 10).await,
            Err(ListCacheError::UnknownList(_))
        ));
    }
}
