//! # cached-lists
//!
//! Time-boxed snapshots of paginated lists, rebuilt in the background by exactly one worker at a time.
//!
//! Rendering a list out of an authoritative store is slow when the list is long: every page means a query with a
//! cursor, and every row has to be pushed through the list's column definitions. This crate keeps, per list and per
//! query, a pre-rendered snapshot of the whole list that stays valid for a configured period. Pages of a fresh
//! snapshot are served straight out of it.
//!
//! # The Basics
//!
//! - A list is described once, in a [`ListRegistry`](registry::ListRegistry): its columns, the entity type it is
//!   built from, and whether it is cached at all.
//! - A snapshot is addressed by a `data_id` derived from the list id and the canonical form of the query.
//! - A snapshot is fresh until its validity period runs out. A stale or missing snapshot is never rebuilt in the
//!   request path: the request reports a miss and a [`RebuildJob`](rebuild::RebuildJob) is handed to a
//!   [`JobRunner`](traits::JobRunner).
//! - No matter how many requests race for the same stale snapshot, only one job gets submitted. The check and the
//!   "being rebuilt" mark happen in a single transaction of the [`EntryStore`](traits::EntryStore).
//! - A worker publishes the rebuilt snapshot and, by doing so, clears the "being rebuilt" mark.
//!
//! ```ignore
//! let state = CacheState::new(Arc::new(MemoryEntryStore::new()));
//! let cache = ListCache::builder()
//!     .state(state)
//!     .registry(registry)
//!     .backing_store(store)
//!     .job_runner(runner)
//!     .build()?;
//!
//! match cache.get_page("projects", &query, None, 50).await? {
//!     Some(page) => render(page),
//!     None => render(cache.read_store(&cache.descriptor("projects")?, &query, None, 50).await?),
//! }
//! ```
//!
//! With the `tracing` feature enabled the [`test`] module also provides a subscriber suitable for tests.

pub mod cache;
pub mod config;
pub mod entry_store;
pub mod error;
pub mod query;
pub mod rebuild;
pub mod registry;
pub mod state;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::ListCache;
#[doc(inline)]
pub use error::ListCacheError;
#[doc(inline)]
pub use state::CacheState;

pub mod prelude {
    pub use crate::cache::ListCache;
    pub use crate::config::CacheConfig;
    pub use crate::entry_store::MemoryEntryStore;
    pub use crate::error::ListCacheError;
    pub use crate::error::Result;
    pub use crate::query::FilterOp;
    pub use crate::query::ListQuery;
    pub use crate::rebuild::LocalJobRunner;
    pub use crate::rebuild::RebuildJob;
    pub use crate::rebuild::RebuildWorker;
    pub use crate::registry::Column;
    pub use crate::registry::ListDescriptor;
    pub use crate::registry::ListRegistry;
    pub use crate::state::CacheState;
    pub use crate::traits::*;
    pub use crate::types::*;
}
