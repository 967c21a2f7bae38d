use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = ListCacheError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ListCacheError {
    /// A state operation was attempted on a `data_id` that has no cached entry. Always a caller bug: either `exists()`
    /// had to be checked first or the rebuild trigger should have been used.
    #[error("a cached list with data id '{0}' does not exist")]
    NotFound(String),

    #[error("a cached list with data id '{0}' already exists")]
    AlreadyExists(String),

    #[error("no list is registered under id '{0}'")]
    UnknownList(String),

    #[error("'{0}' is not an entity type cached in cached lists")]
    NotCacheable(String),

    #[error("list '{list_id}' is built from '{expected}' records, the query asks for '{found}'")]
    QueryMismatch {
        list_id:  String,
        expected: String,
        found:    String,
    },

    #[error("validity period {0:?} is out of range")]
    PeriodOutOfRange(Duration),

    #[error("rebuild job version {found} is not supported (expected {expected})")]
    UnsupportedJobVersion { found: u32, expected: u32 },

    #[error("backend failure: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync + 'static>),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("failed to build {what}: {message}")]
    Build { what: &'static str, message: String },
}

impl ListCacheError {
    /// Wrap an error produced by a record store, a backing store, or a job runner.
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::Backend(err.into())
    }

    pub(crate) fn build<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> Self {
        move |err| Self::Build {
            what,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
