use serde_json::Value;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ListCacheError;
use crate::error::Result;
use crate::query::ListQuery;
use crate::types::Record;
use crate::types::Row;
use crate::types::KEY_COLUMN;

/// How long a rebuilt snapshot stays fresh unless the list says otherwise: one day.
pub const DEFAULT_VALID_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

pub type ColumnFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Where a column takes its value from.
#[derive(Clone)]
pub enum ColumnSource {
    /// The record key.
    Key,
    /// A record field, copied as is. Missing fields render as `null`.
    Field(String),
    Computed(ColumnFn),
}

impl Debug for ColumnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key => f.write_str("Key"),
            Self::Field(field) => f.debug_tuple("Field").field(field).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnOptions {
    pub title:    Option<String>,
    pub hidden:   bool,
    pub sortable: bool,
}

#[derive(Debug, Clone)]
pub struct Column {
    name:    String,
    source:  ColumnSource,
    options: ColumnOptions,
}

impl Column {
    pub fn new(name: impl Into<String>, source: ColumnSource) -> Self {
        Self {
            name: name.into(),
            source,
            options: ColumnOptions::default(),
        }
    }

    /// The identity column. Its name is [`KEY_COLUMN`] so that rebuilt snapshots can be de-duplicated by it.
    pub fn key() -> Self {
        Self::new(KEY_COLUMN, ColumnSource::Key).hidden()
    }

    pub fn field(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(name, ColumnSource::Field(field.into()))
    }

    pub fn computed<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        Self::new(name, ColumnSource::Computed(Arc::new(func)))
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.options.title = Some(title.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.options.hidden = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.options.sortable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ColumnOptions {
        &self.options
    }

    pub fn value_of(&self, record: &Record) -> Value {
        match &self.source {
            ColumnSource::Key => Value::String(record.key.clone()),
            ColumnSource::Field(field) => record.field(field).cloned().unwrap_or(Value::Null),
            ColumnSource::Computed(func) => func(record),
        }
    }
}

/// Static description of one list.
#[derive(Debug, Clone)]
pub struct ListDescriptor {
    list_id:      String,
    entity_type:  String,
    columns:      Vec<Column>,
    cached:       bool,
    valid_period: Duration,
}

impl ListDescriptor {
    pub fn new(list_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            list_id:      list_id.into(),
            entity_type:  entity_type.into(),
            columns:      Vec::new(),
            cached:       false,
            valid_period: DEFAULT_VALID_PERIOD,
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Serve this list from cached snapshots which stay fresh for `valid_period`.
    pub fn cached(mut self, valid_period: Duration) -> Self {
        self.cached = true;
        self.valid_period = valid_period;
        self
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn valid_period(&self) -> Duration {
        self.valid_period
    }

    /// Queries must select the records this list is built from.
    pub fn check_query(&self, query: &ListQuery) -> Result<()> {
        if query.entity_type != self.entity_type {
            return Err(ListCacheError::QueryMismatch {
                list_id:  self.list_id.clone(),
                expected: self.entity_type.clone(),
                found:    query.entity_type.clone(),
            });
        }
        Ok(())
    }

    fn has_key_column(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.name == KEY_COLUMN && matches!(c.source, ColumnSource::Key))
    }

    /// Render a record into a row through the column definitions.
    pub fn to_row(&self, record: &Record) -> Row {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.value_of(record)))
            .collect()
    }
}

/// Immutable map of list ids to their descriptors. Built once and shared by reference.
#[derive(Debug, Default)]
pub struct ListRegistry {
    lists:           HashMap<String, Arc<ListDescriptor>>,
    cached_entities: BTreeSet<String>,
}

impl ListRegistry {
    pub fn builder() -> ListRegistryBuilder {
        ListRegistryBuilder::default()
    }

    pub fn get(&self, list_id: &str) -> Result<Arc<ListDescriptor>> {
        self.lists
            .get(list_id)
            .cloned()
            .ok_or_else(|| ListCacheError::UnknownList(list_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Entity types backing at least one cached list.
    pub fn cached_entity_types(&self) -> impl Iterator<Item = &str> {
        self.cached_entities.iter().map(String::as_str)
    }

    /// Identifier of the cached list of `entity_type` records narrowed down by `filter_value`.
    pub fn list_id(&self, entity_type: &str, filter_value: impl std::fmt::Display) -> Result<String> {
        if !self.cached_entities.contains(entity_type) {
            return Err(ListCacheError::NotCacheable(entity_type.to_string()));
        }
        Ok(format!("{entity_type} {filter_value}"))
    }
}

#[derive(Debug, Default)]
pub struct ListRegistryBuilder {
    lists: Vec<ListDescriptor>,
}

impl ListRegistryBuilder {
    pub fn list(mut self, descriptor: ListDescriptor) -> Self {
        self.lists.push(descriptor);
        self
    }

    pub fn build(self) -> Result<Arc<ListRegistry>> {
        let mut registry = ListRegistry::default();
        for descriptor in self.lists {
            // Snapshot rows are de-duplicated and paged by their key.
            if descriptor.cached && !descriptor.has_key_column() {
                return Err(ListCacheError::Build {
                    what:    "list registry",
                    message: format!("cached list '{}' has no key column", descriptor.list_id),
                });
            }
            if descriptor.cached {
                registry.cached_entities.insert(descriptor.entity_type.clone());
            }
            let list_id = descriptor.list_id.clone();
            if registry.lists.insert(list_id.clone(), Arc::new(descriptor)).is_some() {
                return Err(ListCacheError::Build {
                    what:    "list registry",
                    message: format!("list '{list_id}' is registered twice"),
                });
            }
        }
        Ok(Arc::new(registry))
    }
}
