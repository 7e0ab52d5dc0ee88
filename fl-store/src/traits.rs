use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Top-level field equality predicate on a record's data object.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub equals: serde_json::Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, equals: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, data: &serde_json::Value) -> bool {
        data.get(&self.field) == Some(&self.equals)
    }
}

/// Sort direction over a record's creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    OldestFirst,
    NewestFirst,
}

/// Generic record store: named collections of JSON documents.
///
/// The pipeline depends only on this contract; whether records land in
/// SQLite, a hosted entity store, or process memory is a wiring choice.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<StoredRecord>;

    async fn filter(
        &self,
        collection: &str,
        filters: &[Filter],
        sort: SortOrder,
        limit: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Merge `patch`'s top-level keys into the record's data object.
    async fn update(&self, collection: &str, id: &str, patch: serde_json::Value) -> Result<()>;
}

pub(crate) fn merge_patch(data: &mut serde_json::Value, patch: &serde_json::Value) {
    let (Some(target), Some(source)) = (data.as_object_mut(), patch.as_object()) else {
        *data = patch.clone();
        return;
    };
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}
