use crate::error::{Result, StoreError};
use crate::traits::{Filter, SortOrder, Store, StoredRecord, merge_patch};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

/// In-process store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<StoredRecord> {
        let record = StoredRecord {
            id: Uuid::new_v4().to_string(),
            data,
            created_at: Utc::now(),
        };
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn filter(
        &self,
        collection: &str,
        filters: &[Filter],
        sort: SortOrder,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let Some(records) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<StoredRecord> = records
            .iter()
            .filter(|record| filters.iter().all(|f| f.matches(&record.data)))
            .cloned()
            .collect();
        matched.sort_by_key(|record| record.created_at);
        if sort == SortOrder::NewestFirst {
            matched.reverse();
        }
        matched.truncate(limit);
        Ok(matched)
    }

    async fn update(&self, collection: &str, id: &str, patch: serde_json::Value) -> Result<()> {
        let mut records =
            self.collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        merge_patch(&mut record.data, &patch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::traits::{Filter, SortOrder, Store};

    #[tokio::test]
    async fn create_filter_update_round_trip() {
        let store = MemoryStore::new();
        let created = store
            .create(
                "processed_messages",
                serde_json::json!({ "message_id": "m1", "status": "pending" }),
            )
            .await
            .expect("create should succeed");
        store
            .create(
                "processed_messages",
                serde_json::json!({ "message_id": "m2", "status": "pending" }),
            )
            .await
            .expect("create should succeed");

        let matched = store
            .filter(
                "processed_messages",
                &[Filter::eq("message_id", "m1")],
                SortOrder::OldestFirst,
                10,
            )
            .await
            .expect("filter should succeed");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, created.id);

        store
            .update(
                "processed_messages",
                &created.id,
                serde_json::json!({ "status": "replied" }),
            )
            .await
            .expect("update should succeed");
        let matched = store
            .filter(
                "processed_messages",
                &[Filter::eq("status", "replied")],
                SortOrder::OldestFirst,
                10,
            )
            .await
            .expect("filter should succeed");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].data["message_id"], "m1");
    }

    #[tokio::test]
    async fn newest_first_sort_and_limit_bound_results() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store
                .create("conversation_turns", serde_json::json!({ "n": n }))
                .await
                .expect("create should succeed");
        }
        let recent = store
            .filter("conversation_turns", &[], SortOrder::NewestFirst, 2)
            .await
            .expect("filter should succeed");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].data["n"], 4);
        assert_eq!(recent[1].data["n"], 3);
    }

    #[tokio::test]
    async fn update_missing_record_reports_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("sessions", "nope", serde_json::json!({}))
            .await
            .expect_err("update of missing record should fail");
        assert!(err.to_string().contains("sessions/nope"));
    }
}
