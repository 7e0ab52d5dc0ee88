use crate::error::{Result, StoreError};
use crate::traits::{Filter, SortOrder, Store, StoredRecord, merge_patch};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// SQLite-backed store. One table holds every collection; record data is
/// stored as a JSON string and predicates are applied after the row read,
/// matching the contract's top-level-equality filters.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_records_collection_created
    ON records (collection, created_at);
"#,
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store open task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|_| StoreError::Backend("store connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<StoredRecord> {
        let record = StoredRecord {
            id: Uuid::new_v4().to_string(),
            data,
            created_at: Utc::now(),
        };
        let conn = self.conn.clone();
        let collection = collection.to_string();
        let row = record.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Self::lock_conn(&conn)?;
            conn.execute(
                r#"
INSERT INTO records (collection, id, data, created_at)
VALUES (?1, ?2, ?3, ?4)
"#,
                params![
                    collection,
                    row.id,
                    serde_json::to_string(&row.data)?,
                    row.created_at.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store create task failed: {e}")))??;
        Ok(record)
    }

    async fn filter(
        &self,
        collection: &str,
        filters: &[Filter],
        sort: SortOrder,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let conn = self.conn.clone();
        let collection = collection.to_string();
        let filters = filters.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoredRecord>> {
            let conn = Self::lock_conn(&conn)?;
            let order = match sort {
                SortOrder::OldestFirst => "ASC",
                SortOrder::NewestFirst => "DESC",
            };
            let mut stmt = conn.prepare_cached(&format!(
                r#"
SELECT id, data, created_at
  FROM records
 WHERE collection = ?1
 ORDER BY created_at {order}
"#,
            ))?;
            let rows = stmt.query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut matched = Vec::new();
            for row in rows {
                let (id, data, created_micros) = row?;
                let data: serde_json::Value = serde_json::from_str(&data)?;
                if !filters.iter().all(|f| f.matches(&data)) {
                    continue;
                }
                matched.push(StoredRecord {
                    id,
                    data,
                    created_at: micros_to_datetime(created_micros)?,
                });
                if matched.len() >= limit {
                    break;
                }
            }
            Ok(matched)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store filter task failed: {e}")))?
    }

    async fn update(&self, collection: &str, id: &str, patch: serde_json::Value) -> Result<()> {
        let conn = self.conn.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Self::lock_conn(&conn)?;
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            let Some(data) = data else {
                return Err(StoreError::NotFound { collection, id });
            };

            let mut data: serde_json::Value = serde_json::from_str(&data)?;
            merge_patch(&mut data, &patch);
            conn.execute(
                "UPDATE records SET data = ?3 WHERE collection = ?1 AND id = ?2",
                params![collection, id, serde_json::to_string(&data)?],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store update task failed: {e}")))?
    }
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StoreError::InvalidRecord(format!("bad created_at micros: {micros}")))
}
