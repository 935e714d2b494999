//! SQLite-backed checkpoint store.
//!
//! Two tables, matching the persistence layout the engine documents:
//!
//! - `checkpoints(thread_id, namespace, checkpoint_id, parent_checkpoint_id,
//!   state_blob, metadata_blob, created_at)` with composite primary key
//!   `(thread_id, namespace, checkpoint_id)`
//! - `checkpoint_writes(thread_id, namespace, checkpoint_id, task_id, idx,
//!   channel, value_blob)`
//!
//! A checkpoint and its pending writes commit in a single transaction.
//! Insertion is idempotent on the checkpoint id (`INSERT OR IGNORE`), so a
//! crashed process replaying its last superstep cannot duplicate history.
//! Blobs may optionally be sealed with a [`BlobCipher`].

use crate::checkpoint::{
    CheckpointConfig, CheckpointMetadata, CheckpointTuple, Checkpoint, PendingWrite,
};
use crate::crypto::BlobCipher;
use crate::error::{CheckpointError, Result};
use crate::serializer;
use crate::store::{CheckpointStore, ListFilter};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;

const SCHEMA: [&str; 3] = [
    r#"CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    parent_checkpoint_id TEXT,
    state_blob TEXT NOT NULL,
    metadata_blob TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, namespace, checkpoint_id)
)"#,
    r#"CREATE TABLE IF NOT EXISTS checkpoint_writes (
    thread_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    channel TEXT NOT NULL,
    value_blob TEXT NOT NULL,
    PRIMARY KEY (thread_id, namespace, checkpoint_id, task_id, idx)
)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_checkpoints_latest
    ON checkpoints (thread_id, namespace, created_at DESC)"#,
];

/// Durable checkpoint store over SQLite
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    cipher: Option<Arc<BlobCipher>>,
}

impl SqliteCheckpointStore {
    /// Connect to `database_url` (e.g. `sqlite://valgraph.db` or
    /// `sqlite::memory:`), creating the file and schema if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CheckpointError::Invalid(format!("bad database_url: {}", e)))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!(database_url, "checkpoint store ready");
        Ok(Self { pool, cipher: None })
    }

    /// Seal all blobs with the given cipher from now on
    pub fn with_cipher(mut self, cipher: BlobCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn encode_blob(&self, json: String) -> Result<String> {
        match &self.cipher {
            Some(cipher) => Ok(hex::encode(cipher.seal(json.as_bytes())?)),
            None => Ok(json),
        }
    }

    fn decode_blob(&self, blob: &str) -> Result<String> {
        match &self.cipher {
            Some(cipher) => {
                let sealed = hex::decode(blob)
                    .map_err(|e| CheckpointError::Encryption(format!("bad blob hex: {}", e)))?;
                let plain = cipher.open(&sealed)?;
                String::from_utf8(plain)
                    .map_err(|e| CheckpointError::Encryption(format!("blob not utf-8: {}", e)))
            }
            None => Ok(blob.to_string()),
        }
    }

    async fn load_writes(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, value_blob FROM checkpoint_writes
             WHERE thread_id = ? AND namespace = ? AND checkpoint_id = ?
             ORDER BY task_id ASC, idx ASC",
        )
        .bind(thread_id)
        .bind(namespace)
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let task_id: String = row.try_get("task_id")?;
                let channel: String = row.try_get("channel")?;
                let blob: String = row.try_get("value_blob")?;
                let value = serializer::decode_json(&self.decode_blob(&blob)?)?;
                Ok((task_id, channel, value))
            })
            .collect()
    }

    fn row_to_tuple(
        &self,
        thread_id: &str,
        row: &sqlx::sqlite::SqliteRow,
    ) -> Result<(CheckpointTuple, String)> {
        let namespace: String = row.try_get("namespace")?;
        let checkpoint_id: String = row.try_get("checkpoint_id")?;
        let parent_id: Option<String> = row.try_get("parent_checkpoint_id")?;
        let state_blob: String = row.try_get("state_blob")?;
        let metadata_blob: String = row.try_get("metadata_blob")?;

        let checkpoint: Checkpoint = serializer::decode_json(&self.decode_blob(&state_blob)?)?;
        let metadata: CheckpointMetadata =
            serializer::decode_json(&self.decode_blob(&metadata_blob)?)?;

        let tuple = CheckpointTuple {
            config: CheckpointConfig {
                thread_id: thread_id.to_string(),
                namespace: namespace.clone(),
                checkpoint_id: Some(checkpoint_id.clone()),
            },
            checkpoint,
            metadata,
            parent_config: parent_id.map(|id| CheckpointConfig {
                thread_id: thread_id.to_string(),
                namespace: namespace.clone(),
                checkpoint_id: Some(id),
            }),
            pending_writes: Vec::new(),
        };
        Ok((tuple, checkpoint_id))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig> {
        if config.thread_id.is_empty() {
            return Err(CheckpointError::Invalid("thread_id is required".to_string()));
        }

        // Strict validation happens before anything touches the database.
        serializer::encode_state(&checkpoint.channel_values)?;
        let state_blob = self.encode_blob(serializer::encode_json(&checkpoint)?)?;
        let metadata_blob = self.encode_blob(serializer::encode_json(&metadata)?)?;

        let mut tx = self.pool.begin().await?;

        let parent_id: Option<String> = match &config.checkpoint_id {
            Some(id) => Some(id.clone()),
            None => sqlx::query_scalar(
                "SELECT checkpoint_id FROM checkpoints
                 WHERE thread_id = ? AND namespace = ?
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )
            .bind(&config.thread_id)
            .bind(&config.namespace)
            .fetch_optional(&mut *tx)
            .await?,
        };

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO checkpoints
             (thread_id, namespace, checkpoint_id, parent_checkpoint_id,
              state_blob, metadata_blob, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.thread_id)
        .bind(&config.namespace)
        .bind(&checkpoint.id)
        .bind(&parent_id)
        .bind(&state_blob)
        .bind(&metadata_blob)
        .bind(checkpoint.ts.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            for (idx, (task_id, channel, value)) in writes.iter().enumerate() {
                let value_blob = self.encode_blob(serializer::encode_json(value)?)?;
                sqlx::query(
                    "INSERT OR IGNORE INTO checkpoint_writes
                     (thread_id, namespace, checkpoint_id, task_id, idx, channel, value_blob)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&config.thread_id)
                .bind(&config.namespace)
                .bind(&checkpoint.id)
                .bind(task_id)
                .bind(idx as i64)
                .bind(channel)
                .bind(&value_blob)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            namespace: config.namespace.clone(),
            checkpoint_id: Some(checkpoint.id),
        })
    }

    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let row = match &config.checkpoint_id {
            Some(id) => {
                sqlx::query(
                    "SELECT namespace, checkpoint_id, parent_checkpoint_id, state_blob, metadata_blob
                     FROM checkpoints
                     WHERE thread_id = ? AND namespace = ? AND checkpoint_id = ?",
                )
                .bind(&config.thread_id)
                .bind(&config.namespace)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT namespace, checkpoint_id, parent_checkpoint_id, state_blob, metadata_blob
                     FROM checkpoints
                     WHERE thread_id = ? AND namespace = ?
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                )
                .bind(&config.thread_id)
                .bind(&config.namespace)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let (mut tuple, checkpoint_id) = self.row_to_tuple(&config.thread_id, &row)?;
        tuple.pending_writes = self
            .load_writes(&config.thread_id, &config.namespace, &checkpoint_id)
            .await?;
        Ok(Some(tuple))
    }

    async fn list(&self, thread_id: &str, filter: &ListFilter) -> Result<Vec<CheckpointTuple>> {
        let mut sql = String::from(
            "SELECT namespace, checkpoint_id, parent_checkpoint_id, state_blob, metadata_blob
             FROM checkpoints WHERE thread_id = ?",
        );
        if filter.namespace.is_some() {
            sql.push_str(" AND namespace = ?");
        }
        if filter.before.is_some() {
            sql.push_str(
                " AND created_at < (SELECT created_at FROM checkpoints
                   WHERE thread_id = ? AND checkpoint_id = ?)",
            );
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut query = sqlx::query(&sql).bind(thread_id);
        if let Some(namespace) = &filter.namespace {
            query = query.bind(namespace);
        }
        if let Some(before) = &filter.before {
            query = query.bind(thread_id).bind(before);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut results = Vec::new();
        for row in &rows {
            let (tuple, _) = self.row_to_tuple(thread_id, row)?;
            let matches = filter.metadata.iter().all(|(key, value)| match key.as_str() {
                "source" => serde_json::json!(tuple.metadata.source.as_str()) == *value,
                "step" => serde_json::json!(tuple.metadata.step) == *value,
                other => tuple.metadata.extra.get(other) == Some(value),
            });
            if !matches {
                continue;
            }
            results.push(tuple);
            if let Some(limit) = filter.limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!(thread_id, "thread checkpoints deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::connect("sqlite::memory:").await.unwrap()
    }

    fn checkpoint_with(channel: &str, value: serde_json::Value) -> Checkpoint {
        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_values.insert(channel.to_string(), value);
        checkpoint
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = memory_store().await;
        let config = CheckpointConfig::new("t1");
        let checkpoint = checkpoint_with("thesis", json!("undervalued"));
        let id = checkpoint.id.clone();

        let writes = vec![(
            "task-1".to_string(),
            "thesis".to_string(),
            json!("undervalued"),
        )];
        store
            .put(&config, checkpoint, CheckpointMetadata::input(), writes)
            .await
            .unwrap();

        let tuple = store.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, id);
        assert_eq!(tuple.checkpoint.channel_values["thesis"], json!("undervalued"));
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].1, "thesis");
    }

    #[tokio::test]
    async fn test_put_idempotent_on_checkpoint_id() {
        let store = memory_store().await;
        let config = CheckpointConfig::new("t1");
        let checkpoint = checkpoint_with("price", json!(101.5));

        store
            .put(&config, checkpoint.clone(), CheckpointMetadata::input(), vec![])
            .await
            .unwrap();
        store
            .put(&config, checkpoint, CheckpointMetadata::input(), vec![])
            .await
            .unwrap();

        let filter = ListFilter::default();
        assert_eq!(store.list("t1", &filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_namespaces_distinct_keys() {
        let store = memory_store().await;
        let bull = CheckpointConfig::new("t1").with_namespace("debate:bull");
        let bear = CheckpointConfig::new("t1").with_namespace("debate:bear");

        store
            .put(
                &bull,
                checkpoint_with("case", json!("growth")),
                CheckpointMetadata::loop_step(0),
                vec![],
            )
            .await
            .unwrap();
        store
            .put(
                &bear,
                checkpoint_with("case", json!("leverage")),
                CheckpointMetadata::loop_step(0),
                vec![],
            )
            .await
            .unwrap();

        let bull_tuple = store.get_tuple(&bull).await.unwrap().unwrap();
        let bear_tuple = store.get_tuple(&bear).await.unwrap().unwrap();
        assert_eq!(bull_tuple.checkpoint.channel_values["case"], json!("growth"));
        assert_eq!(bear_tuple.checkpoint.channel_values["case"], json!("leverage"));
    }

    #[tokio::test]
    async fn test_pinned_parent_for_update_fork() {
        let store = memory_store().await;
        let config = CheckpointConfig::new("t1");
        let first = checkpoint_with("a", json!(1));
        let first_id = first.id.clone();
        store
            .put(&config, first, CheckpointMetadata::input(), vec![])
            .await
            .unwrap();
        store
            .put(
                &config,
                checkpoint_with("a", json!(2)),
                CheckpointMetadata::loop_step(0),
                vec![],
            )
            .await
            .unwrap();

        // Fork from the first checkpoint, not the latest.
        let pinned = config.clone().with_checkpoint_id(first_id.clone());
        let forked = checkpoint_with("a", json!(99));
        store
            .put(
                &pinned,
                forked.clone(),
                CheckpointMetadata::loop_step(1),
                vec![],
            )
            .await
            .unwrap();

        let tuple = store
            .get_tuple(&config.clone().with_checkpoint_id(forked.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tuple.parent_config.unwrap().checkpoint_id, Some(first_id));
    }

    #[tokio::test]
    async fn test_unrepresentable_state_fails_before_write() {
        let store = memory_store().await;
        let config = CheckpointConfig::new("t1");
        let bad = checkpoint_with("x", json!({ "__type": "pickle", "value": "x" }));
        assert!(store
            .put(&config, bad, CheckpointMetadata::input(), vec![])
            .await
            .is_err());
        assert!(store.get_tuple(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let cipher = BlobCipher::from_hex_keys(&hex::encode([7u8; 32]), &[]).unwrap();
        let store = memory_store().await.with_cipher(cipher);
        let config = CheckpointConfig::new("t1");
        let checkpoint = checkpoint_with("thesis", json!("moat"));

        store
            .put(&config, checkpoint, CheckpointMetadata::input(), vec![])
            .await
            .unwrap();
        let tuple = store.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.channel_values["thesis"], json!("moat"));

        // Raw row must not contain plaintext.
        let raw: String =
            sqlx::query_scalar("SELECT state_blob FROM checkpoints WHERE thread_id = 't1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert!(!raw.contains("moat"));
    }

    #[tokio::test]
    async fn test_list_before_cursor() {
        let store = memory_store().await;
        let config = CheckpointConfig::new("t1");
        let mut ids = Vec::new();
        for step in 0..3 {
            let mut checkpoint = checkpoint_with("s", json!(step));
            // Distinct timestamps so the cursor has a stable order to cut.
            checkpoint.ts = chrono::Utc::now() + chrono::Duration::seconds(step);
            ids.push(checkpoint.id.clone());
            store
                .put(&config, checkpoint, CheckpointMetadata::loop_step(step), vec![])
                .await
                .unwrap();
        }

        let filter = ListFilter {
            before: Some(ids[2].clone()),
            ..Default::default()
        };
        let page = store.list("t1", &filter).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].checkpoint.id, ids[1]);
    }
}
