//! SQLite-backed structured store.

use super::{BackendKind, StorageAdapter};
use crate::{error::Result, record::record_id, Collection, Error};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Structured store with one table per [`Collection`], keyed by `id`.
///
/// Construction runs the schema setup, so an adapter value only exists once
/// the database is ready for reads and writes.
#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Open or create the database at `url` (e.g. `sqlite:trace.db`).
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // A single long-lived connection: required for `sqlite::memory:` and
        // enough for one client.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;
        tracing::debug!(url = %url, version = SCHEMA_VERSION, "structured store ready");

        Ok(Self { pool })
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await?;

        if version > SCHEMA_VERSION {
            return Err(Error::Storage(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        if version < SCHEMA_VERSION {
            for collection in Collection::ALL {
                let sql = format!(
                    "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY NOT NULL, body TEXT NOT NULL)",
                    collection
                );
                sqlx::query(&sql).execute(pool).await?;
            }
            let sql = format!("PRAGMA user_version = {}", SCHEMA_VERSION);
            sqlx::query(&sql).execute(pool).await?;
        }

        Ok(())
    }

    /// Close the underlying connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_body(collection: Collection, id: &str, body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| Error::CorruptRecord {
        collection: collection.to_string(),
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    async fn save(&self, collection: Collection, record: Value) -> Result<Value> {
        let id = record_id(&record)?.to_string();
        let body = serde_json::to_string(&record)?;

        let sql = format!(
            "INSERT INTO {} (id, body) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            collection
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(&body)
            .execute(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let sql = format!("SELECT body FROM {} WHERE id = ?1", collection);
        let body: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        body.map(|b| parse_body(collection, id, &b)).transpose()
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let sql = format!("SELECT id, body FROM {} ORDER BY id", collection);
        let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|(id, body)| parse_body(collection, id, body))
            .collect()
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", collection);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
