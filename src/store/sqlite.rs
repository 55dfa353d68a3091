//! Bucket store on a local SQLite database.
//!
//! Records keep their payload, etag and derived index values as JSON text.
//! Filters are evaluated over the decoded index values after a per-bucket
//! scan, which is adequate for the record counts a control plane holds.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{
    check_filter_fields, compute_etag, BucketSchema, BucketState, BucketStore, Filter, FindOptions,
    RawRecord, ReadMode, RecordStream, SchemaCache, WriteOp,
};
use crate::error::StoreError;

pub type StorePool = Pool<SqliteConnectionManager>;

/// Capability version seeded into a new database.
pub const SQLITE_CAPABILITY_VERSION: u32 = 2;

const CAPABILITY_KEY: &str = "capability_version";

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name        TEXT PRIMARY KEY,
    schema      TEXT NOT NULL,
    version     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    bucket           TEXT NOT NULL REFERENCES buckets(name) ON DELETE CASCADE,
    key              TEXT NOT NULL,
    value            TEXT NOT NULL,
    etag             TEXT NOT NULL,
    indexes          TEXT NOT NULL,
    indexed_version  INTEGER NOT NULL,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (bucket, key)
);
CREATE INDEX IF NOT EXISTS idx_records_reindex ON records(bucket, indexed_version);

CREATE TABLE IF NOT EXISTS store_settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    pool: StorePool,
    cache: SchemaCache,
}

impl SqliteStore {
    /// Open (creating if needed) the store database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("create {}: {e}", parent.display())))?;
        }
        tracing::info!(path = %path.display(), "Opening bucket store");

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(SqlitePragmaCustomizer))
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: StorePool) -> Result<Self, StoreError> {
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT OR IGNORE INTO store_settings (key, value) VALUES (?1, ?2)",
                params![CAPABILITY_KEY, SQLITE_CAPABILITY_VERSION.to_string()],
            )?;
        }
        tracing::debug!("Bucket store tables ready");
        Ok(Self {
            pool,
            cache: SchemaCache::new(),
        })
    }

    pub fn set_capability_version(&self, version: u32) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO store_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CAPABILITY_KEY, version.to_string()],
        )?;
        Ok(())
    }

    /// Run `f` on a pooled connection off the async scheduler.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }

    /// Bucket state for a call, honouring the read mode.
    async fn view(&self, name: &str, read: ReadMode) -> Result<BucketState, StoreError> {
        if read == ReadMode::Cached {
            if let Some(state) = self.cache.get(name) {
                return Ok(state);
            }
        }
        let state = self.get_bucket(name).await?;
        self.cache.put(name, state.clone());
        Ok(state)
    }
}

fn load_state(conn: &Connection, name: &str) -> Result<BucketState, StoreError> {
    let row: Option<(String, u32)> = conn
        .query_row(
            "SELECT schema, version FROM buckets WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (schema, version) = row.ok_or_else(|| StoreError::BucketNotFound(name.to_string()))?;
    Ok(BucketState {
        schema: serde_json::from_str::<BucketSchema>(&schema)?,
        version,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
impl BucketStore for SqliteStore {
    async fn capability_version(&self) -> Result<u32, StoreError> {
        self.blocking(|conn| {
            let raw: String = conn.query_row(
                "SELECT value FROM store_settings WHERE key = ?1",
                params![CAPABILITY_KEY],
                |row| row.get(0),
            )?;
            raw.parse::<u32>()
                .map_err(|e| StoreError::Internal(format!("bad capability version '{raw}': {e}")))
        })
        .await
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketState, StoreError> {
        let name = name.to_string();
        self.blocking(move |conn| load_state(conn, &name)).await
    }

    async fn create_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        let name = name.to_string();
        let schema = serde_json::to_string(&state.schema)?;
        let version = state.version;
        self.blocking(move |conn| {
            let ts = now();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO buckets (name, schema, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, schema, version, ts],
            )?;
            if inserted == 0 {
                return Err(StoreError::BucketExists(name));
            }
            Ok(())
        })
        .await
    }

    async fn update_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        let name = name.to_string();
        let schema = serde_json::to_string(&state.schema)?;
        let version = state.version;
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE buckets SET schema = ?2, version = ?3, updated_at = ?4 WHERE name = ?1",
                params![name, schema, version, now()],
            )?;
            if updated == 0 {
                return Err(StoreError::BucketNotFound(name));
            }
            Ok(())
        })
        .await
    }

    async fn reindex(&self, name: &str, batch_size: u32, read: ReadMode) -> Result<u32, StoreError> {
        let view = self.view(name, read).await?;
        let name = name.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let stale: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT key, value FROM records
                     WHERE bucket = ?1 AND indexed_version < ?2
                     ORDER BY key LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![name, view.version, batch_size], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };
            for (key, raw) in &stale {
                let value: Value = serde_json::from_str(raw)?;
                let index = serde_json::to_string(&view.schema.derive_index(&value))?;
                tx.execute(
                    "UPDATE records SET indexes = ?3, indexed_version = ?4
                     WHERE bucket = ?1 AND key = ?2",
                    params![name, key, index, view.version],
                )?;
            }
            tx.commit()?;
            Ok(stale.len() as u32)
        })
        .await
    }

    fn find<'a>(&'a self, name: &'a str, filter: &'a Filter, options: FindOptions) -> RecordStream<'a> {
        let scan = async move {
            let view = self.view(name, options.read).await?;
            check_filter_fields(name, &view.schema, filter)?;
            let bucket = name.to_string();
            let filter = filter.clone();
            self.blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value, etag, indexes FROM records WHERE bucket = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![bucket], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (key, value, etag, indexes) = row?;
                    let index: BTreeMap<String, Value> = serde_json::from_str(&indexes)?;
                    if !filter.matches(&index) {
                        continue;
                    }
                    out.push(RawRecord {
                        bucket: bucket.clone(),
                        key,
                        value: serde_json::from_str(&value)?,
                        etag,
                    });
                    if out.len() >= options.limit {
                        break;
                    }
                }
                Ok(out)
            })
            .await
        };
        stream::once(scan)
            .flat_map(|res| match res {
                Ok(records) => stream::iter(records.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(err) => stream::iter(vec![Err(err)]),
            })
            .boxed()
    }

    async fn get_record(&self, bucket: &str, key: &str) -> Result<Option<RawRecord>, StoreError> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.blocking(move |conn| {
            load_state(conn, &bucket)?;
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT value, etag FROM records WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((value, etag)) = row else {
                return Ok(None);
            };
            Ok(Some(RawRecord {
                value: serde_json::from_str(&value)?,
                bucket,
                key,
                etag,
            }))
        })
        .await
    }

    async fn batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let ops = ops.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let ts = now();
            let mut states: HashMap<String, BucketState> = HashMap::new();
            for op in &ops {
                if !states.contains_key(&op.bucket) {
                    states.insert(op.bucket.clone(), load_state(&tx, &op.bucket)?);
                }
                let actual: Option<String> = tx
                    .query_row(
                        "SELECT etag FROM records WHERE bucket = ?1 AND key = ?2",
                        params![op.bucket, op.key],
                        |row| row.get(0),
                    )
                    .optional()?;
                // Dropping the transaction releases it without writing.
                op.check(actual)?;
            }
            for op in &ops {
                let Some(state) = states.get(&op.bucket) else {
                    continue;
                };
                let index = serde_json::to_string(&state.schema.derive_index(&op.value))?;
                tx.execute(
                    "INSERT INTO records (bucket, key, value, etag, indexes, indexed_version, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(bucket, key) DO UPDATE SET
                        value = excluded.value,
                        etag = excluded.etag,
                        indexes = excluded.indexes,
                        indexed_version = excluded.indexed_version,
                        updated_at = excluded.updated_at",
                    params![
                        op.bucket,
                        op.key,
                        op.value.to_string(),
                        compute_etag(&op.value),
                        index,
                        state.version,
                        ts,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// Store on a file inside a fresh temp directory; r2d2 cannot share an
/// in-memory database. The directory, WAL files included, is removed when the
/// returned guard drops.
#[cfg(test)]
pub fn open_test_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteStore::open(&dir.path().join("store.db")).expect("open test store");
    (dir, store)
}
