//! Bucket store interface consumed by the migration engine.
//!
//! The store is schema-on-write: every bucket carries a schema naming its
//! indexed fields, and the store derives index values from the record
//! payload when the record is written (or reindexed). Queries only ever
//! see derived index values.

pub mod filter;
pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;
pub use filter::Filter;

/// Payload field every record uses to carry the schema version that produced it.
pub const SCHEMA_MARKER_FIELD: &str = "v";

/// Page size used by [`FindOptions::default`].
pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub type Etag = String;

/// Lazy, finite stream of records returned by [`BucketStore::find`].
pub type RecordStream<'a> = BoxStream<'a, Result<RawRecord, StoreError>>;

// =============================================================================
// Schema
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    String,
    Number,
    Boolean,
    Ip,
}

/// Declares which payload fields are indexed and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSchema {
    pub index: BTreeMap<String, IndexType>,
}

impl BucketSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut self, field: impl Into<String>, kind: IndexType) -> Self {
        self.index.insert(field.into(), kind);
        self
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.index.contains_key(field)
    }

    /// Derive the index values for `value` under this schema.
    ///
    /// Fields that are missing or whose type does not match the declared
    /// index type produce no index entry.
    pub fn derive_index(&self, value: &Value) -> BTreeMap<String, Value> {
        self.index
            .iter()
            .filter_map(|(field, kind)| {
                let raw = value.get(field)?;
                index_value(*kind, raw).map(|v| (field.clone(), v))
            })
            .collect()
    }
}

fn index_value(kind: IndexType, raw: &Value) -> Option<Value> {
    match (kind, raw) {
        (IndexType::String, Value::String(_)) => Some(raw.clone()),
        (IndexType::Number, Value::Number(_)) => Some(raw.clone()),
        (IndexType::Boolean, Value::Bool(_)) => Some(raw.clone()),
        (IndexType::Ip, Value::String(s)) => s
            .parse::<IpAddr>()
            .ok()
            .map(|ip| Value::String(ip.to_string())),
        // Arrays index every element that matches the declared type.
        (_, Value::Array(items)) => {
            let matched: Vec<Value> = items.iter().filter_map(|i| index_value(kind, i)).collect();
            if matched.is_empty() {
                None
            } else {
                Some(Value::Array(matched))
            }
        }
        _ => None,
    }
}

/// Out-of-band bucket metadata persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub schema: BucketSchema,
    pub version: u32,
}

// =============================================================================
// Records and writes
// =============================================================================

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub etag: Etag,
}

impl RawRecord {
    /// Schema version recorded in the payload, if any.
    pub fn schema_marker(&self) -> Option<u32> {
        schema_marker(&self.value)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }
}

/// Read the schema marker out of a payload.
pub fn schema_marker(value: &Value) -> Option<u32> {
    value
        .get(SCHEMA_MARKER_FIELD)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// What a write expects to find under its key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    Always,
    /// The key must not hold a record yet.
    Absent,
    /// The stored etag must equal this one; a missing record never matches.
    Etag(Etag),
}

impl Precondition {
    /// Pin to a record's state as last observed: its etag, or absent.
    pub fn observed(etag: Option<Etag>) -> Self {
        match etag {
            Some(etag) => Precondition::Etag(etag),
            None => Precondition::Absent,
        }
    }

    pub fn holds(&self, actual: Option<&Etag>) -> bool {
        match self {
            Precondition::Always => true,
            Precondition::Absent => actual.is_none(),
            Precondition::Etag(expected) => actual == Some(expected),
        }
    }
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precondition::Always => f.write_str("*"),
            Precondition::Absent => f.write_str("<absent>"),
            Precondition::Etag(etag) => f.write_str(etag),
        }
    }
}

/// One write inside an atomic [`BucketStore::batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub precondition: Precondition,
}

impl WriteOp {
    /// Unconditional write.
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value,
            precondition: Precondition::Always,
        }
    }

    pub fn conditional(mut self, etag: impl Into<Etag>) -> Self {
        self.precondition = Precondition::Etag(etag.into());
        self
    }

    pub fn create_only(mut self) -> Self {
        self.precondition = Precondition::Absent;
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.precondition != Precondition::Always
    }

    /// Fail with [`StoreError::EtagConflict`] unless the precondition holds
    /// against the etag currently stored under the key.
    pub(crate) fn check(&self, actual: Option<Etag>) -> Result<(), StoreError> {
        if self.precondition.holds(actual.as_ref()) {
            return Ok(());
        }
        Err(StoreError::EtagConflict {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            expected: self.precondition.to_string(),
            actual,
        })
    }
}

/// Content etag: first 16 hex digits of SHA-256 over the serialized payload.
pub fn compute_etag(value: &Value) -> Etag {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

// =============================================================================
// Read options
// =============================================================================

/// Whether a call may use the handle's cached bucket schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    #[default]
    Cached,
    /// Re-read bucket metadata from the store and refresh the cache.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    pub read: ReadMode,
    pub limit: usize,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            read: ReadMode::Cached,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl FindOptions {
    pub fn fresh() -> Self {
        Self {
            read: ReadMode::Fresh,
            ..Self::default()
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Capability surface the migration engine needs from a backing store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Capability level reported by the store.
    async fn capability_version(&self) -> Result<u32, StoreError>;

    /// Fails with [`StoreError::BucketNotFound`] when the bucket is absent.
    async fn get_bucket(&self, name: &str) -> Result<BucketState, StoreError>;
    async fn create_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError>;
    async fn update_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError>;

    /// Re-derive index values for up to `batch_size` records whose indexes
    /// predate the bucket's schema version. Returns how many were processed.
    async fn reindex(&self, name: &str, batch_size: u32, read: ReadMode) -> Result<u32, StoreError>;

    /// Records matching `filter`, at most `options.limit` of them. A fresh
    /// call re-scans from the start.
    fn find<'a>(&'a self, name: &'a str, filter: &'a Filter, options: FindOptions) -> RecordStream<'a>;

    /// Read one record with its current etag; `None` when the key is unset.
    async fn get_record(&self, bucket: &str, key: &str) -> Result<Option<RawRecord>, StoreError>;

    /// Apply every write or none of them. Every precondition is checked
    /// against the state before the batch, so two writes to one key in the
    /// same batch see the same stored record.
    async fn batch(&self, ops: &[WriteOp]) -> Result<(), StoreError>;
}

// =============================================================================
// Schema cache
// =============================================================================

/// Per-handle cache of bucket metadata, mirroring what a store client keeps
/// between calls.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: Mutex<HashMap<String, BucketState>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Option<BucketState> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(bucket).cloned()
    }

    pub fn put(&self, bucket: &str, state: BucketState) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(bucket.to_string(), state);
    }

    /// Resolve the bucket state a call should observe: the cached copy for
    /// [`ReadMode::Cached`] when one exists, otherwise `load()` (which then
    /// refreshes the cache).
    pub fn resolve<F>(&self, bucket: &str, read: ReadMode, load: F) -> Result<BucketState, StoreError>
    where
        F: FnOnce() -> Result<BucketState, StoreError>,
    {
        if read == ReadMode::Cached {
            if let Some(state) = self.get(bucket) {
                return Ok(state);
            }
        }
        let state = load()?;
        self.put(bucket, state.clone());
        Ok(state)
    }
}

/// Reject filters on fields the schema does not index.
pub(crate) fn check_filter_fields(bucket: &str, schema: &BucketSchema, filter: &Filter) -> Result<(), StoreError> {
    for field in filter.fields() {
        if !schema.is_indexed(field) {
            return Err(StoreError::InvalidQuery(format!(
                "{bucket}: field '{field}' is not indexed"
            )));
        }
    }
    Ok(())
}
