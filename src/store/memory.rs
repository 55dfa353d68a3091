//! In-process bucket store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;

use super::{
    check_filter_fields, compute_etag, BucketState, BucketStore, Etag, Filter, FindOptions,
    RawRecord, ReadMode, RecordStream, SchemaCache, WriteOp,
};
use crate::error::StoreError;

/// Capability version a fresh [`MemoryStore`] reports.
pub const MEMORY_CAPABILITY_VERSION: u32 = 2;

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Value,
    etag: Etag,
    index: BTreeMap<String, Value>,
    /// Bucket version the index values were derived under.
    indexed_version: u32,
}

#[derive(Debug, Clone)]
struct StoredBucket {
    state: BucketState,
    records: BTreeMap<String, StoredRecord>,
}

/// A bucket store held entirely in memory.
///
/// Writes are serialized behind one mutex, so a batch is atomic with respect
/// to every other call on the same store.
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
    cache: SchemaCache,
    capability_version: AtomicU32,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            cache: SchemaCache::new(),
            capability_version: AtomicU32::new(MEMORY_CAPABILITY_VERSION),
            writes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_capability_version(&self, version: u32) {
        self.capability_version.store(version, Ordering::Relaxed);
    }

    /// Number of mutating calls (bucket create/update and record writes)
    /// applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Read a record with its current etag.
    pub fn get(&self, bucket: &str, key: &str) -> Option<RawRecord> {
        let buckets = self.lock();
        let record = buckets.get(bucket)?.records.get(key)?;
        Some(RawRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: record.value.clone(),
            etag: record.etag.clone(),
        })
    }

    pub fn len(&self, bucket: &str) -> usize {
        self.lock().get(bucket).map(|b| b.records.len()).unwrap_or(0)
    }

    /// Derived index values currently stored for a record.
    pub fn index_of(&self, bucket: &str, key: &str) -> Option<BTreeMap<String, Value>> {
        let buckets = self.lock();
        Some(buckets.get(bucket)?.records.get(key)?.index.clone())
    }

    /// Seed records exactly as given, indexed under the bucket's current
    /// schema. Bypasses etag checks and the write counter.
    pub fn seed(&self, bucket: &str, records: impl IntoIterator<Item = (String, Value)>) -> Result<(), StoreError> {
        let mut buckets = self.lock();
        let stored = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        for (key, value) in records {
            let record = StoredRecord {
                etag: compute_etag(&value),
                index: stored.state.schema.derive_index(&value),
                indexed_version: stored.state.version,
                value,
            };
            stored.records.insert(key, record);
        }
        Ok(())
    }

    fn load_state(&self, name: &str) -> Result<BucketState, StoreError> {
        self.lock()
            .get(name)
            .map(|b| b.state.clone())
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))
    }

    fn find_sync(&self, name: &str, filter: &Filter, options: FindOptions) -> Result<Vec<RawRecord>, StoreError> {
        let view = self.cache.resolve(name, options.read, || self.load_state(name))?;
        check_filter_fields(name, &view.schema, filter)?;

        let buckets = self.lock();
        let stored = buckets
            .get(name)
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))?;
        Ok(stored
            .records
            .iter()
            .filter(|(_, r)| filter.matches(&r.index))
            .take(options.limit)
            .map(|(key, r)| RawRecord {
                bucket: name.to_string(),
                key: key.clone(),
                value: r.value.clone(),
                etag: r.etag.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn capability_version(&self) -> Result<u32, StoreError> {
        Ok(self.capability_version.load(Ordering::Relaxed))
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketState, StoreError> {
        self.load_state(name)
    }

    async fn create_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        let mut buckets = self.lock();
        if buckets.contains_key(name) {
            return Err(StoreError::BucketExists(name.to_string()));
        }
        buckets.insert(
            name.to_string(),
            StoredBucket {
                state: state.clone(),
                records: BTreeMap::new(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn update_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        let mut buckets = self.lock();
        let stored = buckets
            .get_mut(name)
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))?;
        stored.state = state.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reindex(&self, name: &str, batch_size: u32, read: ReadMode) -> Result<u32, StoreError> {
        let view = self.cache.resolve(name, read, || self.load_state(name))?;
        let mut buckets = self.lock();
        let stored = buckets
            .get_mut(name)
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))?;

        let mut processed = 0u32;
        for record in stored.records.values_mut() {
            if processed >= batch_size {
                break;
            }
            if record.indexed_version < view.version {
                record.index = view.schema.derive_index(&record.value);
                record.indexed_version = view.version;
                processed += 1;
            }
        }
        Ok(processed)
    }

    fn find<'a>(&'a self, name: &'a str, filter: &'a Filter, options: FindOptions) -> RecordStream<'a> {
        match self.find_sync(name, filter, options) {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }

    async fn get_record(&self, bucket: &str, key: &str) -> Result<Option<RawRecord>, StoreError> {
        if !self.lock().contains_key(bucket) {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }
        Ok(self.get(bucket, key))
    }

    async fn batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut buckets = self.lock();

        // Validate every precondition before touching anything.
        for op in ops {
            let stored = buckets
                .get(&op.bucket)
                .ok_or_else(|| StoreError::BucketNotFound(op.bucket.clone()))?;
            op.check(stored.records.get(&op.key).map(|r| r.etag.clone()))?;
        }

        for op in ops {
            if let Some(stored) = buckets.get_mut(&op.bucket) {
                let record = StoredRecord {
                    etag: compute_etag(&op.value),
                    index: stored.state.schema.derive_index(&op.value),
                    indexed_version: stored.state.version,
                    value: op.value.clone(),
                };
                stored.records.insert(op.key.clone(), record);
            }
        }
        self.writes.fetch_add(ops.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
