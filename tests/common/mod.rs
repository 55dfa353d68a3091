//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use bucket_migrator::store::memory::MemoryStore;
use bucket_migrator::store::{BucketSchema, BucketState, FindOptions, ReadMode, RecordStream};
use bucket_migrator::{BucketStore, Filter, RawRecord, StoreError, WriteOp};

type BatchHook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Wraps a [`MemoryStore`], failing chosen calls and recording every call
/// made through it.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    fail_create: AtomicU32,
    fail_get: AtomicU32,
    fail_capability: AtomicU32,
    fail_update: AtomicU32,
    fail_batch: AtomicU32,
    fail_find: AtomicU32,
    conflicts: AtomicU32,
    before_batch: Mutex<Option<BatchHook>>,
    calls: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_create: AtomicU32::new(0),
            fail_get: AtomicU32::new(0),
            fail_capability: AtomicU32::new(0),
            fail_update: AtomicU32::new(0),
            fail_batch: AtomicU32::new(0),
            fail_find: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
            before_batch: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` `create_bucket` calls fail as unavailable.
    pub fn fail_creates(&self, n: u32) {
        self.fail_create.store(n, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, n: u32) {
        self.fail_get.store(n, Ordering::SeqCst);
    }

    pub fn fail_capability_checks(&self, n: u32) {
        self.fail_capability.store(n, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, n: u32) {
        self.fail_update.store(n, Ordering::SeqCst);
    }

    pub fn fail_batches(&self, n: u32) {
        self.fail_batch.store(n, Ordering::SeqCst);
    }

    /// The next `n` `find` streams yield a single unavailable error.
    pub fn fail_finds(&self, n: u32) {
        self.fail_find.store(n, Ordering::SeqCst);
    }

    /// Run `hook` against the backing store right before the next batch is
    /// applied, standing in for a concurrent writer.
    pub fn on_next_batch(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.before_batch.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of `op` against `bucket`.
    pub fn count(&self, op: &str, bucket: &str) -> usize {
        let wanted = format!("{op}:{bucket}");
        self.calls().iter().filter(|c| **c == wanted).count()
    }

    pub fn conflicts(&self) -> u32 {
        self.conflicts.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str, bucket: &str) {
        self.calls.lock().unwrap().push(format!("{op}:{bucket}"));
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BucketStore for FaultyStore {
    async fn capability_version(&self) -> Result<u32, StoreError> {
        self.record("capability_version", "-");
        if Self::take_failure(&self.fail_capability) {
            return Err(StoreError::Unavailable("injected capability failure".into()));
        }
        self.inner.capability_version().await
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketState, StoreError> {
        self.record("get_bucket", name);
        if Self::take_failure(&self.fail_get) {
            return Err(StoreError::Unavailable("injected get failure".into()));
        }
        self.inner.get_bucket(name).await
    }

    async fn create_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        self.record("create_bucket", name);
        if Self::take_failure(&self.fail_create) {
            return Err(StoreError::Unavailable("injected create failure".into()));
        }
        self.inner.create_bucket(name, state).await
    }

    async fn update_bucket(&self, name: &str, state: &BucketState) -> Result<(), StoreError> {
        self.record("update_bucket", name);
        if Self::take_failure(&self.fail_update) {
            return Err(StoreError::Unavailable("injected update failure".into()));
        }
        self.inner.update_bucket(name, state).await
    }

    async fn reindex(&self, name: &str, batch_size: u32, read: ReadMode) -> Result<u32, StoreError> {
        self.record("reindex", name);
        self.inner.reindex(name, batch_size, read).await
    }

    fn find<'a>(&'a self, name: &'a str, filter: &'a Filter, options: FindOptions) -> RecordStream<'a> {
        self.record("find", name);
        if Self::take_failure(&self.fail_find) {
            return stream::once(async { Err(StoreError::Unavailable("injected find failure".into())) }).boxed();
        }
        self.inner.find(name, filter, options)
    }

    async fn get_record(&self, bucket: &str, key: &str) -> Result<Option<RawRecord>, StoreError> {
        self.record("get_record", bucket);
        self.inner.get_record(bucket, key).await
    }

    async fn batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let bucket = ops.first().map(|op| op.bucket.as_str()).unwrap_or("-");
        self.record("batch", bucket);
        if Self::take_failure(&self.fail_batch) {
            return Err(StoreError::Unavailable("injected batch failure".into()));
        }
        let hook = self.before_batch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        let result = self.inner.batch(ops).await;
        if matches!(result, Err(StoreError::EtagConflict { .. })) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Create `name` at `version` with `schema` and fill it with `records`.
pub async fn seed_bucket(
    store: &MemoryStore,
    name: &str,
    version: u32,
    schema: BucketSchema,
    records: impl IntoIterator<Item = (String, Value)>,
) {
    store
        .create_bucket(name, &BucketState { schema, version })
        .await
        .unwrap();
    store.seed(name, records).unwrap();
}

/// A network record as the v1 service wrote it.
pub fn legacy_network(i: u32) -> (String, Value) {
    let uuid = format!("net-{i:02}");
    let value = json!({
        "uuid": uuid,
        "name": format!("admin{i}"),
        "vlan_id": 100 + i,
        "nic_tag": "external",
        "subnet": format!("10.{i}.0.0/24"),
        "provision_start_ip": format!("10.{i}.0.10"),
        "provision_end_ip": format!("10.{i}.0.250"),
        "gateway": format!("10.{i}.0.1"),
    });
    (uuid, value)
}

/// A v1 NIC: numeric MAC, numeric IPv4 and a string `primary`.
pub fn legacy_nic(i: u32, with_ip: bool) -> (String, Value) {
    let mac = 0x90b8_d0c0_0000_u64 + u64::from(i);
    let mut value = json!({
        "mac": mac,
        "belongs_to_uuid": format!("vm-{i}"),
        "belongs_to_type": "zone",
        "owner_uuid": "owner-1",
        "primary": "true",
    });
    if with_ip {
        // 10.0.0.<i>
        value["ip"] = json!(0x0a00_0000_u32 + i);
        value["network_uuid"] = json!("net-00");
    }
    (mac.to_string(), value)
}
