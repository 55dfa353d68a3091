//! Domain entities rebuilt from stored records.
//!
//! Each bucket's model module owns a version-dispatch table: the record's
//! schema marker picks one legacy shape, and one pure conversion per shape
//! produces the single current representation. Absent markers fall back
//! to the oldest shape the module knows.

pub mod network;
pub mod nic;
pub mod nic_ip;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ModelError;
use crate::migrate::BucketDefinition;
use crate::store::{RawRecord, WriteOp};

/// A current-version entity able to serialize itself back to the store.
pub trait DomainEntity: Send {
    /// Store writes for this entity; the first targets the entity's own
    /// record and any others are denormalized copies.
    fn to_write_ops(&self) -> Result<Vec<WriteOp>, ModelError>;
}

/// Builds the current domain entity from whatever fields a record holds.
pub type ModelFactory =
    Arc<dyn Fn(&RawRecord) -> Result<Box<dyn DomainEntity>, ModelError> + Send + Sync>;

/// Wrap a plain constructor as a [`ModelFactory`].
pub fn factory<E, F>(build: F) -> ModelFactory
where
    E: DomainEntity + 'static,
    F: Fn(&RawRecord) -> Result<E, ModelError> + Send + Sync + 'static,
{
    Arc::new(move |record| build(record).map(|e| Box::new(e) as Box<dyn DomainEntity>))
}

/// Every bucket the service owns, in the order they must be migrated.
///
/// `nic_ips` precedes `nics` because migrated NICs write into it.
pub fn bucket_definitions() -> Vec<BucketDefinition> {
    vec![
        network::definition(),
        nic_ip::definition(),
        nic::definition(),
    ]
}

/// Deserialize a record's payload into one legacy shape.
pub(crate) fn decode<T: DeserializeOwned>(record: &RawRecord) -> Result<T, ModelError> {
    serde_json::from_value(record.value.clone()).map_err(|e| ModelError::InvalidField {
        key: record.key.clone(),
        field: "value",
        reason: e.to_string(),
    })
}

pub(crate) fn invalid(record: &RawRecord, field: &'static str, reason: impl Into<String>) -> ModelError {
    ModelError::InvalidField {
        key: record.key.clone(),
        field,
        reason: reason.into(),
    }
}

/// Serialize an entity and stamp the schema marker on the payload.
pub(crate) fn to_payload<T: serde::Serialize>(entity: &T, version: u32) -> Result<Value, ModelError> {
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(map) = &mut value {
        map.insert(crate::store::SCHEMA_MARKER_FIELD.to_string(), Value::from(version));
    }
    Ok(value)
}
