//! Network interfaces (`nics` bucket).
//!
//! | marker | mac     | ip           | primary          |
//! |--------|---------|--------------|------------------|
//! | none/1 | integer | integer      | "true"/"false"   |
//! | 2      | integer | dotted text  | bool             |
//! | 3      | a:b:..  | dotted text  | bool, + `state`  |
//!
//! A NIC holding an address fans out to a `nic_ips` record. That write
//! leaves the model unconditional; the record migrator pins it to whatever
//! `nic_ips` record it observes before the batch.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::nic_ip::{self, NicIp};
use super::{decode, factory, invalid, to_payload, DomainEntity};
use crate::error::ModelError;
use crate::migrate::BucketDefinition;
use crate::store::{BucketSchema, Etag, IndexType, RawRecord, WriteOp};

pub const BUCKET: &str = "nics";
pub const VERSION: u32 = 3;
/// Lowest store capability the v3 layout is written against. The migrator
/// waits for it before running any step.
pub const MIN_STORE_VERSION: u32 = 2;
pub const DEFAULT_STATE: &str = "running";

const MAX_MAC: u64 = 0xffff_ffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<String>,
    pub belongs_to_uuid: String,
    pub belongs_to_type: String,
    pub owner_uuid: String,
    pub primary: bool,
    pub state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nic_tags_provided: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NicV1 {
    mac: u64,
    #[serde(default)]
    ip: Option<u32>,
    #[serde(default)]
    network_uuid: Option<String>,
    belongs_to_uuid: String,
    belongs_to_type: String,
    owner_uuid: String,
    #[serde(default)]
    primary: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NicV2 {
    mac: u64,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    network_uuid: Option<String>,
    belongs_to_uuid: String,
    belongs_to_type: String,
    owner_uuid: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    nic_tags_provided: Vec<String>,
}

enum Shape {
    V1(NicV1),
    V2(NicV2),
    V3(Nic),
}

fn shape(record: &RawRecord) -> Result<Shape, ModelError> {
    match record.schema_marker() {
        None | Some(1) => decode(record).map(Shape::V1),
        Some(2) => decode(record).map(Shape::V2),
        Some(3) => decode(record).map(Shape::V3),
        Some(version) => Err(ModelError::UnknownVersion {
            key: record.key.clone(),
            version,
        }),
    }
}

/// Render a 48-bit MAC address as colon-separated hex.
pub fn format_mac(record: &RawRecord, mac: u64) -> Result<String, ModelError> {
    if mac > MAX_MAC {
        return Err(invalid(record, "mac", format!("{mac} exceeds 48 bits")));
    }
    let octets = mac.to_be_bytes();
    Ok(octets[2..]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn legacy_primary(record: &RawRecord, raw: Option<Value>) -> Result<bool, ModelError> {
    match raw {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::String(s)) => match s.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(invalid(record, "primary", format!("'{other}' is not a boolean"))),
        },
        Some(other) => Err(invalid(record, "primary", format!("unexpected {other}"))),
    }
}

fn from_v1(record: &RawRecord, v1: NicV1) -> Result<Nic, ModelError> {
    Ok(Nic {
        mac: format_mac(record, v1.mac)?,
        ip: v1.ip.map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        network_uuid: v1.network_uuid,
        belongs_to_uuid: v1.belongs_to_uuid,
        belongs_to_type: v1.belongs_to_type,
        owner_uuid: v1.owner_uuid,
        primary: legacy_primary(record, v1.primary)?,
        state: DEFAULT_STATE.to_string(),
        nic_tags_provided: Vec::new(),
    })
}

fn from_v2(record: &RawRecord, v2: NicV2) -> Result<Nic, ModelError> {
    Ok(Nic {
        mac: format_mac(record, v2.mac)?,
        ip: v2.ip,
        network_uuid: v2.network_uuid,
        belongs_to_uuid: v2.belongs_to_uuid,
        belongs_to_type: v2.belongs_to_type,
        owner_uuid: v2.owner_uuid,
        primary: v2.primary,
        state: DEFAULT_STATE.to_string(),
        nic_tags_provided: v2.nic_tags_provided,
    })
}

#[derive(Debug)]
pub struct NicRecord {
    pub key: String,
    pub etag: Option<Etag>,
    pub nic: Nic,
}

impl NicRecord {
    pub fn from_record(record: &RawRecord) -> Result<Self, ModelError> {
        let nic = match shape(record)? {
            Shape::V1(v1) => from_v1(record, v1)?,
            Shape::V2(v2) => from_v2(record, v2)?,
            Shape::V3(current) => current,
        };
        Ok(Self {
            key: record.key.clone(),
            etag: Some(record.etag.clone()),
            nic,
        })
    }

    /// The denormalized address record, when the NIC holds one.
    pub fn nic_ip(&self) -> Option<NicIp> {
        let ip = self.nic.ip?;
        let network_uuid = self.nic.network_uuid.clone()?;
        Some(NicIp {
            ip,
            network_uuid,
            belongs_to_uuid: self.nic.belongs_to_uuid.clone(),
            mac: self.nic.mac.clone(),
        })
    }
}

impl DomainEntity for NicRecord {
    fn to_write_ops(&self) -> Result<Vec<WriteOp>, ModelError> {
        let mut primary = WriteOp::put(BUCKET, self.key.clone(), to_payload(&self.nic, VERSION)?);
        if let Some(etag) = &self.etag {
            primary = primary.conditional(etag.clone());
        }

        let mut ops = vec![primary];
        if let Some(addr) = self.nic_ip() {
            ops.push(WriteOp::put(
                nic_ip::BUCKET,
                addr.key(),
                to_payload(&addr, nic_ip::VERSION)?,
            ));
        }
        Ok(ops)
    }
}

pub fn schema() -> BucketSchema {
    BucketSchema::new()
        .with_index("mac", IndexType::String)
        .with_index("ip", IndexType::Ip)
        .with_index("network_uuid", IndexType::String)
        .with_index("belongs_to_uuid", IndexType::String)
        .with_index("belongs_to_type", IndexType::String)
        .with_index("owner_uuid", IndexType::String)
        .with_index("primary", IndexType::Boolean)
        .with_index("state", IndexType::String)
        .with_index("nic_tags_provided", IndexType::String)
}

pub fn definition() -> BucketDefinition {
    BucketDefinition::new(BUCKET, VERSION, schema(), factory(NicRecord::from_record))
        .with_min_store_version(MIN_STORE_VERSION)
}
