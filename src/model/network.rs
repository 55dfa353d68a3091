//! Logical networks (`networks` bucket).
//!
//! v1 stored the subnet as CIDR text. v2 splits it into start address and
//! prefix length and records the MTU.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{decode, factory, invalid, to_payload, DomainEntity};
use crate::error::ModelError;
use crate::migrate::BucketDefinition;
use crate::store::{BucketSchema, Etag, IndexType, RawRecord, WriteOp};

pub const BUCKET: &str = "networks";
pub const VERSION: u32 = 2;
pub const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub uuid: String,
    pub name: String,
    pub vlan_id: u16,
    pub nic_tag: String,
    pub subnet_start: IpAddr,
    pub subnet_bits: u8,
    pub provision_start: IpAddr,
    pub provision_end: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    pub mtu: u32,
}

#[derive(Debug, Deserialize)]
struct NetworkV1 {
    uuid: String,
    name: String,
    vlan_id: u16,
    nic_tag: String,
    subnet: String,
    provision_start_ip: IpAddr,
    provision_end_ip: IpAddr,
    #[serde(default)]
    gateway: Option<IpAddr>,
}

enum Shape {
    V1(NetworkV1),
    V2(Network),
}

fn shape(record: &RawRecord) -> Result<Shape, ModelError> {
    match record.schema_marker() {
        None | Some(1) => decode(record).map(Shape::V1),
        Some(2) => decode(record).map(Shape::V2),
        Some(version) => Err(ModelError::UnknownVersion {
            key: record.key.clone(),
            version,
        }),
    }
}

fn from_v1(record: &RawRecord, v1: NetworkV1) -> Result<Network, ModelError> {
    let (start, bits) = v1
        .subnet
        .split_once('/')
        .ok_or_else(|| invalid(record, "subnet", format!("'{}' is not CIDR", v1.subnet)))?;
    let subnet_start: IpAddr = start
        .parse()
        .map_err(|e| invalid(record, "subnet", format!("'{start}': {e}")))?;
    let subnet_bits: u8 = bits
        .parse()
        .map_err(|e| invalid(record, "subnet", format!("'{bits}': {e}")))?;
    let max_bits = if subnet_start.is_ipv4() { 32 } else { 128 };
    if subnet_bits > max_bits {
        return Err(invalid(record, "subnet", format!("prefix /{subnet_bits} too long")));
    }

    Ok(Network {
        uuid: v1.uuid,
        name: v1.name,
        vlan_id: v1.vlan_id,
        nic_tag: v1.nic_tag,
        subnet_start,
        subnet_bits,
        provision_start: v1.provision_start_ip,
        provision_end: v1.provision_end_ip,
        gateway: v1.gateway,
        mtu: DEFAULT_MTU,
    })
}

/// Network entity bound to the record it was read from.
#[derive(Debug)]
pub struct NetworkRecord {
    pub key: String,
    pub etag: Option<Etag>,
    pub network: Network,
}

impl NetworkRecord {
    pub fn from_record(record: &RawRecord) -> Result<Self, ModelError> {
        let network = match shape(record)? {
            Shape::V1(v1) => from_v1(record, v1)?,
            Shape::V2(current) => current,
        };
        Ok(Self {
            key: record.key.clone(),
            etag: Some(record.etag.clone()),
            network,
        })
    }
}

impl DomainEntity for NetworkRecord {
    fn to_write_ops(&self) -> Result<Vec<WriteOp>, ModelError> {
        let mut op = WriteOp::put(BUCKET, self.key.clone(), to_payload(&self.network, VERSION)?);
        if let Some(etag) = &self.etag {
            op = op.conditional(etag.clone());
        }
        Ok(vec![op])
    }
}

pub fn schema() -> BucketSchema {
    BucketSchema::new()
        .with_index("uuid", IndexType::String)
        .with_index("name", IndexType::String)
        .with_index("vlan_id", IndexType::Number)
        .with_index("nic_tag", IndexType::String)
        .with_index("subnet_start", IndexType::Ip)
        .with_index("subnet_bits", IndexType::Number)
        .with_index("mtu", IndexType::Number)
}

pub fn definition() -> BucketDefinition {
    BucketDefinition::new(BUCKET, VERSION, schema(), factory(NetworkRecord::from_record))
}
