//! IP-to-NIC lookup records (`nic_ips` bucket), written alongside NICs.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{decode, factory, to_payload, DomainEntity};
use crate::error::ModelError;
use crate::migrate::BucketDefinition;
use crate::store::{BucketSchema, Etag, IndexType, RawRecord, WriteOp};

pub const BUCKET: &str = "nic_ips";
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicIp {
    pub ip: IpAddr,
    pub network_uuid: String,
    pub belongs_to_uuid: String,
    pub mac: String,
}

impl NicIp {
    /// Record key: one address per network.
    pub fn key(&self) -> String {
        format!("{}/{}", self.network_uuid, self.ip)
    }
}

#[derive(Debug)]
pub struct NicIpRecord {
    pub key: String,
    pub etag: Option<Etag>,
    pub ip: NicIp,
}

impl NicIpRecord {
    pub fn from_record(record: &RawRecord) -> Result<Self, ModelError> {
        match record.schema_marker() {
            None | Some(1) => Ok(Self {
                key: record.key.clone(),
                etag: Some(record.etag.clone()),
                ip: decode(record)?,
            }),
            Some(version) => Err(ModelError::UnknownVersion {
                key: record.key.clone(),
                version,
            }),
        }
    }
}

impl DomainEntity for NicIpRecord {
    fn to_write_ops(&self) -> Result<Vec<WriteOp>, ModelError> {
        let mut op = WriteOp::put(BUCKET, self.key.clone(), to_payload(&self.ip, VERSION)?);
        if let Some(etag) = &self.etag {
            op = op.conditional(etag.clone());
        }
        Ok(vec![op])
    }
}

pub fn schema() -> BucketSchema {
    BucketSchema::new()
        .with_index("ip", IndexType::Ip)
        .with_index("network_uuid", IndexType::String)
        .with_index("belongs_to_uuid", IndexType::String)
        .with_index("mac", IndexType::String)
}

pub fn definition() -> BucketDefinition {
    BucketDefinition::new(BUCKET, VERSION, schema(), factory(NicIpRecord::from_record))
}
