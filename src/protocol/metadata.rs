//! Metadata API (key 3).
//!
//! ```text
//! MetadataRequest  => [topic:string]
//! MetadataResponse => [broker] [topic_metadata]
//!   broker         => node_id:int32 host:string port:int32
//!   topic_metadata => error_code:int16 topic:string [partition_metadata]
//!   partition_metadata => error_code:int16 partition:int32 leader:int32 [replica:int32] [isr:int32]
//! ```

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRequest {
    /// An empty list asks for every topic.
    pub topics: Vec<String>,
}

impl Encodable for MetadataRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.topics, |buf, topic| {
            wire::put_required_string(buf, "topic_name", topic)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerEndpoint {
    pub fn new(node_id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error_code: i16,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error_code: i16,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerEndpoint>,
    pub topics: Vec<TopicMetadata>,
}

impl Decodable for MetadataResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        let brokers = reader.array(|r| {
            Ok(BrokerEndpoint {
                node_id: r.i32()?,
                host: r.string()?,
                port: r.i32()?,
            })
        })?;
        let topics = reader.array(|r| {
            Ok(TopicMetadata {
                error_code: r.i16()?,
                name: r.string()?,
                partitions: r.array(|r| {
                    Ok(PartitionMetadata {
                        error_code: r.i16()?,
                        partition: r.i32()?,
                        leader: r.i32()?,
                        replicas: r.array(|r| r.i32())?,
                        isr: r.array(|r| r.i32())?,
                    })
                })?,
            })
        })?;
        Ok(Self { brokers, topics })
    }
}

/// Response-side encoder, used by fixtures that play the broker.
impl Encodable for MetadataResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.brokers, |buf, broker| {
            buf.put_i32(broker.node_id);
            wire::put_string(buf, &broker.host)?;
            buf.put_i32(broker.port);
            Ok(())
        })?;
        wire::put_array(buf, &self.topics, |buf, topic| {
            buf.put_i16(topic.error_code);
            wire::put_string(buf, &topic.name)?;
            wire::put_array(buf, &topic.partitions, |buf, p| {
                buf.put_i16(p.error_code);
                buf.put_i32(p.partition);
                buf.put_i32(p.leader);
                wire::put_array(buf, &p.replicas, |buf, id| {
                    buf.put_i32(*id);
                    Ok(())
                })?;
                wire::put_array(buf, &p.isr, |buf, id| {
                    buf.put_i32(*id);
                    Ok(())
                })
            })
        })
    }
}
