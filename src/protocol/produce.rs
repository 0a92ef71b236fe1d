//! Produce API (key 0).
//!
//! ```text
//! ProduceRequest  => acks:int16 timeout:int32 [topic:string [partition:int32 message_set]]
//! ProduceResponse => [topic:string [partition:int32 error_code:int16 offset:int64 timestamp:int64 (v2)]]
//!                    throttle_time_ms:int32 (v1+)
//! ```

use bytes::{BufMut, BytesMut};

use super::message::{self, Compression, Message};
use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::error::KafkaError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartition {
    pub partition: i32,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopic {
    pub topic: String,
    pub partitions: Vec<ProducePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub required_acks: i16,
    pub timeout: i32,
    pub compression: Compression,
    pub topics: Vec<ProduceTopic>,
}

impl Encodable for ProduceRequest {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        if self.topics.is_empty() {
            return Err(KafkaError::protocol("required field `data` is missing"));
        }
        buf.put_i16(self.required_acks);
        buf.put_i32(self.timeout);
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                if p.messages.is_empty() {
                    return Err(KafkaError::protocol("required field `messages` is missing"));
                }
                buf.put_i32(p.partition);
                let messages = stamp(version, &p.messages);
                let mut set = BytesMut::new();
                message::encode_message_set(&mut set, &messages, self.compression)?;
                wire::put_bytes(buf, &set)
            })
        })
    }
}

/// Version 2 writes magic 1 records; older versions must not carry timestamps.
fn stamp(version: ApiVersion, messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .cloned()
        .map(|mut m| {
            if version >= ApiVersion::V2 {
                m.magic = 1;
                m.timestamp = Some(m.timestamp.unwrap_or(-1));
            } else {
                m.magic = 0;
                m.timestamp = None;
            }
            m
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub offset: i64,
    /// Log append time, version 2 only.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicResponse {
    pub topic: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

impl Decodable for ProduceResponse {
    fn decode(version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        let topics = reader.array(|r| {
            Ok(ProduceTopicResponse {
                topic: r.string()?,
                partitions: r.array(|r| {
                    Ok(ProducePartitionResponse {
                        partition: r.i32()?,
                        error_code: r.i16()?,
                        offset: r.i64()?,
                        timestamp: if version >= ApiVersion::V2 { r.i64()? } else { -1 },
                    })
                })?,
            })
        })?;
        let throttle_time_ms = if version >= ApiVersion::V1 {
            reader.i32()?
        } else {
            0
        };
        Ok(Self {
            topics,
            throttle_time_ms,
        })
    }
}

impl Encodable for ProduceResponse {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_string(buf, &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i16(p.error_code);
                buf.put_i64(p.offset);
                if version >= ApiVersion::V2 {
                    buf.put_i64(p.timestamp);
                }
                Ok(())
            })
        })?;
        if version >= ApiVersion::V1 {
            buf.put_i32(self.throttle_time_ms);
        }
        Ok(())
    }
}
