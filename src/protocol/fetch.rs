//! Fetch API (key 1).
//!
//! ```text
//! FetchRequest  => replica_id:int32 max_wait_time:int32 min_bytes:int32
//!                  [topic:string [partition:int32 fetch_offset:int64 max_bytes:int32]]
//! FetchResponse => [throttle_time_ms:int32 (v1+)]
//!                  [topic:string [partition:int32 error_code:int16 high_watermark:int64 message_set]]
//! ```
//!
//! Version 2 brokers answer with magic 1 (timestamped) messages.

use bytes::{BufMut, BytesMut};

use super::message::{self, Compression, Message};
use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::error::KafkaError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionRequest {
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopicRequest {
    pub topic: String,
    pub partitions: Vec<FetchPartitionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_time: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopicRequest>,
}

impl Encodable for FetchRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        if self.topics.is_empty() {
            return Err(KafkaError::protocol("required field `data` is missing"));
        }
        buf.put_i32(self.replica_id);
        buf.put_i32(self.max_wait_time);
        buf.put_i32(self.min_bytes);
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i64(p.offset);
                buf.put_i32(p.max_bytes);
                Ok(())
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchResponse {
    /// Zero for version 0, which has no throttle field.
    pub throttle_time_ms: i32,
    pub topics: Vec<FetchTopicResponse>,
}

impl Decodable for FetchResponse {
    fn decode(version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        let throttle_time_ms = if version >= ApiVersion::V1 {
            reader.i32()?
        } else {
            0
        };
        let topics = reader.array(|r| {
            Ok(FetchTopicResponse {
                topic: r.string()?,
                partitions: r.array(|r| {
                    let partition = r.i32()?;
                    let error_code = r.i16()?;
                    let high_watermark = r.i64()?;
                    let message_set = r.bytes()?;
                    Ok(FetchPartitionResponse {
                        partition,
                        error_code,
                        high_watermark,
                        messages: message::decode_message_set(message_set)?,
                    })
                })?,
            })
        })?;
        Ok(Self {
            throttle_time_ms,
            topics,
        })
    }
}

impl Encodable for FetchResponse {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        if version >= ApiVersion::V1 {
            buf.put_i32(self.throttle_time_ms);
        }
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_string(buf, &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i16(p.error_code);
                buf.put_i64(p.high_watermark);
                let mut set = BytesMut::new();
                message::encode_message_set(&mut set, &p.messages, Compression::None)?;
                wire::put_bytes(buf, &set)
            })
        })
    }
}
