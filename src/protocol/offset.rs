//! Offset APIs: Offset/ListOffsets (2), OffsetCommit (8) and OffsetFetch (9).

use bytes::{BufMut, BytesMut};

use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::error::KafkaError;
use crate::Result;

/// Ask for offsets before the latest message (the high-water mark comes first).
pub const LATEST_TIME: i64 = -1;
/// Ask for the earliest available offset.
pub const EARLIEST_TIME: i64 = -2;

fn require_topics<T>(topics: &[T]) -> Result<()> {
    if topics.is_empty() {
        return Err(KafkaError::protocol("required field `data` is missing"));
    }
    Ok(())
}

// ---- Offset (ListOffsets v0) ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetPartitionRequest {
    pub partition: i32,
    pub time: i64,
    pub max_offsets: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTopicRequest {
    pub topic: String,
    pub partitions: Vec<OffsetPartitionRequest>,
}

/// ```text
/// OffsetRequest => replica_id:int32 [topic:string [partition:int32 time:int64 max_offsets:int32]]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRequest {
    pub replica_id: i32,
    pub topics: Vec<OffsetTopicRequest>,
}

impl Encodable for OffsetRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        require_topics(&self.topics)?;
        buf.put_i32(self.replica_id);
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i64(p.time);
                buf.put_i32(p.max_offsets);
                Ok(())
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    /// Segment offsets in descending order, the high-water mark first.
    pub offsets: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTopicResponse {
    pub topic: String,
    pub partitions: Vec<OffsetPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetResponse {
    pub topics: Vec<OffsetTopicResponse>,
}

impl Decodable for OffsetResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            topics: reader.array(|r| {
                Ok(OffsetTopicResponse {
                    topic: r.string()?,
                    partitions: r.array(|r| {
                        Ok(OffsetPartitionResponse {
                            partition: r.i32()?,
                            error_code: r.i16()?,
                            offsets: r.array(|r| r.i64())?,
                        })
                    })?,
                })
            })?,
        })
    }
}

impl Encodable for OffsetResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_string(buf, &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i16(p.error_code);
                wire::put_array(buf, &p.offsets, |buf, o| {
                    buf.put_i64(*o);
                    Ok(())
                })
            })
        })
    }
}

// ---- OffsetFetch ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchTopic {
    pub topic: String,
    pub partitions: Vec<i32>,
}

/// Version 0 reads offsets kept by the coordination service, version 1 offsets kept by
/// the broker; both share one layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Vec<OffsetFetchTopic>,
}

impl Encodable for OffsetFetchRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        require_topics(&self.topics)?;
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(*p);
                Ok(())
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchPartition {
    pub partition: i32,
    /// `-1` when the group has never committed this partition.
    pub offset: i64,
    pub metadata: String,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<OffsetFetchPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    pub topics: Vec<OffsetFetchTopicResponse>,
}

impl Decodable for OffsetFetchResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            topics: reader.array(|r| {
                Ok(OffsetFetchTopicResponse {
                    topic: r.string()?,
                    partitions: r.array(|r| {
                        Ok(OffsetFetchPartition {
                            partition: r.i32()?,
                            offset: r.i64()?,
                            metadata: r.string()?,
                            error_code: r.i16()?,
                        })
                    })?,
                })
            })?,
        })
    }
}

impl Encodable for OffsetFetchResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_string(buf, &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i64(p.offset);
                wire::put_string(buf, &p.metadata)?;
                buf.put_i16(p.error_code);
                Ok(())
            })
        })
    }
}

// ---- OffsetCommit ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitPartition {
    pub partition: i32,
    pub offset: i64,
    /// Only written by version 1; `-1` lets the broker stamp the commit time.
    pub timestamp: i64,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitTopic {
    pub topic: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

/// ```text
/// v0 => group_id [topic [partition offset metadata]]
/// v1 => group_id generation_id member_id [topic [partition offset timestamp metadata]]
/// v2 => group_id generation_id member_id retention_time [topic [partition offset metadata]]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub retention_time: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

impl Encodable for OffsetCommitRequest {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        require_topics(&self.topics)?;
        if version >= ApiVersion::V1 {
            buf.put_i32(self.generation_id);
            wire::put_required_string(buf, "member_id", &self.member_id)?;
        }
        if version >= ApiVersion::V2 {
            buf.put_i64(self.retention_time);
        }
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i64(p.offset);
                if version == ApiVersion::V1 {
                    buf.put_i64(p.timestamp);
                }
                wire::put_string(buf, &p.metadata)
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionErrorCode {
    pub partition: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitTopicResponse {
    pub topic: String,
    pub partitions: Vec<PartitionErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    pub topics: Vec<OffsetCommitTopicResponse>,
}

impl Decodable for OffsetCommitResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            topics: reader.array(|r| {
                Ok(OffsetCommitTopicResponse {
                    topic: r.string()?,
                    partitions: r.array(|r| {
                        Ok(PartitionErrorCode {
                            partition: r.i32()?,
                            error_code: r.i16()?,
                        })
                    })?,
                })
            })?,
        })
    }
}

impl Encodable for OffsetCommitResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.topics, |buf, t| {
            wire::put_string(buf, &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(p.partition);
                buf.put_i16(p.error_code);
                Ok(())
            })
        })
    }
}
