//! Group membership APIs: GroupCoordinator (10), JoinGroup (11), Heartbeat (12),
//! LeaveGroup (13), SyncGroup (14), DescribeGroups (15) and ListGroups (16).

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::Result;

pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";
pub const DEFAULT_ASSIGNMENT_PROTOCOL: &str = "range";

// ---- embedded consumer protocol ----

/// Subscription carried as JoinGroup protocol metadata.
///
/// ```text
/// ProtocolMetadata => version:int16 [topic:string] user_data:bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumerProtocolMetadata {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Bytes,
}

impl ConsumerProtocolMetadata {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            version: 0,
            topics,
            user_data: Bytes::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        wire::put_array(&mut buf, &self.topics, |buf, topic| {
            wire::put_required_string(buf, "topic_name", topic)
        })?;
        wire::put_bytes(&mut buf, &self.user_data)?;
        Ok(buf.freeze())
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = Reader::new(data);
        Ok(Self {
            version: reader.i16()?,
            topics: reader.array(|r| r.string())?,
            user_data: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub topic: String,
    pub partitions: Vec<i32>,
}

/// Partitions handed to one member through SyncGroup.
///
/// ```text
/// MemberAssignment => version:int16 [topic:string [partition:int32]] user_data:bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberAssignment {
    pub version: i16,
    pub topics: Vec<TopicAssignment>,
    pub user_data: Bytes,
}

impl MemberAssignment {
    pub fn partition_count(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }

    /// Append `partition` under `topic`, keeping topics in first-seen order.
    pub fn push(&mut self, topic: &str, partition: i32) {
        match self.topics.iter_mut().find(|t| t.topic == topic) {
            Some(entry) => entry.partitions.push(partition),
            None => self.topics.push(TopicAssignment {
                topic: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        wire::put_array(&mut buf, &self.topics, |buf, t| {
            wire::put_required_string(buf, "topic_name", &t.topic)?;
            wire::put_array(buf, &t.partitions, |buf, p| {
                buf.put_i32(*p);
                Ok(())
            })
        })?;
        wire::put_bytes(&mut buf, &self.user_data)?;
        Ok(buf.freeze())
    }

    /// An empty blob (a member that was given nothing) decodes as an empty assignment.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = Reader::new(data);
        Ok(Self {
            version: reader.i16()?,
            topics: reader.array(|r| {
                Ok(TopicAssignment {
                    topic: r.string()?,
                    partitions: r.array(|r| r.i32())?,
                })
            })?,
            user_data: if reader.is_empty() {
                Bytes::new()
            } else {
                reader.bytes()?
            },
        })
    }
}

// ---- GroupCoordinator ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCoordinatorRequest {
    pub group_id: String,
}

impl Encodable for GroupCoordinatorRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCoordinatorResponse {
    pub error_code: i16,
    pub coordinator_id: i32,
    pub host: String,
    pub port: i32,
}

impl Decodable for GroupCoordinatorResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
            coordinator_id: reader.i32()?,
            host: reader.string()?,
            port: reader.i32()?,
        })
    }
}

impl Encodable for GroupCoordinatorResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        buf.put_i32(self.coordinator_id);
        wire::put_string(buf, &self.host)?;
        buf.put_i32(self.port);
        Ok(())
    }
}

// ---- JoinGroup ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

/// Version 1 adds `rebalance_timeout` after the session timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout: i32,
    pub rebalance_timeout: i32,
    pub member_id: String,
    pub protocol_type: String,
    pub group_protocols: Vec<GroupProtocol>,
}

impl Encodable for JoinGroupRequest {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        buf.put_i32(self.session_timeout);
        if version >= ApiVersion::V1 {
            buf.put_i32(self.rebalance_timeout);
        }
        wire::put_string(buf, &self.member_id)?;
        wire::put_required_string(buf, "protocol_type", &self.protocol_type)?;
        if self.group_protocols.is_empty() {
            return Err(crate::KafkaError::protocol(
                "required field `group_protocols` is missing",
            ));
        }
        wire::put_array(buf, &self.group_protocols, |buf, p| {
            wire::put_required_string(buf, "protocol_name", &p.name)?;
            wire::put_bytes(buf, &p.metadata)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupResponse {
    pub error_code: i16,
    pub generation_id: i32,
    pub group_protocol: String,
    pub leader_id: String,
    pub member_id: String,
    pub members: Vec<JoinGroupMember>,
}

impl JoinGroupResponse {
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.leader_id == self.member_id
    }
}

impl Decodable for JoinGroupResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
            generation_id: reader.i32()?,
            group_protocol: reader.string()?,
            leader_id: reader.string()?,
            member_id: reader.string()?,
            members: reader.array(|r| {
                Ok(JoinGroupMember {
                    member_id: r.string()?,
                    metadata: r.bytes()?,
                })
            })?,
        })
    }
}

impl Encodable for JoinGroupResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        buf.put_i32(self.generation_id);
        wire::put_string(buf, &self.group_protocol)?;
        wire::put_string(buf, &self.leader_id)?;
        wire::put_string(buf, &self.member_id)?;
        wire::put_array(buf, &self.members, |buf, m| {
            wire::put_string(buf, &m.member_id)?;
            wire::put_bytes(buf, &m.metadata)
        })
    }
}

// ---- SyncGroup ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: MemberAssignment,
}

/// Only the leader fills `group_assignment`; followers send an empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_assignment: Vec<SyncGroupAssignment>,
}

impl Encodable for SyncGroupRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        buf.put_i32(self.generation_id);
        wire::put_required_string(buf, "member_id", &self.member_id)?;
        wire::put_array(buf, &self.group_assignment, |buf, a| {
            wire::put_required_string(buf, "member_id", &a.member_id)?;
            wire::put_bytes(buf, &a.assignment.to_bytes()?)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupResponse {
    pub error_code: i16,
    pub assignment: MemberAssignment,
}

impl Decodable for SyncGroupResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        let error_code = reader.i16()?;
        let assignment = MemberAssignment::from_bytes(reader.bytes()?)?;
        Ok(Self {
            error_code,
            assignment,
        })
    }
}

impl Encodable for SyncGroupResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        if self.assignment.topics.is_empty() && self.assignment.user_data.is_empty() {
            buf.put_i32(0);
            Ok(())
        } else {
            wire::put_bytes(buf, &self.assignment.to_bytes()?)
        }
    }
}

// ---- Heartbeat ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

impl Encodable for HeartbeatRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        buf.put_i32(self.generation_id);
        wire::put_required_string(buf, "member_id", &self.member_id)
    }
}

/// Shared shape of responses that carry only an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorOnlyResponse {
    pub error_code: i16,
}

impl Decodable for ErrorOnlyResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
        })
    }
}

impl Encodable for ErrorOnlyResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        Ok(())
    }
}

pub type HeartbeatResponse = ErrorOnlyResponse;
pub type LeaveGroupResponse = ErrorOnlyResponse;

// ---- LeaveGroup ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl Encodable for LeaveGroupRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "group_id", &self.group_id)?;
        wire::put_required_string(buf, "member_id", &self.member_id)
    }
}

// ---- ListGroups ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListGroupsRequest;

impl Encodable for ListGroupsRequest {
    fn encode(&self, _version: ApiVersion, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedGroup {
    pub group_id: String,
    pub protocol_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListGroupsResponse {
    pub error_code: i16,
    pub groups: Vec<ListedGroup>,
}

impl Decodable for ListGroupsResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
            groups: reader.array(|r| {
                Ok(ListedGroup {
                    group_id: r.string()?,
                    protocol_type: r.string()?,
                })
            })?,
        })
    }
}

impl Encodable for ListGroupsResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        wire::put_array(buf, &self.groups, |buf, g| {
            wire::put_string(buf, &g.group_id)?;
            wire::put_string(buf, &g.protocol_type)
        })
    }
}

// ---- DescribeGroups ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeGroupsRequest {
    pub groups: Vec<String>,
}

impl Encodable for DescribeGroupsRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        if self.groups.is_empty() {
            return Err(crate::KafkaError::protocol(
                "required field `groups` is missing",
            ));
        }
        wire::put_array(buf, &self.groups, |buf, g| {
            wire::put_required_string(buf, "group_id", g)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub metadata: ConsumerProtocolMetadata,
    pub assignment: MemberAssignment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedGroup {
    pub error_code: i16,
    pub group_id: String,
    pub state: String,
    pub protocol_type: String,
    pub protocol: String,
    pub members: Vec<DescribedMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeGroupsResponse {
    pub groups: Vec<DescribedGroup>,
}

impl Decodable for DescribeGroupsResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            groups: reader.array(|r| {
                Ok(DescribedGroup {
                    error_code: r.i16()?,
                    group_id: r.string()?,
                    state: r.string()?,
                    protocol_type: r.string()?,
                    protocol: r.string()?,
                    members: r.array(|r| {
                        Ok(DescribedMember {
                            member_id: r.string()?,
                            client_id: r.string()?,
                            client_host: r.string()?,
                            metadata: ConsumerProtocolMetadata::from_bytes(r.bytes()?)?,
                            assignment: MemberAssignment::from_bytes(r.bytes()?)?,
                        })
                    })?,
                })
            })?,
        })
    }
}

impl Encodable for DescribeGroupsResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_array(buf, &self.groups, |buf, g| {
            buf.put_i16(g.error_code);
            wire::put_string(buf, &g.group_id)?;
            wire::put_string(buf, &g.state)?;
            wire::put_string(buf, &g.protocol_type)?;
            wire::put_string(buf, &g.protocol)?;
            wire::put_array(buf, &g.members, |buf, m| {
                wire::put_string(buf, &m.member_id)?;
                wire::put_string(buf, &m.client_id)?;
                wire::put_string(buf, &m.client_host)?;
                wire::put_bytes(buf, &m.metadata.to_bytes()?)?;
                wire::put_bytes(buf, &m.assignment.to_bytes()?)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KafkaError;
    use assert_matches::assert_matches;

    fn join_request() -> JoinGroupRequest {
        JoinGroupRequest {
            group_id: "g".into(),
            session_timeout: 30000,
            rebalance_timeout: 60000,
            member_id: String::new(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.into(),
            group_protocols: vec![GroupProtocol {
                name: DEFAULT_ASSIGNMENT_PROTOCOL.into(),
                metadata: ConsumerProtocolMetadata::new(vec!["t".into()])
                    .to_bytes()
                    .unwrap(),
            }],
        }
    }

    #[test]
    fn test_join_group_rebalance_timeout_only_in_v1() {
        let mut v0 = BytesMut::new();
        join_request().encode(ApiVersion::V0, &mut v0).unwrap();
        let mut v1 = BytesMut::new();
        join_request().encode(ApiVersion::V1, &mut v1).unwrap();
        assert_eq!(v1.len(), v0.len() + 4);
        // group_id(2 + 1) then session timeout then rebalance timeout
        assert_eq!(&v1[3..7], &30000i32.to_be_bytes());
        assert_eq!(&v1[7..11], &60000i32.to_be_bytes());
        // empty member id is a zero-length string
        assert_eq!(&v1[11..13], &[0, 0]);
    }

    #[test]
    fn test_join_group_requires_group_id() {
        let mut request = join_request();
        request.group_id.clear();
        let mut buf = BytesMut::new();
        assert_matches!(
            request.encode(ApiVersion::V1, &mut buf),
            Err(KafkaError::ProtocolError(msg)) if msg.contains("group_id")
        );
    }

    #[test]
    fn test_join_group_response_round_trip() {
        let response = JoinGroupResponse {
            error_code: 0,
            generation_id: 4,
            group_protocol: "range".into(),
            leader_id: "m1".into(),
            member_id: "m1".into(),
            members: vec![JoinGroupMember {
                member_id: "m1".into(),
                metadata: ConsumerProtocolMetadata::new(vec!["test".into()])
                    .to_bytes()
                    .unwrap(),
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(ApiVersion::V1, &mut buf).unwrap();
        let decoded =
            JoinGroupResponse::decode(ApiVersion::V1, &mut Reader::new(buf.freeze())).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.is_leader());
        let metadata =
            ConsumerProtocolMetadata::from_bytes(decoded.members[0].metadata.clone()).unwrap();
        assert_eq!(metadata.topics, vec!["test".to_string()]);
    }

    #[test]
    fn test_sync_group_response_round_trip() {
        let mut assignment = MemberAssignment::default();
        assignment.push("test", 0);
        assignment.push("test", 1);
        assignment.push("other", 3);
        let response = SyncGroupResponse {
            error_code: 0,
            assignment,
        };
        let mut buf = BytesMut::new();
        response.encode(ApiVersion::V0, &mut buf).unwrap();
        let decoded =
            SyncGroupResponse::decode(ApiVersion::V0, &mut Reader::new(buf.freeze())).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.assignment.partition_count(), 3);
    }

    #[test]
    fn test_sync_group_empty_assignment() {
        let bytes = Bytes::from_static(&[0, 27, 0, 0, 0, 0]);
        let decoded = SyncGroupResponse::decode(ApiVersion::V0, &mut Reader::new(bytes)).unwrap();
        assert_eq!(decoded.error_code, 27);
        assert!(decoded.assignment.topics.is_empty());
    }

    #[test]
    fn test_heartbeat_request_bytes() {
        let mut buf = BytesMut::new();
        HeartbeatRequest {
            group_id: "g".into(),
            generation_id: 2,
            member_id: "m".into(),
        }
        .encode(ApiVersion::V0, &mut buf)
        .unwrap();
        assert_eq!(&buf[..], &[0, 1, b'g', 0, 0, 0, 2, 0, 1, b'm']);
    }

    #[test]
    fn test_describe_groups_round_trip() {
        let mut assignment = MemberAssignment::default();
        assignment.push("t", 0);
        let response = DescribeGroupsResponse {
            groups: vec![DescribedGroup {
                error_code: 0,
                group_id: "g".into(),
                state: "Stable".into(),
                protocol_type: "consumer".into(),
                protocol: "range".into(),
                members: vec![DescribedMember {
                    member_id: "m1".into(),
                    client_id: "c".into(),
                    client_host: "/127.0.0.1".into(),
                    metadata: ConsumerProtocolMetadata::new(vec!["t".into()]),
                    assignment,
                }],
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(ApiVersion::V0, &mut buf).unwrap();
        let decoded =
            DescribeGroupsResponse::decode(ApiVersion::V0, &mut Reader::new(buf.freeze()))
                .unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_list_groups_round_trip() {
        let response = ListGroupsResponse {
            error_code: 0,
            groups: vec![ListedGroup {
                group_id: "g".into(),
                protocol_type: "consumer".into(),
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(ApiVersion::V0, &mut buf).unwrap();
        let decoded =
            ListGroupsResponse::decode(ApiVersion::V0, &mut Reader::new(buf.freeze())).unwrap();
        assert_eq!(decoded, response);
    }
}
