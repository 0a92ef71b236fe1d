//! Kafka wire protocol.
//!
//! Requests are framed as
//!
//! ```text
//! length:int32 api_key:int16 api_version:int16 correlation_id:int32 client_id:string body
//! ```
//!
//! and responses as `length:int32 correlation_id:int32 body`. The transport strips the
//! length prefix; [`split_response`] peels the correlation id off and [`Codec::decode`]
//! turns the body into a typed [`Response`]. Every version decision goes through
//! [`version::BrokerVersion::api_version`].

pub mod error_code;
pub mod fetch;
pub mod group;
pub mod handshake;
pub mod message;
pub mod metadata;
pub mod offset;
pub mod produce;
pub mod version;
pub mod wire;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::KafkaError;
use crate::Result;

pub use error_code::{ErrorCategory, ErrorCode};
pub use fetch::{FetchRequest, FetchResponse};
pub use group::{
    GroupCoordinatorRequest, GroupCoordinatorResponse, HeartbeatRequest, HeartbeatResponse,
    JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse,
    MemberAssignment, SyncGroupRequest, SyncGroupResponse,
};
pub use handshake::{
    ApiVersionsRequest, ApiVersionsResponse, SaslHandshakeRequest, SaslHandshakeResponse,
};
pub use message::{Compression, Message};
pub use metadata::{BrokerEndpoint, MetadataRequest, MetadataResponse};
pub use offset::{
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse,
    OffsetRequest, OffsetResponse,
};
pub use produce::{ProduceRequest, ProduceResponse};
pub use version::{ApiVersion, BrokerVersion};

use group::{DescribeGroupsRequest, DescribeGroupsResponse, ListGroupsRequest, ListGroupsResponse};
use wire::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    Fetch,
    Offset,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    GroupCoordinator,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
    SyncGroup,
    DescribeGroups,
    ListGroups,
    SaslHandshake,
    ApiVersions,
}

impl ApiKey {
    pub fn as_i16(self) -> i16 {
        match self {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::Offset => 2,
            ApiKey::Metadata => 3,
            ApiKey::OffsetCommit => 8,
            ApiKey::OffsetFetch => 9,
            ApiKey::GroupCoordinator => 10,
            ApiKey::JoinGroup => 11,
            ApiKey::Heartbeat => 12,
            ApiKey::LeaveGroup => 13,
            ApiKey::SyncGroup => 14,
            ApiKey::DescribeGroups => 15,
            ApiKey::ListGroups => 16,
            ApiKey::SaslHandshake => 17,
            ApiKey::ApiVersions => 18,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ApiKey::Produce),
            1 => Some(ApiKey::Fetch),
            2 => Some(ApiKey::Offset),
            3 => Some(ApiKey::Metadata),
            8 => Some(ApiKey::OffsetCommit),
            9 => Some(ApiKey::OffsetFetch),
            10 => Some(ApiKey::GroupCoordinator),
            11 => Some(ApiKey::JoinGroup),
            12 => Some(ApiKey::Heartbeat),
            13 => Some(ApiKey::LeaveGroup),
            14 => Some(ApiKey::SyncGroup),
            15 => Some(ApiKey::DescribeGroups),
            16 => Some(ApiKey::ListGroups),
            17 => Some(ApiKey::SaslHandshake),
            18 => Some(ApiKey::ApiVersions),
            _ => None,
        }
    }
}

/// Writes one API body in the layout of the given wire version.
pub trait Encodable {
    fn encode(&self, version: ApiVersion, buf: &mut BytesMut) -> Result<()>;
}

/// Reads one API body in the layout of the given wire version.
pub trait Decodable: Sized {
    fn decode(version: ApiVersion, reader: &mut Reader) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    Offset(OffsetRequest),
    Metadata(MetadataRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
    GroupCoordinator(GroupCoordinatorRequest),
    JoinGroup(JoinGroupRequest),
    Heartbeat(HeartbeatRequest),
    LeaveGroup(LeaveGroupRequest),
    SyncGroup(SyncGroupRequest),
    DescribeGroups(DescribeGroupsRequest),
    ListGroups(ListGroupsRequest),
    SaslHandshake(SaslHandshakeRequest),
    ApiVersions(ApiVersionsRequest),
}

impl Request {
    pub fn api_key(&self) -> ApiKey {
        match self {
            Request::Produce(_) => ApiKey::Produce,
            Request::Fetch(_) => ApiKey::Fetch,
            Request::Offset(_) => ApiKey::Offset,
            Request::Metadata(_) => ApiKey::Metadata,
            Request::OffsetCommit(_) => ApiKey::OffsetCommit,
            Request::OffsetFetch(_) => ApiKey::OffsetFetch,
            Request::GroupCoordinator(_) => ApiKey::GroupCoordinator,
            Request::JoinGroup(_) => ApiKey::JoinGroup,
            Request::Heartbeat(_) => ApiKey::Heartbeat,
            Request::LeaveGroup(_) => ApiKey::LeaveGroup,
            Request::SyncGroup(_) => ApiKey::SyncGroup,
            Request::DescribeGroups(_) => ApiKey::DescribeGroups,
            Request::ListGroups(_) => ApiKey::ListGroups,
            Request::SaslHandshake(_) => ApiKey::SaslHandshake,
            Request::ApiVersions(_) => ApiKey::ApiVersions,
        }
    }

    fn body(&self) -> &dyn Encodable {
        match self {
            Request::Produce(r) => r,
            Request::Fetch(r) => r,
            Request::Offset(r) => r,
            Request::Metadata(r) => r,
            Request::OffsetCommit(r) => r,
            Request::OffsetFetch(r) => r,
            Request::GroupCoordinator(r) => r,
            Request::JoinGroup(r) => r,
            Request::Heartbeat(r) => r,
            Request::LeaveGroup(r) => r,
            Request::SyncGroup(r) => r,
            Request::DescribeGroups(r) => r,
            Request::ListGroups(r) => r,
            Request::SaslHandshake(r) => r,
            Request::ApiVersions(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    Offset(OffsetResponse),
    Metadata(MetadataResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
    GroupCoordinator(GroupCoordinatorResponse),
    JoinGroup(JoinGroupResponse),
    Heartbeat(HeartbeatResponse),
    LeaveGroup(LeaveGroupResponse),
    SyncGroup(SyncGroupResponse),
    DescribeGroups(DescribeGroupsResponse),
    ListGroups(ListGroupsResponse),
    SaslHandshake(SaslHandshakeResponse),
    ApiVersions(ApiVersionsResponse),
}

impl Response {
    pub fn api_key(&self) -> ApiKey {
        match self {
            Response::Produce(_) => ApiKey::Produce,
            Response::Fetch(_) => ApiKey::Fetch,
            Response::Offset(_) => ApiKey::Offset,
            Response::Metadata(_) => ApiKey::Metadata,
            Response::OffsetCommit(_) => ApiKey::OffsetCommit,
            Response::OffsetFetch(_) => ApiKey::OffsetFetch,
            Response::GroupCoordinator(_) => ApiKey::GroupCoordinator,
            Response::JoinGroup(_) => ApiKey::JoinGroup,
            Response::Heartbeat(_) => ApiKey::Heartbeat,
            Response::LeaveGroup(_) => ApiKey::LeaveGroup,
            Response::SyncGroup(_) => ApiKey::SyncGroup,
            Response::DescribeGroups(_) => ApiKey::DescribeGroups,
            Response::ListGroups(_) => ApiKey::ListGroups,
            Response::SaslHandshake(_) => ApiKey::SaslHandshake,
            Response::ApiVersions(_) => ApiKey::ApiVersions,
        }
    }

    /// Decode a response body (correlation id already removed).
    pub fn decode(api_key: ApiKey, version: ApiVersion, body: Bytes) -> Result<Self> {
        let mut reader = Reader::new(body);
        let r = &mut reader;
        let response = match api_key {
            ApiKey::Produce => Response::Produce(Decodable::decode(version, r)?),
            ApiKey::Fetch => Response::Fetch(Decodable::decode(version, r)?),
            ApiKey::Offset => Response::Offset(Decodable::decode(version, r)?),
            ApiKey::Metadata => Response::Metadata(Decodable::decode(version, r)?),
            ApiKey::OffsetCommit => Response::OffsetCommit(Decodable::decode(version, r)?),
            ApiKey::OffsetFetch => Response::OffsetFetch(Decodable::decode(version, r)?),
            ApiKey::GroupCoordinator => {
                Response::GroupCoordinator(Decodable::decode(version, r)?)
            }
            ApiKey::JoinGroup => Response::JoinGroup(Decodable::decode(version, r)?),
            ApiKey::Heartbeat => Response::Heartbeat(Decodable::decode(version, r)?),
            ApiKey::LeaveGroup => Response::LeaveGroup(Decodable::decode(version, r)?),
            ApiKey::SyncGroup => Response::SyncGroup(Decodable::decode(version, r)?),
            ApiKey::DescribeGroups => Response::DescribeGroups(Decodable::decode(version, r)?),
            ApiKey::ListGroups => Response::ListGroups(Decodable::decode(version, r)?),
            ApiKey::SaslHandshake => Response::SaslHandshake(Decodable::decode(version, r)?),
            ApiKey::ApiVersions => Response::ApiVersions(Decodable::decode(version, r)?),
        };
        if !reader.is_empty() {
            trace!(?api_key, trailing = reader.remaining(), "ignoring trailing response bytes");
        }
        Ok(response)
    }

    fn body(&self) -> &dyn Encodable {
        match self {
            Response::Produce(r) => r,
            Response::Fetch(r) => r,
            Response::Offset(r) => r,
            Response::Metadata(r) => r,
            Response::OffsetCommit(r) => r,
            Response::OffsetFetch(r) => r,
            Response::GroupCoordinator(r) => r,
            Response::JoinGroup(r) => r,
            Response::Heartbeat(r) => r,
            Response::LeaveGroup(r) => r,
            Response::SyncGroup(r) => r,
            Response::DescribeGroups(r) => r,
            Response::ListGroups(r) => r,
            Response::SaslHandshake(r) => r,
            Response::ApiVersions(r) => r,
        }
    }
}

/// Encode a complete request frame, length prefix included.
pub fn encode_request(
    request: &Request,
    version: ApiVersion,
    correlation_id: i32,
    client_id: &str,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    buf.put_i16(request.api_key().as_i16());
    buf.put_i16(version.as_i16());
    buf.put_i32(correlation_id);
    wire::put_string(&mut buf, client_id)?;
    request.body().encode(version, &mut buf)?;
    let len = (buf.len() - 4) as i32;
    (&mut buf[0..4]).put_i32(len);
    Ok(buf.freeze())
}

/// Encode a complete response frame, length prefix included. Used by code that plays
/// the broker side, such as test fixtures.
pub fn encode_response(
    response: &Response,
    version: ApiVersion,
    correlation_id: i32,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    buf.put_i32(correlation_id);
    response.body().encode(version, &mut buf)?;
    let len = (buf.len() - 4) as i32;
    (&mut buf[0..4]).put_i32(len);
    Ok(buf.freeze())
}

/// Split a response frame (length prefix removed) into correlation id and body.
pub fn split_response(mut frame: Bytes) -> Result<(i32, Bytes)> {
    if frame.len() < 4 {
        return Err(KafkaError::protocol(format!(
            "response frame of {} bytes has no correlation id",
            frame.len()
        )));
    }
    let correlation_id = frame.get_i32();
    Ok((correlation_id, frame))
}

/// Header of an encoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

impl RequestHeader {
    /// Parse the header of a request frame whose length prefix was already removed.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(Bytes::copy_from_slice(frame));
        Ok(Self {
            api_key: reader.i16()?,
            api_version: reader.i16()?,
            correlation_id: reader.i32()?,
            client_id: reader.string()?,
        })
    }
}

/// Request encoder/response decoder bound to one client id and broker release.
#[derive(Debug, Clone)]
pub struct Codec {
    client_id: String,
    broker_version: BrokerVersion,
}

impl Codec {
    pub fn new(client_id: impl Into<String>, broker_version: &str) -> Result<Self> {
        Ok(Self {
            client_id: client_id.into(),
            broker_version: BrokerVersion::parse(broker_version)?,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker_version(&self) -> &BrokerVersion {
        &self.broker_version
    }

    pub fn version(&self, api_key: ApiKey) -> ApiVersion {
        self.broker_version.api_version(api_key)
    }

    pub fn encode(&self, correlation_id: i32, request: &Request) -> Result<Bytes> {
        let version = self.version(request.api_key());
        encode_request(request, version, correlation_id, &self.client_id)
    }

    pub fn decode(&self, api_key: ApiKey, body: Bytes) -> Result<Response> {
        Response::decode(api_key, self.version(api_key), body)
    }

    pub fn encode_response(&self, correlation_id: i32, response: &Response) -> Result<Bytes> {
        encode_response(response, self.version(response.api_key()), correlation_id)
    }
}
