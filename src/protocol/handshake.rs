//! Connection-level APIs: SaslHandshake (17) and ApiVersions (18).

use bytes::{BufMut, BytesMut};

use super::wire::{self, Reader};
use super::{ApiVersion, Decodable, Encodable};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl Encodable for SaslHandshakeRequest {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        wire::put_required_string(buf, "mechanism", &self.mechanism)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslHandshakeResponse {
    pub error_code: i16,
    pub enabled_mechanisms: Vec<String>,
}

impl Decodable for SaslHandshakeResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
            enabled_mechanisms: reader.array(|r| r.string())?,
        })
    }
}

impl Encodable for SaslHandshakeResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        wire::put_array(buf, &self.enabled_mechanisms, |buf, m| wire::put_string(buf, m))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApiVersionsRequest;

impl Encodable for ApiVersionsRequest {
    fn encode(&self, _version: ApiVersion, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_versions: Vec<ApiVersionRange>,
}

impl ApiVersionsResponse {
    pub fn range_for(&self, api_key: i16) -> Option<ApiVersionRange> {
        self.api_versions.iter().copied().find(|r| r.api_key == api_key)
    }
}

impl Decodable for ApiVersionsResponse {
    fn decode(_version: ApiVersion, reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            error_code: reader.i16()?,
            api_versions: reader.array(|r| {
                Ok(ApiVersionRange {
                    api_key: r.i16()?,
                    min_version: r.i16()?,
                    max_version: r.i16()?,
                })
            })?,
        })
    }
}

impl Encodable for ApiVersionsResponse {
    fn encode(&self, _version: ApiVersion, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(self.error_code);
        wire::put_array(buf, &self.api_versions, |buf, r| {
            buf.put_i16(r.api_key);
            buf.put_i16(r.min_version);
            buf.put_i16(r.max_version);
            Ok(())
        })
    }
}
