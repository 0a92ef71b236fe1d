//! Maps the configured broker release to the wire version of each request.
//!
//! The thresholds live in one static table so that every encode and decode goes through
//! [`resolve`] (or [`BrokerVersion::api_version`]) rather than assuming version 0.

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::ApiKey;
use crate::error::KafkaError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiVersion {
    V0,
    V1,
    V2,
}

impl ApiVersion {
    pub fn as_i16(self) -> i16 {
        match self {
            ApiVersion::V0 => 0,
            ApiVersion::V1 => 1,
            ApiVersion::V2 => 2,
        }
    }
}

/// Lowest broker release (inclusive) for each non-zero wire version, highest first.
type Thresholds = &'static [([u32; 3], ApiVersion)];

static VERSION_TABLE: &[(ApiKey, Thresholds)] = &[
    (
        ApiKey::Produce,
        &[([0, 10, 0], ApiVersion::V2), ([0, 9, 0], ApiVersion::V1)],
    ),
    (
        ApiKey::Fetch,
        &[([0, 10, 0], ApiVersion::V2), ([0, 9, 0], ApiVersion::V1)],
    ),
    (
        ApiKey::OffsetCommit,
        &[([0, 9, 0], ApiVersion::V2), ([0, 8, 2], ApiVersion::V1)],
    ),
    (ApiKey::OffsetFetch, &[([0, 8, 2], ApiVersion::V1)]),
    (ApiKey::JoinGroup, &[([0, 10, 1], ApiVersion::V1)]),
];

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?(?:\.(\d+))?$").expect("static regex is valid")
    })
}

/// A dotted broker release such as `0.10.1.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerVersion {
    parts: [u32; 4],
    raw: String,
}

impl BrokerVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let captures = version_pattern()
            .captures(raw.trim())
            .ok_or_else(|| KafkaError::configuration(format!("invalid broker version `{}`", raw)))?;
        let mut parts = [0u32; 4];
        for (i, part) in parts.iter_mut().enumerate() {
            if let Some(m) = captures.get(i + 1) {
                *part = m.as_str().parse().map_err(|_| {
                    KafkaError::configuration(format!("invalid broker version `{}`", raw))
                })?;
            }
        }
        Ok(Self {
            parts,
            raw: raw.trim().to_string(),
        })
    }

    fn at_least(&self, threshold: &[u32; 3]) -> bool {
        self.parts[..3].cmp(&threshold[..]) != Ordering::Less
    }

    pub fn api_version(&self, api_key: ApiKey) -> ApiVersion {
        VERSION_TABLE
            .iter()
            .find(|(key, _)| *key == api_key)
            .and_then(|(_, thresholds)| {
                thresholds
                    .iter()
                    .find(|(threshold, _)| self.at_least(threshold))
                    .map(|(_, version)| *version)
            })
            .unwrap_or(ApiVersion::V0)
    }
}

impl fmt::Display for BrokerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Resolve the wire version of `api_key` for a broker release string.
pub fn resolve(api_key: ApiKey, broker_version: &str) -> Result<ApiVersion> {
    Ok(BrokerVersion::parse(broker_version)?.api_version(api_key))
}
