//! Consumer settings.
//!
//! One named field per option. Settings can come from JSON, where unknown option names
//! are rejected, or from [`ConsumerConfigBuilder`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KafkaError;
use crate::protocol::BrokerVersion;
use crate::Result;

/// Where to restart a partition whose position fell outside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    /// The high-water mark seen when offsets were first fetched.
    #[default]
    Latest,
    /// The earliest offset still held by the log.
    Earliest,
}

/// When fetched messages are handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeMode {
    /// Buffer each batch and release it once its offsets are committed.
    AfterCommit,
    /// Deliver every message as soon as it is fetched.
    #[default]
    BeforeCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConsumerConfig {
    pub client_id: String,
    /// Comma separated `host:port` bootstrap brokers.
    pub metadata_broker_list: String,
    pub broker_version: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u64,
    pub rebalance_timeout_ms: u64,
    /// Defaults to a third of the session timeout.
    pub heartbeat_interval_ms: Option<u64>,
    pub offset_interval_ms: u64,
    pub fetch_offset_interval_ms: u64,
    pub commit_interval_ms: u64,
    pub fetch_interval_ms: u64,
    pub metadata_refresh_interval_ms: u64,
    /// How long a request may stay unanswered before its step is retried.
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub tick_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_wait_time_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub offset_reset: OffsetReset,
    pub consume_mode: ConsumeMode,
    /// `-1` keeps the broker's retention.
    pub offset_retention_time_ms: i64,
    pub sasl: Option<SaslConfig>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_id: "tiny-kafka-group".to_string(),
            metadata_broker_list: String::new(),
            broker_version: "0.10.1.0".to_string(),
            group_id: String::new(),
            topics: Vec::new(),
            session_timeout_ms: 30_000,
            rebalance_timeout_ms: 30_000,
            heartbeat_interval_ms: None,
            offset_interval_ms: 2_000,
            fetch_offset_interval_ms: 2_000,
            commit_interval_ms: 2_000,
            fetch_interval_ms: 100,
            metadata_refresh_interval_ms: 30_000,
            request_timeout_ms: 30_000,
            retry_backoff_ms: 500,
            tick_interval_ms: 50,
            connect_timeout_ms: 10_000,
            max_wait_time_ms: 100,
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            offset_reset: OffsetReset::Latest,
            consume_mode: ConsumeMode::BeforeCommit,
            offset_retention_time_ms: -1,
            sasl: None,
        }
    }
}

fn topic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]{1,249}$").expect("valid topic regex"))
}

fn broker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^\s:]+:\d{1,5}$").expect("valid broker regex"))
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    /// Parse and validate settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KafkaError::configuration(format!("invalid consumer config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata_broker_list.trim().is_empty() {
            return Err(KafkaError::configuration("metadata_broker_list is required"));
        }
        for broker in self.metadata_broker_list.split(',').map(str::trim) {
            if !broker_pattern().is_match(broker) {
                return Err(KafkaError::configuration(format!(
                    "broker `{}` is not in host:port form",
                    broker
                )));
            }
        }
        if self.group_id.is_empty() {
            return Err(KafkaError::configuration("group_id is required"));
        }
        if self.topics.is_empty() {
            return Err(KafkaError::configuration("at least one topic is required"));
        }
        if let Some(topic) = self.topics.iter().find(|t| !topic_pattern().is_match(t)) {
            return Err(KafkaError::configuration(format!("invalid topic name `{}`", topic)));
        }
        BrokerVersion::parse(&self.broker_version)?;
        if self.session_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(KafkaError::configuration(
                "session_timeout_ms and tick_interval_ms must be positive",
            ));
        }
        for (name, value) in [
            ("session_timeout_ms", self.session_timeout_ms),
            ("rebalance_timeout_ms", self.rebalance_timeout_ms),
        ] {
            if i32::try_from(value).is_err() {
                return Err(KafkaError::configuration(format!(
                    "{} must fit in a 32-bit signed integer, got {}",
                    name, value
                )));
            }
        }
        if let Some(sasl) = &self.sasl {
            if sasl.mechanism != "PLAIN" {
                return Err(KafkaError::configuration(format!(
                    "unsupported SASL mechanism `{}`",
                    sasl.mechanism
                )));
            }
        }
        Ok(())
    }

    /// Bootstrap brokers as `(host, port)` pairs.
    pub fn bootstrap_brokers(&self) -> Result<Vec<(String, i32)>> {
        self.metadata_broker_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
                    KafkaError::configuration(format!("broker `{}` has no port", entry))
                })?;
                let port = port.parse::<i32>().map_err(|_| {
                    KafkaError::configuration(format!("broker `{}` has an invalid port", entry))
                })?;
                Ok((host.to_string(), port))
            })
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .unwrap_or(self.session_timeout_ms / 3),
        )
    }
}

/// Chained construction of a [`ConsumerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.metadata_broker_list = brokers.into();
        self
    }

    pub fn broker_version(mut self, version: impl Into<String>) -> Self {
        self.config.broker_version = version.into();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topics.push(topic.into());
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn fetch_interval(mut self, interval: Duration) -> Self {
        self.config.fetch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.offset_reset = reset;
        self
    }

    pub fn consume_mode(mut self, mode: ConsumeMode) -> Self {
        self.config.consume_mode = mode;
        self
    }

    pub fn sasl_plain(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.sasl = Some(SaslConfig {
            mechanism: default_sasl_mechanism(),
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Validate and return the settings.
    pub fn build(self) -> Result<ConsumerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn valid() -> ConsumerConfigBuilder {
        ConsumerConfig::builder()
            .brokers("127.0.0.1:9092,broker-2:9093")
            .group_id("group")
            .topic("test")
    }

    #[test]
    fn test_builder_defaults() {
        let config = valid().build().unwrap();
        assert_eq!(config.commit_interval_ms, 2_000);
        assert_eq!(config.fetch_interval_ms, 100);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(10_000));
        assert_eq!(
            config.bootstrap_brokers().unwrap(),
            vec![("127.0.0.1".to_string(), 9092), ("broker-2".to_string(), 9093)]
        );
    }

    #[test]
    fn test_missing_required_settings() {
        let err = ConsumerConfig::builder().group_id("g").topic("t").build();
        assert_matches!(err, Err(KafkaError::ConfigurationError(msg)) if msg.contains("metadata_broker_list"));

        let err = ConsumerConfig::builder().brokers("h:1").topic("t").build();
        assert_matches!(err, Err(KafkaError::ConfigurationError(msg)) if msg.contains("group_id"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_matches!(valid().topic("bad topic").build(), Err(KafkaError::ConfigurationError(_)));
        assert_matches!(valid().brokers("nohost").build(), Err(KafkaError::ConfigurationError(_)));
        assert_matches!(
            valid().broker_version("latest").build(),
            Err(KafkaError::ConfigurationError(_))
        );
        let mut config = valid().build().unwrap();
        config.sasl = Some(SaslConfig {
            mechanism: "SCRAM-SHA-256".into(),
            username: "u".into(),
            password: "p".into(),
        });
        assert_matches!(config.validate(), Err(KafkaError::ConfigurationError(_)));
    }

    #[test]
    fn test_rejects_timeouts_beyond_wire_range() {
        let mut config = valid().build().unwrap();
        config.rebalance_timeout_ms = i32::MAX as u64 + 1;
        assert_matches!(
            config.validate(),
            Err(KafkaError::ConfigurationError(msg)) if msg.contains("rebalance_timeout_ms")
        );

        let mut config = valid().build().unwrap();
        config.session_timeout_ms = u64::MAX;
        assert_matches!(
            config.validate(),
            Err(KafkaError::ConfigurationError(msg)) if msg.contains("session_timeout_ms")
        );
    }

    #[test]
    fn test_from_json() {
        let config = ConsumerConfig::from_json(
            r#"{
                "metadata_broker_list": "127.0.0.1:9092",
                "group_id": "g",
                "topics": ["test"],
                "offset_reset": "earliest",
                "consume_mode": "after_commit",
                "sasl": {"username": "u", "password": "p"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.offset_reset, OffsetReset::Earliest);
        assert_eq!(config.consume_mode, ConsumeMode::AfterCommit);
        assert_eq!(config.sasl.unwrap().mechanism, "PLAIN");
    }

    #[test]
    fn test_from_json_rejects_unknown_options() {
        let err = ConsumerConfig::from_json(
            r#"{"metadata_broker_list": "h:1", "group_id": "g", "topics": ["t"], "groupId": "x"}"#,
        );
        assert_matches!(err, Err(KafkaError::ConfigurationError(msg)) if msg.contains("groupId"));
    }
}
