//! Broker list and topic/partition leadership.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::protocol::{BrokerEndpoint, ErrorCode, MetadataResponse};
use crate::Result;

/// Source of broker endpoints and partition ownership.
pub trait MetadataProvider {
    fn list_brokers(&self) -> Vec<BrokerEndpoint>;
    fn partition_leader(&self, topic: &str, partition: i32) -> Option<i32>;
}

/// Leader node per partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLeaders {
    pub name: String,
    pub leaders: BTreeMap<i32, i32>,
}

/// Last-known cluster layout, replaced wholesale by every metadata response.
#[derive(Debug, Clone, Default)]
pub struct ClusterDirectory {
    brokers: BTreeMap<i32, BrokerEndpoint>,
    topics: Vec<TopicLeaders>,
    loaded: bool,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the layout from a metadata response. Returns whether anything changed.
    pub fn apply_metadata(&mut self, response: &MetadataResponse) -> bool {
        let brokers: BTreeMap<i32, BrokerEndpoint> = response
            .brokers
            .iter()
            .map(|b| (b.node_id, b.clone()))
            .collect();

        let mut topics = Vec::with_capacity(response.topics.len());
        for topic in &response.topics {
            let code = ErrorCode::from_i16(topic.error_code);
            if !code.is_ok() {
                warn!(
                    topic = %topic.name,
                    error_code = topic.error_code,
                    "skipping topic metadata: {}",
                    code.description()
                );
                continue;
            }
            let mut leaders = BTreeMap::new();
            for partition in &topic.partitions {
                if partition.leader < 0 {
                    warn!(
                        topic = %topic.name,
                        partition = partition.partition,
                        "skipping partition without a leader"
                    );
                    continue;
                }
                leaders.insert(partition.partition, partition.leader);
            }
            topics.push(TopicLeaders {
                name: topic.name.clone(),
                leaders,
            });
        }

        let changed = !self.loaded || brokers != self.brokers || topics != self.topics;
        if changed {
            debug!(
                brokers = brokers.len(),
                topics = topics.len(),
                "cluster metadata changed"
            );
        }
        self.brokers = brokers;
        self.topics = topics;
        self.loaded = true;
        changed
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn lookup_leader(&self, topic: &str, partition: i32) -> Option<i32> {
        self.topics
            .iter()
            .find(|t| t.name == topic)
            .and_then(|t| t.leaders.get(&partition).copied())
    }

    pub fn broker(&self, node_id: i32) -> Option<&BrokerEndpoint> {
        self.brokers.get(&node_id)
    }

    pub fn broker_ids(&self) -> Vec<i32> {
        self.brokers.keys().copied().collect()
    }

    /// Topics in the order the broker listed them.
    pub fn topics(&self) -> &[TopicLeaders] {
        &self.topics
    }
}

impl MetadataProvider for ClusterDirectory {
    fn list_brokers(&self) -> Vec<BrokerEndpoint> {
        self.brokers.values().cloned().collect()
    }

    fn partition_leader(&self, topic: &str, partition: i32) -> Option<i32> {
        self.lookup_leader(topic, partition)
    }
}

/// Bootstrap brokers from settings, used until the first metadata response arrives.
///
/// Entries get negative node ids so they never collide with real broker ids.
#[derive(Debug, Clone)]
pub struct StaticBrokerList {
    brokers: Vec<BrokerEndpoint>,
}

impl StaticBrokerList {
    pub fn new(brokers: Vec<(String, i32)>) -> Self {
        let brokers = brokers
            .into_iter()
            .enumerate()
            .map(|(i, (host, port))| BrokerEndpoint::new(-(i as i32) - 1, host, port))
            .collect();
        Self { brokers }
    }

    pub fn from_config(config: &crate::config::ConsumerConfig) -> Result<Self> {
        Ok(Self::new(config.bootstrap_brokers()?))
    }
}

impl MetadataProvider for StaticBrokerList {
    fn list_brokers(&self) -> Vec<BrokerEndpoint> {
        self.brokers.clone()
    }

    fn partition_leader(&self, _topic: &str, _partition: i32) -> Option<i32> {
        None
    }
}
