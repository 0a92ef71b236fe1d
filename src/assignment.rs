//! Group membership and per-partition offset bookkeeping.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::cluster::ClusterDirectory;
use crate::config::OffsetReset;
use crate::protocol::MemberAssignment;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// The offset maps kept for every assigned partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetState {
    /// Earliest offset still held by the log.
    pub known: HashMap<TopicPartition, i64>,
    /// High-water mark at the time offsets were first fetched.
    pub baseline: HashMap<TopicPartition, i64>,
    /// Next offset to fetch.
    pub position: HashMap<TopicPartition, i64>,
    /// Last consumed offset, waiting to be committed.
    pub pending_commit: HashMap<TopicPartition, i64>,
    /// Last offset the broker acknowledged as committed.
    pub precommitted: HashMap<TopicPartition, i64>,
}

impl OffsetState {
    pub fn clear(&mut self) {
        self.known.clear();
        self.baseline.clear();
        self.position.clear();
        self.pending_commit.clear();
        self.precommitted.clear();
    }

    /// Record a consumed message. Both maps only grow, so fetch responses from different
    /// brokers may be applied in any order.
    pub fn advance(&mut self, tp: &TopicPartition, offset: i64) {
        let position = self.position.entry(tp.clone()).or_insert(offset + 1);
        *position = (*position).max(offset + 1);
        let pending = self.pending_commit.entry(tp.clone()).or_insert(offset);
        *pending = (*pending).max(offset);
    }

    /// Overwrite the fetch position of one partition.
    pub fn reset_position(&mut self, tp: &TopicPartition, offset: i64) {
        self.position.insert(tp.clone(), offset);
    }

    /// Where `policy` restarts `tp`, if the needed offset is known.
    pub fn reset_target(&self, tp: &TopicPartition, policy: OffsetReset) -> Option<i64> {
        match policy {
            OffsetReset::Latest => self.baseline.get(tp).copied(),
            OffsetReset::Earliest => self.known.get(tp).copied(),
        }
    }

    /// Partitions whose pending commit differs from what was last sent.
    pub fn uncommitted(&self) -> Vec<(TopicPartition, i64)> {
        let mut dirty: Vec<_> = self
            .pending_commit
            .iter()
            .filter(|(tp, offset)| self.precommitted.get(*tp) != Some(*offset))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        dirty.sort();
        dirty
    }
}

/// This member's view of the group: identity, generation and owned partitions.
#[derive(Debug, Clone, Default)]
pub struct GroupAssignment {
    member_id: String,
    generation_id: i32,
    /// broker id -> topic -> partitions
    assigned: BTreeMap<i32, BTreeMap<String, Vec<i32>>>,
    offsets: OffsetState,
}

impl GroupAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn set_member_id(&mut self, member_id: impl Into<String>) {
        self.member_id = member_id.into();
    }

    pub fn reset_member_id(&mut self) {
        self.member_id.clear();
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub fn set_generation_id(&mut self, generation_id: i32) {
        self.generation_id = generation_id;
    }

    pub fn assigned(&self) -> &BTreeMap<i32, BTreeMap<String, Vec<i32>>> {
        &self.assigned
    }

    /// Rebuild the per-broker map from a SyncGroup assignment.
    pub fn rebuild(&mut self, assignment: &MemberAssignment, directory: &ClusterDirectory) {
        self.assigned.clear();
        for topic in &assignment.topics {
            for &partition in &topic.partitions {
                match directory.lookup_leader(&topic.topic, partition) {
                    Some(leader) => self
                        .assigned
                        .entry(leader)
                        .or_default()
                        .entry(topic.topic.clone())
                        .or_default()
                        .push(partition),
                    None => warn!(
                        topic = %topic.topic,
                        partition,
                        "assigned partition has no known leader"
                    ),
                }
            }
        }
        for topics in self.assigned.values_mut() {
            for partitions in topics.values_mut() {
                partitions.sort_unstable();
                partitions.dedup();
            }
        }
    }

    pub fn broker_ids(&self) -> Vec<i32> {
        self.assigned.keys().copied().collect()
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut all: Vec<_> = self
            .assigned
            .values()
            .flat_map(|topics| {
                topics.iter().flat_map(|(topic, partitions)| {
                    partitions.iter().map(move |p| TopicPartition::new(topic.clone(), *p))
                })
            })
            .collect();
        all.sort();
        all
    }

    pub fn partitions_on(&self, broker_id: i32) -> Vec<TopicPartition> {
        self.assigned
            .get(&broker_id)
            .map(|topics| {
                topics
                    .iter()
                    .flat_map(|(topic, partitions)| {
                        partitions.iter().map(move |p| TopicPartition::new(topic.clone(), *p))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn offsets(&self) -> &OffsetState {
        &self.offsets
    }

    pub fn offsets_mut(&mut self) -> &mut OffsetState {
        &mut self.offsets
    }

    pub fn clear_offsets(&mut self) {
        self.offsets.clear();
    }
}

/// Leader-side assignment: every partition known to `directory` goes to exactly one member.
///
/// Topics are walked in directory order and partitions in ascending order, with a single
/// counter across all topics choosing the member. Members that receive nothing still get an
/// (empty) entry.
pub fn assign_partitions_round_robin(
    members: &[String],
    directory: &ClusterDirectory,
) -> Vec<(String, MemberAssignment)> {
    let mut result: Vec<(String, MemberAssignment)> = members
        .iter()
        .map(|m| (m.clone(), MemberAssignment::default()))
        .collect();
    if result.is_empty() {
        return result;
    }
    let mut counter = 0usize;
    for topic in directory.topics() {
        for &partition in topic.leaders.keys() {
            let slot = counter % result.len();
            result[slot].1.push(&topic.name, partition);
            counter += 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::metadata::{PartitionMetadata, TopicMetadata};
    use crate::protocol::{BrokerEndpoint, MetadataResponse};
    use std::collections::HashSet;

    fn directory(layout: &[(&str, i32)]) -> ClusterDirectory {
        let response = MetadataResponse {
            brokers: vec![
                BrokerEndpoint::new(0, "127.0.0.1", 9092),
                BrokerEndpoint::new(1, "127.0.0.1", 9093),
            ],
            topics: layout
                .iter()
                .map(|(name, count)| TopicMetadata {
                    error_code: 0,
                    name: name.to_string(),
                    partitions: (0..*count)
                        .map(|p| PartitionMetadata {
                            error_code: 0,
                            partition: p,
                            leader: p % 2,
                            replicas: vec![],
                            isr: vec![],
                        })
                        .collect(),
                })
                .collect(),
        };
        let mut directory = ClusterDirectory::new();
        directory.apply_metadata(&response);
        directory
    }

    #[test]
    fn test_round_robin_is_balanced_and_complete() {
        let directory = directory(&[("a", 5), ("b", 3), ("c", 1)]);
        for n in 1..=6 {
            let members: Vec<String> = (0..n).map(|i| format!("m{}", i)).collect();
            let result = assign_partitions_round_robin(&members, &directory);
            assert_eq!(result.len(), n);

            let counts: Vec<usize> = result.iter().map(|(_, a)| a.partition_count()).collect();
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = counts.iter().min().copied().unwrap_or(0);
            assert!(max - min <= 1, "unbalanced for {} members: {:?}", n, counts);

            let mut seen = HashSet::new();
            for (_, assignment) in &result {
                for topic in &assignment.topics {
                    for p in &topic.partitions {
                        assert!(seen.insert((topic.topic.clone(), *p)));
                    }
                }
            }
            assert_eq!(seen.len(), 9);
        }
    }

    #[test]
    fn test_round_robin_counter_spans_topics() {
        let directory = directory(&[("a", 1), ("b", 1)]);
        let members = vec!["m1".to_string(), "m2".to_string()];
        let result = assign_partitions_round_robin(&members, &directory);
        assert_eq!(result[0].1.topics[0].topic, "a");
        assert_eq!(result[1].1.topics[0].topic, "b");
    }

    #[test]
    fn test_rebuild_groups_by_leader() {
        let directory = directory(&[("t", 4)]);
        let mut assignment = MemberAssignment::default();
        for p in [3, 0, 1, 2] {
            assignment.push("t", p);
        }
        assignment.push("unknown", 0);
        let mut group = GroupAssignment::new();
        group.rebuild(&assignment, &directory);
        assert_eq!(group.broker_ids(), vec![0, 1]);
        assert_eq!(group.assigned()[&0]["t"], vec![0, 2]);
        assert_eq!(group.assigned()[&1]["t"], vec![1, 3]);
        assert_eq!(group.partitions().len(), 4);
        assert_eq!(group.partitions_on(1), vec![TopicPartition::new("t", 1), TopicPartition::new("t", 3)]);
    }

    #[test]
    fn test_advance_is_monotonic_and_order_free() {
        let tp = TopicPartition::new("t", 0);
        let mut forward = OffsetState::default();
        forward.advance(&tp, 4);
        forward.advance(&tp, 9);
        let mut backward = OffsetState::default();
        backward.advance(&tp, 9);
        backward.advance(&tp, 4);
        assert_eq!(forward, backward);
        assert_eq!(forward.position[&tp], 10);
        assert_eq!(forward.pending_commit[&tp], 9);
    }

    #[test]
    fn test_uncommitted_and_reset_target() {
        let tp = TopicPartition::new("t", 0);
        let mut offsets = OffsetState::default();
        offsets.baseline.insert(tp.clone(), 500);
        offsets.known.insert(tp.clone(), 20);
        assert_eq!(offsets.reset_target(&tp, OffsetReset::Latest), Some(500));
        assert_eq!(offsets.reset_target(&tp, OffsetReset::Earliest), Some(20));

        offsets.pending_commit.insert(tp.clone(), 7);
        assert_eq!(offsets.uncommitted(), vec![(tp.clone(), 7)]);
        offsets.precommitted.insert(tp.clone(), 7);
        assert!(offsets.uncommitted().is_empty());

        offsets.clear();
        assert_eq!(offsets, OffsetState::default());
    }
}
