//! Consumer-group coordination.
//!
//! [`CoordinationMachine`] is sans-IO: it is advanced by [`CoordinationMachine::tick`] and
//! [`CoordinationMachine::handle_event`], writes requests through the
//! [`ConnectionRegistry`] and never awaits. One task owns it, so group and cluster state
//! have a single writer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::state::{StateTable, Step, StepStatus};
use crate::assignment::{assign_partitions_round_robin, GroupAssignment, TopicPartition};
use crate::cluster::{ClusterDirectory, MetadataProvider, StaticBrokerList};
use crate::config::{ConsumeMode, ConsumerConfig};
use crate::connection::{BrokerKey, ConnectionRegistry, ConnectionRole};
use crate::error::KafkaError;
use crate::protocol::fetch::{FetchPartitionRequest, FetchTopicRequest};
use crate::protocol::group::{
    ConsumerProtocolMetadata, GroupProtocol, SyncGroupAssignment, CONSUMER_PROTOCOL_TYPE,
    DEFAULT_ASSIGNMENT_PROTOCOL,
};
use crate::protocol::offset::{
    OffsetCommitPartition, OffsetCommitTopic, OffsetFetchTopic, OffsetPartitionRequest,
    OffsetTopicRequest, LATEST_TIME,
};
use crate::protocol::{
    self, ApiKey, BrokerEndpoint, Codec, ErrorCategory, ErrorCode, FetchRequest, FetchResponse,
    GroupCoordinatorRequest, GroupCoordinatorResponse, HeartbeatRequest, HeartbeatResponse,
    JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest, MetadataRequest, MetadataResponse,
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse,
    OffsetRequest, OffsetResponse, Request, Response, SyncGroupRequest, SyncGroupResponse,
};
use crate::transport::{ConnectionId, Transport, TransportEvent};
use crate::Result;

/// Segment offsets asked for per partition; the first answer is the high-water mark and the
/// last the earliest offset.
const OFFSET_PROBE_COUNT: i32 = 10_000;

/// One record handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub key: Bytes,
    pub value: Bytes,
}

/// Receives consumed records, in fetch order per partition.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSink: Send {
    fn on_message(&mut self, message: ConsumedMessage);
}

impl<F> MessageSink for F
where
    F: FnMut(ConsumedMessage) + Send,
{
    fn on_message(&mut self, message: ConsumedMessage) {
        self(message)
    }
}

/// Where a broker error was reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub step: Step,
    pub partition: Option<TopicPartition>,
}

impl ErrorContext {
    pub fn step(step: Step) -> Self {
        Self {
            step,
            partition: None,
        }
    }

    pub fn partition(step: Step, partition: TopicPartition) -> Self {
        Self {
            step,
            partition: Some(partition),
        }
    }
}

/// What [`CoordinationMachine::state_convert`] did about an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Metadata refresh and restart from coordinator discovery.
    Restarted,
    /// Rejoin with the known coordinator.
    Rejoined,
    /// The consumer position of one partition was moved.
    PositionReset,
    /// Logged only.
    Ignored,
}

impl Recovery {
    /// Whether the rest of the response belongs to a cycle that no longer exists.
    pub fn aborts_cycle(self) -> bool {
        matches!(self, Recovery::Restarted | Recovery::Rejoined)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    step: Step,
    api_key: ApiKey,
}

pub struct CoordinationMachine {
    config: ConsumerConfig,
    codec: Codec,
    registry: ConnectionRegistry,
    bootstrap: StaticBrokerList,
    directory: ClusterDirectory,
    group: GroupAssignment,
    states: StateTable,
    sink: Box<dyn MessageSink>,
    in_flight: HashMap<(ConnectionId, i32), PendingRequest>,
    correlation_id: i32,
    coordinator: Option<BrokerEndpoint>,
    leader_assignment: Vec<SyncGroupAssignment>,
    /// Fetched in after-commit mode, held until the broker acknowledges a commit covering
    /// their offsets.
    batch: Vec<ConsumedMessage>,
    /// Offsets carried by the outstanding OffsetCommit request.
    commit_in_flight: HashMap<TopicPartition, i64>,
    stopped: bool,
}

impl CoordinationMachine {
    pub fn new(
        config: ConsumerConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        sink: Box<dyn MessageSink>,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Codec::new(config.client_id.clone(), &config.broker_version)?;
        let bootstrap = StaticBrokerList::from_config(&config)?;
        let states = StateTable::new(&config, now);
        Ok(Self {
            config,
            codec,
            registry: ConnectionRegistry::new(transport, events),
            bootstrap,
            directory: ClusterDirectory::new(),
            group: GroupAssignment::new(),
            states,
            sink,
            in_flight: HashMap::new(),
            correlation_id: 0,
            coordinator: None,
            leader_assignment: Vec::new(),
            batch: Vec::new(),
            commit_in_flight: HashMap::new(),
            stopped: false,
        })
    }

    pub fn directory(&self) -> &ClusterDirectory {
        &self.directory
    }

    pub fn group(&self) -> &GroupAssignment {
        &self.group
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn coordinator(&self) -> Option<&BrokerEndpoint> {
        self.coordinator.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    /// Expire overdue requests, then fire every step that is ready.
    pub fn tick(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        for step in self.states.expired(now) {
            warn!(%step, "no response before the request timeout, retrying");
            self.in_flight.retain(|_, pending| pending.step != step);
            self.abandon(step, now);
        }
        for step in Step::ALL {
            if self.states.ready(step, now) {
                self.fire(step, now);
            }
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        if self.stopped {
            trace!("consumer stopped, dropping transport event");
            return;
        }
        match event {
            TransportEvent::Frame { id, frame } => self.on_frame(id, frame, now),
            TransportEvent::Closed { id, reason } => self.on_closed(id, &reason, now),
        }
    }

    /// Apply a decoded response to the request it answers.
    pub fn handle_response(
        &mut self,
        connection: ConnectionId,
        correlation_id: i32,
        response: Response,
        now: Instant,
    ) {
        if self.stopped {
            return;
        }
        let Some(pending) = self.in_flight.remove(&(connection, correlation_id)) else {
            debug!(connection, correlation_id, "response matches no outstanding request");
            return;
        };
        if pending.api_key != response.api_key() {
            error!(
                step = %pending.step,
                expected = ?pending.api_key,
                received = ?response.api_key(),
                "response type does not match its request"
            );
            self.fail_connection(pending.step, connection, now);
            return;
        }
        match response {
            Response::Metadata(r) => self.on_metadata(connection, r, now),
            Response::GroupCoordinator(r) => self.on_group_coordinator(connection, r, now),
            Response::JoinGroup(r) => self.on_join_group(connection, r, now),
            Response::SyncGroup(r) => self.on_sync_group(connection, r, now),
            Response::Heartbeat(r) => self.on_heartbeat(connection, r, now),
            Response::Offset(r) => self.on_offset(connection, r, now),
            Response::OffsetFetch(r) => self.on_fetch_offset(connection, r, now),
            Response::Fetch(r) => self.on_fetch(connection, r, now),
            Response::OffsetCommit(r) => self.on_commit(connection, r, now),
            other => debug!(api_key = ?other.api_key(), "ignoring response"),
        }
    }

    /// Best-effort LeaveGroup, then close every connection. Later events are ignored.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        if !self.group.member_id().is_empty() && self.coordinator.is_some() {
            match self.leave_group() {
                Ok(()) => info!(member_id = %self.group.member_id(), "left consumer group"),
                Err(e) => warn!(error = %e, "could not send LeaveGroup"),
            }
        }
        self.stopped = true;
        self.in_flight.clear();
        self.registry.close_all();
    }

    fn leave_group(&mut self) -> Result<()> {
        let connection = self.coordinator_connection()?;
        let request = Request::LeaveGroup(LeaveGroupRequest {
            group_id: self.config.group_id.clone(),
            member_id: self.group.member_id().to_string(),
        });
        let correlation_id = self.next_correlation_id();
        let frame = self.codec.encode(correlation_id, &request)?;
        self.registry.write(connection, frame)
    }

    /// Route a broker error code to its recovery action.
    pub fn state_convert(&mut self, code: i16, context: &ErrorContext, now: Instant) -> Recovery {
        let error = ErrorCode::from_i16(code);
        match error.category() {
            ErrorCategory::RefreshMetadata => {
                error!(
                    step = %context.step,
                    error_code = code,
                    "{}, refreshing metadata and restarting",
                    error.description()
                );
                self.restart_pipeline(now, true);
                Recovery::Restarted
            }
            ErrorCategory::Rejoin => {
                error!(
                    step = %context.step,
                    error_code = code,
                    "{}, rejoining group",
                    error.description()
                );
                if error == ErrorCode::UnknownMemberId {
                    self.group.reset_member_id();
                }
                self.rejoin(now);
                Recovery::Rejoined
            }
            ErrorCategory::OffsetOutOfRange => {
                let Some(tp) = &context.partition else {
                    warn!(step = %context.step, "offset out of range without a partition");
                    return Recovery::Ignored;
                };
                let policy = self.config.offset_reset;
                match self.group.offsets().reset_target(tp, policy) {
                    Some(offset) => {
                        warn!(
                            topic = %tp.topic,
                            partition = tp.partition,
                            offset,
                            ?policy,
                            "offset out of range, resetting position"
                        );
                        self.group.offsets_mut().reset_position(tp, offset);
                        Recovery::PositionReset
                    }
                    None => {
                        warn!(
                            topic = %tp.topic,
                            partition = tp.partition,
                            ?policy,
                            "offset out of range and no reset offset is known yet"
                        );
                        Recovery::Ignored
                    }
                }
            }
            ErrorCategory::UnsupportedMessageFormat => {
                error!(step = %context.step, error_code = code, "{}", error.description());
                Recovery::Ignored
            }
            ErrorCategory::Other => {
                warn!(step = %context.step, error_code = code, "{}", error.description());
                Recovery::Ignored
            }
        }
    }

    fn restart_pipeline(&mut self, now: Instant, refresh_metadata: bool) {
        self.registry.close_all();
        self.in_flight.clear();
        self.coordinator = None;
        self.group.clear_offsets();
        self.leader_assignment.clear();
        self.batch.clear();
        self.commit_in_flight.clear();
        self.states.restart(now, refresh_metadata);
    }

    fn rejoin(&mut self, now: Instant) {
        if self.coordinator.is_none() {
            self.restart_pipeline(now, false);
            return;
        }
        self.in_flight
            .retain(|_, pending| matches!(pending.step, Step::Metadata | Step::GetCoordinator));
        self.group.clear_offsets();
        self.leader_assignment.clear();
        self.batch.clear();
        self.commit_in_flight.clear();
        self.states.rejoin(now);
    }

    // ---- outbound ----

    fn fire(&mut self, step: Step, now: Instant) {
        let result = match step {
            Step::Metadata => self.send_metadata(now),
            Step::GetCoordinator => self.send_group_coordinator(now),
            Step::JoinGroup => self.send_join_group(now),
            Step::SyncGroup => self.send_sync_group(now),
            Step::Heartbeat => self.send_heartbeat(now),
            Step::Offset => self.send_offset(now),
            Step::FetchOffset => self.send_fetch_offset(now),
            Step::Fetch => self.send_fetch(now),
            Step::Commit => self.send_commit(now),
        };
        if let Err(e) = result {
            if e.is_retryable() {
                debug!(%step, error = %e, "step skipped this cycle");
            } else {
                error!(%step, error = %e, "step failed");
            }
            let backoff = self.retry_backoff();
            self.states.retry(step, now, backoff);
        }
    }

    fn next_correlation_id(&mut self) -> i32 {
        self.correlation_id = if self.correlation_id == i32::MAX {
            1
        } else {
            self.correlation_id + 1
        };
        self.correlation_id
    }

    fn send(&mut self, connection: ConnectionId, step: Step, request: &Request) -> Result<()> {
        let correlation_id = self.next_correlation_id();
        let frame = self.codec.encode(correlation_id, request)?;
        self.registry.write(connection, frame)?;
        trace!(%step, connection, correlation_id, api_key = ?request.api_key(), "request sent");
        self.in_flight.insert(
            (connection, correlation_id),
            PendingRequest {
                step,
                api_key: request.api_key(),
            },
        );
        Ok(())
    }

    fn send_single(
        &mut self,
        step: Step,
        connection: ConnectionId,
        request: Request,
        now: Instant,
    ) -> Result<()> {
        self.send(connection, step, &request)?;
        self.states.begin(step, HashSet::from([connection]), now);
        Ok(())
    }

    /// One request per broker; the step stays in flight until every one is answered.
    fn fan_out(
        &mut self,
        step: Step,
        role: ConnectionRole,
        requests: Vec<(i32, Request)>,
        now: Instant,
    ) -> Result<()> {
        if requests.is_empty() {
            self.finish_step(step, now);
            return Ok(());
        }
        let mut sent = HashSet::new();
        let mut failure = None;
        for (broker, request) in requests {
            let result = self
                .registry
                .get_connection(&BrokerKey::Node(broker), role, &self.directory)
                .and_then(|connection| {
                    self.send(connection, step, &request)?;
                    Ok(connection)
                });
            match result {
                Ok(connection) => {
                    sent.insert(connection);
                }
                Err(e) => {
                    debug!(%step, broker, error = %e, "request not sent");
                    failure.get_or_insert(e);
                }
            }
        }
        if sent.is_empty() {
            return Err(failure.unwrap_or_else(|| KafkaError::connection("no request sent")));
        }
        self.states.begin(step, sent, now);
        Ok(())
    }

    fn coordinator_connection(&mut self) -> Result<ConnectionId> {
        let coordinator = self
            .coordinator
            .clone()
            .ok_or_else(|| KafkaError::connection("group coordinator is not known"))?;
        self.registry
            .connect_endpoint(&coordinator, ConnectionRole::Meta)
    }

    fn send_metadata(&mut self, now: Instant) -> Result<()> {
        let provider: &dyn MetadataProvider =
            if self.directory.is_loaded() && !self.directory.broker_ids().is_empty() {
                &self.directory
            } else {
                &self.bootstrap
            };
        let connection = self
            .registry
            .get_random_connection(ConnectionRole::Meta, provider)?
            .ok_or_else(|| KafkaError::connection("no broker known yet"))?;
        let request = Request::Metadata(MetadataRequest {
            topics: self.config.topics.clone(),
        });
        self.send_single(Step::Metadata, connection, request, now)
    }

    fn send_group_coordinator(&mut self, now: Instant) -> Result<()> {
        let connection = self
            .registry
            .get_random_connection(ConnectionRole::Meta, &self.directory)?
            .ok_or_else(|| KafkaError::connection("no broker known yet"))?;
        let request = Request::GroupCoordinator(GroupCoordinatorRequest {
            group_id: self.config.group_id.clone(),
        });
        self.send_single(Step::GetCoordinator, connection, request, now)
    }

    fn send_join_group(&mut self, now: Instant) -> Result<()> {
        let connection = self.coordinator_connection()?;
        let metadata = ConsumerProtocolMetadata::new(self.config.topics.clone()).to_bytes()?;
        let session_timeout = wire_millis("session_timeout_ms", self.config.session_timeout_ms)?;
        let rebalance_timeout =
            wire_millis("rebalance_timeout_ms", self.config.rebalance_timeout_ms)?;
        let request = Request::JoinGroup(JoinGroupRequest {
            group_id: self.config.group_id.clone(),
            session_timeout,
            rebalance_timeout,
            member_id: self.group.member_id().to_string(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            group_protocols: vec![GroupProtocol {
                name: DEFAULT_ASSIGNMENT_PROTOCOL.to_string(),
                metadata,
            }],
        });
        self.send_single(Step::JoinGroup, connection, request, now)
    }

    fn send_sync_group(&mut self, now: Instant) -> Result<()> {
        let connection = self.coordinator_connection()?;
        let request = Request::SyncGroup(SyncGroupRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.group.generation_id(),
            member_id: self.group.member_id().to_string(),
            group_assignment: self.leader_assignment.clone(),
        });
        self.send_single(Step::SyncGroup, connection, request, now)
    }

    fn send_heartbeat(&mut self, now: Instant) -> Result<()> {
        let connection = self.coordinator_connection()?;
        let request = Request::Heartbeat(HeartbeatRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.group.generation_id(),
            member_id: self.group.member_id().to_string(),
        });
        self.send_single(Step::Heartbeat, connection, request, now)
    }

    fn send_offset(&mut self, now: Instant) -> Result<()> {
        let requests = self
            .group
            .assigned()
            .iter()
            .map(|(broker, topics)| {
                let topics = topics
                    .iter()
                    .map(|(topic, partitions)| OffsetTopicRequest {
                        topic: topic.clone(),
                        partitions: partitions
                            .iter()
                            .map(|p| OffsetPartitionRequest {
                                partition: *p,
                                time: LATEST_TIME,
                                max_offsets: OFFSET_PROBE_COUNT,
                            })
                            .collect(),
                    })
                    .collect();
                (
                    *broker,
                    Request::Offset(OffsetRequest {
                        replica_id: -1,
                        topics,
                    }),
                )
            })
            .collect();
        self.fan_out(Step::Offset, ConnectionRole::Meta, requests, now)
    }

    fn send_fetch_offset(&mut self, now: Instant) -> Result<()> {
        let mut topics: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for tp in self.group.partitions() {
            topics.entry(tp.topic).or_default().push(tp.partition);
        }
        if topics.is_empty() {
            self.finish_step(Step::FetchOffset, now);
            return Ok(());
        }
        let connection = self.coordinator_connection()?;
        let request = Request::OffsetFetch(OffsetFetchRequest {
            group_id: self.config.group_id.clone(),
            topics: topics
                .into_iter()
                .map(|(topic, partitions)| OffsetFetchTopic { topic, partitions })
                .collect(),
        });
        self.send_single(Step::FetchOffset, connection, request, now)
    }

    fn send_fetch(&mut self, now: Instant) -> Result<()> {
        let positions = &self.group.offsets().position;
        let mut requests = Vec::new();
        for (broker, topics) in self.group.assigned() {
            let topics: Vec<FetchTopicRequest> = topics
                .iter()
                .filter_map(|(topic, partitions)| {
                    let partitions: Vec<FetchPartitionRequest> = partitions
                        .iter()
                        .filter_map(|p| {
                            positions
                                .get(&TopicPartition::new(topic.clone(), *p))
                                .map(|offset| FetchPartitionRequest {
                                    partition: *p,
                                    offset: *offset,
                                    max_bytes: self.config.max_bytes,
                                })
                        })
                        .collect();
                    (!partitions.is_empty()).then(|| FetchTopicRequest {
                        topic: topic.clone(),
                        partitions,
                    })
                })
                .collect();
            if !topics.is_empty() {
                requests.push((
                    *broker,
                    Request::Fetch(FetchRequest {
                        replica_id: -1,
                        max_wait_time: self.config.max_wait_time_ms,
                        min_bytes: self.config.min_bytes,
                        topics,
                    }),
                ));
            }
        }
        self.fan_out(Step::Fetch, ConnectionRole::Data, requests, now)
    }

    fn send_commit(&mut self, now: Instant) -> Result<()> {
        let dirty = self.group.offsets().uncommitted();
        if dirty.is_empty() {
            self.finish_step(Step::Commit, now);
            return Ok(());
        }
        let mut topics: BTreeMap<String, Vec<OffsetCommitPartition>> = BTreeMap::new();
        for (tp, offset) in &dirty {
            topics
                .entry(tp.topic.clone())
                .or_default()
                .push(OffsetCommitPartition {
                    partition: tp.partition,
                    offset: *offset,
                    timestamp: -1,
                    metadata: String::new(),
                });
        }
        let connection = self.coordinator_connection()?;
        let request = Request::OffsetCommit(OffsetCommitRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.group.generation_id(),
            member_id: self.group.member_id().to_string(),
            retention_time: self.config.offset_retention_time_ms,
            topics: topics
                .into_iter()
                .map(|(topic, partitions)| OffsetCommitTopic { topic, partitions })
                .collect(),
        });
        self.send_single(Step::Commit, connection, request, now)?;
        self.commit_in_flight = dirty.into_iter().collect();
        Ok(())
    }

    // ---- inbound ----

    fn on_frame(&mut self, connection: ConnectionId, frame: Bytes, now: Instant) {
        let (correlation_id, body) = match protocol::split_response(frame) {
            Ok(parts) => parts,
            Err(e) => {
                error!(connection, error = %e, "malformed response frame");
                return;
            }
        };
        let Some(pending) = self.in_flight.get(&(connection, correlation_id)).copied() else {
            debug!(connection, correlation_id, "response matches no outstanding request");
            return;
        };
        match self.codec.decode(pending.api_key, body) {
            Ok(response) => self.handle_response(connection, correlation_id, response, now),
            Err(e) => {
                self.in_flight.remove(&(connection, correlation_id));
                error!(step = %pending.step, error = %e, "could not decode response");
                self.fail_connection(pending.step, connection, now);
            }
        }
    }

    fn on_closed(&mut self, connection: ConnectionId, reason: &str, now: Instant) {
        if !self.registry.remove(connection) {
            trace!(connection, "closed connection was already forgotten");
        }
        debug!(connection, reason, "connection closed");
        self.in_flight.retain(|(id, _), _| *id != connection);
        for step in self.states.drop_connection(connection) {
            if self.states.pending(step) == 0 {
                self.abandon(step, now);
            }
        }
    }

    /// Treat one fanned-out request as a connection failure.
    fn fail_connection(&mut self, step: Step, connection: ConnectionId, now: Instant) {
        if self.states.complete(step, connection) {
            self.abandon(step, now);
        }
    }

    /// `step` will get no answer; try it again after the backoff.
    fn abandon(&mut self, step: Step, now: Instant) {
        if step == Step::Commit && !self.commit_in_flight.is_empty() {
            debug!(
                partitions = self.commit_in_flight.len(),
                "commit unanswered, offsets will be sent again"
            );
            self.commit_in_flight.clear();
        }
        let backoff = self.retry_backoff();
        self.states.retry(step, now, backoff);
    }

    fn complete_step(&mut self, step: Step, connection: ConnectionId, now: Instant) {
        if self.states.complete(step, connection) {
            self.finish_step(step, now);
        }
    }

    fn finish_step(&mut self, step: Step, now: Instant) {
        self.states.finish(step, now);
        match step {
            Step::FetchOffset => {
                if self.states.status(Step::Fetch) == StepStatus::Stopped
                    && !self.states.is_finished(Step::Fetch)
                {
                    self.states.start(Step::Fetch, now);
                    self.states.start(Step::Commit, now);
                }
            }
            Step::Commit => self.release_acknowledged(),
            _ => {}
        }
    }

    /// Hand the sink every batched message at or below its partition's acknowledged commit.
    fn release_acknowledged(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let acknowledged = &self.group.offsets().precommitted;
        let (ready, held): (Vec<_>, Vec<_>) = self.batch.drain(..).partition(|message| {
            acknowledged
                .get(&TopicPartition::new(message.topic.clone(), message.partition))
                .map_or(false, |committed| message.offset <= *committed)
        });
        self.batch = held;
        for message in ready {
            self.sink.on_message(message);
        }
    }

    /// A whole-response error code.
    fn on_step_error(&mut self, step: Step, connection: ConnectionId, code: i16, now: Instant) {
        let recovery = self.state_convert(code, &ErrorContext::step(step), now);
        if recovery.aborts_cycle() {
            return;
        }
        if step.is_one_shot() {
            self.states.complete(step, connection);
            let backoff = self.retry_backoff();
            self.states.retry(step, now, backoff);
        } else {
            self.complete_step(step, connection, now);
        }
    }

    fn on_metadata(&mut self, connection: ConnectionId, response: MetadataResponse, now: Instant) {
        let first_load = !self.directory.is_loaded();
        let changed = self.directory.apply_metadata(&response);
        self.complete_step(Step::Metadata, connection, now);
        if changed && !first_load {
            info!("cluster metadata changed, restarting coordination");
            self.restart_pipeline(now, false);
        }
    }

    fn on_group_coordinator(
        &mut self,
        connection: ConnectionId,
        response: GroupCoordinatorResponse,
        now: Instant,
    ) {
        if response.error_code != 0 {
            self.on_step_error(Step::GetCoordinator, connection, response.error_code, now);
            return;
        }
        let coordinator =
            BrokerEndpoint::new(response.coordinator_id, response.host, response.port);
        info!(coordinator = %coordinator.address(), node_id = coordinator.node_id, "found group coordinator");
        self.coordinator = Some(coordinator);
        self.complete_step(Step::GetCoordinator, connection, now);
        self.states.start(Step::JoinGroup, now);
    }

    fn on_join_group(&mut self, connection: ConnectionId, response: JoinGroupResponse, now: Instant) {
        if response.error_code != 0 {
            self.on_step_error(Step::JoinGroup, connection, response.error_code, now);
            return;
        }
        self.group.set_member_id(response.member_id.clone());
        self.group.set_generation_id(response.generation_id);
        self.leader_assignment = if response.is_leader() {
            let members: Vec<String> = response
                .members
                .iter()
                .map(|m| m.member_id.clone())
                .collect();
            info!(
                generation_id = response.generation_id,
                members = members.len(),
                "elected group leader, assigning partitions"
            );
            assign_partitions_round_robin(&members, &self.directory)
                .into_iter()
                .map(|(member_id, assignment)| SyncGroupAssignment {
                    member_id,
                    assignment,
                })
                .collect()
        } else {
            Vec::new()
        };
        self.complete_step(Step::JoinGroup, connection, now);
        self.states.start(Step::SyncGroup, now);
    }

    fn on_sync_group(&mut self, connection: ConnectionId, response: SyncGroupResponse, now: Instant) {
        if response.error_code != 0 {
            self.on_step_error(Step::SyncGroup, connection, response.error_code, now);
            return;
        }
        self.group.rebuild(&response.assignment, &self.directory);
        info!(
            member_id = %self.group.member_id(),
            generation_id = self.group.generation_id(),
            partitions = response.assignment.partition_count(),
            "joined consumer group"
        );
        self.complete_step(Step::SyncGroup, connection, now);
        self.states.start(Step::Heartbeat, now);
        self.states.start(Step::Offset, now);
        self.states.start(Step::FetchOffset, now);
    }

    fn on_heartbeat(&mut self, connection: ConnectionId, response: HeartbeatResponse, now: Instant) {
        if response.error_code != 0 {
            self.on_step_error(Step::Heartbeat, connection, response.error_code, now);
            return;
        }
        self.complete_step(Step::Heartbeat, connection, now);
    }

    fn on_offset(&mut self, connection: ConnectionId, response: OffsetResponse, now: Instant) {
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    let context = ErrorContext::partition(Step::Offset, tp);
                    if self
                        .state_convert(partition.error_code, &context, now)
                        .aborts_cycle()
                    {
                        return;
                    }
                    continue;
                }
                let offsets = self.group.offsets_mut();
                if let Some(high) = partition.offsets.first() {
                    offsets.baseline.entry(tp.clone()).or_insert(*high);
                }
                if let Some(low) = partition.offsets.last() {
                    offsets.known.insert(tp, *low);
                }
            }
        }
        self.complete_step(Step::Offset, connection, now);
    }

    fn on_fetch_offset(
        &mut self,
        connection: ConnectionId,
        response: OffsetFetchResponse,
        now: Instant,
    ) {
        let policy = self.config.offset_reset;
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    let context = ErrorContext::partition(Step::FetchOffset, tp);
                    if self
                        .state_convert(partition.error_code, &context, now)
                        .aborts_cycle()
                    {
                        return;
                    }
                    continue;
                }
                let offsets = self.group.offsets_mut();
                if offsets.position.contains_key(&tp) {
                    continue;
                }
                let committed = partition.offset;
                let start = if committed >= 0 {
                    Some(committed + 1)
                } else {
                    offsets.reset_target(&tp, policy)
                };
                match start {
                    Some(position) => {
                        debug!(
                            topic = %tp.topic,
                            partition = tp.partition,
                            committed,
                            position,
                            "seeded consumer position"
                        );
                        if committed >= 0 {
                            offsets.pending_commit.insert(tp.clone(), committed);
                            offsets.precommitted.insert(tp.clone(), committed);
                        }
                        offsets.position.insert(tp, position);
                    }
                    None => debug!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        "nothing committed and no reset offset yet"
                    ),
                }
            }
        }
        self.complete_step(Step::FetchOffset, connection, now);
    }

    fn on_fetch(&mut self, connection: ConnectionId, response: FetchResponse, now: Instant) {
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    let context = ErrorContext::partition(Step::Fetch, tp);
                    if self
                        .state_convert(partition.error_code, &context, now)
                        .aborts_cycle()
                    {
                        return;
                    }
                    continue;
                }
                for message in partition.messages {
                    let position = self.group.offsets().position.get(&tp).copied();
                    if position.map_or(false, |position| message.offset < position) {
                        continue;
                    }
                    self.group.offsets_mut().advance(&tp, message.offset);
                    let consumed = ConsumedMessage {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: message.offset,
                        timestamp: message.timestamp,
                        key: message.key,
                        value: message.value,
                    };
                    match self.config.consume_mode {
                        ConsumeMode::BeforeCommit => self.sink.on_message(consumed),
                        ConsumeMode::AfterCommit => self.batch.push(consumed),
                    }
                }
            }
        }
        self.complete_step(Step::Fetch, connection, now);
    }

    fn on_commit(&mut self, connection: ConnectionId, response: OffsetCommitResponse, now: Instant) {
        let mut sent = std::mem::take(&mut self.commit_in_flight);
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                let offset = sent.remove(&tp);
                if partition.error_code == 0 {
                    if let Some(offset) = offset {
                        self.group.offsets_mut().precommitted.insert(tp, offset);
                    }
                    continue;
                }
                let context = ErrorContext::partition(Step::Commit, tp);
                if self
                    .state_convert(partition.error_code, &context, now)
                    .aborts_cycle()
                {
                    return;
                }
            }
        }
        if !sent.is_empty() {
            debug!(partitions = sent.len(), "commit response left partitions unacknowledged");
        }
        self.complete_step(Step::Commit, connection, now);
    }
}

fn wire_millis(name: &str, millis: u64) -> Result<i32> {
    i32::try_from(millis).map_err(|_| {
        KafkaError::configuration(format!("{} of {}ms does not fit the wire format", name, millis))
    })
}
