//! Per-step scheduling for the coordination pipeline.
//!
//! ```text
//! METADATA -> GET_COORDINATOR -> JOIN_GROUP -> SYNC_GROUP -> HEARTBEAT
//!                                                         -> OFFSET
//!                                                         -> FETCH_OFFSET -> FETCH
//!                                                                         -> COMMIT
//! ```
//!
//! A step fires when it is `Started`, its due time has passed and its prerequisite has
//! finished at least once in the current cycle.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ConsumerConfig;
use crate::transport::ConnectionId;

/// Slack on top of the rebalance timeout before an unanswered JoinGroup is retried.
const JOIN_GROUP_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Metadata,
    GetCoordinator,
    JoinGroup,
    SyncGroup,
    Heartbeat,
    Offset,
    FetchOffset,
    Fetch,
    Commit,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::Metadata,
        Step::GetCoordinator,
        Step::JoinGroup,
        Step::SyncGroup,
        Step::Heartbeat,
        Step::Offset,
        Step::FetchOffset,
        Step::Fetch,
        Step::Commit,
    ];

    pub fn prerequisite(self) -> Option<Step> {
        match self {
            Step::Metadata => None,
            Step::GetCoordinator => Some(Step::Metadata),
            Step::JoinGroup => Some(Step::GetCoordinator),
            Step::SyncGroup => Some(Step::JoinGroup),
            Step::Heartbeat | Step::Offset | Step::FetchOffset => Some(Step::SyncGroup),
            Step::Fetch | Step::Commit => Some(Step::FetchOffset),
        }
    }

    /// One-shot steps run once per generation; the others re-arm on their interval.
    pub fn is_one_shot(self) -> bool {
        matches!(self, Step::GetCoordinator | Step::JoinGroup | Step::SyncGroup)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Metadata => "METADATA",
            Step::GetCoordinator => "GET_COORDINATOR",
            Step::JoinGroup => "JOIN_GROUP",
            Step::SyncGroup => "SYNC_GROUP",
            Step::Heartbeat => "HEARTBEAT",
            Step::Offset => "OFFSET",
            Step::FetchOffset => "FETCH_OFFSET",
            Step::Fetch => "FETCH",
            Step::Commit => "COMMIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Stopped,
    Started,
    InFlight,
}

#[derive(Debug, Clone)]
struct StepState {
    status: StepStatus,
    finished: bool,
    interval: Duration,
    due: Instant,
    pending: HashSet<ConnectionId>,
    deadline: Option<Instant>,
}

impl StepState {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            status: StepStatus::Stopped,
            finished: false,
            interval,
            due: now,
            pending: HashSet::new(),
            deadline: None,
        }
    }

    fn reset(&mut self) {
        self.status = StepStatus::Stopped;
        self.finished = false;
        self.pending.clear();
        self.deadline = None;
    }
}

#[derive(Debug, Clone)]
pub struct StateTable {
    steps: Vec<StepState>,
    request_timeout: Duration,
    join_timeout: Duration,
}

impl StateTable {
    /// Every step stopped except `Metadata`, which is due immediately, and
    /// `GetCoordinator`, which waits for it.
    pub fn new(config: &ConsumerConfig, now: Instant) -> Self {
        let millis = Duration::from_millis;
        let interval = |step: Step| match step {
            Step::Metadata => millis(config.metadata_refresh_interval_ms),
            Step::Heartbeat => config.heartbeat_interval(),
            Step::Offset => millis(config.offset_interval_ms),
            Step::FetchOffset => millis(config.fetch_offset_interval_ms),
            Step::Fetch => millis(config.fetch_interval_ms),
            Step::Commit => millis(config.commit_interval_ms),
            Step::GetCoordinator | Step::JoinGroup | Step::SyncGroup => Duration::ZERO,
        };
        let steps = Step::ALL
            .iter()
            .map(|step| StepState::new(interval(*step), now))
            .collect();
        let request_timeout = millis(config.request_timeout_ms);
        let mut table = Self {
            steps,
            request_timeout,
            // the broker may hold a JoinGroup until the rebalance completes
            join_timeout: request_timeout
                .max(millis(config.rebalance_timeout_ms) + JOIN_GROUP_MARGIN),
        };
        table.start(Step::Metadata, now);
        table.start(Step::GetCoordinator, now);
        table
    }

    fn get(&self, step: Step) -> &StepState {
        &self.steps[step.index()]
    }

    fn get_mut(&mut self, step: Step) -> &mut StepState {
        &mut self.steps[step.index()]
    }

    pub fn status(&self, step: Step) -> StepStatus {
        self.get(step).status
    }

    pub fn is_finished(&self, step: Step) -> bool {
        self.get(step).finished
    }

    pub fn interval(&self, step: Step) -> Duration {
        self.get(step).interval
    }

    pub fn pending(&self, step: Step) -> usize {
        self.get(step).pending.len()
    }

    /// Arm `step` to fire on the next tick.
    pub fn start(&mut self, step: Step, now: Instant) {
        self.schedule(step, now);
    }

    pub fn schedule(&mut self, step: Step, at: Instant) {
        let state = self.get_mut(step);
        state.status = StepStatus::Started;
        state.due = at;
        state.pending.clear();
        state.deadline = None;
    }

    pub fn stop(&mut self, step: Step) {
        let state = self.get_mut(step);
        state.status = StepStatus::Stopped;
        state.pending.clear();
        state.deadline = None;
    }

    pub fn ready(&self, step: Step, now: Instant) -> bool {
        let state = self.get(step);
        state.status == StepStatus::Started
            && state.due <= now
            && step.prerequisite().map_or(true, |p| self.is_finished(p))
    }

    /// How long an in-flight `step` may wait for its responses.
    pub fn timeout(&self, step: Step) -> Duration {
        match step {
            Step::JoinGroup => self.join_timeout,
            _ => self.request_timeout,
        }
    }

    /// Mark `step` in flight, awaiting one response per connection in `connections`.
    pub fn begin(&mut self, step: Step, connections: HashSet<ConnectionId>, now: Instant) {
        let deadline = now + self.timeout(step);
        let state = self.get_mut(step);
        state.status = StepStatus::InFlight;
        state.pending = connections;
        state.deadline = Some(deadline);
    }

    /// Record one fanned-out response. Returns true when it was the last one outstanding.
    pub fn complete(&mut self, step: Step, connection: ConnectionId) -> bool {
        let state = self.get_mut(step);
        if state.status != StepStatus::InFlight {
            return false;
        }
        state.pending.remove(&connection);
        state.pending.is_empty()
    }

    /// Drop `connection` from every in-flight step and return the steps it was blocking.
    pub fn drop_connection(&mut self, connection: ConnectionId) -> Vec<Step> {
        Step::ALL
            .iter()
            .copied()
            .filter(|step| {
                let state = self.get_mut(*step);
                state.status == StepStatus::InFlight && state.pending.remove(&connection)
            })
            .collect()
    }

    /// In-flight steps whose watchdog deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<Step> {
        Step::ALL
            .iter()
            .copied()
            .filter(|step| {
                let state = self.get(*step);
                state.status == StepStatus::InFlight
                    && state.deadline.map_or(false, |deadline| deadline <= now)
            })
            .collect()
    }

    /// Successful completion: one-shot steps stop, the others re-arm on their interval.
    pub fn finish(&mut self, step: Step, now: Instant) {
        self.get_mut(step).finished = true;
        if step.is_one_shot() {
            self.stop(step);
        } else {
            let interval = self.interval(step);
            self.schedule(step, now + interval);
        }
    }

    /// Try `step` again after `delay` without changing its finished flag.
    pub fn retry(&mut self, step: Step, now: Instant, delay: Duration) {
        self.schedule(step, now + delay);
    }

    /// Restart from coordinator discovery. With `refresh_metadata` the metadata step is
    /// forced to run again before discovery.
    pub fn restart(&mut self, now: Instant, refresh_metadata: bool) {
        for step in Step::ALL.iter().skip(1) {
            self.get_mut(*step).reset();
        }
        if refresh_metadata {
            self.get_mut(Step::Metadata).finished = false;
            self.start(Step::Metadata, now);
        } else if self.status(Step::Metadata) == StepStatus::InFlight {
            // its connection is being closed
            self.start(Step::Metadata, now);
        }
        self.start(Step::GetCoordinator, now);
    }

    /// Rejoin the group with the coordinator already known.
    pub fn rejoin(&mut self, now: Instant) {
        for step in Step::ALL.iter().skip(3) {
            self.get_mut(*step).reset();
        }
        self.get_mut(Step::JoinGroup).reset();
        self.start(Step::JoinGroup, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(now: Instant) -> StateTable {
        StateTable::new(&ConsumerConfig::default(), now)
    }

    fn finish_chain(table: &mut StateTable, now: Instant) {
        for step in [Step::Metadata, Step::GetCoordinator, Step::JoinGroup, Step::SyncGroup] {
            table.begin(step, HashSet::from([1]), now);
            assert!(table.complete(step, 1));
            table.finish(step, now);
        }
    }

    #[test]
    fn test_initial_table() {
        let now = Instant::now();
        let table = table(now);
        assert!(table.ready(Step::Metadata, now));
        assert_eq!(table.status(Step::GetCoordinator), StepStatus::Started);
        assert!(!table.ready(Step::GetCoordinator, now));
        assert_eq!(table.status(Step::Fetch), StepStatus::Stopped);
    }

    #[test]
    fn test_prerequisite_gates_firing() {
        let now = Instant::now();
        let mut table = table(now);
        table.begin(Step::Metadata, HashSet::from([1]), now);
        assert!(table.complete(Step::Metadata, 1));
        table.finish(Step::Metadata, now);
        assert!(table.ready(Step::GetCoordinator, now));
        assert_eq!(table.status(Step::Metadata), StepStatus::Started);
        assert!(!table.ready(Step::Metadata, now));
        assert!(table.ready(Step::Metadata, now + table.interval(Step::Metadata)));
    }

    #[test]
    fn test_fan_out_completes_on_last_response() {
        let now = Instant::now();
        let mut table = table(now);
        table.begin(Step::Fetch, HashSet::from([1, 2]), now);
        assert!(!table.complete(Step::Fetch, 2));
        assert_eq!(table.pending(Step::Fetch), 1);
        assert!(table.complete(Step::Fetch, 1));
    }

    #[test]
    fn test_one_shot_steps_stop_when_finished() {
        let now = Instant::now();
        let mut table = table(now);
        finish_chain(&mut table, now);
        assert_eq!(table.status(Step::SyncGroup), StepStatus::Stopped);
        assert!(table.is_finished(Step::SyncGroup));
    }

    #[test]
    fn test_join_group_waits_for_the_rebalance() {
        let now = Instant::now();
        let config = ConsumerConfig {
            request_timeout_ms: 30_000,
            rebalance_timeout_ms: 60_000,
            ..ConsumerConfig::default()
        };
        let mut table = StateTable::new(&config, now);
        assert_eq!(table.timeout(Step::Heartbeat), Duration::from_secs(30));
        assert_eq!(table.timeout(Step::JoinGroup), Duration::from_secs(65));

        table.begin(Step::JoinGroup, HashSet::from([2]), now);
        assert!(table.expired(now + Duration::from_secs(45)).is_empty());
        assert_eq!(
            table.expired(now + Duration::from_secs(65)),
            vec![Step::JoinGroup]
        );
    }

    #[test]
    fn test_watchdog_and_dropped_connections() {
        let now = Instant::now();
        let mut table = table(now);
        table.begin(Step::Metadata, HashSet::from([4]), now);
        assert!(table.expired(now).is_empty());
        let late = now + Duration::from_millis(ConsumerConfig::default().request_timeout_ms);
        assert_eq!(table.expired(late), vec![Step::Metadata]);
        assert_eq!(table.drop_connection(4), vec![Step::Metadata]);
        assert!(table.drop_connection(4).is_empty());
    }

    #[test]
    fn test_rejoin_keeps_coordinator() {
        let now = Instant::now();
        let mut table = table(now);
        finish_chain(&mut table, now);
        table.start(Step::Fetch, now);
        table.rejoin(now);
        assert!(table.is_finished(Step::GetCoordinator));
        assert!(!table.is_finished(Step::SyncGroup));
        assert_eq!(table.status(Step::JoinGroup), StepStatus::Started);
        assert_eq!(table.status(Step::Fetch), StepStatus::Stopped);
        assert!(table.ready(Step::JoinGroup, now));
    }

    #[test]
    fn test_restart_with_metadata_refresh() {
        let now = Instant::now();
        let mut table = table(now);
        finish_chain(&mut table, now);
        table.restart(now, true);
        assert!(!table.is_finished(Step::Metadata));
        assert!(table.ready(Step::Metadata, now));
        assert_eq!(table.status(Step::GetCoordinator), StepStatus::Started);
        assert!(!table.ready(Step::GetCoordinator, now));

        finish_chain(&mut table, now);
        table.restart(now, false);
        assert!(table.ready(Step::GetCoordinator, now));
    }
}
