//! The group membership state machine: discover the coordinator broker,
//! join, sync an assignment, heartbeat while stable, and leave.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::allocator::{validate_assignment, AllocatorFn};
use crate::client::error::{Error, Result};
use crate::cluster::Cluster;
use crate::protocol::error::{Error as ApiError, ErrorClass};
use crate::protocol::messages::{
    ConsumerGroupMemberAssignment, ConsumerGroupMemberMetadata, HeartbeatRequest,
    JoinGroupRequest, JoinGroupRequestProtocol, LeaveGroupRequest, SyncGroupRequest,
    SyncGroupRequestAssignment, CONSUMER_PROTOCOL_TYPE,
};
use crate::protocol::primitives::{Int32, NullableBytes, String_};

/// The phases of a group member's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Disconnected,
    Discovering,
    Joining,
    AwaitingSync,
    Stable,
    Rebalancing,
    Leaving,
}

/// What the group session knows while [`GroupPhase::Stable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StableView {
    pub generation_id: i32,
    pub member_id: String,
    pub coordinator_id: i32,

    /// This member's share of the group's partitions.
    pub assignment: BTreeMap<String, Vec<i32>>,
}

/// What consumers observe about the group session.
#[derive(Debug, Clone)]
pub(crate) enum GroupView {
    /// Somewhere between disconnected and stable; fetches and commits wait.
    Connecting,

    Stable(StableView),

    /// The session died beyond recovery.
    Failed(String),
}

/// The partitions and topics a group divides among its members.
///
/// Backed by the coordinator-service shared set, with cluster metadata as
/// the seed; kept as a seam so the state machine can be driven in tests.
#[async_trait]
pub(crate) trait PartitionUniverse: Send + Sync + 'static {
    /// Sorted `"topic:partition"` labels.
    async fn partitions(&self) -> Vec<String>;

    /// Sorted topic names.
    async fn topics(&self) -> Vec<String>;
}

pub(crate) struct GroupConfig {
    pub group: String,
    pub protocol_name: String,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub allocator: AllocatorFn,
}

/// Handle to a running group session.
pub(crate) struct GroupSession {
    view_rx: watch::Receiver<GroupView>,
    phase_rx: watch::Receiver<GroupPhase>,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl GroupSession {
    /// Spawn the state machine driver.
    ///
    /// `membership_changes` carries coordinator-service party updates; any
    /// change short-circuits straight into a new join round instead of
    /// waiting for the broker to fail a heartbeat.
    pub(crate) fn spawn(
        cluster: Arc<Cluster>,
        config: GroupConfig,
        universe: Arc<dyn PartitionUniverse>,
        membership_changes: broadcast::Receiver<Vec<String>>,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(GroupView::Connecting);
        let (phase_tx, phase_rx) = watch::channel(GroupPhase::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            let mut driver = Driver {
                cluster,
                config,
                universe,
                membership_changes,
                view_tx,
                phase_tx,
                shutdown_rx,
                coordinator_id: None,
                member_id: String::new(),
                generation_id: -1,
                pending_join: None,
            };
            driver.run().await;
        });

        Self {
            view_rx,
            phase_rx,
            shutdown_tx,
            driver,
        }
    }

    /// The current phase.
    pub(crate) fn phase(&self) -> GroupPhase {
        *self.phase_rx.borrow()
    }

    /// Wait until the session is stable and return the stable view.
    ///
    /// Operations that must carry a generation call this first, so nothing
    /// is fetched or committed mid-rebalance.
    pub(crate) async fn wait_stable(&self) -> Result<StableView> {
        let mut view_rx = self.view_rx.clone();
        loop {
            match &*view_rx.borrow_and_update() {
                GroupView::Stable(view) => return Ok(view.clone()),
                GroupView::Failed(reason) => return Err(Error::Group(reason.clone())),
                GroupView::Connecting => {}
            }
            if view_rx.changed().await.is_err() {
                return Err(Error::Group("group session terminated".to_owned()));
            }
        }
    }

    /// Leave the group and stop the driver.
    pub(crate) async fn leave(&mut self) {
        self.shutdown_tx.send(true).ok();
        (&mut self.driver).await.ok();
    }
}

impl Drop for GroupSession {
    fn drop(&mut self) {
        // a handle dropped without leave() means the member died; the broker
        // notices via missed heartbeats, peers via the lost party session
        self.driver.abort();
    }
}

struct Driver {
    cluster: Arc<Cluster>,
    config: GroupConfig,
    universe: Arc<dyn PartitionUniverse>,
    membership_changes: broadcast::Receiver<Vec<String>>,
    view_tx: watch::Sender<GroupView>,
    phase_tx: watch::Sender<GroupPhase>,
    shutdown_rx: watch::Receiver<bool>,
    coordinator_id: Option<i32>,
    member_id: String,
    generation_id: i32,
    pending_join: Option<JoinOutcome>,
}

impl Driver {
    fn enter(&self, phase: GroupPhase) {
        debug!(group = self.config.group.as_str(), ?phase, "Group phase transition");
        self.phase_tx.send(phase).ok();
        if phase != GroupPhase::Stable {
            self.view_tx.send(GroupView::Connecting).ok();
        }
    }

    fn fail(&self, reason: String) {
        warn!(group = self.config.group.as_str(), reason = reason.as_str(), "Group session failed");
        self.phase_tx.send(GroupPhase::Disconnected).ok();
        self.view_tx.send(GroupView::Failed(reason)).ok();
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn run(&mut self) {
        self.enter(GroupPhase::Discovering);

        loop {
            if self.shutting_down() {
                self.leave().await;
                return;
            }

            match self.phase() {
                GroupPhase::Discovering => self.discover().await,
                GroupPhase::Joining => self.join().await,
                GroupPhase::AwaitingSync => self.sync().await,
                GroupPhase::Stable => self.stable().await,
                GroupPhase::Rebalancing => self.enter(GroupPhase::Joining),
                GroupPhase::Leaving | GroupPhase::Disconnected => return,
            }
        }
    }

    fn phase(&self) -> GroupPhase {
        *self.phase_tx.borrow()
    }

    async fn discover(&mut self) {
        self.coordinator_id = None;
        match self.cluster.find_coordinator(&self.config.group).await {
            Ok(coordinator_id) => {
                info!(
                    group = self.config.group.as_str(),
                    coordinator_id, "Found group coordinator"
                );
                self.coordinator_id = Some(coordinator_id);
                self.enter(GroupPhase::Joining);
            }
            Err(e) => {
                self.fail(format!("cannot locate group coordinator: {e}"));
            }
        }
    }

    async fn join(&mut self) {
        let Some(coordinator_id) = self.coordinator_id else {
            self.enter(GroupPhase::Discovering);
            return;
        };

        let metadata = ConsumerGroupMemberMetadata {
            version: 0,
            topics: self.universe.topics().await,
            user_data: None,
        };
        let metadata = match metadata.to_bytes() {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail(format!("cannot serialize member metadata: {e}"));
                return;
            }
        };

        let request = JoinGroupRequest {
            group_id: String_(self.config.group.clone()),
            session_timeout_ms: Int32(self.config.session_timeout.as_millis() as i32),
            member_id: String_(self.member_id.clone()),
            protocol_type: String_(CONSUMER_PROTOCOL_TYPE.to_owned()),
            protocols: vec![JoinGroupRequestProtocol {
                name: String_(self.config.protocol_name.clone()),
                metadata: NullableBytes(Some(metadata)),
            }],
        };

        let response = match self.cluster.request_broker(coordinator_id, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%e, "Join request failed, rediscovering coordinator");
                self.enter(GroupPhase::Discovering);
                return;
            }
        };

        match response.error {
            None => {
                self.generation_id = response.generation_id.0;
                self.member_id = response.member_id.0.clone();
                let is_leader = response.leader.0 == response.member_id.0;
                info!(
                    group = self.config.group.as_str(),
                    generation = self.generation_id,
                    member = self.member_id.as_str(),
                    is_leader,
                    "Joined group"
                );
                self.enter(GroupPhase::AwaitingSync);
                self.pending_join = Some(JoinOutcome {
                    is_leader,
                    members: response
                        .members
                        .iter()
                        .map(|m| m.member_id.0.clone())
                        .collect(),
                });
            }
            Some(e @ (ApiError::UnknownMemberId | ApiError::IllegalGeneration)) => {
                debug!(error = %e, "Resetting member ID and rejoining");
                self.member_id.clear();
            }
            Some(e) => self.handle_group_error("join", e).await,
        }
    }

    async fn sync(&mut self) {
        let Some(coordinator_id) = self.coordinator_id else {
            self.enter(GroupPhase::Discovering);
            return;
        };
        let Some(join) = self.pending_join.take() else {
            self.enter(GroupPhase::Joining);
            return;
        };

        let assignments = if join.is_leader {
            match self.compute_assignments(&join.members).await {
                Ok(assignments) => assignments,
                Err(reason) => {
                    self.fail(reason);
                    return;
                }
            }
        } else {
            vec![]
        };

        let request = SyncGroupRequest {
            group_id: String_(self.config.group.clone()),
            generation_id: Int32(self.generation_id),
            member_id: String_(self.member_id.clone()),
            assignments,
        };

        let response = match self.cluster.request_broker(coordinator_id, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%e, "Sync request failed, rediscovering coordinator");
                self.enter(GroupPhase::Discovering);
                return;
            }
        };

        match response.error {
            None => {
                let assignment = match response.assignment.0.as_deref() {
                    None | Some([]) => BTreeMap::new(),
                    Some(raw) => match ConsumerGroupMemberAssignment::from_bytes(raw) {
                        Ok(assignment) => assignment.assignment,
                        Err(e) => {
                            self.fail(format!("cannot decode member assignment: {e}"));
                            return;
                        }
                    },
                };

                info!(
                    group = self.config.group.as_str(),
                    generation = self.generation_id,
                    ?assignment,
                    "Group is stable"
                );
                self.view_tx
                    .send(GroupView::Stable(StableView {
                        generation_id: self.generation_id,
                        member_id: self.member_id.clone(),
                        coordinator_id,
                        assignment,
                    }))
                    .ok();
                self.phase_tx.send(GroupPhase::Stable).ok();
            }
            Some(ApiError::RebalanceInProgress) => {
                // the round is still forming; give the other members a beat
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.enter(GroupPhase::Joining);
            }
            Some(e @ (ApiError::UnknownMemberId | ApiError::IllegalGeneration)) => {
                debug!(error = %e, "Resetting member ID and rejoining");
                self.member_id.clear();
                self.enter(GroupPhase::Joining);
            }
            Some(e) => self.handle_group_error("sync", e).await,
        }
    }

    async fn compute_assignments(
        &self,
        members: &[String],
    ) -> Result<Vec<SyncGroupRequestAssignment>, String> {
        let mut members = members.to_vec();
        members.sort();
        let partitions = self.universe.partitions().await;

        let mapping = (self.config.allocator)(&members, &partitions);
        validate_assignment(&mapping, &partitions)
            .map_err(|e| format!("allocator produced an invalid assignment: {e}"))?;

        members
            .iter()
            .map(|member| {
                let assignment = ConsumerGroupMemberAssignment {
                    version: 0,
                    assignment: mapping.get(member).cloned().unwrap_or_default(),
                    user_data: None,
                };
                Ok(SyncGroupRequestAssignment {
                    member_id: String_(member.clone()),
                    assignment: NullableBytes(Some(
                        assignment
                            .to_bytes()
                            .map_err(|e| format!("cannot serialize assignment: {e}"))?,
                    )),
                })
            })
            .collect()
    }

    async fn stable(&mut self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the interval fires immediately; stability was just confirmed
        ticker.tick().await;

        let mut failing_since: Option<Instant> = None;
        let mut shutdown_rx = self.shutdown_rx.clone();

        // a fresh subscription sees only changes from here on; the backlog
        // described the membership this generation was synced against
        let mut membership_changes = self.membership_changes.resubscribe();
        let mut membership_closed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        HeartbeatOutcome::Ok => {
                            failing_since = None;
                        }
                        HeartbeatOutcome::Rejoin => {
                            self.enter(GroupPhase::Rebalancing);
                            return;
                        }
                        HeartbeatOutcome::ResetAndRejoin => {
                            self.member_id.clear();
                            self.enter(GroupPhase::Joining);
                            return;
                        }
                        HeartbeatOutcome::Rediscover => {
                            self.enter(GroupPhase::Discovering);
                            return;
                        }
                        HeartbeatOutcome::SendFailed => {
                            let since = *failing_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= self.config.session_timeout {
                                warn!(
                                    group = self.config.group.as_str(),
                                    "Heartbeats undeliverable for a full session timeout"
                                );
                                self.enter(GroupPhase::Discovering);
                                return;
                            }
                        }
                    }
                }
                changed = membership_changes.recv(), if !membership_closed => {
                    match changed {
                        Ok(members) => {
                            info!(
                                group = self.config.group.as_str(),
                                ?members,
                                "Party membership changed, rebalancing"
                            );
                            self.enter(GroupPhase::Rebalancing);
                            return;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.enter(GroupPhase::Rebalancing);
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // no party attached; heartbeats carry the session
                            membership_closed = true;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    // the run loop picks the shutdown up and leaves
                    return;
                }
            }
        }
    }

    async fn heartbeat(&self) -> HeartbeatOutcome {
        let Some(coordinator_id) = self.coordinator_id else {
            return HeartbeatOutcome::Rediscover;
        };

        let request = HeartbeatRequest {
            group_id: String_(self.config.group.clone()),
            generation_id: Int32(self.generation_id),
            member_id: String_(self.member_id.clone()),
        };

        match self.cluster.request_broker(coordinator_id, request).await {
            Ok(response) => match response.error {
                None => HeartbeatOutcome::Ok,
                Some(ApiError::RebalanceInProgress) => HeartbeatOutcome::Rejoin,
                Some(ApiError::IllegalGeneration | ApiError::UnknownMemberId) => {
                    HeartbeatOutcome::ResetAndRejoin
                }
                Some(
                    ApiError::GroupCoordinatorNotAvailable
                    | ApiError::NotCoordinator
                    | ApiError::GroupLoadInProgress,
                ) => HeartbeatOutcome::Rediscover,
                Some(e) => {
                    warn!(error = %e, "Heartbeat rejected");
                    HeartbeatOutcome::Rediscover
                }
            },
            Err(e) => {
                warn!(%e, "Heartbeat could not be sent");
                HeartbeatOutcome::SendFailed
            }
        }
    }

    async fn handle_group_error(&mut self, during: &str, e: ApiError) {
        match e.classify() {
            ErrorClass::Refresh => {
                debug!(during, error = %e, "Coordinator moved, rediscovering");
                self.enter(GroupPhase::Discovering);
            }
            ErrorClass::Retriable => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            ErrorClass::Fatal => {
                self.fail(format!("{during} failed: {e}"));
            }
        }
    }

    async fn leave(&mut self) {
        self.enter(GroupPhase::Leaving);

        if let Some(coordinator_id) = self.coordinator_id {
            if !self.member_id.is_empty() {
                let request = LeaveGroupRequest {
                    group_id: String_(self.config.group.clone()),
                    member_id: String_(self.member_id.clone()),
                };
                if let Err(e) = self.cluster.request_broker(coordinator_id, request).await {
                    debug!(%e, "Best-effort leave failed");
                }
            }
        }

        self.phase_tx.send(GroupPhase::Disconnected).ok();
        self.view_tx
            .send(GroupView::Failed("left the group".to_owned()))
            .ok();
    }
}

struct JoinOutcome {
    is_leader: bool,
    members: Vec<String>,
}

enum HeartbeatOutcome {
    Ok,
    Rejoin,
    ResetAndRejoin,
    Rediscover,
    SendFailed,
}
