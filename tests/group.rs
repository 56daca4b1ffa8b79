//! Grouped-consumer scenarios: rebalance rounds, member loss, and offset
//! commit/fetch against a scripted coordinator broker.


use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use skiff::coordinator::MemoryCoordinator;
use skiff::protocol::error::Error as ApiError;
use skiff::protocol::messages::{
    FetchResponse, FetchResponsePartition, FetchResponseTopic, GroupCoordinatorResponse,
    HeartbeatResponse, JoinGroupResponse, JoinGroupResponseMember, LeaveGroupResponse,
    ListOffsetsResponse, ListOffsetsResponsePartition, ListOffsetsResponseTopic,
    OffsetCommitResponse, OffsetCommitResponsePartition, OffsetCommitResponseTopic,
    OffsetFetchResponse, OffsetFetchResponsePartition, OffsetFetchResponseTopic, SyncGroupResponse,
};
use skiff::protocol::primitives::{Array, Int32, Int64, NullableBytes, NullableString, String_};
use skiff::{ClientBuilder, GroupedConsumerBuilder, Start};

use test_helpers::*;

const TOPIC: &str = "colors";
const PARTITIONS: i32 = 4;

/// Broker-side group bookkeeping for the scripted coordinator.
struct GroupState {
    next_member: u32,
    members: Vec<String>,

    /// Last join or heartbeat per member; silence past `session_ttl` evicts.
    last_seen: HashMap<String, std::time::Instant>,
    session_ttl: Duration,

    /// Membership the current generation was formed over.
    generation_members: Vec<String>,
    generation: i32,

    /// member -> serialized assignment, stored by the leader's sync.
    assignments: HashMap<String, Vec<u8>>,

    /// (partition) -> committed offset.
    committed: HashMap<i32, i64>,

    /// Commits that carried a stale generation.
    violations: Vec<String>,

    /// Per-partition logs backing fetches.
    logs: HashMap<i32, SimLog>,
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            next_member: 0,
            members: vec![],
            last_seen: HashMap::new(),
            session_ttl: Duration::from_millis(500),
            generation_members: vec![],
            generation: 0,
            assignments: HashMap::new(),
            committed: HashMap::new(),
            violations: vec![],
            logs: HashMap::new(),
        }
    }
}

impl GroupState {
    fn leader(&self) -> Option<&String> {
        self.generation_members.iter().min()
    }

    fn touch(&mut self, member: &str) {
        self.last_seen
            .insert(member.to_owned(), std::time::Instant::now());
    }

    fn evict_stale(&mut self) {
        let ttl = self.session_ttl;
        let last_seen = &self.last_seen;
        self.members
            .retain(|m| last_seen.get(m).is_some_and(|seen| seen.elapsed() < ttl));
    }

    fn membership_changed(&self) -> bool {
        let mut members = self.members.clone();
        members.sort();
        let mut generation_members = self.generation_members.clone();
        generation_members.sort();
        members != generation_members
    }

    fn settle_generation(&mut self) {
        if self.membership_changed() {
            self.generation += 1;
            self.generation_members = self.members.clone();
            self.assignments.clear();
        }
    }
}

fn group_handler(
    addr_slot: Arc<Mutex<Option<std::net::SocketAddr>>>,
    state: Arc<Mutex<GroupState>>,
) -> Handler {
    Arc::new(move |request| {
        let addr = (*addr_slot.lock()).expect("address published before requests");
        let mut state = state.lock();
        match request {
            SimRequest::Metadata(_) => SimResponse::Metadata(metadata_response(
                &[(1, addr)],
                TOPIC,
                &(0..PARTITIONS).map(|p| (p, 1)).collect::<Vec<_>>(),
            )),
            SimRequest::GroupCoordinator(_) => {
                SimResponse::GroupCoordinator(GroupCoordinatorResponse {
                    error: None,
                    coordinator_id: Int32(1),
                    host: String_(addr.ip().to_string()),
                    port: Int32(addr.port() as i32),
                })
            }
            SimRequest::JoinGroup(join) => {
                let member_id = if join.member_id.0.is_empty() {
                    state.next_member += 1;
                    format!("m-{}", state.next_member)
                } else {
                    join.member_id.0.clone()
                };
                state.touch(&member_id);
                state.evict_stale();
                if !state.members.contains(&member_id) {
                    state.members.push(member_id.clone());
                }
                state.settle_generation();

                let leader = state.leader().cloned().unwrap_or_default();
                let members = if leader == member_id {
                    state
                        .generation_members
                        .iter()
                        .map(|m| JoinGroupResponseMember {
                            member_id: String_(m.clone()),
                            metadata: NullableBytes(None),
                        })
                        .collect()
                } else {
                    vec![]
                };

                SimResponse::JoinGroup(JoinGroupResponse {
                    error: None,
                    generation_id: Int32(state.generation),
                    protocol_name: String_("round-robin".to_owned()),
                    leader: String_(leader),
                    member_id: String_(member_id),
                    members,
                })
            }
            SimRequest::SyncGroup(sync) => {
                if sync.generation_id.0 != state.generation {
                    return SimResponse::SyncGroup(SyncGroupResponse {
                        error: Some(ApiError::RebalanceInProgress),
                        assignment: NullableBytes(None),
                    });
                }

                let is_leader = state.leader() == Some(&sync.member_id.0);
                if is_leader && !sync.assignments.is_empty() {
                    state.assignments = sync
                        .assignments
                        .iter()
                        .map(|a| {
                            (
                                a.member_id.0.clone(),
                                a.assignment.0.clone().unwrap_or_default(),
                            )
                        })
                        .collect();
                }

                match state.assignments.get(&sync.member_id.0) {
                    Some(assignment) => SimResponse::SyncGroup(SyncGroupResponse {
                        error: None,
                        assignment: NullableBytes(Some(assignment.clone())),
                    }),
                    // the leader has not distributed this round yet
                    None => SimResponse::SyncGroup(SyncGroupResponse {
                        error: Some(ApiError::RebalanceInProgress),
                        assignment: NullableBytes(None),
                    }),
                }
            }
            SimRequest::Heartbeat(heartbeat) => {
                let error = if !state.members.contains(&heartbeat.member_id.0) {
                    Some(ApiError::UnknownMemberId)
                } else {
                    state.touch(&heartbeat.member_id.0);
                    state.evict_stale();
                    if state.membership_changed()
                        || heartbeat.generation_id.0 != state.generation
                    {
                        Some(ApiError::RebalanceInProgress)
                    } else {
                        None
                    }
                };
                SimResponse::Heartbeat(HeartbeatResponse { error })
            }
            SimRequest::LeaveGroup(leave) => {
                state.members.retain(|m| m != &leave.member_id.0);
                SimResponse::LeaveGroup(LeaveGroupResponse { error: None })
            }
            SimRequest::OffsetCommit(commit) => {
                let generation = commit.generation_id.map(|g| g.0).unwrap_or(-1);
                let stale = generation != state.generation;
                if stale {
                    let current_generation = state.generation;
                    state
                        .violations
                        .push(format!(
                            "commit with generation {generation}, current {}",
                            current_generation
                        ));
                }

                let topics = commit
                    .topics
                    .iter()
                    .map(|topic| OffsetCommitResponseTopic {
                        name: topic.name.clone(),
                        partitions: topic
                            .partitions
                            .iter()
                            .map(|p| {
                                if !stale {
                                    state.committed.insert(p.partition_index.0, p.committed_offset.0);
                                }
                                OffsetCommitResponsePartition {
                                    partition_index: p.partition_index,
                                    error: stale.then_some(ApiError::IllegalGeneration),
                                }
                            })
                            .collect(),
                    })
                    .collect();
                SimResponse::OffsetCommit(OffsetCommitResponse { topics })
            }
            SimRequest::OffsetFetch(fetch) => {
                let topics = fetch
                    .topics
                    .iter()
                    .map(|topic| OffsetFetchResponseTopic {
                        name: topic.name.clone(),
                        partitions: topic
                            .partition_indexes
                            .0
                            .clone()
                            .unwrap_or_default()
                            .iter()
                            .map(|p| OffsetFetchResponsePartition {
                                partition_index: *p,
                                committed_offset: Int64(
                                    state.committed.get(&p.0).copied().unwrap_or(-1),
                                ),
                                metadata: NullableString(None),
                                error: None,
                            })
                            .collect(),
                    })
                    .collect();
                SimResponse::OffsetFetch(OffsetFetchResponse { topics })
            }
            SimRequest::ListOffsets(list) => {
                let partitions = list.topics[0]
                    .partitions
                    .iter()
                    .map(|p| ListOffsetsResponsePartition {
                        partition_index: p.partition_index,
                        error: None,
                        offsets: Array(Some(vec![Int64(
                            state
                                .logs
                                .get(&p.partition_index.0)
                                .map(|log| log.offset_for(p.timestamp.0))
                                .unwrap_or(0),
                        )])),
                    })
                    .collect();
                SimResponse::ListOffsets(ListOffsetsResponse {
                    topics: vec![ListOffsetsResponseTopic {
                        name: String_(TOPIC.to_owned()),
                        partitions,
                    }],
                })
            }
            SimRequest::Fetch(fetch) => {
                let partitions = fetch.topics[0]
                    .partitions
                    .iter()
                    .map(|p| {
                        let log = state.logs.entry(p.partition.0).or_default();
                        fetch_response_partition(
                            p.partition.0,
                            log.fetch_from(p.fetch_offset.0)
                                .map(|set| (set, log.latest())),
                        )
                    })
                    .collect::<Vec<FetchResponsePartition>>();
                SimResponse::Fetch(FetchResponse {
                    topics: vec![FetchResponseTopic {
                        name: String_(TOPIC.to_owned()),
                        partitions,
                    }],
                })
            }
            other => panic!("group broker got unexpected request: {other:?}"),
        }
    })
}

async fn wait_for_assignment(
    consumer: &skiff::GroupedConsumer,
    expected: &BTreeMap<String, Vec<i32>>,
) {
    let mut last = None;
    for _ in 0..100 {
        if let Ok(Ok(assignment)) =
            tokio::time::timeout(Duration::from_millis(100), consumer.assignment()).await
        {
            if &assignment == expected {
                return;
            }
            last = Some(assignment);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("assignment never settled at {expected:?}, last: {last:?}");
}

fn expected_assignment(partitions: &[i32]) -> BTreeMap<String, Vec<i32>> {
    BTreeMap::from([(TOPIC.to_owned(), partitions.to_vec())])
}

/// Two members split four partitions round-robin; when one dies, the
/// survivor re-joins and takes everything.
#[tokio::test(flavor = "multi_thread")]
async fn test_rebalance_on_member_loss() {
    let state = Arc::new(Mutex::new(GroupState::default()));
    let addr_slot = Arc::new(Mutex::new(None));
    let sim = BrokerSim::spawn(group_handler(Arc::clone(&addr_slot), Arc::clone(&state))).await;
    *addr_slot.lock() = Some(sim.addr);

    let coordinator = MemoryCoordinator::new();

    let client = ClientBuilder::new(vec![sim.seed()])
        .backoff_config(fast_backoff())
        .build()
        .await
        .unwrap();

    let consumer_a = GroupedConsumerBuilder::from_client(&client, "workers")
        .coordinator(Arc::new(coordinator.session()))
        .session_timeout(Duration::from_millis(900))
        .heartbeat_interval(Duration::from_millis(150))
        .connect()
        .await
        .unwrap();

    // alone, the first member owns all four partitions
    wait_for_assignment(&consumer_a, &expected_assignment(&[0, 1, 2, 3])).await;

    let session_b = coordinator.session();
    let consumer_b = GroupedConsumerBuilder::from_client(&client, "workers")
        .coordinator(Arc::new(session_b))
        .session_timeout(Duration::from_millis(900))
        .heartbeat_interval(Duration::from_millis(150))
        .connect()
        .await
        .unwrap();

    // the naive round-robin over sorted members and partitions
    wait_for_assignment(&consumer_a, &expected_assignment(&[0, 2])).await;
    wait_for_assignment(&consumer_b, &expected_assignment(&[1, 3])).await;

    // kill B: no goodbye, its heartbeats stop and its coordinator session
    // expires with it
    drop(consumer_b);

    // once B's session lapses, the survivor re-joins and the next
    // generation hands it everything
    wait_for_assignment(&consumer_a, &expected_assignment(&[0, 1, 2, 3])).await;

    assert!(state.lock().violations.is_empty(), "{:?}", state.lock().violations);
    consumer_a.close().await.unwrap();
}

/// Offsets are committed with the live generation and re-read on the next
/// connect; commits never regress.
#[tokio::test(flavor = "multi_thread")]
async fn test_commit_and_refetch_offsets() {
    let state = Arc::new(Mutex::new(GroupState::default()));
    {
        let mut state = state.lock();
        for partition in 0..PARTITIONS {
            let log = state.logs.entry(partition).or_default();
            log.append(skiff::protocol::record::MessageSet(vec![
                skiff::protocol::record::MessageSetEntry {
                    offset: 0,
                    message: json_message(&json!({ "partition": partition })),
                },
            ]));
        }
    }

    let addr_slot = Arc::new(Mutex::new(None));
    let sim = BrokerSim::spawn(group_handler(Arc::clone(&addr_slot), Arc::clone(&state))).await;
    *addr_slot.lock() = Some(sim.addr);

    let coordinator = MemoryCoordinator::new();
    let client = ClientBuilder::new(vec![sim.seed()])
        .backoff_config(fast_backoff())
        .build()
        .await
        .unwrap();

    let consumer = GroupedConsumerBuilder::from_client(&client, "workers")
        .coordinator(Arc::new(coordinator.session()))
        .session_timeout(Duration::from_millis(900))
        .heartbeat_interval(Duration::from_millis(150))
        .connect()
        .await
        .unwrap();

    let batch = consumer.consume(TOPIC, Start::Beginning).await.unwrap();
    assert!(batch.errors.is_empty());
    assert_eq!(batch.records.len(), PARTITIONS as usize);

    // autocommit pushed the next offset for every partition
    {
        let state = state.lock();
        for partition in 0..PARTITIONS {
            assert_eq!(state.committed.get(&partition), Some(&1));
        }
        assert!(state.violations.is_empty(), "{:?}", state.violations);
    }

    consumer.close().await.unwrap();

    // a second consumer resumes from the committed offsets and sees nothing
    let consumer = GroupedConsumerBuilder::from_client(&client, "workers")
        .coordinator(Arc::new(coordinator.session()))
        .session_timeout(Duration::from_millis(900))
        .heartbeat_interval(Duration::from_millis(150))
        .connect()
        .await
        .unwrap();

    let batch = consumer.consume(TOPIC, Start::Beginning).await.unwrap();
    assert!(batch.errors.is_empty());
    assert!(batch.records.is_empty());

    consumer.close().await.unwrap();
}

/// A consumer with no coordinator service is rejected synchronously.
#[tokio::test]
async fn test_missing_coordinator_is_configuration_error() {
    let err = GroupedConsumerBuilder::new(vec!["127.0.0.1:1".to_owned()], "workers")
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, skiff::Error::Configuration(_)), "{err:?}");
}
