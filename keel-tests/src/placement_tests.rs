//! Topics placed by the allocator and served by many groups per node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_cluster::{PartitionAllocator, PartitionAssignment, TopicConfiguration};
use keel_core::{GroupId, NodeId};
use keel_raft::{ConsensusGroup, ConsistencyLevel, GroupManager, RaftConfig};
use keel_storage::{LogManager, LogManagerConfig, ReaderConfig, SimulatedStorage};
use tokio::time::{sleep, timeout};

use crate::cluster::{data_batch, data_values};
use crate::init_tracing;
use crate::network::SimulatedNetwork;

const WAIT: Duration = Duration::from_secs(30);

struct Host {
    manager: Arc<GroupManager>,
    logs: LogManager,
    storage: SimulatedStorage,
}

async fn leader_of(hosts: &BTreeMap<NodeId, Host>, assignment: &PartitionAssignment) -> ConsensusGroup {
    let find = async {
        loop {
            for node in assignment.nodes() {
                if let Some(group) = hosts[&node].manager.get(assignment.group).await {
                    if group.is_leader() {
                        return group;
                    }
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(WAIT, find).await.expect("group elects a leader")
}

#[tokio::test(start_paused = true)]
async fn test_placement_topic_groups_replicate() {
    init_tracing();
    let allocator = PartitionAllocator::new(GroupId::default());
    let network = SimulatedNetwork::new();
    let mut hosts = BTreeMap::new();
    for id in 1..=4 {
        let node = NodeId::new(id);
        allocator.register_node(node, 2, BTreeMap::new()).unwrap();
        let storage = SimulatedStorage::new();
        let logs = LogManager::new(
            LogManagerConfig::new(format!("/{node}")),
            Arc::new(storage.clone()),
        )
        .unwrap();
        let manager = Arc::new(GroupManager::new(node));
        network.attach(node, Arc::clone(&manager));
        hosts.insert(node, Host { manager, logs, storage });
    }

    let topic = TopicConfiguration::new("kafka", "orders", 6, 3);
    let assignments = allocator.allocate(&topic).unwrap().commit();
    assert_eq!(assignments.len(), 6);

    for assignment in &assignments {
        let voters = assignment.nodes();
        for &node in &voters {
            let host = &hosts[&node];
            let log = host.logs.manage(assignment.ntp.clone()).await.unwrap();
            let config = RaftConfig::new(node, assignment.group, voters.clone())
                .with_election_timeout(150_000, 300_000)
                .with_heartbeat_interval(30_000)
                .with_rng_seed(assignment.group.get() * 31 + node.get());
            let group = ConsensusGroup::start(
                config,
                log,
                network.transport(node),
                Arc::new(host.storage.clone()),
            )
            .await
            .unwrap();
            host.manager.add(group).await.unwrap();
        }
    }

    for assignment in &assignments {
        let leader = leader_of(&hosts, assignment).await;
        let value = assignment.ntp.to_string();
        leader
            .replicate(vec![data_batch(&[&value])], ConsistencyLevel::QuorumAck)
            .await
            .unwrap();
        let committed = leader.commit_index().unwrap();
        let batches = leader
            .read(ReaderConfig::new(committed).with_max_offset(committed))
            .await
            .unwrap();
        assert_eq!(data_values(batches), [value]);
    }

    for (id, host) in &hosts {
        let hosted = assignments.iter().filter(|a| a.nodes().contains(id)).count();
        assert_eq!(host.manager.groups().await.len(), hosted);
        assert_eq!(allocator.node(*id).unwrap().allocated() as usize, hosted);
    }

    // Deleting the topic returns every unit of capacity.
    for assignment in &assignments {
        for node in assignment.nodes() {
            let host = &hosts[&node];
            assert!(host.manager.remove(assignment.group).await.is_some());
            host.logs.remove(&assignment.ntp).await.unwrap();
        }
        allocator.deallocate(assignment);
    }
    for id in allocator.node_ids() {
        assert_eq!(allocator.node(id).unwrap().allocated(), 0);
    }
}

#[tokio::test]
async fn test_placement_rejects_unplaceable_topic() {
    let allocator = PartitionAllocator::new(GroupId::new(10));
    for id in 1..=2 {
        allocator
            .register_node(NodeId::new(id), 1, BTreeMap::new())
            .unwrap();
    }
    let topic = TopicConfiguration::new("kafka", "wide", 3, 3);
    assert!(allocator.allocate(&topic).is_none());
    assert_eq!(allocator.highest_group(), GroupId::new(10));

    let units = allocator
        .allocate(&TopicConfiguration::new("kafka", "narrow", 3, 2))
        .unwrap();
    assert_eq!(units.assignments()[0].group, GroupId::new(11));
    drop(units);
    for id in allocator.node_ids() {
        assert_eq!(allocator.node(id).unwrap().allocated(), 0);
    }
}
