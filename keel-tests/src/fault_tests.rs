//! Seeded random fault schedules.
//!
//! Each schedule interleaves crashes, restarts, partitions and writes,
//! checking the commit history after every step. At the end the network is
//! healed, every node restarted, and the cluster must converge.

use std::time::Duration;

use keel_core::NodeId;
use keel_raft::ConsistencyLevel;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;

use crate::cluster::{data_batch, data_values, Cluster, ClusterConfig};
use crate::init_tracing;
use crate::properties::CommitHistory;
use crate::seeds::REGRESSION_SEEDS;

const STEPS: u32 = 40;
const WAIT: Duration = Duration::from_secs(60);

async fn run_schedule(size: u64, seed: u64) {
    let mut cluster = Cluster::start(ClusterConfig::new(size).with_seed(seed))
        .await
        .unwrap();
    let mut history = CommitHistory::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let ids = cluster.node_ids();
    let quorum = ids.len() / 2 + 1;

    for step in 0..STEPS {
        let running: Vec<NodeId> = ids.iter().copied().filter(|&id| cluster.is_running(id)).collect();
        let stopped: Vec<NodeId> = ids.iter().copied().filter(|&id| !cluster.is_running(id)).collect();
        match rng.gen_range(0..10) {
            0 if running.len() > quorum => {
                let victim = *running.choose(&mut rng).unwrap();
                cluster.crash(victim).await;
            }
            1 if !stopped.is_empty() => {
                let id = *stopped.choose(&mut rng).unwrap();
                cluster.restart(id).await.unwrap();
                history.node_restarted(id);
            }
            2 => {
                let mut shuffled = ids.clone();
                shuffled.shuffle(&mut rng);
                let split = rng.gen_range(1..shuffled.len());
                cluster.network().partition(&shuffled[..split], &shuffled[split..]);
            }
            3 => cluster.network().heal(),
            _ => {
                if let Some(group) = cluster.leader().and_then(|id| cluster.group(id)).cloned() {
                    let value = format!("s{seed}-{step}");
                    let level = if rng.gen_bool(0.8) {
                        ConsistencyLevel::QuorumAck
                    } else {
                        ConsistencyLevel::LeaderAck
                    };
                    // Outcome is irrelevant; safety is checked below.
                    tokio::spawn(async move {
                        group.replicate(vec![data_batch(&[&value])], level).await
                    });
                }
            }
        }
        sleep(Duration::from_millis(rng.gen_range(20..400))).await;
        if let Err(violation) = cluster.check(&mut history).await {
            panic!("seed {seed} step {step}: {violation}");
        }
    }

    cluster.network().heal();
    for id in ids.clone() {
        if !cluster.is_running(id) {
            cluster.restart(id).await.unwrap();
            history.node_restarted(id);
        }
    }

    let mut committed = false;
    for _ in 0..10 {
        if let Some(leader) = cluster.wait_for_leader(WAIT).await {
            if cluster
                .replicate(leader, &["final"], ConsistencyLevel::QuorumAck)
                .await
                .is_ok()
            {
                committed = true;
                break;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(committed, "seed {seed}: final write never committed");
    assert!(cluster.wait_for_convergence(WAIT).await, "seed {seed}: no convergence");
    if let Err(violation) = cluster.check(&mut history).await {
        panic!("seed {seed} after heal: {violation}");
    }

    let reference = data_values(cluster.committed_batches(ids[0]).await.unwrap());
    assert_eq!(reference.last().map(String::as_str), Some("final"));
    for &id in &ids[1..] {
        let values = data_values(cluster.committed_batches(id).await.unwrap());
        assert_eq!(values, reference, "seed {seed}: {id} diverged");
    }
    cluster.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fault_schedule_three_nodes() {
    init_tracing();
    for &seed in REGRESSION_SEEDS {
        run_schedule(3, seed).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_fault_schedule_five_nodes() {
    init_tracing();
    for &seed in &REGRESSION_SEEDS[..4] {
        run_schedule(5, seed).await;
    }
}
