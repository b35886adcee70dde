//! End-to-end scenario checks exercising the properties a replicated log is
//! supposed to guarantee: quorum commit, leader failover, partition
//! tolerance, the read lease, single-server membership change, and
//! cooperative leader replacement. Each scenario drives a real `Cluster` of
//! `Server` instances rather than a simulation.

use crate::cluster::Cluster;
use crate::fault_injection::{self, FaultConfig};
use crate::workload::{Operation, WorkloadConfig, WorkloadGenerator};
use raft_core::{ClientReply, NodeId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type ScenarioResult = Result<(), String>;
pub type BoxFuture = Pin<Box<dyn Future<Output = ScenarioResult>>>;

async fn three_node_cluster() -> (Cluster, NodeId, Vec<NodeId>) {
    let mut cluster = Cluster::bootstrap("n0");
    cluster.add_follower(&"n0".to_string(), "n1").await.unwrap();
    cluster.add_follower(&"n0".to_string(), "n2").await.unwrap();
    cluster.settle(Duration::from_millis(50)).await;
    let ids = vec!["n0".to_string(), "n1".to_string(), "n2".to_string()];
    (cluster, "n0".to_string(), ids)
}

/// S1: a command committed by the leader is eventually visible from every
/// replica's status (i.e. every replica has converged on a leader).
pub async fn quorum_write_is_visible_everywhere() -> ScenarioResult {
    let (cluster, leader, nodes) = three_node_cluster().await;
    cluster.command(&leader, "x", json!(1)).await;
    cluster.settle(Duration::from_millis(100)).await;
    for node in &nodes {
        let Some(ClientReply::Status(status)) = cluster.status(node).await else {
            return Err(format!("{node}: no status reply"));
        };
        if status.leader.is_none() {
            return Err(format!("{node}: no leader known"));
        }
    }
    Ok(())
}

/// S2: crashing the leader causes a new leader to be elected and service to
/// continue.
pub async fn leader_crash_triggers_reelection() -> ScenarioResult {
    let (cluster, leader, nodes) = three_node_cluster().await;
    cluster.command(&leader, "x", json!(1)).await;
    cluster.crash(&leader);
    cluster.settle(Duration::from_millis(400)).await;

    let survivors: Vec<&NodeId> = nodes.iter().filter(|n| *n != &leader).collect();
    for node in &survivors {
        let Some(ClientReply::Status(status)) = cluster.status(node).await else {
            return Err(format!("{node}: no status reply"));
        };
        if status.leader.is_none() || status.leader.as_deref() == Some(leader.as_str()) {
            return Err(format!("{node}: did not recognize a new leader after crash"));
        }
    }
    Ok(())
}

/// S3: a minority partition cannot commit new writes; the majority side
/// keeps serving.
pub async fn minority_partition_cannot_commit() -> ScenarioResult {
    let (cluster, leader, nodes) = three_node_cluster().await;
    let (minority, majority) = fault_injection::partition_minority(&cluster, &nodes, 1);
    cluster.settle(Duration::from_millis(300)).await;

    let majority_leader = majority.iter().find(|n| *n != &leader).unwrap_or(&majority[0]);
    let reply = cluster.command(majority_leader, "x", json!(2)).await;
    let committed = matches!(reply, Some(ClientReply::Command(Ok(_))));

    let result = if committed {
        Ok(())
    } else if minority.contains(&leader) {
        // original leader stuck in the minority: the majority still needed
        // a little more time to elect someone new.
        cluster.settle(Duration::from_millis(300)).await;
        let reply = cluster.command(majority_leader, "x", json!(3)).await;
        if matches!(reply, Some(ClientReply::Command(Ok(_)))) {
            Ok(())
        } else {
            Err("majority side never regained the ability to commit".to_string())
        }
    } else {
        Err("majority side failed to commit despite retaining the leader".to_string())
    };
    cluster.heal_partitions();
    result
}

/// S4: a query answered under a valid lease reflects the latest committed
/// write without the leader needing to log it first.
pub async fn lease_backed_query_reads_fresh_state() -> ScenarioResult {
    let (cluster, leader, _nodes) = three_node_cluster().await;
    cluster.command(&leader, "x", json!(42)).await;
    cluster.settle(Duration::from_millis(50)).await;
    match cluster.query(&leader, "x").await {
        Some(ClientReply::Query(Ok(v))) if v == json!(42) => Ok(()),
        other => Err(format!("unexpected query reply: {other:?}")),
    }
}

/// S5: a follower added at runtime catches up and later can be removed
/// again without disrupting the group.
pub async fn single_server_membership_change_round_trips() -> ScenarioResult {
    let mut cluster = Cluster::bootstrap("n0");
    let leader = "n0".to_string();
    let follower = "n1".to_string();
    cluster.command(&leader, "x", json!(1)).await;
    cluster.add_follower(&leader, follower.clone()).await?;
    cluster.settle(Duration::from_millis(50)).await;

    let Some(ClientReply::Status(status)) = cluster.status(&leader).await else {
        return Err("no status reply after add_follower".into());
    };
    if !status.members.contains(&follower) {
        return Err("new follower never appeared in the voting set".into());
    }

    cluster.remove_follower(&leader, &follower).await?;
    cluster.settle(Duration::from_millis(50)).await;
    let Some(ClientReply::Status(status)) = cluster.status(&leader).await else {
        return Err("no status reply after remove_follower".into());
    };
    if status.members.contains(&follower) {
        return Err("removed follower still in the voting set".into());
    }
    Ok(())
}

/// S6: a cooperative `replace_leader` request hands leadership to a
/// specific, responsive follower.
pub async fn cooperative_leader_replacement_hands_off() -> ScenarioResult {
    let (cluster, leader, nodes) = three_node_cluster().await;
    let target = nodes.iter().find(|n| *n != &leader).cloned().unwrap();
    cluster.settle(Duration::from_millis(100)).await;
    let reply = cluster.replace_leader(&leader, Some(target.clone())).await;
    if !matches!(reply, Some(ClientReply::ReplaceLeader(Ok(())))) {
        return Err(format!("replace_leader request was rejected: {reply:?}"));
    }
    cluster.settle(Duration::from_millis(400)).await;
    let Some(ClientReply::Status(status)) = cluster.status(&target).await else {
        return Err("no status reply from handoff target".into());
    };
    if status.leader.as_deref() != Some(target.as_str()) {
        return Err(format!("handoff target never became leader (status: {status:?})"));
    }
    Ok(())
}

/// S7: a random set/get workload run under light message loss still
/// converges once the fault is lifted — every committed write is visible.
pub async fn random_workload_survives_light_faults() -> ScenarioResult {
    let (cluster, leader, _nodes) = three_node_cluster().await;
    fault_injection::apply(&cluster, &FaultConfig::light());

    let mut workload = WorkloadGenerator::new(WorkloadConfig::default());
    let mut committed: HashMap<String, Value> = HashMap::new();
    for op in workload.generate(20) {
        let key = op.key().to_string();
        let value = op.value();
        if matches!(op, Operation::Set { .. }) {
            let reply = cluster.command(&leader, &key, value.clone()).await;
            if matches!(reply, Some(ClientReply::Command(Ok(_)))) {
                committed.insert(key, value);
            }
        } else {
            cluster.query(&leader, &key).await;
        }
    }

    fault_injection::apply(&cluster, &FaultConfig::none());
    cluster.settle(Duration::from_millis(200)).await;
    for (key, expected) in committed {
        match cluster.query(&leader, &key).await {
            Some(ClientReply::Query(Ok(v))) if v == expected => {}
            other => return Err(format!("key {key}: expected {expected}, got {other:?}")),
        }
    }
    Ok(())
}

fn box_s1() -> BoxFuture {
    Box::pin(quorum_write_is_visible_everywhere())
}
fn box_s2() -> BoxFuture {
    Box::pin(leader_crash_triggers_reelection())
}
fn box_s3() -> BoxFuture {
    Box::pin(minority_partition_cannot_commit())
}
fn box_s4() -> BoxFuture {
    Box::pin(lease_backed_query_reads_fresh_state())
}
fn box_s5() -> BoxFuture {
    Box::pin(single_server_membership_change_round_trips())
}
fn box_s6() -> BoxFuture {
    Box::pin(cooperative_leader_replacement_hands_off())
}
fn box_s7() -> BoxFuture {
    Box::pin(random_workload_survives_light_faults())
}

/// Every named scenario, in the order the `suite` CLI command runs them.
pub fn all_scenarios() -> Vec<(&'static str, fn() -> BoxFuture)> {
    vec![
        ("quorum-write", box_s1 as fn() -> BoxFuture),
        ("leader-crash", box_s2 as fn() -> BoxFuture),
        ("minority-partition", box_s3 as fn() -> BoxFuture),
        ("lease-read", box_s4 as fn() -> BoxFuture),
        ("membership-change", box_s5 as fn() -> BoxFuture),
        ("leader-handoff", box_s6 as fn() -> BoxFuture),
        ("random-workload", box_s7 as fn() -> BoxFuture),
    ]
}
