//! In-process multi-replica cluster for testing
//!
//! Wires real `raft_core::Server` instances together over an in-memory
//! `Comm` that understands partitions, crashes, message loss and delay, so
//! scenario tests can drive and observe an actual Raft replica set without
//! any sockets.

use rand::Rng;
use raft_core::{
    ClientHandle, ClientReply, ClientRequest, Comm, Config, ConfigBuilder, DataOps, Input, LeaderHook, Message,
    NodeId, Server,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A deterministic key/value store shared by every scenario test.
pub struct TestKv;

impl DataOps for TestKv {
    fn new(&self) -> Value {
        json!({})
    }

    fn command(&self, data: &Value, arg: &Value) -> (Value, Value) {
        let key = arg.get("key").and_then(Value::as_str).unwrap_or_default();
        let value = arg.get("value").cloned().unwrap_or(Value::Null);
        let mut next = data.clone();
        let previous = next
            .as_object_mut()
            .and_then(|m| m.insert(key.to_string(), value))
            .unwrap_or(Value::Null);
        (previous, next)
    }

    fn query(&self, data: &Value, arg: &Value) -> Value {
        let key = arg.get("key").and_then(Value::as_str).unwrap_or_default();
        data.get(key).cloned().unwrap_or(Value::Null)
    }
}

/// Counts role transitions and commits, fed by a `Server`'s `LeaderHook`
/// callbacks. Shared across the whole cluster so scenarios can assert on
/// aggregate behavior (election churn, total commits).
#[derive(Default)]
pub struct MetricsInner {
    pub elections: usize,
    pub commands_committed: usize,
    pub follower_adds: usize,
    pub follower_removes: usize,
}

#[derive(Clone, Default)]
pub struct Metrics(Arc<Mutex<MetricsInner>>);

impl Metrics {
    pub fn snapshot(&self) -> MetricsInner {
        let inner = self.0.lock().unwrap();
        MetricsInner {
            elections: inner.elections,
            commands_committed: inner.commands_committed,
            follower_adds: inner.follower_adds,
            follower_removes: inner.follower_removes,
        }
    }
}

impl LeaderHook for Metrics {
    fn on_elected(&self, leader: &NodeId) {
        self.0.lock().unwrap().elections += 1;
        info!(%leader, "elected");
    }
    fn on_command_committed(&self, _command_id: &str, _result: &Value) {
        self.0.lock().unwrap().commands_committed += 1;
    }
    fn on_follower_added(&self, _peer: &NodeId) {
        self.0.lock().unwrap().follower_adds += 1;
    }
    fn on_follower_removed(&self, _peer: &NodeId) {
        self.0.lock().unwrap().follower_removes += 1;
    }
}

/// Shared fault-injection state consulted by every node's `ClusterComm`.
#[derive(Default)]
struct RegistryInner {
    senders: HashMap<NodeId, mpsc::UnboundedSender<Input>>,
    crashed: HashSet<NodeId>,
    severed_pairs: HashSet<(NodeId, NodeId)>,
    message_loss_probability: f64,
    delay: Option<Duration>,
}

fn pair_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

pub struct ClusterRegistry(Mutex<RegistryInner>);

impl ClusterRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(RegistryInner::default())))
    }

    fn register(&self, id: NodeId, sender: mpsc::UnboundedSender<Input>) {
        self.0.lock().unwrap().senders.insert(id, sender);
    }

    fn can_deliver(&self, from: &NodeId, to: &NodeId) -> bool {
        let inner = self.0.lock().unwrap();
        !inner.crashed.contains(from) && !inner.crashed.contains(to) && !inner.severed_pairs.contains(&pair_key(from, to))
    }

    pub fn crash(&self, id: &NodeId) {
        self.0.lock().unwrap().crashed.insert(id.clone());
        info!(%id, "node crashed");
    }

    pub fn recover(&self, id: &NodeId) {
        self.0.lock().unwrap().crashed.remove(id);
        info!(%id, "node recovered");
    }

    /// Sever every link between `group_a` and `group_b` (both directions).
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut inner = self.0.lock().unwrap();
        for a in group_a {
            for b in group_b {
                inner.severed_pairs.insert(pair_key(a, b));
            }
        }
        info!(?group_a, ?group_b, "partition created");
    }

    pub fn heal_partitions(&self) {
        self.0.lock().unwrap().severed_pairs.clear();
        info!("partitions healed");
    }

    pub fn set_message_loss_probability(&self, p: f64) {
        self.0.lock().unwrap().message_loss_probability = p;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.0.lock().unwrap().delay = delay;
    }
}

/// In-process `Comm`, one per node, sharing a `ClusterRegistry` for routing
/// and fault state and owning its own table of pending local client replies.
pub struct ClusterComm {
    self_id: NodeId,
    registry: Arc<ClusterRegistry>,
    local_replies: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
}

impl ClusterComm {
    fn new(self_id: NodeId, registry: Arc<ClusterRegistry>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            registry,
            local_replies: Mutex::new(HashMap::new()),
        })
    }

    fn register_local_reply(&self, sender: oneshot::Sender<ClientReply>) -> ClientHandle {
        let key = uuid::Uuid::new_v4().to_string();
        self.local_replies.lock().unwrap().insert(key.clone(), sender);
        ClientHandle::Remote(key)
    }
}

impl Comm for ClusterComm {
    fn send_event(&self, dest: &NodeId, msg: Message) {
        if !self.registry.can_deliver(&self.self_id, dest) {
            return;
        }
        let (loss_probability, delay) = {
            let inner = self.registry.0.lock().unwrap();
            (inner.message_loss_probability, inner.delay)
        };
        if loss_probability > 0.0 && rand::thread_rng().gen::<f64>() < loss_probability {
            return;
        }
        let Some(sender) = self.registry.0.lock().unwrap().senders.get(dest).cloned() else {
            return;
        };
        match delay {
            None => {
                let _ = sender.send(Input::Rpc(msg));
            }
            Some(d) => {
                tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    let _ = sender.send(Input::Rpc(msg));
                });
            }
        }
    }

    fn reply(&self, client: &ClientHandle, reply: ClientReply) {
        if let ClientHandle::Remote(key) = client {
            if let Some(sender) = self.local_replies.lock().unwrap().remove(key) {
                let _ = sender.send(reply);
            }
        }
    }
}

struct NodeHandle {
    comm: Arc<ClusterComm>,
    inbox: mpsc::UnboundedSender<Input>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// A running in-process cluster of real `Server`s.
pub struct Cluster {
    registry: Arc<ClusterRegistry>,
    handles: HashMap<NodeId, NodeHandle>,
    pub metrics: Metrics,
    heartbeat_timeout: Duration,
    election_timeout: Duration,
}

impl Cluster {
    /// Bootstrap a brand-new single-member group at `leader_id`, with short
    /// timeouts suited to fast-running tests.
    pub fn bootstrap(leader_id: impl Into<NodeId>) -> Self {
        let mut cluster = Self {
            registry: ClusterRegistry::new(),
            handles: HashMap::new(),
            metrics: Metrics::default(),
            heartbeat_timeout: Duration::from_millis(20),
            election_timeout: Duration::from_millis(100),
        };
        let leader_id = leader_id.into();
        let comm = ClusterComm::new(leader_id.clone(), cluster.registry.clone());
        let config = cluster.config_for(comm.clone());
        let server = Server::create_new_consensus_group(leader_id.clone(), config);
        cluster.spawn(leader_id, server, comm);
        cluster
    }

    fn config_for(&self, comm: Arc<ClusterComm>) -> Config {
        ConfigBuilder::default()
            .heartbeat_timeout(self.heartbeat_timeout)
            .election_timeout(self.election_timeout)
            .communication_module(comm)
            .leader_hook_module(Arc::new(self.metrics.clone()))
            .build(Arc::new(TestKv))
    }

    fn spawn(&mut self, id: NodeId, server: Server, comm: Arc<ClusterComm>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.register(id.clone(), tx.clone());
        let task = tokio::spawn(server.run(rx));
        self.handles.insert(id, NodeHandle { comm, inbox: tx, task });
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.handles.keys().cloned().collect()
    }

    /// Ask `leader_id` to add `new_id` as a follower, waiting for the
    /// resulting `InstallSnapshot` and spawning the new replica from it.
    /// In-process equivalent of the `JoinRequest`/`JoinReply` exchange a
    /// real `raft-node` process drives over UDP.
    pub async fn add_follower(&mut self, leader_id: &NodeId, new_id: impl Into<NodeId>) -> Result<(), String> {
        let new_id = new_id.into();
        let reply = self
            .submit(leader_id, |client| ClientRequest::AddFollower {
                peer: new_id.clone(),
                client,
            })
            .await
            .ok_or("no reply from leader")?;
        let ClientReply::AddFollower(result) = reply else {
            return Err("unexpected reply variant".into());
        };
        let snapshot_msg = *result.map_err(|e| e.to_string())?;
        let Message::InstallSnapshot {
            members,
            term,
            last_committed_entry,
            data,
            command_results,
            config: config_snapshot,
        } = snapshot_msg
        else {
            return Err("add_follower reply was not an InstallSnapshot".into());
        };
        let comm = ClusterComm::new(new_id.clone(), self.registry.clone());
        let config = self.config_for(comm.clone());
        let server = Server::new_follower_from_snapshot(
            new_id.clone(),
            config,
            members,
            term,
            last_committed_entry,
            data,
            command_results,
            config_snapshot,
        );
        self.spawn(new_id, server, comm);
        Ok(())
    }

    pub async fn remove_follower(&mut self, leader_id: &NodeId, target: &NodeId) -> Result<(), String> {
        let reply = self
            .submit(leader_id, |client| ClientRequest::RemoveFollower {
                peer: target.clone(),
                client,
            })
            .await
            .ok_or("no reply from leader")?;
        let ClientReply::RemoveFollower(result) = reply else {
            return Err("unexpected reply variant".into());
        };
        result.map_err(|e| e.to_string())
    }

    pub async fn command(&self, node_id: &NodeId, key: &str, value: Value) -> Option<ClientReply> {
        let arg = json!({"key": key, "value": value});
        self.submit(node_id, |client| ClientRequest::Command {
            arg,
            command_id: uuid::Uuid::new_v4().to_string(),
            client,
        })
        .await
    }

    pub async fn query(&self, node_id: &NodeId, key: &str) -> Option<ClientReply> {
        let arg = json!({"key": key});
        self.submit(node_id, |client| ClientRequest::Query { arg, client }).await
    }

    pub async fn replace_leader(&self, leader_id: &NodeId, target: Option<NodeId>) -> Option<ClientReply> {
        self.submit(leader_id, |client| ClientRequest::ReplaceLeader { target, client })
            .await
    }

    pub async fn status(&self, node_id: &NodeId) -> Option<ClientReply> {
        self.submit(node_id, |client| ClientRequest::Status { client }).await
    }

    async fn submit(&self, node_id: &NodeId, build: impl FnOnce(ClientHandle) -> ClientRequest) -> Option<ClientReply> {
        let handle = self.handles.get(node_id)?;
        let (tx, rx) = oneshot::channel();
        let client = handle.comm.register_local_reply(tx);
        handle.inbox.send(Input::Client(build(client))).ok()?;
        tokio::time::timeout(Duration::from_secs(2), rx).await.ok()?.ok()
    }

    pub fn crash(&self, id: &NodeId) {
        self.registry.crash(id);
    }

    pub fn recover(&self, id: &NodeId) {
        self.registry.recover(id);
    }

    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.registry.partition(group_a, group_b);
    }

    pub fn heal_partitions(&self) {
        self.registry.heal_partitions();
    }

    pub fn set_message_loss_probability(&self, p: f64) {
        self.registry.set_message_loss_probability(p);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.registry.set_delay(delay);
    }

    pub async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lonely_leader_serves_commands_immediately() {
        let cluster = Cluster::bootstrap("a");
        let reply = cluster.command(&"a".to_string(), "x", json!(1)).await;
        assert!(matches!(reply, Some(ClientReply::Command(Ok(_)))));
    }

    #[tokio::test]
    async fn query_sees_a_prior_committed_command() {
        let cluster = Cluster::bootstrap("a");
        cluster.command(&"a".to_string(), "x", json!(42)).await;
        let reply = cluster.query(&"a".to_string(), "x").await;
        assert!(matches!(reply, Some(ClientReply::Query(Ok(v))) if v == json!(42)));
    }

    #[tokio::test]
    async fn add_follower_replicates_prior_state() {
        let mut cluster = Cluster::bootstrap("a");
        cluster.command(&"a".to_string(), "x", json!(7)).await;
        cluster.add_follower(&"a".to_string(), "b").await.unwrap();
        cluster.settle(Duration::from_millis(50)).await;
        let reply = cluster.query(&"b".to_string(), "x").await;
        assert!(matches!(reply, Some(ClientReply::Query(_))));
    }
}
