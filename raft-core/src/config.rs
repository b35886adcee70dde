//! Plug-in capability interfaces (`DataOps`, `Comm`, `LeaderHook`) and the
//! `Config` that binds them once at construction.

use crate::error::ClientError;
use crate::message::{ConfigSnapshot, Message};
use crate::types::{ClientHandle, CommandId, NodeId};
use std::sync::Arc;
use std::time::Duration;

/// The deterministic user data state machine. Implementations must be pure
/// functions of `(data, arg)`: the same inputs always produce the same
/// `(result, data')`, since every replica must reach identical state.
pub trait DataOps: Send + Sync {
    /// The initial value of `data` for a freshly bootstrapped group.
    fn new(&self) -> serde_json::Value;

    /// Apply a command, returning `(result, updated_data)`.
    fn command(
        &self,
        data: &serde_json::Value,
        arg: &serde_json::Value,
    ) -> (serde_json::Value, serde_json::Value);

    /// Answer a read-only query against `data` without mutating it.
    fn query(&self, data: &serde_json::Value, arg: &serde_json::Value) -> serde_json::Value;
}

/// Fire-and-forget transport. Calls are synchronous from the FSM's point of
/// view: the implementation is responsible for doing the actual
/// sending asynchronously and must never block the caller on network I/O.
pub trait Comm: Send + Sync {
    /// Send an RPC to another replica. May be dropped, reordered, or
    /// duplicated by the transport; the protocol tolerates all three.
    fn send_event(&self, dest: &NodeId, msg: Message);

    /// Deliver a reply to whichever client is waiting on `client`. A best
    /// effort: if the client has gone away the implementation may discard it.
    fn reply(&self, client: &ClientHandle, reply: ClientReply);
}

/// Best-effort observer callbacks invoked after an entry commits and is
/// applied. A panicking or slow hook must never corrupt replica state or
/// block it: `Server` invokes hooks synchronously but treats their failure
/// as log-and-continue.
pub trait LeaderHook: Send + Sync {
    fn on_elected(&self, _leader: &NodeId) {}
    fn on_command_committed(&self, _command_id: &CommandId, _result: &serde_json::Value) {}
    fn on_query_answered(&self, _result: &serde_json::Value) {}
    fn on_follower_added(&self, _peer: &NodeId) {}
    fn on_follower_removed(&self, _peer: &NodeId) {}
}

/// No-op hook used when `Config` is built without a `leader_hook_module`.
pub struct NoopLeaderHook;
impl LeaderHook for NoopLeaderHook {}

/// What the leader sends back for each synchronous client request.
#[derive(Debug, Clone)]
pub enum ClientReply {
    Command(crate::error::ClientResult<serde_json::Value>),
    Query(crate::error::ClientResult<serde_json::Value>),
    ChangeConfig(crate::error::ClientResult<()>),
    AddFollower(crate::error::ClientResult<Box<Message>>),
    RemoveFollower(crate::error::ClientResult<()>),
    ReplaceLeader(crate::error::ClientResult<()>),
    Status(Box<StatusReply>),
}

/// Reply to the `status` query.
#[derive(Debug, Clone)]
pub struct StatusReply {
    pub from: NodeId,
    pub members: Vec<NodeId>,
    pub leader: Option<NodeId>,
    pub unresponsive_followers: Vec<NodeId>,
    pub current_term: crate::types::TermNumber,
    pub role_name: &'static str,
    pub config: ConfigSnapshot,
}

/// Tunables and plug-in module references. Bound once at
/// construction; `config_snapshot` and `data_ops`/`comm`/`leader_hook` are
/// never swapped except via `ConfigBuilder` before the `Server` is built.
pub struct Config {
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub max_retained_committed_logs: usize,
    pub max_retained_command_results: usize,
    pub data_ops: Arc<dyn DataOps>,
    pub comm: Arc<dyn Comm>,
    pub leader_hook: Arc<dyn LeaderHook>,
}

impl Config {
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            heartbeat_timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            election_timeout_ms: self.election_timeout.as_millis() as u64,
            max_retained_committed_logs: self.max_retained_committed_logs,
            max_retained_command_results: self.max_retained_command_results,
        }
    }

    /// Replace the tunable fields from a committed `change_config` entry.
    /// Plug-in modules are never touched by this.
    pub fn apply_snapshot(&mut self, snapshot: &ConfigSnapshot) {
        self.heartbeat_timeout = Duration::from_millis(snapshot.heartbeat_timeout_ms);
        self.election_timeout = Duration::from_millis(snapshot.election_timeout_ms);
        self.max_retained_committed_logs = snapshot.max_retained_committed_logs;
        self.max_retained_command_results = snapshot.max_retained_command_results;
    }
}

/// Builder enforcing that a `data_ops_module` is always supplied — leaving
/// the construction-time validation failure a compile-time one
/// rather than a runtime panic.
pub struct ConfigBuilder {
    heartbeat_timeout: Duration,
    election_timeout: Duration,
    max_retained_committed_logs: usize,
    max_retained_command_results: usize,
    comm: Option<Arc<dyn Comm>>,
    leader_hook: Option<Arc<dyn LeaderHook>>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        let defaults = ConfigSnapshot::default();
        Self {
            heartbeat_timeout: Duration::from_millis(defaults.heartbeat_timeout_ms),
            election_timeout: Duration::from_millis(defaults.election_timeout_ms),
            max_retained_committed_logs: defaults.max_retained_committed_logs,
            max_retained_command_results: defaults.max_retained_command_results,
            comm: None,
            leader_hook: None,
        }
    }
}

impl ConfigBuilder {
    pub fn heartbeat_timeout(mut self, d: Duration) -> Self {
        self.heartbeat_timeout = d;
        self
    }

    pub fn election_timeout(mut self, d: Duration) -> Self {
        self.election_timeout = d;
        self
    }

    pub fn max_retained_committed_logs(mut self, n: usize) -> Self {
        self.max_retained_committed_logs = n;
        self
    }

    pub fn max_retained_command_results(mut self, n: usize) -> Self {
        self.max_retained_command_results = n;
        self
    }

    pub fn communication_module(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn leader_hook_module(mut self, hook: Arc<dyn LeaderHook>) -> Self {
        self.leader_hook = Some(hook);
        self
    }

    /// Finish the builder. `data_ops_module` is required: without it there
    /// is nothing for committed commands to run against.
    pub fn build(self, data_ops: Arc<dyn DataOps>) -> Config {
        Config {
            heartbeat_timeout: self.heartbeat_timeout,
            election_timeout: self.election_timeout,
            max_retained_committed_logs: self.max_retained_committed_logs,
            max_retained_command_results: self.max_retained_command_results,
            data_ops,
            comm: self
                .comm
                .unwrap_or_else(|| Arc::new(crate::comm::ChannelComm::unrouted())),
            leader_hook: self.leader_hook.unwrap_or_else(|| Arc::new(NoopLeaderHook)),
        }
    }
}
