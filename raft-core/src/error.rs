//! Crate-wide error taxonomy.
//!
//! `ClientError` is the wire-facing subset: it is `Clone`/`Serialize` so
//! a `Comm` implementation can ship it back to an out-of-process caller.
//! `RaftError` is the broader internal error used for `?` throughout the
//! crate; it wraps codec and channel failures that never need to cross the
//! wire and converts into `ClientError` at the one seam that matters (the
//! reply sent from `Server`).

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned to a synchronous client request.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ClientError {
    #[error("not leader (known leader: {known_leader:?})")]
    NotLeader { known_leader: Option<NodeId> },

    #[error("removing {peer} would break quorum")]
    WillBreakQuorum { peer: NodeId },

    #[error("new leader {peer} is currently unresponsive")]
    NewLeaderUnresponsive { peer: NodeId },

    #[error("another membership change is already uncommitted")]
    UncommittedMembershipChange,

    #[error("transport could not reach {peer}")]
    NoProc { peer: NodeId },

    #[error("peer {peer} is not a member of the voting set")]
    UnknownFollower { peer: NodeId },

    #[error("client request timed out")]
    Timeout,
}

/// Broader internal error, covering everything in `ClientError` plus
/// operations that are fatal to the initiator or never reach a client.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("config is missing a required data_ops_module")]
    MissingDataOps,

    #[error("log entry payload could not be encoded or decoded: {0}")]
    PayloadCodec(#[from] serde_json::Error),

    #[error("log entry binary encoding is truncated or corrupt")]
    MalformedLogEntry,

    #[error("reply channel dropped before a reply could be delivered")]
    ReplyChannelClosed,
}

pub type Result<T> = std::result::Result<T, RaftError>;
pub type ClientResult<T> = std::result::Result<T, ClientError>;
