//! raft-core
//!
//! A single-server-membership-change Raft replica core: role state machine,
//! replicated log, election protocol, leader lease for local reads, and
//! command deduplication. Transport, storage and the user data state machine
//! are all plug-in traits bound once at construction (`config::Config`); the
//! core itself holds no sockets and touches no disk.

pub mod command_results;
pub mod comm;
pub mod config;
pub mod election;
pub mod error;
pub mod leadership;
pub mod logs;
pub mod members;
pub mod message;
pub mod server;
pub mod timer;
pub mod types;

pub use command_results::CommandResults;
pub use comm::ChannelComm;
pub use config::{ClientReply, Comm, Config, ConfigBuilder, DataOps, LeaderHook, NoopLeaderHook, StatusReply};
pub use election::Election;
pub use error::{ClientError, ClientResult, RaftError, Result};
pub use leadership::Leadership;
pub use logs::{AppendEntriesPlan, Logs};
pub use members::Members;
pub use message::{ConfigSnapshot, EntryPayload, LogEntry, Message};
pub use server::{ClientRequest, Input, Server};
pub use types::{ClientHandle, CommandId, LogIndex, LogPosition, NodeId, TermNumber};
