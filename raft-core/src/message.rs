//! `LogEntry` definition, its binary codec, and the RPC wire messages.

use crate::error::RaftError;
use crate::types::{ClientHandle, CommandId, LogIndex, NodeId, TermNumber};
use serde::{Deserialize, Serialize};

/// Tunable, loggable subset of `Config` — the part a `change_config` entry
/// carries. The plug-in trait objects (`DataOps`/`Comm`/`LeaderHook`) are not
/// part of this snapshot: they are bound once at construction and are
/// never replaced by a committed log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub heartbeat_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub max_retained_committed_logs: usize,
    pub max_retained_command_results: usize,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 200,
            election_timeout_ms: 1000,
            max_retained_committed_logs: 100,
            max_retained_command_results: 100,
        }
    }
}

/// The six entry payload shapes a log entry may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryPayload {
    Command {
        client: ClientHandle,
        arg: serde_json::Value,
        command_id: CommandId,
    },
    Query {
        client: ClientHandle,
        arg: serde_json::Value,
    },
    ChangeConfig {
        config: ConfigSnapshot,
    },
    LeaderElected {
        leader: NodeId,
    },
    AddFollower {
        peer: NodeId,
    },
    RemoveFollower {
        peer: NodeId,
    },
}

impl EntryPayload {
    fn kind_tag(&self) -> u8 {
        match self {
            EntryPayload::Command { .. } => 0,
            EntryPayload::Query { .. } => 1,
            EntryPayload::ChangeConfig { .. } => 2,
            EntryPayload::LeaderElected { .. } => 3,
            EntryPayload::AddFollower { .. } => 4,
            EntryPayload::RemoveFollower { .. } => 5,
        }
    }
}

/// A single replicated log entry: `(term, index, kind, payload)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: TermNumber,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: TermNumber, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(
            self.payload,
            EntryPayload::AddFollower { .. } | EntryPayload::RemoveFollower { .. }
        )
    }

    /// Encode as `term:64 | index:64 | kind_tag:8 | payload_len:64 | payload_bytes`,
    /// all integers big-endian. Payload bytes are a deterministic `serde_json`
    /// encoding of `EntryPayload`'s data (opaque to the codec itself).
    pub fn to_binary(&self) -> Vec<u8> {
        let payload_bytes = serde_json::to_vec(&self.payload)
            .expect("EntryPayload serialization is infallible for well-formed values");
        let mut out = Vec::with_capacity(8 + 8 + 1 + 8 + payload_bytes.len());
        out.extend_from_slice(&self.term.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.push(self.payload.kind_tag());
        out.extend_from_slice(&(payload_bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(&payload_bytes);
        out
    }

    /// Parse one entry off the front of `bytes`, returning the entry and the
    /// unconsumed remainder. Fails on any malformed input (short header,
    /// unknown kind tag, truncated or corrupt payload). Never panics.
    pub fn extract_from_binary(bytes: &[u8]) -> crate::error::Result<(LogEntry, &[u8])> {
        const HEADER_LEN: usize = 8 + 8 + 1 + 8;
        if bytes.len() < HEADER_LEN {
            return Err(RaftError::MalformedLogEntry);
        }
        let term = TermNumber::from_be_bytes(bytes[0..8].try_into().unwrap());
        let index = LogIndex::from_be_bytes(bytes[8..16].try_into().unwrap());
        let kind_tag = bytes[16];
        let payload_len = u64::from_be_bytes(bytes[17..25].try_into().unwrap());
        let payload_len = usize::try_from(payload_len).map_err(|_| RaftError::MalformedLogEntry)?;
        let payload_start = HEADER_LEN;
        let payload_end = payload_start.checked_add(payload_len).ok_or(RaftError::MalformedLogEntry)?;
        if payload_end > bytes.len() {
            return Err(RaftError::MalformedLogEntry);
        }
        let payload_bytes = &bytes[payload_start..payload_end];
        let payload: EntryPayload = serde_json::from_slice(payload_bytes)?;
        if payload.kind_tag() != kind_tag {
            return Err(RaftError::MalformedLogEntry);
        }
        let entry = LogEntry::new(term, index, payload);
        Ok((entry, &bytes[payload_end..]))
    }
}

/// RPC and client-visible wire messages. All carry `term` where the
/// underlying entity (sender's or subject's) has one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    AppendEntriesRequest {
        term: TermNumber,
        leader_id: NodeId,
        prev_log: crate::types::LogPosition,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesResponse {
        from: NodeId,
        term: TermNumber,
        success: bool,
        /// Present iff `success`.
        i_replicated: Option<LogIndex>,
    },
    RequestVoteRequest {
        term: TermNumber,
        candidate_id: NodeId,
        last_log: crate::types::LogPosition,
        replacing_leader: bool,
    },
    RequestVoteResponse {
        from: NodeId,
        term: TermNumber,
        vote_granted: bool,
    },
    InstallSnapshot {
        members: Vec<NodeId>,
        term: TermNumber,
        last_committed_entry: Option<LogEntry>,
        data: serde_json::Value,
        command_results: Vec<(CommandId, serde_json::Value)>,
        config: ConfigSnapshot,
    },
    TimeoutNow {
        append_entries_req: Box<Message>,
    },
    /// Tells a removed follower its `remove_follower` entry has committed;
    /// the recipient stops participating in the group.
    RemoveFollowerCompleted {
        term: TermNumber,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LogEntry {
        LogEntry::new(
            3,
            7,
            EntryPayload::Command {
                client: ClientHandle::Anonymous,
                arg: serde_json::json!({"op": "incr", "by": 5}),
                command_id: "cmd-1".to_string(),
            },
        )
    }

    #[test]
    fn round_trips_through_binary() {
        let entry = sample_entry();
        let bytes = entry.to_binary();
        let (decoded, rest) = LogEntry::extract_from_binary(&bytes).expect("decodes");
        assert_eq!(decoded, entry);
        assert!(rest.is_empty());
    }

    #[test]
    fn decodes_a_sequence_back_to_back() {
        let a = sample_entry();
        let b = LogEntry::new(
            4,
            8,
            EntryPayload::AddFollower {
                peer: "node-b".to_string(),
            },
        );
        let mut bytes = a.to_binary();
        bytes.extend(b.to_binary());

        let (first, rest) = LogEntry::extract_from_binary(&bytes).expect("decodes");
        assert_eq!(first, a);
        let (second, rest) = LogEntry::extract_from_binary(rest).expect("decodes");
        assert_eq!(second, b);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let bytes = sample_entry().to_binary();
        assert!(LogEntry::extract_from_binary(&bytes[..bytes.len() - 1]).is_err());
        assert!(LogEntry::extract_from_binary(&[]).is_err());
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(LogEntry::extract_from_binary(&[0u8; 10]).is_none());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let entry = sample_entry();
        let mut bytes = entry.to_binary();
        bytes.truncate(bytes.len() - 3);
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }

    #[test]
    fn mismatched_kind_tag_is_rejected() {
        let entry = sample_entry();
        let mut bytes = entry.to_binary();
        // kind tag sits right after the two 64-bit integers.
        bytes[16] = 5;
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }

    #[test]
    fn garbage_payload_length_is_rejected() {
        let entry = sample_entry();
        let mut bytes = entry.to_binary();
        let huge = u64::MAX.to_be_bytes();
        bytes[17..25].copy_from_slice(&huge);
        assert!(LogEntry::extract_from_binary(&bytes).is_none());
    }
}
