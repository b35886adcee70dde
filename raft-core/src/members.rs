//! Peer set, leader pointer, and pending membership/leader-change bookkeeping.
//! `Members` never talks to the network; it is pure state mutated by
//! `Server` in response to committed entries and client requests.

use crate::message::LogEntry;
use crate::types::{LogIndex, NodeId};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Members {
    self_id: NodeId,
    voters: BTreeSet<NodeId>,
    leader: Option<NodeId>,
    /// The single in-flight add/remove entry, if any — only one membership
    /// change may be outstanding at a time.
    uncommitted_membership_change: Option<LogEntry>,
    /// Target of a cooperative leader handoff requested via `replace_leader`.
    pending_leader_change: Option<NodeId>,
}

impl Members {
    /// Bootstrap a brand-new group containing only `self_id`, with `self_id`
    /// as its own leader (`create_new_consensus_group`).
    pub fn new_for_lonely_leader(self_id: NodeId) -> Self {
        let mut voters = BTreeSet::new();
        voters.insert(self_id.clone());
        Self {
            leader: Some(self_id.clone()),
            self_id,
            voters,
            uncommitted_membership_change: None,
            pending_leader_change: None,
        }
    }

    /// A follower's view, seeded with whatever peer set it learned about
    /// from an `InstallSnapshot` (join path).
    pub fn new_from_snapshot(self_id: NodeId, voters: Vec<NodeId>) -> Self {
        Self {
            self_id,
            voters: voters.into_iter().collect(),
            leader: None,
            uncommitted_membership_change: None,
            pending_leader_change: None,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    pub fn voter_count(&self) -> usize {
        self.voters.len()
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.voters.contains(id)
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn put_leader(&mut self, leader: Option<NodeId>) {
        self.leader = leader;
    }

    /// All voters except `self`, the set `Server` broadcasts RPCs to.
    pub fn other_members_list(&self) -> Vec<NodeId> {
        self.voters
            .iter()
            .filter(|id| *id != &self.self_id)
            .cloned()
            .collect()
    }

    pub fn uncommitted_membership_change(&self) -> Option<&LogEntry> {
        self.uncommitted_membership_change.as_ref()
    }

    pub fn has_uncommitted_membership_change(&self) -> bool {
        self.uncommitted_membership_change.is_some()
    }

    /// Adopt `entry` as the pending add, growing the voting set immediately
    /// per Raft's single-server membership change. Fails if another change
    /// is already uncommitted.
    pub fn start_adding_follower(&mut self, entry: LogEntry, peer: NodeId) -> Result<(), ()> {
        if self.uncommitted_membership_change.is_some() {
            return Err(());
        }
        self.voters.insert(peer);
        self.uncommitted_membership_change = Some(entry);
        Ok(())
    }

    /// Adopt `entry` as the pending removal, shrinking the voting set
    /// immediately. Fails if another change is already uncommitted.
    pub fn start_removing_follower(&mut self, entry: LogEntry, peer: &NodeId) -> Result<(), ()> {
        if self.uncommitted_membership_change.is_some() {
            return Err(());
        }
        self.voters.remove(peer);
        self.uncommitted_membership_change = Some(entry);
        Ok(())
    }

    /// Clear the pending entry once its index has committed.
    pub fn membership_change_committed(&mut self, index: LogIndex) {
        if let Some(entry) = &self.uncommitted_membership_change {
            if entry.index == index {
                self.uncommitted_membership_change = None;
            }
        }
    }

    /// Undo an in-flight membership change truncated off the log before it
    /// committed (log-matching repair).
    pub fn clear_uncommitted_membership_change(&mut self) {
        self.uncommitted_membership_change = None;
    }

    pub fn pending_leader_change(&self) -> Option<&NodeId> {
        self.pending_leader_change.as_ref()
    }

    /// Record (or clear, with `None`) the target of a cooperative leader
    /// handoff. The caller is responsible for checking `new_leader` is a
    /// current voter before calling this.
    pub fn start_replacing_leader(&mut self, new_leader: Option<NodeId>) {
        self.pending_leader_change = new_leader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntryPayload;

    fn entry(index: LogIndex, peer: &str) -> LogEntry {
        LogEntry::new(
            1,
            index,
            EntryPayload::AddFollower {
                peer: peer.to_string(),
            },
        )
    }

    #[test]
    fn lonely_leader_is_its_own_sole_voter_and_leader() {
        let m = Members::new_for_lonely_leader("a".into());
        assert_eq!(m.voter_count(), 1);
        assert_eq!(m.leader(), Some(&"a".to_string()));
        assert!(m.other_members_list().is_empty());
    }

    #[test]
    fn adding_follower_grows_voters_immediately() {
        let mut m = Members::new_for_lonely_leader("a".into());
        m.start_adding_follower(entry(1, "b"), "b".into()).unwrap();
        assert_eq!(m.voter_count(), 2);
        assert!(m.is_voter(&"b".to_string()));
        assert!(m.has_uncommitted_membership_change());
    }

    #[test]
    fn second_membership_change_is_rejected_while_first_pending() {
        let mut m = Members::new_for_lonely_leader("a".into());
        m.start_adding_follower(entry(1, "b"), "b".into()).unwrap();
        assert!(m.start_adding_follower(entry(2, "c"), "c".into()).is_err());
    }

    #[test]
    fn commit_clears_pending_change_only_on_matching_index() {
        let mut m = Members::new_for_lonely_leader("a".into());
        m.start_adding_follower(entry(5, "b"), "b".into()).unwrap();
        m.membership_change_committed(4);
        assert!(m.has_uncommitted_membership_change());
        m.membership_change_committed(5);
        assert!(!m.has_uncommitted_membership_change());
    }
}
