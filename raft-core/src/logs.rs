//! Log storage, append/truncate, commit-index advance and follower progress
//! tracking.

use crate::config::Config;
use crate::members::Members;
use crate::message::{EntryPayload, LogEntry};
use crate::types::{LogIndex, LogPosition, NodeId, TermNumber};
use std::collections::{HashMap, VecDeque};

/// Result of asking a leader to build the next `AppendEntriesRequest` for a
/// follower.
pub enum AppendEntriesPlan {
    /// Send these entries starting right after `prev_log`.
    Send {
        prev_log: LogPosition,
        entries: Vec<LogEntry>,
    },
    /// The follower's `next_index` has fallen out of the retained window;
    /// the caller should send `InstallSnapshot` and reset `next_index` to
    /// `last_committed.index + 1`.
    TooOld,
    /// `follower` is not (or no longer) a recognized follower.
    UnknownFollower,
}

#[derive(Debug, Clone)]
pub struct Logs {
    /// Entries currently retained, oldest first. May include both committed
    /// (within the retention window) and uncommitted entries.
    entries: VecDeque<LogEntry>,
    /// Log index of `entries[0]`, or `last_committed.index + 1` if `entries`
    /// is empty.
    first_index: LogIndex,
    last_committed: LogPosition,
    /// Leader-only: next index to send each follower.
    next_index: HashMap<NodeId, LogIndex>,
    /// Leader-only: highest index known replicated to each follower.
    match_index: HashMap<NodeId, LogIndex>,
}

impl Default for Logs {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            last_committed: LogPosition::START,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }
}

impl Logs {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset_of(&self, index: LogIndex) -> Option<usize> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        if offset < self.entries.len() {
            Some(offset)
        } else {
            None
        }
    }

    pub fn get_entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.offset_of(index).map(|o| &self.entries[o])
    }

    pub fn last_entry(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn last_position(&self) -> LogPosition {
        self.last_entry()
            .map(|e| LogPosition::new(e.term, e.index))
            .unwrap_or(self.last_committed)
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_position().index
    }

    pub fn last_committed(&self) -> LogPosition {
        self.last_committed
    }

    pub fn last_committed_entry(&self) -> Option<&LogEntry> {
        if self.last_committed.index == 0 {
            None
        } else {
            self.get_entry_at(self.last_committed.index)
        }
    }

    /// True iff `index == 0`, or the log holds an entry at `index` whose
    /// term matches `term` (Raft's `prevLogIndex`/`prevLogTerm` check).
    pub fn contain_given_prev_log(&self, term: TermNumber, index: LogIndex) -> bool {
        if index == 0 {
            return true;
        }
        if index == self.last_committed.index {
            return term == self.last_committed.term;
        }
        self.get_entry_at(index).is_some_and(|e| e.term == term)
    }

    fn truncate_from(&mut self, index: LogIndex, members: &mut Members) {
        if let Some(offset) = self.offset_of(index) {
            let removed_membership_change = self.entries[offset..]
                .iter()
                .any(LogEntry::is_membership_change);
            self.entries.truncate(offset);
            if removed_membership_change {
                members.clear_uncommitted_membership_change();
            }
        }
    }

    fn append_one(&mut self, entry: LogEntry) {
        if self.entries.is_empty() {
            self.first_index = entry.index;
        }
        self.entries.push_back(entry);
    }

    fn prune_retained_window(&mut self, config: &Config) {
        let retain_budget = config.max_retained_committed_logs;
        let committed_count = self
            .entries
            .iter()
            .take_while(|e| e.index <= self.last_committed.index)
            .count();
        if committed_count > retain_budget {
            let drop_count = committed_count - retain_budget;
            for _ in 0..drop_count {
                self.entries.pop_front();
            }
            if let Some(front) = self.entries.front() {
                self.first_index = front.index;
            } else {
                self.first_index = self.last_committed.index + 1;
            }
        }
    }

    /// Advance `last_committed` to `min(leader_commit, last_index)`,
    /// returning the newly committed entries in ascending index order
    /// (the caller applies them immediately).
    fn advance_commit_to(&mut self, leader_commit: LogIndex) -> Vec<LogEntry> {
        let target = leader_commit.min(self.last_index());
        if target <= self.last_committed.index {
            return Vec::new();
        }
        let mut applicable = Vec::new();
        for index in (self.last_committed.index + 1)..=target {
            if let Some(entry) = self.get_entry_at(index) {
                applicable.push(entry.clone());
            }
        }
        if let Some(last) = applicable.last() {
            self.last_committed = LogPosition::new(last.term, last.index);
        }
        applicable
    }

    /// Follower-side `AppendEntries` handling: truncate on conflict, append
    /// new entries, advance commit. Returns the newly applicable entries.
    pub fn append_entries(
        &mut self,
        members: &mut Members,
        entries: &[LogEntry],
        leader_commit: LogIndex,
        config: &Config,
    ) -> Vec<LogEntry> {
        for entry in entries {
            match self.get_entry_at(entry.index) {
                Some(existing) if existing.term == entry.term => {
                    // Already present and matching; idempotent no-op.
                }
                Some(_) => {
                    self.truncate_from(entry.index, members);
                    self.append_one(entry.clone());
                }
                None => {
                    self.append_one(entry.clone());
                }
            }
        }
        let applicable = self.advance_commit_to(leader_commit);
        for entry in &applicable {
            if entry.is_membership_change() {
                members.membership_change_committed(entry.index);
            }
        }
        self.prune_retained_window(config);
        applicable
    }

    /// Leader-side: append one entry at the next index.
    pub fn add_entry<F: FnOnce(LogIndex) -> LogEntry>(&mut self, f: F) -> LogEntry {
        let index = self.last_index() + 1;
        let entry = f(index);
        self.append_one(entry.clone());
        entry
    }

    /// Seed an empty log from an `InstallSnapshot`'s `last_committed_entry`:
    /// the receiver's log now starts right at that entry, already committed.
    pub fn seed_from_snapshot(&mut self, entry: LogEntry) {
        self.last_committed = LogPosition::new(entry.term, entry.index);
        self.first_index = entry.index;
        self.entries = VecDeque::new();
        self.entries.push_back(entry);
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Reset `next_index[follower]` to just past the last committed entry,
    /// the recovery step after discovering `make_append_entries_plan`
    /// reports the follower as too far behind the retained window.
    pub fn reset_next_index_to_committed(&mut self, follower: &NodeId) {
        self.next_index
            .insert(follower.clone(), self.last_committed.index + 1);
    }

    /// Append a `leader_elected` entry and (re)initialize per-follower
    /// progress tracking for the current membership.
    pub fn elected_leader(&mut self, members: &Members, term: TermNumber, config: &Config) -> LogEntry {
        let entry = self.add_entry(|index| {
            LogEntry::new(
                term,
                index,
                EntryPayload::LeaderElected {
                    leader: members.self_id().clone(),
                },
            )
        });
        let next = self.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in members.other_members_list() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }
        let _ = config;
        entry
    }

    pub fn next_index_of(&self, follower: &NodeId) -> Option<LogIndex> {
        self.next_index.get(follower).copied()
    }

    pub fn match_index_of(&self, follower: &NodeId) -> Option<LogIndex> {
        self.match_index.get(follower).copied()
    }

    pub fn register_follower(&mut self, follower: NodeId) {
        let next = self.last_index() + 1;
        self.next_index.insert(follower.clone(), next);
        self.match_index.insert(follower, 0);
    }

    pub fn forget_follower(&mut self, follower: &NodeId) {
        self.next_index.remove(follower);
        self.match_index.remove(follower);
    }

    pub fn decrement_next_index_of_follower(&mut self, from: &NodeId) {
        if let Some(next) = self.next_index.get_mut(from) {
            *next = (*next).saturating_sub(1).max(1);
        }
    }

    /// Raise `match_index[from]` monotonically and recompute the commit
    /// index: the highest `N` from the current term for which a majority of
    /// `members`' voters (self implicitly caught up) have `match_index >= N`.
    /// Returns the newly applicable entries.
    pub fn set_follower_index(
        &mut self,
        members: &mut Members,
        term: TermNumber,
        from: &NodeId,
        i_replicated: LogIndex,
        config: &Config,
    ) -> Vec<LogEntry> {
        if let Some(existing) = self.match_index.get(from).copied() {
            if i_replicated > existing {
                self.match_index.insert(from.clone(), i_replicated);
            }
        }
        if let Some(next) = self.next_index.get_mut(from) {
            *next = (*next).max(i_replicated + 1);
        }

        let voter_count = members.voter_count();
        let majority = voter_count / 2 + 1;
        let last_index = self.last_index();
        let mut new_commit = self.last_committed.index;
        for candidate_index in (self.last_committed.index + 1)..=last_index {
            let Some(entry) = self.get_entry_at(candidate_index) else {
                break;
            };
            if entry.term != term {
                continue;
            }
            // self always counts as caught up to `last_index`.
            let mut count = 1;
            for peer in members.other_members_list() {
                if self.match_index.get(&peer).copied().unwrap_or(0) >= candidate_index {
                    count += 1;
                }
            }
            if count >= majority {
                new_commit = candidate_index;
            }
        }
        let applicable = if new_commit > self.last_committed.index {
            self.advance_commit_to(new_commit)
        } else {
            Vec::new()
        };
        for entry in &applicable {
            if entry.is_membership_change() {
                members.membership_change_committed(entry.index);
            }
        }
        self.prune_retained_window(config);
        applicable
    }

    /// Lonely leader (no other voters): commit straight up to the last
    /// entry, since there is no one else to wait on.
    pub fn commit_to_latest(&mut self) -> Vec<LogEntry> {
        let last = self.last_index();
        self.advance_commit_to(last)
    }

    /// Build the next `AppendEntriesRequest` payload for `follower`.
    pub fn make_append_entries_plan(&self, follower: &NodeId) -> AppendEntriesPlan {
        let Some(next) = self.next_index.get(follower).copied() else {
            return AppendEntriesPlan::UnknownFollower;
        };
        if next < self.first_index && next != self.last_committed.index + 1 {
            return AppendEntriesPlan::TooOld;
        }
        let prev_index = next.saturating_sub(1);
        let prev_log = if prev_index == 0 {
            LogPosition::START
        } else if prev_index == self.last_committed.index {
            self.last_committed
        } else if let Some(e) = self.get_entry_at(prev_index) {
            LogPosition::new(e.term, e.index)
        } else {
            return AppendEntriesPlan::TooOld;
        };
        let entries = (next..=self.last_index())
            .filter_map(|i| self.get_entry_at(i).cloned())
            .collect();
        AppendEntriesPlan::Send { prev_log, entries }
    }

    /// A candidate's log is at least as up to date as ours iff
    /// its `(lastTerm, lastIndex)` is `>=` ours lexicographically.
    pub fn candidate_log_up_to_date(&self, candidate_last_log: LogPosition) -> bool {
        candidate_last_log >= self.last_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use serde_json::Value;
    use std::sync::Arc;

    struct NoopData;
    impl crate::config::DataOps for NoopData {
        fn new(&self) -> Value {
            Value::Null
        }
        fn command(&self, data: &Value, _arg: &Value) -> (Value, Value) {
            (Value::Null, data.clone())
        }
        fn query(&self, _data: &Value, _arg: &Value) -> Value {
            Value::Null
        }
    }

    fn test_config() -> Config {
        ConfigBuilder::default().build(Arc::new(NoopData))
    }

    fn command_entry(term: TermNumber, index: LogIndex) -> LogEntry {
        LogEntry::new(
            term,
            index,
            EntryPayload::Command {
                client: crate::types::ClientHandle::Anonymous,
                arg: serde_json::json!(1),
                command_id: format!("c{index}"),
            },
        )
    }

    #[test]
    fn empty_log_treats_index_zero_as_matching() {
        let logs = Logs::new();
        assert!(logs.contain_given_prev_log(0, 0));
        assert!(!logs.contain_given_prev_log(1, 5));
    }

    #[test]
    fn append_then_commit_returns_applicable_entries() {
        let mut members = Members::new_for_lonely_leader("a".into());
        let config = test_config();
        let mut logs = Logs::new();
        let entries = vec![command_entry(1, 1), command_entry(1, 2)];
        let applicable = logs.append_entries(&mut members, &entries, 2, &config);
        assert_eq!(applicable.len(), 2);
        assert_eq!(logs.last_committed().index, 2);
    }

    #[test]
    fn conflicting_entry_truncates_the_tail() {
        let mut members = Members::new_for_lonely_leader("a".into());
        let config = test_config();
        let mut logs = Logs::new();
        logs.append_entries(&mut members, &[command_entry(1, 1), command_entry(1, 2)], 0, &config);
        // A new leader at term 2 overwrites index 2.
        let replacement = command_entry(2, 2);
        logs.append_entries(&mut members, &[replacement.clone()], 0, &config);
        assert_eq!(logs.get_entry_at(2).unwrap().term, 2);
    }

    #[test]
    fn leader_commits_to_latest_when_alone() {
        let mut logs = Logs::new();
        logs.add_entry(|index| command_entry(1, index));
        logs.add_entry(|index| command_entry(1, index));
        let applicable = logs.commit_to_latest();
        assert_eq!(applicable.len(), 2);
        assert_eq!(logs.last_committed().index, 2);
    }

    #[test]
    fn set_follower_index_commits_on_majority_of_current_term() {
        let mut members = Members::new_for_lonely_leader("a".into());
        members
            .start_adding_follower(
                LogEntry::new(1, 1, EntryPayload::AddFollower { peer: "b".into() }),
                "b".into(),
            )
            .unwrap();
        let config = test_config();
        let mut logs = Logs::new();
        logs.elected_leader(&members, 1, &config);
        logs.add_entry(|index| command_entry(1, index));
        // b hasn't replicated yet.
        assert_eq!(logs.last_committed().index, 0);
        let applicable = logs.set_follower_index(&mut members, 1, &"b".to_string(), 2, &config);
        assert_eq!(applicable.len(), 1);
        assert_eq!(logs.last_committed().index, 2);
    }

    #[test]
    fn candidate_up_to_date_check_is_lexicographic() {
        let mut logs = Logs::new();
        logs.add_entry(|index| command_entry(3, index));
        assert!(logs.candidate_log_up_to_date(LogPosition::new(3, 1)));
        assert!(logs.candidate_log_up_to_date(LogPosition::new(4, 0)));
        assert!(!logs.candidate_log_up_to_date(LogPosition::new(2, 999)));
    }

    #[test]
    fn decrement_next_index_floors_at_one() {
        let mut logs = Logs::new();
        logs.register_follower("b".into());
        for _ in 0..100 {
            logs.decrement_next_index_of_follower(&"b".to_string());
        }
        assert_eq!(logs.next_index_of(&"b".to_string()), Some(1));
    }
}
