//! Per-term vote bookkeeping and the election timer.
//!
//! `Election` is role-agnostic storage; `Server` arms/disarms its timer and
//! calls the right update method as it transitions roles. `votes_granted`
//! and the leader-message timestamp are only meaningful for, respectively,
//! a candidate and a follower/candidate — a leader carries an `Election` too
//! (so `voted_for` for the current term survives the transition) but never
//! consults those two fields.

use crate::config::Config;
use crate::members::Members;
use crate::timer::{randomized_election_timeout, Timer};
use crate::types::NodeId;
use std::collections::BTreeSet;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Election {
    voted_for: Option<NodeId>,
    timer: Timer,
    votes_granted: BTreeSet<NodeId>,
    last_leader_message_at: Option<Instant>,
}

impl Election {
    pub fn new_for_leader() -> Self {
        Self {
            voted_for: None,
            timer: Timer::disarmed(),
            votes_granted: BTreeSet::new(),
            last_leader_message_at: None,
        }
    }

    pub fn new_for_follower(config: &Config) -> Self {
        Self {
            voted_for: None,
            timer: Timer::armed(randomized_election_timeout(config.election_timeout)),
            votes_granted: BTreeSet::new(),
            last_leader_message_at: None,
        }
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn timer_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Clear `voted_for`, self-vote, and arm a fresh randomized election
    /// timer. Called on entry to the candidate role and on every subsequent
    /// split-vote retry.
    pub fn update_for_candidate(&mut self, self_id: &NodeId, config: &Config) {
        self.voted_for = Some(self_id.clone());
        self.votes_granted.clear();
        self.votes_granted.insert(self_id.clone());
        self.timer
            .rearm(randomized_election_timeout(config.election_timeout));
    }

    /// Clear the leader-message timestamp and arm a fresh election timer.
    /// Called whenever a replica (re)enters the follower role. `new_term`
    /// must be `true` when this follows a term bump (a higher-term RPC, or
    /// a fresh `InstallSnapshot`): `voted_for` is only valid for the term it
    /// was recorded in, so it is cleared. Stepping down to follower within
    /// the *same* term (e.g. discovering a current leader while candidate)
    /// must pass `false` — the term's vote, if any, still stands.
    pub fn update_for_follower(&mut self, config: &Config, new_term: bool) {
        self.last_leader_message_at = None;
        self.votes_granted.clear();
        if new_term {
            self.voted_for = None;
        }
        self.timer
            .rearm(randomized_election_timeout(config.election_timeout));
    }

    pub fn disarm_timer(&mut self) {
        self.timer.disarm();
    }

    /// Record `candidate` as this term's vote, and reset the election timer
    /// (granting a vote is itself evidence of a live peer).
    pub fn vote_for(&mut self, candidate: NodeId, config: &Config) {
        self.voted_for = Some(candidate);
        self.timer
            .rearm(randomized_election_timeout(config.election_timeout));
    }

    /// Record a message from the current leader, resetting the timer.
    pub fn reset_timer_for_leader_message(&mut self, config: &Config) {
        self.last_leader_message_at = Some(Instant::now());
        self.timer
            .rearm(randomized_election_timeout(config.election_timeout));
    }

    /// Add `from`'s granted vote, returning whether a majority of `members`'
    /// voters (self included) have now granted a vote this term.
    pub fn gain_vote(&mut self, members: &Members, from: NodeId) -> bool {
        self.votes_granted.insert(from);
        let needed = members.voter_count() / 2 + 1;
        self.votes_granted.len() >= needed
    }

    /// True iff at least `election_timeout` has elapsed since the last
    /// message from a legitimate leader (or none has ever been seen) — used
    /// to deny `RequestVote` while a valid lease is in effect.
    pub fn minimum_timeout_elapsed_since_last_leader_message(&self, config: &Config) -> bool {
        match self.last_leader_message_at {
            None => true,
            Some(t) => t.elapsed() >= config.election_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::members::Members;
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

    #[test]
    fn candidate_self_votes() {
        let config = test_config();
        let members = Members::new_for_lonely_leader("a".into());
        let mut election = Election::new_for_follower(&config);
        election.update_for_candidate(&"a".to_string(), &config);
        assert_eq!(election.voted_for(), Some(&"a".to_string()));
        assert_eq!(members.voter_count(), 1);
    }

    #[test]
    fn gain_vote_reaches_majority_of_two() {
        let config = test_config();
        let mut members = Members::new_for_lonely_leader("a".into());
        members
            .start_adding_follower(
                crate::message::LogEntry::new(
                    1,
                    1,
                    crate::message::EntryPayload::AddFollower { peer: "b".into() },
                ),
                "b".into(),
            )
            .unwrap();
        let mut election = Election::new_for_follower(&config);
        election.update_for_candidate(&"a".to_string(), &config);
        // self("a") + "b" = 2 of 2 voters -> majority.
        assert!(election.gain_vote(&members, "b".to_string()));
    }

    #[test]
    fn no_leader_message_means_lease_already_expired() {
        let config = test_config();
        let election = Election::new_for_follower(&config);
        assert!(election.minimum_timeout_elapsed_since_last_leader_message(&config));
    }

    #[test]
    fn fresh_leader_message_means_lease_is_valid() {
        let config = test_config();
        let mut election = Election::new_for_follower(&config);
        election.reset_timer_for_leader_message(&config);
        assert!(!election.minimum_timeout_elapsed_since_last_leader_message(&config));
    }
}
