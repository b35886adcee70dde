//! Leader-only bookkeeping: heartbeat timer, per-follower response times,
//! and the quorum-reach timestamp backing the read lease.

use crate::config::Config;
use crate::members::Members;
use crate::timer::Timer;
use crate::types::NodeId;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Leadership {
    heartbeat_timer: Timer,
    last_response_time: HashMap<NodeId, Instant>,
    quorum_reached_at: Instant,
}

impl Leadership {
    pub fn new_for_leader(config: &Config) -> Self {
        Self {
            heartbeat_timer: Timer::armed(config.heartbeat_timeout),
            last_response_time: HashMap::new(),
            quorum_reached_at: Instant::now(),
        }
    }

    pub fn heartbeat_deadline(&self) -> Instant {
        self.heartbeat_timer.deadline()
    }

    pub fn reset_heartbeat_timer(&mut self, config: &Config) {
        self.heartbeat_timer.rearm(config.heartbeat_timeout);
    }

    pub fn stop_timers(&mut self) {
        self.heartbeat_timer.disarm();
    }

    /// Record that `from` responded just now, and refresh the quorum
    /// timestamp if a majority of voters have responded within the last
    /// `election_timeout`.
    pub fn follower_responded(&mut self, members: &Members, from: NodeId, config: &Config) {
        let now = Instant::now();
        self.last_response_time.insert(from, now);
        let fresh_count = members
            .voters()
            .iter()
            .filter(|id| *id == members.self_id())
            .count()
            + self
                .last_response_time
                .iter()
                .filter(|(id, at)| {
                    members.is_voter(id) && now.duration_since(**at) < config.election_timeout
                })
                .count();
        let needed = members.voter_count() / 2 + 1;
        if fresh_count >= needed {
            self.quorum_reached_at = now;
        }
    }

    /// True iff the read lease has lapsed: no fresh quorum response within
    /// the last `election_timeout`.
    pub fn minimum_timeout_elapsed_since_quorum_responded(&self, config: &Config) -> bool {
        self.quorum_reached_at.elapsed() >= config.election_timeout
    }

    /// Voters whose last response predates `election_timeout`, or who have
    /// never responded at all.
    pub fn unresponsive_followers(&self, members: &Members, config: &Config) -> Vec<NodeId> {
        let now = Instant::now();
        members
            .other_members_list()
            .into_iter()
            .filter(|id| match self.last_response_time.get(id) {
                None => true,
                Some(at) => now.duration_since(*at) >= config.election_timeout,
            })
            .collect()
    }

    /// True iff removing `pid` still leaves a responsive majority of the
    /// *remaining* voting set.
    pub fn can_safely_remove(&self, members: &Members, pid: &NodeId, config: &Config) -> bool {
        let remaining_voters = members.voter_count().saturating_sub(1);
        if remaining_voters == 0 {
            return true;
        }
        let now = Instant::now();
        let responsive = members
            .voters()
            .iter()
            .filter(|id| *id != pid)
            .filter(|id| {
                *id == members.self_id()
                    || self
                        .last_response_time
                        .get(*id)
                        .is_some_and(|at| now.duration_since(*at) < config.election_timeout)
            })
            .count();
        responsive >= remaining_voters / 2 + 1
    }

    pub fn remove_follower_response_time_entry(&mut self, pid: &NodeId) {
        self.last_response_time.remove(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

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
        ConfigBuilder::default()
            .election_timeout(Duration::from_millis(50))
            .build(Arc::new(NoopData))
    }

    #[test]
    fn lease_starts_valid_on_construction() {
        let config = test_config();
        let leadership = Leadership::new_for_leader(&config);
        assert!(!leadership.minimum_timeout_elapsed_since_quorum_responded(&config));
    }

    #[test]
    fn nobody_is_unresponsive_before_any_timeout_elapses() {
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
        let mut leadership = Leadership::new_for_leader(&config);
        leadership.follower_responded(&members, "b".to_string(), &config);
        assert!(leadership.unresponsive_followers(&members, &config).is_empty());
    }

    #[test]
    fn can_safely_remove_a_responsive_follower_from_a_three_node_group() {
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
        members
            .start_removing_follower(
                crate::message::LogEntry::new(
                    1,
                    2,
                    crate::message::EntryPayload::RemoveFollower { peer: "z".into() },
                ),
                &"z".to_string(),
            )
            .unwrap_err();
        members.membership_change_committed(1);
        members
            .start_adding_follower(
                crate::message::LogEntry::new(
                    1,
                    2,
                    crate::message::EntryPayload::AddFollower { peer: "c".into() },
                ),
                "c".into(),
            )
            .unwrap();
        let mut leadership = Leadership::new_for_leader(&config);
        leadership.follower_responded(&members, "b".to_string(), &config);
        leadership.follower_responded(&members, "c".to_string(), &config);
        assert!(leadership.can_safely_remove(&members, &"c".to_string(), &config));
    }
}
