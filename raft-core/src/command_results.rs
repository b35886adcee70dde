//! Bounded command-id → result cache, enforcing at-most-once command
//! application per replica.

use crate::types::CommandId;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct CommandResults {
    order: VecDeque<CommandId>,
    results: HashMap<CommandId, serde_json::Value>,
}

impl CommandResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(&self, id: &str) -> Option<&serde_json::Value> {
        self.results.get(id)
    }

    /// Insert `(id, result)`, evicting the oldest entry if this insertion
    /// would exceed `max`. A re-`put` of an id already present does not grow
    /// the order queue twice.
    pub fn put(&mut self, id: CommandId, result: serde_json::Value, max: usize) {
        if self.results.insert(id.clone(), result).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > max {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Snapshot as an ordered `Vec`, oldest first — used to populate
    /// `InstallSnapshot` for a newly joining follower.
    pub fn to_vec(&self) -> Vec<(CommandId, serde_json::Value)> {
        self.order
            .iter()
            .map(|id| (id.clone(), self.results[id].clone()))
            .collect()
    }

    /// Rebuild from an ordered snapshot (oldest first), as received via
    /// `InstallSnapshot`.
    pub fn from_vec(entries: Vec<(CommandId, serde_json::Value)>) -> Self {
        let mut cr = Self::new();
        for (id, result) in entries {
            cr.order.push_back(id.clone());
            cr.results.insert(id, result);
        }
        cr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fetch_misses_before_put() {
        let cr = CommandResults::new();
        assert!(cr.fetch("a").is_none());
    }

    #[test]
    fn put_then_fetch_hits() {
        let mut cr = CommandResults::new();
        cr.put("a".to_string(), json!(1), 10);
        assert_eq!(cr.fetch("a"), Some(&json!(1)));
    }

    #[test]
    fn evicts_oldest_over_capacity() {
        let mut cr = CommandResults::new();
        cr.put("a".to_string(), json!(1), 2);
        cr.put("b".to_string(), json!(2), 2);
        cr.put("c".to_string(), json!(3), 2);
        assert!(cr.fetch("a").is_none());
        assert_eq!(cr.fetch("b"), Some(&json!(2)));
        assert_eq!(cr.fetch("c"), Some(&json!(3)));
        assert_eq!(cr.len(), 2);
    }

    #[test]
    fn reinserting_same_id_does_not_grow_queue() {
        let mut cr = CommandResults::new();
        cr.put("a".to_string(), json!(1), 2);
        cr.put("a".to_string(), json!(2), 2);
        assert_eq!(cr.len(), 1);
        assert_eq!(cr.fetch("a"), Some(&json!(2)));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut cr = CommandResults::new();
        cr.put("a".to_string(), json!(1), 10);
        cr.put("b".to_string(), json!(2), 10);
        let restored = CommandResults::from_vec(cr.to_vec());
        assert_eq!(restored.fetch("a"), Some(&json!(1)));
        assert_eq!(restored.fetch("b"), Some(&json!(2)));
        assert_eq!(restored.len(), 2);
    }
}
