//! Fault injection presets for the in-process cluster.
//!
//! Applies message loss, delay, partitions and crashes to a `Cluster`'s
//! shared fault state. Every replica runs the same real `Server` state
//! machine, not a scriptable stand-in, so faults are limited to what the
//! transport can do to messages rather than what a node can be told to do.

use crate::cluster::Cluster;
use raft_core::NodeId;
use std::time::Duration;

/// Fault injection configuration applied to a cluster for the duration of a
/// scenario.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of message loss (0.0-1.0).
    pub message_loss_probability: f64,
    /// Fixed delay applied to every delivered message, if any.
    pub delay: Option<Duration>,
}

impl FaultConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn light() -> Self {
        Self {
            message_loss_probability: 0.05,
            ..Default::default()
        }
    }

    pub fn heavy() -> Self {
        Self {
            message_loss_probability: 0.20,
            ..Default::default()
        }
    }

    pub fn slow_network() -> Self {
        Self {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        }
    }
}

pub fn apply(cluster: &Cluster, config: &FaultConfig) {
    cluster.set_message_loss_probability(config.message_loss_probability);
    cluster.set_delay(config.delay);
}

/// Split `nodes` into a minority of size `minority_size` and the rest,
/// sever every cross link, and return the two groups.
pub fn partition_minority(cluster: &Cluster, nodes: &[NodeId], minority_size: usize) -> (Vec<NodeId>, Vec<NodeId>) {
    let minority: Vec<NodeId> = nodes[..minority_size].to_vec();
    let majority: Vec<NodeId> = nodes[minority_size..].to_vec();
    cluster.partition(&minority, &majority);
    (minority, majority)
}
