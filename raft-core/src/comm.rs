//! Default, in-process `Comm` implementation: a shared registry of
//! `tokio::mpsc` senders keyed by `NodeId`. A real deployment swaps this for
//! a `Comm` backed by sockets.

use crate::config::{ClientReply, Comm};
use crate::message::Message;
use crate::types::{ClientHandle, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

/// An inbound item delivered to a replica's single input loop: either a
/// peer RPC or a reply destined for a waiting local client.
#[derive(Debug)]
pub enum Envelope {
    Rpc(Message),
}

/// Registry mapping `NodeId` to the channel that feeds that replica's FSM
/// loop, plus a table of pending local client reply handles. Shared via
/// `Arc` across every replica wired into the same in-process cluster.
pub struct ChannelComm {
    peers: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    local_replies: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
}

impl ChannelComm {
    /// A `ChannelComm` with no peers registered yet — used as the harmless
    /// default when a `Config` is built without an explicit communication
    /// module (a lone `create_new_consensus_group` replica never needs to
    /// send anywhere until a peer is registered).
    pub fn unrouted() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            local_replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: NodeId, sender: mpsc::UnboundedSender<Envelope>) {
        self.peers.lock().unwrap().insert(id, sender);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.peers.lock().unwrap().remove(id);
    }

    /// Register a oneshot reply handle under a fresh anonymous key, returning
    /// the `ClientHandle` an in-flight log entry should carry so the eventual
    /// `reply` call can find it again.
    pub fn register_local_reply(&self, sender: oneshot::Sender<ClientReply>) -> ClientHandle {
        let key = uuid::Uuid::new_v4().to_string();
        self.local_replies.lock().unwrap().insert(key.clone(), sender);
        ClientHandle::Remote(key)
    }
}

impl Comm for ChannelComm {
    fn send_event(&self, dest: &NodeId, msg: Message) {
        let peers = self.peers.lock().unwrap();
        if let Some(sender) = peers.get(dest) {
            // Fire-and-forget: a full or closed channel is dropped silently,
            // matching the transport's license to drop messages.
            let _ = sender.send(Envelope::Rpc(msg));
        }
    }

    fn reply(&self, client: &ClientHandle, reply: ClientReply) {
        if let ClientHandle::Remote(key) = client {
            if let Some(sender) = self.local_replies.lock().unwrap().remove(key) {
                let _ = sender.send(reply);
            }
        }
    }
}
