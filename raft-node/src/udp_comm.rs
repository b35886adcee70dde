//! UDP-backed `Comm`: each replica owns one socket, keeps a directory of
//! peer addresses, and fire-and-forgets JSON-encoded RPCs. Peers are
//! registered by an operator (or learned from an incoming `JoinRequest`)
//! rather than discovered.
//!
//! Alongside the core `Message` RPCs, this transport carries its own
//! `JoinRequest`/`JoinReply` pair so a brand-new process can be added to an
//! existing group over the wire: see `join_existing_consensus_group` in
//! `main.rs` for the requester side of that exchange.

use raft_core::{ClientError, ClientHandle, ClientReply, ClientRequest, Comm, Input, Message, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65536;

/// Everything that can travel over this transport's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireMessage {
    Rpc(Message),
    /// Sent by a not-yet-a-member process to a candidate peer, asking to be
    /// added as a follower.
    JoinRequest { id: NodeId, addr: SocketAddr },
    JoinReply(JoinOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinOutcome {
    Snapshot(Box<Message>),
    NotLeader { known_leader: Option<NodeId> },
    Rejected(String),
}

pub struct UdpComm {
    socket: Arc<UdpSocket>,
    peers: Mutex<HashMap<NodeId, SocketAddr>>,
    local_replies: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
    /// Keys minted by `register_join_reply`, resolved to the joiner's
    /// address rather than a local oneshot.
    join_targets: Mutex<HashMap<String, SocketAddr>>,
}

impl UdpComm {
    pub async fn bind(bind_addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers: Mutex::new(HashMap::new()),
            local_replies: Mutex::new(HashMap::new()),
            join_targets: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn register_peer(&self, id: NodeId, addr: SocketAddr) {
        self.peers.lock().unwrap().insert(id, addr);
    }

    pub fn register_local_reply(&self, sender: oneshot::Sender<ClientReply>) -> ClientHandle {
        let key = uuid::Uuid::new_v4().to_string();
        self.local_replies.lock().unwrap().insert(key.clone(), sender);
        ClientHandle::Remote(key)
    }

    fn register_join_reply(&self, addr: SocketAddr) -> ClientHandle {
        let key = uuid::Uuid::new_v4().to_string();
        self.join_targets.lock().unwrap().insert(key.clone(), addr);
        ClientHandle::Remote(key)
    }

    /// Send a `JoinRequest` directly to `addr` — no peer registration or
    /// `NodeId` resolution needed, since the candidate may not even know
    /// this process exists yet.
    pub fn send_join_request(&self, addr: SocketAddr, id: NodeId, my_addr: SocketAddr) {
        let wire = WireMessage::JoinRequest { id, addr: my_addr };
        let Ok(bytes) = serde_json::to_vec(&wire) else {
            error!("failed to encode join request");
            return;
        };
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!(%e, %addr, "join request send failed");
            }
        });
    }

    /// Block for one datagram and decode it, retrying on malformed input.
    /// Used only during the pre-join handshake, before `spawn_receive_loop`
    /// is running.
    async fn recv_wire(&self) -> std::io::Result<WireMessage> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            match serde_json::from_slice::<WireMessage>(&buf[..len]) {
                Ok(msg) => return Ok(msg),
                Err(e) => warn!(%e, %src, "dropping malformed datagram during join handshake"),
            }
        }
    }

    /// Send a `JoinRequest` to `addr` and wait up to `timeout` for the
    /// matching `JoinReply`. Any other datagram received in the meantime is
    /// discarded (there is no `Server` yet to route it to).
    pub async fn try_join(
        &self,
        addr: SocketAddr,
        id: NodeId,
        my_addr: SocketAddr,
        timeout: std::time::Duration,
    ) -> Option<JoinOutcome> {
        self.send_join_request(addr, id, my_addr);
        loop {
            match tokio::time::timeout(timeout, self.recv_wire()).await {
                Ok(Ok(WireMessage::JoinReply(outcome))) => return Some(outcome),
                Ok(Ok(_other)) => continue,
                Ok(Err(e)) => {
                    warn!(%e, "socket error while awaiting join reply");
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Feed decoded RPCs (and inbound join requests) to `inbox` until the
    /// socket errors out fatally.
    pub fn spawn_receive_loop(self: &Arc<Self>, inbox: mpsc::UnboundedSender<Input>) {
        let comm = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match comm.socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match serde_json::from_slice::<WireMessage>(&buf[..len]) {
                        Ok(WireMessage::Rpc(msg)) => {
                            debug!(?src, "received rpc");
                            if inbox.send(Input::Rpc(msg)).is_err() {
                                break;
                            }
                        }
                        Ok(WireMessage::JoinRequest { id, addr }) => {
                            info!(peer = %id, %addr, "received join request");
                            comm.register_peer(id.clone(), addr);
                            let client = comm.register_join_reply(addr);
                            if inbox.send(Input::Client(ClientRequest::AddFollower { peer: id, client })).is_err() {
                                break;
                            }
                        }
                        Ok(WireMessage::JoinReply(_)) => {
                            debug!(?src, "dropping stray join reply");
                        }
                        Err(e) => warn!(%e, %src, "dropping malformed datagram"),
                    },
                    Err(e) => {
                        error!(%e, "udp receive error");
                    }
                }
            }
        });
    }
}

impl Comm for UdpComm {
    fn send_event(&self, dest: &NodeId, msg: Message) {
        let Some(addr) = self.peers.lock().unwrap().get(dest).copied() else {
            warn!(peer = %dest, "no known address, dropping outbound rpc");
            return;
        };
        let Ok(bytes) = serde_json::to_vec(&WireMessage::Rpc(msg)) else {
            error!("failed to encode outbound rpc");
            return;
        };
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!(%e, %addr, "send failed");
            }
        });
    }

    fn reply(&self, client: &ClientHandle, reply: ClientReply) {
        let ClientHandle::Remote(key) = client else {
            return;
        };
        if let Some(sender) = self.local_replies.lock().unwrap().remove(key) {
            let _ = sender.send(reply);
            return;
        }
        let Some(addr) = self.join_targets.lock().unwrap().remove(key) else {
            return;
        };
        let outcome = match reply {
            ClientReply::AddFollower(Ok(msg)) => JoinOutcome::Snapshot(msg),
            ClientReply::AddFollower(Err(ClientError::NotLeader { known_leader })) => {
                JoinOutcome::NotLeader { known_leader }
            }
            ClientReply::AddFollower(Err(e)) => JoinOutcome::Rejected(e.to_string()),
            _ => return,
        };
        let Ok(bytes) = serde_json::to_vec(&WireMessage::JoinReply(outcome)) else {
            error!("failed to encode join reply");
            return;
        };
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!(%e, %addr, "join reply send failed");
            }
        });
    }
}
