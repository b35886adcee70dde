//! raft-node
//!
//! Thin start/stop facade around `raft-core::Server`: binds a UDP socket,
//! boots a replica in either of the two start modes, and offers a stdin
//! REPL for the synchronous client requests. All Raft logic itself lives in
//! `raft-core`; this binary only wires a concrete `Comm` and `DataOps`
//! together and pumps messages between sockets/stdin and the server's
//! single input channel.

mod kv_store;
mod udp_comm;

use clap::{Parser, Subcommand};
use kv_store::KvStore;
use raft_core::{ClientHandle, ClientReply, ClientRequest, Config, ConfigBuilder, Input, Message, NodeId, Server};
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use udp_comm::{JoinOutcome, UdpComm};
use uuid::Uuid;

const JOIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_ROUND_BACKOFF: Duration = Duration::from_millis(500);
const JOIN_MAX_ROUNDS: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Bootstrap a brand-new, single-member group.
    Create {
        #[arg(long)]
        id: String,
        #[arg(long)]
        bind: SocketAddr,
    },
    /// Ask an existing group to add this process as a follower, then start
    /// serving once its `InstallSnapshot` arrives.
    Join {
        #[arg(long)]
        id: String,
        #[arg(long)]
        bind: SocketAddr,
        /// A candidate member to contact, given as `id=host:port`. Repeat
        /// for every peer worth trying; if the one contacted isn't the
        /// leader it redirects by id when it knows who is.
        #[arg(long = "peer", required = true)]
        peers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.mode {
        Mode::Create { id, bind } => run_created(id, bind).await,
        Mode::Join { id, bind, peers } => {
            let peers = peers.iter().map(|p| parse_peer(p)).collect::<Result<Vec<_>, _>>()?;
            run_joined(id, bind, peers).await
        }
    }
}

fn parse_peer(raw: &str) -> Result<(NodeId, SocketAddr), Box<dyn std::error::Error>> {
    let (id, addr) = raw.split_once('=').ok_or_else(|| format!("peer '{raw}' must be given as id=host:port"))?;
    Ok((id.to_string(), addr.parse()?))
}

async fn run_created(id: String, bind: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let comm = UdpComm::bind(bind).await?;
    info!(%id, addr = %comm.local_addr()?, "created new consensus group");
    let config = build_config(comm.clone());
    let server = Server::create_new_consensus_group(id, config);
    serve(server, comm).await;
    Ok(())
}

async fn run_joined(id: String, bind: SocketAddr, peers: Vec<(NodeId, SocketAddr)>) -> Result<(), Box<dyn std::error::Error>> {
    let comm = UdpComm::bind(bind).await?;
    let my_addr = comm.local_addr()?;
    info!(%id, addr = %my_addr, "asking to join an existing group");
    let snapshot = join_existing_consensus_group(&comm, id.clone(), my_addr, peers).await?;
    let config = build_config(comm.clone());
    let Message::InstallSnapshot {
        members,
        term,
        last_committed_entry,
        data,
        command_results,
        config: config_snapshot,
    } = snapshot
    else {
        unreachable!("join_existing_consensus_group only returns InstallSnapshot");
    };
    let server = Server::new_follower_from_snapshot(
        id, config, members, term, last_committed_entry, data, command_results, config_snapshot,
    );
    info!("joined existing group, now serving");
    serve(server, comm).await;
    Ok(())
}

/// Drive the `JoinRequest`/`JoinReply` handshake against `candidates` until
/// one of them installs us as a follower. A `NotLeader` reply that names a
/// leader present in `candidates` is followed immediately; otherwise the
/// next candidate in the list is tried. The whole list is retried, with a
/// backoff, for up to `JOIN_MAX_ROUNDS` rounds before giving up.
async fn join_existing_consensus_group(
    comm: &Arc<UdpComm>,
    id: NodeId,
    my_addr: SocketAddr,
    candidates: Vec<(NodeId, SocketAddr)>,
) -> Result<Message, Box<dyn std::error::Error>> {
    if candidates.is_empty() {
        return Err("join requires at least one --peer candidate".into());
    }
    for round in 0..JOIN_MAX_ROUNDS {
        let mut index = 0;
        while index < candidates.len() {
            let (candidate_id, candidate_addr) = &candidates[index];
            info!(peer = %candidate_id, addr = %candidate_addr, round, "sending join request");
            match comm.try_join(*candidate_addr, id.clone(), my_addr, JOIN_ATTEMPT_TIMEOUT).await {
                Some(JoinOutcome::Snapshot(msg)) => return Ok(*msg),
                Some(JoinOutcome::NotLeader { known_leader: Some(leader_id) }) => {
                    match candidates.iter().position(|(cid, _)| *cid == leader_id) {
                        Some(pos) => {
                            index = pos;
                            continue;
                        }
                        None => {
                            warn!(%leader_id, "redirected to a peer not in our candidate list");
                            index += 1;
                        }
                    }
                }
                Some(JoinOutcome::NotLeader { known_leader: None }) => {
                    warn!(peer = %candidate_id, "peer doesn't know who the leader is either");
                    index += 1;
                }
                Some(JoinOutcome::Rejected(reason)) => {
                    warn!(peer = %candidate_id, %reason, "join request rejected");
                    index += 1;
                }
                None => {
                    warn!(peer = %candidate_id, "join request timed out or failed");
                    index += 1;
                }
            }
        }
        tokio::time::sleep(JOIN_ROUND_BACKOFF).await;
    }
    Err(format!("could not join via any of {} candidate(s) after {JOIN_MAX_ROUNDS} rounds", candidates.len()).into())
}

fn build_config(comm: Arc<UdpComm>) -> Config {
    ConfigBuilder::default()
        .communication_module(comm)
        .build(Arc::new(KvStore))
}

async fn serve(server: Server, comm: Arc<UdpComm>) {
    let (tx, rx) = mpsc::unbounded_channel();
    comm.spawn_receive_loop(tx.clone());
    tokio::spawn(server.run(rx));
    stdin_repl(tx, comm).await;
}

/// Read client commands from stdin, translate each into a `ClientRequest`
/// delivered through the server's own input channel, and print the reply.
async fn stdin_repl(inbox: mpsc::UnboundedSender<Input>, comm: Arc<UdpComm>) {
    println!("commands: set <key> <value> | get <key> | peer <id> <addr> | add-follower <id> <addr> | remove-follower <id> | replace-leader [<id>] | status | quit");
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines().flatten() {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        let Some(&cmd) = parts.first() else { continue };
        match cmd {
            "quit" | "exit" => break,
            "peer" if parts.len() == 3 => match parts[2].parse::<SocketAddr>() {
                Ok(addr) => comm.register_peer(parts[1].to_string(), addr),
                Err(e) => warn!(%e, "bad address"),
            },
            "set" if parts.len() == 3 => {
                let arg = serde_json::json!({"key": parts[1], "value": parts[2]});
                let reply = submit(&inbox, &comm, |client| ClientRequest::Command {
                    arg,
                    command_id: Uuid::new_v4().to_string(),
                    client,
                })
                .await;
                print_reply(reply);
            }
            "get" if parts.len() == 2 => {
                let arg = serde_json::json!({"key": parts[1]});
                let reply = submit(&inbox, &comm, |client| ClientRequest::Query { arg, client }).await;
                print_reply(reply);
            }
            "add-follower" if parts.len() == 3 => {
                if let Ok(addr) = parts[2].parse::<SocketAddr>() {
                    comm.register_peer(parts[1].to_string(), addr);
                }
                let peer = parts[1].to_string();
                let reply = submit(&inbox, &comm, |client| ClientRequest::AddFollower { peer, client }).await;
                print_reply(reply);
            }
            "remove-follower" if parts.len() == 2 => {
                let peer = parts[1].to_string();
                let reply = submit(&inbox, &comm, |client| ClientRequest::RemoveFollower { peer, client }).await;
                print_reply(reply);
            }
            "replace-leader" => {
                let target = parts.get(1).map(|s| s.to_string());
                let reply = submit(&inbox, &comm, |client| ClientRequest::ReplaceLeader { target, client }).await;
                print_reply(reply);
            }
            "status" => {
                let reply = submit(&inbox, &comm, |client| ClientRequest::Status { client }).await;
                print_reply(reply);
            }
            _ => println!("unrecognized command: {line}"),
        }
    }
}

async fn submit(
    inbox: &mpsc::UnboundedSender<Input>,
    comm: &Arc<UdpComm>,
    build: impl FnOnce(ClientHandle) -> ClientRequest,
) -> Option<ClientReply> {
    let (tx, rx) = oneshot::channel();
    let client = comm.register_local_reply(tx);
    if inbox.send(Input::Client(build(client))).is_err() {
        error!("server loop has shut down");
        return None;
    }
    rx.await.ok()
}

fn print_reply(reply: Option<ClientReply>) {
    match reply {
        None => println!("(no reply)"),
        Some(ClientReply::Command(r)) => println!("{r:?}"),
        Some(ClientReply::Query(r)) => println!("{r:?}"),
        Some(ClientReply::ChangeConfig(r)) => println!("{r:?}"),
        Some(ClientReply::AddFollower(r)) => println!("{r:?}"),
        Some(ClientReply::RemoveFollower(r)) => println!("{r:?}"),
        Some(ClientReply::ReplaceLeader(r)) => println!("{r:?}"),
        Some(ClientReply::Status(status)) => println!("{status:?}"),
    }
}
