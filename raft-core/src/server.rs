//! The role state machine orchestrating every other component.
//!
//! `Server` is driven by a single `tokio::select!` loop (`run`): one input
//! at a time, never suspending mid-handler.

use crate::command_results::CommandResults;
use crate::config::{ClientReply, Config, StatusReply};
use crate::election::Election;
use crate::error::ClientError;
use crate::leadership::Leadership;
use crate::logs::{AppendEntriesPlan, Logs};
use crate::members::Members;
use crate::message::{ConfigSnapshot, EntryPayload, LogEntry, Message};
use crate::types::{ClientHandle, CommandId, LogIndex, LogPosition, NodeId, TermNumber};
use tokio::sync::mpsc;
use tokio::time::Instant;

type ClientResult<T> = Result<T, ClientError>;

enum RoleState {
    Follower,
    Candidate,
    Leader(Leadership),
    /// Entered after a committed `remove_follower` names this replica.
    Terminated,
}

impl RoleState {
    fn name(&self) -> &'static str {
        match self {
            RoleState::Follower => "follower",
            RoleState::Candidate => "candidate",
            RoleState::Leader(_) => "leader",
            RoleState::Terminated => "terminated",
        }
    }
}

/// A request arriving through a replica's single input channel. Peer RPCs
/// and synchronous client requests are funneled through the same channel so
/// the FSM never handles two inputs concurrently.
pub enum Input {
    Rpc(Message),
    Client(ClientRequest),
}

/// The seven synchronous client operations. Each carries the `ClientHandle`
/// the eventual reply should be routed to via `Comm::reply`.
pub enum ClientRequest {
    Command {
        arg: serde_json::Value,
        command_id: CommandId,
        client: ClientHandle,
    },
    Query {
        arg: serde_json::Value,
        client: ClientHandle,
    },
    ChangeConfig {
        config: ConfigSnapshot,
        client: ClientHandle,
    },
    AddFollower {
        peer: NodeId,
        client: ClientHandle,
    },
    RemoveFollower {
        peer: NodeId,
        client: ClientHandle,
    },
    ReplaceLeader {
        target: Option<NodeId>,
        client: ClientHandle,
    },
    Status {
        client: ClientHandle,
    },
}

pub struct Server {
    self_id: NodeId,
    current_term: TermNumber,
    role: RoleState,
    logs: Logs,
    members: Members,
    election: Election,
    command_results: CommandResults,
    data: serde_json::Value,
    config: Config,
    /// Set by `TimeoutNow` and consulted while broadcasting `RequestVote`
    /// during the candidacy it triggers.
    replacing_leader: bool,
}

fn message_term(msg: &Message) -> TermNumber {
    match msg {
        Message::AppendEntriesRequest { term, .. }
        | Message::AppendEntriesResponse { term, .. }
        | Message::RequestVoteRequest { term, .. }
        | Message::RequestVoteResponse { term, .. }
        | Message::InstallSnapshot { term, .. }
        | Message::RemoveFollowerCompleted { term, .. } => *term,
        Message::TimeoutNow { append_entries_req } => message_term(append_entries_req),
    }
}

impl Server {
    /// `create_new_consensus_group(config)`: boots a single-member
    /// leader at term 0.
    pub fn create_new_consensus_group(self_id: NodeId, config: Config) -> Self {
        let members = Members::new_for_lonely_leader(self_id.clone());
        let data = config.data_ops.new();
        let mut server = Server {
            self_id,
            current_term: 0,
            role: RoleState::Follower,
            logs: Logs::new(),
            members,
            election: Election::new_for_leader(),
            command_results: CommandResults::new(),
            data,
            config,
            replacing_leader: false,
        };
        server.become_leader();
        server
    }

    /// Construct a follower from an `InstallSnapshot` received while
    /// attempting to join an existing group (the retry loop
    /// across candidate peers lives in the thin start/stop facade, not
    /// here — see `raft-node`).
    pub fn new_follower_from_snapshot(
        self_id: NodeId,
        mut config: Config,
        members: Vec<NodeId>,
        term: TermNumber,
        last_committed_entry: Option<LogEntry>,
        data: serde_json::Value,
        command_results: Vec<(CommandId, serde_json::Value)>,
        config_snapshot: ConfigSnapshot,
    ) -> Self {
        config.apply_snapshot(&config_snapshot);
        let mut logs = Logs::new();
        if let Some(entry) = last_committed_entry {
            logs.seed_from_snapshot(entry);
        }
        let election = Election::new_for_follower(&config);
        Server {
            self_id: self_id.clone(),
            current_term: term,
            role: RoleState::Follower,
            logs,
            members: Members::new_from_snapshot(self_id, members),
            election,
            command_results: CommandResults::from_vec(command_results),
            data,
            config,
            replacing_leader: false,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn current_term(&self) -> TermNumber {
        self.current_term
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.role, RoleState::Terminated)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    pub fn election_deadline(&self) -> Instant {
        self.election.timer_deadline()
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        match &self.role {
            RoleState::Leader(leadership) => Some(leadership.heartbeat_deadline()),
            _ => None,
        }
    }

    // ---- role transitions ------------------------------------------------

    fn become_follower(&mut self, term: TermNumber) {
        self.current_term = term;
        if let RoleState::Leader(leadership) = &mut self.role {
            leadership.stop_timers();
        }
        self.role = RoleState::Follower;
        self.election.update_for_follower(&self.config, true);
        self.members.put_leader(None);
        self.replacing_leader = false;
    }

    fn step_down_to_follower(&mut self) {
        if let RoleState::Leader(leadership) = &mut self.role {
            leadership.stop_timers();
        }
        self.role = RoleState::Follower;
        self.election.update_for_follower(&self.config, false);
        self.members.put_leader(None);
        self.replacing_leader = false;
    }

    fn become_candidate(&mut self) {
        self.current_term += 1;
        self.role = RoleState::Candidate;
        self.election.update_for_candidate(&self.self_id, &self.config);
        self.members.put_leader(None);
        tracing::info!(term = self.current_term, replacing_leader = self.replacing_leader, "starting election");
        self.broadcast_request_vote();
        self.maybe_become_leader_unopposed();
    }

    fn maybe_become_leader_unopposed(&mut self) {
        if matches!(self.role, RoleState::Candidate) && self.members.voter_count() == 1 {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        tracing::info!(term = self.current_term, self_id = %self.self_id, "became leader");
        self.role = RoleState::Leader(Leadership::new_for_leader(&self.config));
        self.election.disarm_timer();
        self.replacing_leader = false;
        self.members.put_leader(Some(self.self_id.clone()));
        let term = self.current_term;
        self.logs.elected_leader(&self.members, term, &self.config);
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn maybe_commit_lonely(&mut self) {
        if self.members.voter_count() == 1 {
            let applicable = self.logs.commit_to_latest();
            self.apply_all(applicable);
        }
    }

    // ---- outbound RPCs -----------------------------------------------------

    fn broadcast_request_vote(&self) {
        let last_log = self.logs.last_position();
        for peer in self.members.other_members_list() {
            self.config.comm.send_event(
                &peer,
                Message::RequestVoteRequest {
                    term: self.current_term,
                    candidate_id: self.self_id.clone(),
                    last_log,
                    replacing_leader: self.replacing_leader,
                },
            );
        }
    }

    fn broadcast_append_entries_all(&mut self) {
        for peer in self.members.other_members_list() {
            self.resend_append_entries(&peer);
        }
    }

    fn resend_append_entries(&mut self, follower: &NodeId) {
        match self.logs.make_append_entries_plan(follower) {
            AppendEntriesPlan::Send { prev_log, entries } => {
                self.config.comm.send_event(
                    follower,
                    Message::AppendEntriesRequest {
                        term: self.current_term,
                        leader_id: self.self_id.clone(),
                        prev_log,
                        entries,
                        leader_commit: self.logs.last_committed().index,
                    },
                );
            }
            AppendEntriesPlan::TooOld => {
                self.logs.reset_next_index_to_committed(follower);
                self.config.comm.send_event(follower, self.install_snapshot_message());
            }
            AppendEntriesPlan::UnknownFollower => {}
        }
    }

    fn install_snapshot_message(&self) -> Message {
        Message::InstallSnapshot {
            members: self.members.voters().iter().cloned().collect(),
            term: self.current_term,
            last_committed_entry: self.logs.last_committed_entry().cloned(),
            data: self.data.clone(),
            command_results: self.command_results.to_vec(),
            config: self.config.snapshot(),
        }
    }

    fn send_append_entries_response(&self, to: &NodeId, success: bool, i_replicated: Option<crate::types::LogIndex>) {
        self.config.comm.send_event(
            to,
            Message::AppendEntriesResponse {
                from: self.self_id.clone(),
                term: self.current_term,
                success,
                i_replicated,
            },
        );
    }

    // ---- input dispatch ------------------------------------------------

    pub fn handle_input(&mut self, input: Input) {
        match input {
            Input::Rpc(msg) => self.handle_rpc(msg),
            Input::Client(req) => self.handle_client(req),
        }
    }

    pub fn handle_election_timeout(&mut self) {
        match self.role {
            RoleState::Follower | RoleState::Candidate => self.become_candidate(),
            RoleState::Leader(_) | RoleState::Terminated => {}
        }
    }

    pub fn handle_heartbeat_timeout(&mut self) {
        let is_lonely = self.members.voter_count() == 1;
        if !matches!(self.role, RoleState::Leader(_)) {
            return;
        }
        if is_lonely {
            let applicable = self.logs.commit_to_latest();
            self.apply_all(applicable);
        } else {
            self.broadcast_append_entries_all();
        }
        let lease_lapsed = if let RoleState::Leader(leadership) = &mut self.role {
            leadership.reset_heartbeat_timer(&self.config);
            !is_lonely && leadership.minimum_timeout_elapsed_since_quorum_responded(&self.config)
        } else {
            false
        };
        if lease_lapsed {
            tracing::warn!(term = self.current_term, "lost quorum, stepping down");
            self.step_down_to_follower();
        }
    }

    fn handle_rpc(&mut self, msg: Message) {
        let term = message_term(&msg);
        if term > self.current_term {
            self.become_follower(term);
        }
        match msg {
            Message::AppendEntriesRequest {
                term,
                leader_id,
                prev_log,
                entries,
                leader_commit,
            } => self.handle_append_entries_request(term, leader_id, prev_log, entries, leader_commit),
            Message::AppendEntriesResponse {
                from,
                term,
                success,
                i_replicated,
            } => self.handle_append_entries_response(from, term, success, i_replicated),
            Message::RequestVoteRequest {
                term,
                candidate_id,
                last_log,
                replacing_leader,
            } => self.handle_request_vote_request(term, candidate_id, last_log, replacing_leader),
            Message::RequestVoteResponse {
                from,
                term,
                vote_granted,
            } => self.handle_request_vote_response(from, term, vote_granted),
            Message::InstallSnapshot {
                members,
                term,
                last_committed_entry,
                data,
                command_results,
                config,
            } => self.handle_install_snapshot(members, term, last_committed_entry, data, command_results, config),
            Message::TimeoutNow { append_entries_req } => self.handle_timeout_now(*append_entries_req),
            Message::RemoveFollowerCompleted { .. } => {
                self.role = RoleState::Terminated;
            }
        }
    }

    fn handle_append_entries_request(
        &mut self,
        term: TermNumber,
        leader_id: NodeId,
        prev_log: LogPosition,
        entries: Vec<LogEntry>,
        leader_commit: crate::types::LogIndex,
    ) {
        if term < self.current_term {
            self.send_append_entries_response(&leader_id, false, None);
            return;
        }
        if matches!(self.role, RoleState::Candidate) {
            self.step_down_to_follower();
        }
        self.members.put_leader(Some(leader_id.clone()));
        self.election.reset_timer_for_leader_message(&self.config);
        if !self.logs.contain_given_prev_log(prev_log.term, prev_log.index) {
            self.send_append_entries_response(&leader_id, false, None);
            return;
        }
        let applicable = self
            .logs
            .append_entries(&mut self.members, &entries, leader_commit, &self.config);
        self.apply_all(applicable);
        self.send_append_entries_response(&leader_id, true, Some(self.logs.last_index()));
    }

    fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        term: TermNumber,
        success: bool,
        i_replicated: Option<crate::types::LogIndex>,
    ) {
        if term < self.current_term || !matches!(self.role, RoleState::Leader(_)) {
            return;
        }
        if success {
            let i_replicated = i_replicated.unwrap_or(0);
            if let RoleState::Leader(leadership) = &mut self.role {
                leadership.follower_responded(&self.members, from.clone(), &self.config);
            }
            let term_now = self.current_term;
            let applicable =
                self.logs
                    .set_follower_index(&mut self.members, term_now, &from, i_replicated, &self.config);
            self.apply_all(applicable);

            if self.members.pending_leader_change() == Some(&from)
                && self.logs.match_index_of(&from) == Some(self.logs.last_index())
            {
                self.initiate_leader_handoff(&from);
            }
        } else {
            self.logs.decrement_next_index_of_follower(&from);
            self.resend_append_entries(&from);
        }
    }

    fn initiate_leader_handoff(&mut self, to: &NodeId) {
        tracing::info!(to = %to, term = self.current_term, "handing off leadership");
        match self.logs.make_append_entries_plan(to) {
            AppendEntriesPlan::Send { prev_log, entries } => {
                let append_req = Message::AppendEntriesRequest {
                    term: self.current_term,
                    leader_id: self.self_id.clone(),
                    prev_log,
                    entries,
                    leader_commit: self.logs.last_committed().index,
                };
                self.config.comm.send_event(
                    to,
                    Message::TimeoutNow {
                        append_entries_req: Box::new(append_req),
                    },
                );
            }
            _ => return,
        }
        self.members.start_replacing_leader(None);
        self.step_down_to_follower();
    }

    fn handle_request_vote_request(
        &mut self,
        term: TermNumber,
        candidate_id: NodeId,
        last_log: LogPosition,
        replacing_leader: bool,
    ) {
        if term < self.current_term {
            self.config.comm.send_event(
                &candidate_id,
                Message::RequestVoteResponse {
                    from: self.self_id.clone(),
                    term: self.current_term,
                    vote_granted: false,
                },
            );
            return;
        }
        let voted_for_ok = match self.election.voted_for() {
            None => true,
            Some(existing) => existing == &candidate_id,
        };
        let log_ok = self.logs.candidate_log_up_to_date(last_log);
        let lease_lapsed = replacing_leader || self.leader_authority_lapsed();
        let grant = voted_for_ok && log_ok && lease_lapsed;
        if grant {
            self.election.vote_for(candidate_id.clone(), &self.config);
        }
        tracing::debug!(candidate = %candidate_id, term, grant, "request vote");
        self.config.comm.send_event(
            &candidate_id,
            Message::RequestVoteResponse {
                from: self.self_id.clone(),
                term: self.current_term,
                vote_granted: grant,
            },
        );
    }

    fn leader_authority_lapsed(&self) -> bool {
        match &self.role {
            RoleState::Leader(leadership) => {
                leadership.minimum_timeout_elapsed_since_quorum_responded(&self.config)
            }
            _ => self
                .election
                .minimum_timeout_elapsed_since_last_leader_message(&self.config),
        }
    }

    fn handle_request_vote_response(&mut self, from: NodeId, term: TermNumber, vote_granted: bool) {
        if term < self.current_term || !matches!(self.role, RoleState::Candidate) {
            return;
        }
        if vote_granted && self.election.gain_vote(&self.members, from) {
            self.become_leader();
        }
    }

    fn handle_install_snapshot(
        &mut self,
        members: Vec<NodeId>,
        term: TermNumber,
        last_committed_entry: Option<LogEntry>,
        data: serde_json::Value,
        command_results: Vec<(CommandId, serde_json::Value)>,
        config_snapshot: ConfigSnapshot,
    ) {
        self.current_term = term.max(self.current_term);
        self.members = Members::new_from_snapshot(self.self_id.clone(), members);
        self.logs = Logs::new();
        if let Some(entry) = last_committed_entry {
            self.logs.seed_from_snapshot(entry);
        }
        self.data = data;
        self.command_results = CommandResults::from_vec(command_results);
        self.config.apply_snapshot(&config_snapshot);
        self.role = RoleState::Follower;
        self.election.update_for_follower(&self.config, true);
    }

    fn handle_timeout_now(&mut self, append_entries_req: Message) {
        let Message::AppendEntriesRequest {
            term,
            leader_id,
            prev_log,
            entries,
            leader_commit,
        } = append_entries_req
        else {
            return;
        };
        if term < self.current_term {
            return;
        }
        self.current_term = term;
        self.members.put_leader(Some(leader_id));
        if !self.logs.contain_given_prev_log(prev_log.term, prev_log.index) {
            return;
        }
        let applicable = self
            .logs
            .append_entries(&mut self.members, &entries, leader_commit, &self.config);
        self.apply_all(applicable);
        self.replacing_leader = true;
        self.become_candidate();
    }

    // ---- client requests -------------------------------------------------

    fn handle_client(&mut self, req: ClientRequest) {
        match req {
            ClientRequest::Command { arg, command_id, client } => self.handle_client_command(arg, command_id, client),
            ClientRequest::Query { arg, client } => self.handle_client_query(arg, client),
            ClientRequest::ChangeConfig { config, client } => self.handle_client_change_config(config, client),
            ClientRequest::AddFollower { peer, client } => self.handle_client_add_follower(peer, client),
            ClientRequest::RemoveFollower { peer, client } => self.handle_client_remove_follower(peer, client),
            ClientRequest::ReplaceLeader { target, client } => self.handle_client_replace_leader(target, client),
            ClientRequest::Status { client } => self.handle_client_status(client),
        }
    }

    fn known_leader(&self) -> Option<NodeId> {
        self.members.leader().cloned()
    }

    fn handle_client_command(&mut self, arg: serde_json::Value, command_id: CommandId, client: ClientHandle) {
        if !self.is_leader() {
            self.config.comm.reply(
                &client,
                ClientReply::Command(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        }
        if let Some(cached) = self.command_results.fetch(&command_id).cloned() {
            self.config.comm.reply(&client, ClientReply::Command(Ok(cached)));
            return;
        }
        let term = self.current_term;
        self.logs.add_entry(|index| {
            LogEntry::new(
                term,
                index,
                EntryPayload::Command {
                    client: client.clone(),
                    arg,
                    command_id,
                },
            )
        });
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn handle_client_query(&mut self, arg: serde_json::Value, client: ClientHandle) {
        let RoleState::Leader(leadership) = &self.role else {
            self.config.comm.reply(
                &client,
                ClientReply::Query(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        };
        let lease_valid = !leadership.minimum_timeout_elapsed_since_quorum_responded(&self.config);
        if lease_valid {
            let result = self.config.data_ops.query(&self.data, &arg);
            self.config.leader_hook.on_query_answered(&result);
            self.config.comm.reply(&client, ClientReply::Query(Ok(result)));
            return;
        }
        let term = self.current_term;
        self.logs
            .add_entry(|index| LogEntry::new(term, index, EntryPayload::Query { client, arg }));
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn handle_client_change_config(&mut self, snapshot: ConfigSnapshot, client: ClientHandle) {
        if !self.is_leader() {
            self.config.comm.reply(
                &client,
                ClientReply::ChangeConfig(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        }
        let term = self.current_term;
        self.logs
            .add_entry(|index| LogEntry::new(term, index, EntryPayload::ChangeConfig { config: snapshot }));
        self.config.comm.reply(&client, ClientReply::ChangeConfig(Ok(())));
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn handle_client_add_follower(&mut self, peer: NodeId, client: ClientHandle) {
        if !self.is_leader() {
            self.config.comm.reply(
                &client,
                ClientReply::AddFollower(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        }
        if self.members.has_uncommitted_membership_change() {
            self.config
                .comm
                .reply(&client, ClientReply::AddFollower(Err(ClientError::UncommittedMembershipChange)));
            return;
        }
        let term = self.current_term;
        let entry = self
            .logs
            .add_entry(|index| LogEntry::new(term, index, EntryPayload::AddFollower { peer: peer.clone() }));
        self.members
            .start_adding_follower(entry, peer.clone())
            .expect("checked has_uncommitted_membership_change above");
        self.logs.register_follower(peer);
        let snapshot_msg = self.install_snapshot_message();
        self.config
            .comm
            .reply(&client, ClientReply::AddFollower(Ok(Box::new(snapshot_msg))));
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn handle_client_remove_follower(&mut self, peer: NodeId, client: ClientHandle) {
        let RoleState::Leader(leadership) = &self.role else {
            self.config.comm.reply(
                &client,
                ClientReply::RemoveFollower(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        };
        if self.members.has_uncommitted_membership_change() {
            self.config.comm.reply(
                &client,
                ClientReply::RemoveFollower(Err(ClientError::UncommittedMembershipChange)),
            );
            return;
        }
        if !leadership.can_safely_remove(&self.members, &peer, &self.config) {
            self.config.comm.reply(
                &client,
                ClientReply::RemoveFollower(Err(ClientError::WillBreakQuorum { peer })),
            );
            return;
        }
        let term = self.current_term;
        let entry = self
            .logs
            .add_entry(|index| LogEntry::new(term, index, EntryPayload::RemoveFollower { peer: peer.clone() }));
        self.members
            .start_removing_follower(entry, &peer)
            .expect("checked has_uncommitted_membership_change above");
        if let RoleState::Leader(leadership) = &mut self.role {
            leadership.remove_follower_response_time_entry(&peer);
        }
        self.config.comm.reply(&client, ClientReply::RemoveFollower(Ok(())));
        self.maybe_commit_lonely();
        self.broadcast_append_entries_all();
    }

    fn handle_client_replace_leader(&mut self, target: Option<NodeId>, client: ClientHandle) {
        let RoleState::Leader(leadership) = &self.role else {
            self.config.comm.reply(
                &client,
                ClientReply::ReplaceLeader(Err(ClientError::NotLeader {
                    known_leader: self.known_leader(),
                })),
            );
            return;
        };
        if let Some(peer) = &target {
            if !self.members.is_voter(peer) {
                self.config.comm.reply(
                    &client,
                    ClientReply::ReplaceLeader(Err(ClientError::UnknownFollower { peer: peer.clone() })),
                );
                return;
            }
            let unresponsive = leadership.unresponsive_followers(&self.members, &self.config);
            if unresponsive.contains(peer) {
                self.config.comm.reply(
                    &client,
                    ClientReply::ReplaceLeader(Err(ClientError::NewLeaderUnresponsive { peer: peer.clone() })),
                );
                return;
            }
        }
        self.members.start_replacing_leader(target);
        self.config.comm.reply(&client, ClientReply::ReplaceLeader(Ok(())));
    }

    fn handle_client_status(&self, client: ClientHandle) {
        let unresponsive_followers = match &self.role {
            RoleState::Leader(leadership) => leadership.unresponsive_followers(&self.members, &self.config),
            _ => Vec::new(),
        };
        let reply = StatusReply {
            from: self.self_id.clone(),
            members: self.members.voters().iter().cloned().collect(),
            leader: self.members.leader().cloned(),
            unresponsive_followers,
            current_term: self.current_term,
            role_name: self.role.name(),
            config: self.config.snapshot(),
        };
        self.config.comm.reply(&client, ClientReply::Status(Box::new(reply)));
    }

    // ---- apply -------------------------------------------------------------

    fn apply_all(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            self.apply_entry(entry);
        }
    }

    fn apply_entry(&mut self, entry: LogEntry) {
        let is_leader = self.is_leader();
        match entry.payload {
            EntryPayload::Command { client, arg, command_id } => {
                if let Some(cached) = self.command_results.fetch(&command_id).cloned() {
                    if is_leader {
                        self.config.comm.reply(&client, ClientReply::Command(Ok(cached)));
                    }
                } else {
                    let (result, new_data) = self.config.data_ops.command(&self.data, &arg);
                    self.data = new_data;
                    self.command_results
                        .put(command_id.clone(), result.clone(), self.config.max_retained_command_results);
                    if is_leader {
                        self.config.comm.reply(&client, ClientReply::Command(Ok(result.clone())));
                        self.config.leader_hook.on_command_committed(&command_id, &result);
                    }
                }
            }
            EntryPayload::Query { .. } => {
                // Answered by whoever was leader when the entry was first
                // appended; by the time it commits here the reply (if this
                // replica is still leader) has already been sent on the
                // lease-fast-path check inside `handle_client_query`, or the
                // entry was logged precisely because the lease had lapsed
                // and no reply is owed from a later commit — queries are
                // best-effort under leadership change.
            }
            EntryPayload::ChangeConfig { config } => {
                self.config.apply_snapshot(&config);
            }
            EntryPayload::LeaderElected { leader } => {
                if is_leader && leader == self.self_id {
                    self.config.leader_hook.on_elected(&leader);
                }
            }
            EntryPayload::AddFollower { peer } => {
                if is_leader {
                    self.config.leader_hook.on_follower_added(&peer);
                }
            }
            EntryPayload::RemoveFollower { peer } => {
                if is_leader {
                    self.config.leader_hook.on_follower_removed(&peer);
                    self.logs.forget_follower(&peer);
                    if let RoleState::Leader(leadership) = &mut self.role {
                        leadership.remove_follower_response_time_entry(&peer);
                    }
                    self.config.comm.send_event(
                        &peer,
                        Message::RemoveFollowerCompleted {
                            term: self.current_term,
                        },
                    );
                }
            }
        }
    }

    /// Run this replica's single-threaded cooperative FSM loop until it is
    /// terminated (removed) or `inbox` closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        while !self.is_terminated() {
            let election_deadline = self.election_deadline();
            let heartbeat_deadline = self.heartbeat_deadline();
            tokio::select! {
                maybe_input = inbox.recv() => {
                    match maybe_input {
                        Some(input) => self.handle_input(input),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(election_deadline) => {
                    self.handle_election_timeout();
                }
                _ = heartbeat_sleep(heartbeat_deadline), if heartbeat_deadline.is_some() => {
                    self.handle_heartbeat_timeout();
                }
            }
        }
    }
}

async fn heartbeat_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
