//! Interactive Connectivity Establishment: candidate gathering over the
//! shared sockets, pairing, connectivity checks, nomination and the
//! keepalive on the selected path.

use crate::shared::{NetworkError, NetworkResult};
use crate::socket::{enumerate_local_addresses, SocketTable, SocketToken};
use crate::stun::{
    is_stun_packet, Attribute, Integrity, MessageClass, StunMessage, METHOD_BINDING,
    TRANSACTION_ID_SIZE,
};
use flare::crypto;
use flare::logging;
use mio::Registry;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Candidate type preferences per the priority formula.
const TYPE_PREF_HOST: u32 = 126;
const TYPE_PREF_PRFLX: u32 = 110;
const TYPE_PREF_SRFLX: u32 = 100;

/// STUN transaction schedule: 500ms * 2^n, capped, bounded attempts.
const RETRY_BASE_USEC: u64 = 500_000;
const RETRY_CAP_USEC: u64 = 60_000_000;
const MAX_ATTEMPTS: u32 = 7;

/// NAT binding refresh cadence on the selected path.
const KEEPALIVE_INTERVAL_USEC: u64 = 15_000_000;

/// Permitted candidate classes, a caller-supplied bitmask.
pub mod candidate_mask {
    pub const HOST: u32 = 0x01;
    pub const SRFLX: u32 = 0x02;
    pub const PRFLX: u32 = 0x04;
    pub const RELAY: u32 = 0x08;
    pub const IPV4: u32 = 0x10;
    pub const IPV6: u32 = 0x20;

    pub const ALL: u32 = 0x3F;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IceRole {
    /// The connection initiator drives nomination.
    Controlling,
    Controlled,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IceSessionState {
    Idle,
    GatheringCandidates,
    TestingPeerConnectivity,
    Selected,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
}

impl CandidateKind {
    #[inline]
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => TYPE_PREF_HOST,
            CandidateKind::PeerReflexive => TYPE_PREF_PRFLX,
            CandidateKind::ServerReflexive => TYPE_PREF_SRFLX,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
        }
    }

    fn from_label(label: &str) -> Option<CandidateKind> {
        Some(match label {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            "prflx" => CandidateKind::PeerReflexive,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: CandidateKind,
    /// Address the candidate transmits from (the local socket for local
    /// candidates; equal to `mapped` for remote ones).
    pub base: SocketAddr,
    /// Address advertised to the peer.
    pub mapped: SocketAddr,
    pub stun_server: Option<SocketAddr>,
    pub priority: u32,
    /// Local candidates carry the socket they live on.
    pub socket: Option<SocketToken>,
    pub foundation: u64,
}

impl Candidate {
    /// Renders the exchange form carried in rendezvous messages:
    /// `candidate:<foundation> 1 udp <priority> <ip> <port> typ <kind>
    /// [raddr <ip> rport <port>]`.
    pub fn render(&self) -> String {
        let mut out = format!(
            "candidate:{:x} 1 udp {} {} {} typ {}",
            self.foundation,
            self.priority,
            self.mapped.ip(),
            self.mapped.port(),
            self.kind.label()
        );

        if self.kind != CandidateKind::Host && self.base != self.mapped {
            out.push_str(&format!(" raddr {} rport {}", self.base.ip(), self.base.port()));
        }

        out
    }

    /// Parses the exchange form for a remote candidate.
    pub fn parse(text: &str) -> Option<Candidate> {
        let rest = text.strip_prefix("candidate:")?;
        let mut fields = rest.split_whitespace();

        let foundation = u64::from_str_radix(fields.next()?, 16).ok()?;
        let component: u32 = fields.next()?.parse().ok()?;
        if component != 1 {
            return None;
        }

        if fields.next()? != "udp" {
            return None;
        }

        let priority: u32 = fields.next()?.parse().ok()?;
        let ip: IpAddr = fields.next()?.parse().ok()?;
        let port: u16 = fields.next()?.parse().ok()?;

        if fields.next()? != "typ" {
            return None;
        }
        let kind = CandidateKind::from_label(fields.next()?)?;

        let mapped = SocketAddr::new(ip, port);
        let mut base = mapped;

        // Optional related-address tail
        let mut raddr: Option<IpAddr> = None;
        while let Some(field) = fields.next() {
            match field {
                "raddr" => raddr = fields.next()?.parse().ok(),
                "rport" => {
                    let rport: u16 = fields.next()?.parse().ok()?;
                    if let Some(ip) = raddr {
                        base = SocketAddr::new(ip, rport);
                    }
                }
                _ => return None,
            }
        }

        Some(Candidate {
            kind,
            base,
            mapped,
            stun_server: None,
            priority,
            socket: None,
            foundation,
        })
    }
}

fn compute_foundation(
    kind: CandidateKind,
    base: SocketAddr,
    stun_server: Option<SocketAddr>,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.label().hash(&mut hasher);
    base.hash(&mut hasher);
    stun_server.hash(&mut hasher);
    hasher.finish()
}

#[inline]
fn candidate_priority(kind: CandidateKind, local_pref: u32) -> u32 {
    (kind.type_preference() << 24) | (local_pref << 8) | (256 - 1)
}

#[inline]
fn backoff_usec(attempt: u32) -> u64 {
    (RETRY_BASE_USEC << attempt.min(16)).min(RETRY_CAP_USEC)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

struct CheckTx {
    txid: [u8; TRANSACTION_ID_SIZE],
    attempts: u32,
    next_send_usec: u64,
    nominate: bool,
}

pub struct CandidatePair {
    local: usize,
    remote: usize,
    priority: u64,
    state: PairState,
    nominated: bool,
    /// At most one in-flight STUN transaction per pair.
    tx: Option<CheckTx>,
    triggered: bool,
}

impl CandidatePair {
    #[inline]
    pub fn state(&self) -> PairState {
        self.state
    }

    #[inline]
    pub fn is_nominated(&self) -> bool {
        self.nominated
    }
}

/// A server-reflexive discovery in progress on one host candidate.
struct GatherTx {
    host_candidate: usize,
    server_index: usize,
    txid: [u8; TRANSACTION_ID_SIZE],
    attempts: u32,
    next_send_usec: u64,
    done: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IceEvent {
    /// A freshly gathered local candidate in exchange form.
    LocalCandidate(String),
    /// All gathering transactions have concluded.
    GatheringComplete,
    /// A pair was selected and is now the data path.
    PairSelected {
        socket: SocketToken,
        remote: SocketAddr,
    },
    /// Every pair failed; the session cannot provide a route.
    Failed,
}

pub struct IceSession {
    role: IceRole,
    state: IceSessionState,

    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    tiebreaker: u64,

    permitted: u32,
    stun_servers: Vec<SocketAddr>,

    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    selected: Option<usize>,

    gather: Vec<GatherTx>,
    gathering_reported: bool,

    keepalive_due_usec: u64,
    events: VecDeque<IceEvent>,

    log: logging::Logger,
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    let mut bytes = vec![0u8; len];
    crypto::random_bytes(&mut bytes);

    bytes
        .iter()
        .map(|&b| ALPHABET[b as usize % ALPHABET.len()] as char)
        .collect()
}

impl IceSession {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        role: IceRole,
        stun_servers: Vec<SocketAddr>,
        permitted: u32,
        log: L,
    ) -> IceSession {
        let local_ufrag = random_token(8);
        let local_pwd = random_token(22);

        let log = match log.into() {
            Some(log) => log.new(logging::o!("ufrag" => local_ufrag.clone())),
            None => logging::discard(),
        };

        IceSession {
            role,
            state: IceSessionState::Idle,
            local_ufrag,
            local_pwd,
            remote_ufrag: None,
            remote_pwd: None,
            tiebreaker: crypto::random_u64(),
            permitted,
            stun_servers,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            selected: None,
            gather: Vec::new(),
            gathering_reported: false,
            keepalive_due_usec: 0,
            events: VecDeque::new(),
            log,
        }
    }

    #[inline]
    pub fn state(&self) -> IceSessionState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> IceRole {
        self.role
    }

    #[inline]
    pub fn local_auth(&self) -> (&str, &str) {
        (&self.local_ufrag, &self.local_pwd)
    }

    /// Flips the agreed role. Used when a symmetric simultaneous connect
    /// resolves the tie and one initiator yields.
    pub fn set_role(&mut self, role: IceRole) {
        self.role = role;
    }

    pub fn set_remote_auth(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = Some(ufrag.to_owned());
        self.remote_pwd = Some(pwd.to_owned());
    }

    #[inline]
    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// The selected data route, once one exists.
    pub fn selected_route(&self) -> Option<(SocketToken, SocketAddr)> {
        let pair = &self.pairs[self.selected?];
        let local = &self.local_candidates[pair.local];
        let remote = &self.remote_candidates[pair.remote];
        Some((local.socket?, remote.mapped))
    }

    /// True when this session owns the given socket token.
    pub fn owns_socket(&self, token: SocketToken) -> bool {
        self.local_candidates
            .iter()
            .any(|c| c.socket == Some(token))
    }

    /// Opens a socket per permitted local interface, emits Host candidates
    /// and kicks off server-reflexive discovery.
    pub fn begin_gathering(
        &mut self,
        sockets: &mut SocketTable,
        registry: Option<&Registry>,
        now_usec: u64,
    ) -> NetworkResult<()> {
        if self.state != IceSessionState::Idle {
            return Ok(());
        }

        self.state = IceSessionState::GatheringCandidates;

        let want_v4 = self.permitted & candidate_mask::IPV4 != 0;
        let want_v6 = self.permitted & candidate_mask::IPV6 != 0;

        let mut local_pref: u32 = 65535;

        if self.permitted & candidate_mask::HOST != 0 {
            for addr in enumerate_local_addresses(true) {
                match addr {
                    IpAddr::V4(_) if !want_v4 => continue,
                    IpAddr::V6(_) if !want_v6 => continue,
                    _ => (),
                }

                let token = match sockets.open(SocketAddr::new(addr, 0), registry) {
                    Ok(token) => token,
                    Err(err) => {
                        logging::warn!(self.log, "interface bind failed";
                                       "context" => "gather",
                                       "addr" => %addr,
                                       "error" => ?err);
                        continue;
                    }
                };

                let bound_addr = sockets
                    .get(token)
                    .expect("Socket just opened")
                    .bound()
                    .local_addr();

                let candidate = Candidate {
                    kind: CandidateKind::Host,
                    base: bound_addr,
                    mapped: bound_addr,
                    stun_server: None,
                    priority: candidate_priority(CandidateKind::Host, local_pref),
                    socket: Some(token),
                    foundation: compute_foundation(CandidateKind::Host, bound_addr, None),
                };
                local_pref = local_pref.saturating_sub(1);

                logging::debug!(self.log, "host candidate";
                                "context" => "gather",
                                "addr" => %bound_addr);

                self.events
                    .push_back(IceEvent::LocalCandidate(candidate.render()));

                let host_index = self.local_candidates.len();
                self.local_candidates.push(candidate);

                if self.permitted & candidate_mask::SRFLX != 0 && !self.stun_servers.is_empty() {
                    self.gather.push(GatherTx {
                        host_candidate: host_index,
                        server_index: 0,
                        txid: [0u8; TRANSACTION_ID_SIZE],
                        attempts: 0,
                        next_send_usec: now_usec,
                        done: false,
                    });
                }
            }
        }

        if self.gather.is_empty() {
            self.finish_gathering();
        }

        Ok(())
    }

    fn finish_gathering(&mut self) {
        if self.gathering_reported {
            return;
        }

        self.gathering_reported = true;
        self.state = IceSessionState::TestingPeerConnectivity;
        self.events.push_back(IceEvent::GatheringComplete);
        self.form_pairs();

        logging::debug!(self.log, "gathering complete";
                        "context" => "gather",
                        "candidates" => self.local_candidates.len());
    }

    /// Ingests a remote candidate from the rendezvous channel.
    pub fn add_remote_candidate(&mut self, text: &str) -> bool {
        let candidate = match Candidate::parse(text) {
            Some(candidate) => candidate,
            None => {
                logging::debug!(self.log, "unparseable remote candidate dropped";
                                "context" => "pairing",
                                "text" => text.to_owned());
                return false;
            }
        };

        // Duplicate announcements are harmless
        if self
            .remote_candidates
            .iter()
            .any(|c| c.mapped == candidate.mapped)
        {
            return true;
        }

        logging::debug!(self.log, "remote candidate";
                        "context" => "pairing",
                        "addr" => %candidate.mapped,
                        "kind" => candidate.kind.label());

        self.remote_candidates.push(candidate);
        self.form_pairs();
        true
    }

    /// Builds any missing pairs: local x remote with matching address family,
    /// sorted by pair priority, new ones Frozen until their foundation frees.
    fn form_pairs(&mut self) {
        if self.state == IceSessionState::Idle || self.state == IceSessionState::GatheringCandidates
        {
            return;
        }

        for local_index in 0..self.local_candidates.len() {
            for remote_index in 0..self.remote_candidates.len() {
                let local = &self.local_candidates[local_index];
                let remote = &self.remote_candidates[remote_index];

                if local.mapped.is_ipv4() != remote.mapped.is_ipv4() {
                    continue;
                }

                let exists = self
                    .pairs
                    .iter()
                    .any(|pair| pair.local == local_index && pair.remote == remote_index);
                if exists {
                    continue;
                }

                let (g, d) = match self.role {
                    IceRole::Controlling => (local.priority as u64, remote.priority as u64),
                    IceRole::Controlled => (remote.priority as u64, local.priority as u64),
                };

                let priority =
                    (1u64 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 };

                self.pairs.push(CandidatePair {
                    local: local_index,
                    remote: remote_index,
                    priority,
                    state: PairState::Frozen,
                    nominated: false,
                    tx: None,
                    triggered: false,
                });
            }
        }

        // Sorting invalidates indices; remember the selected pair by content
        let selected_key = self
            .selected
            .map(|index| (self.pairs[index].local, self.pairs[index].remote));

        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(key) = selected_key {
            self.selected = self
                .pairs
                .iter()
                .position(|pair| (pair.local, pair.remote) == key);
        }

        self.unfreeze_pairs();
    }

    /// One pair per foundation may thaw whenever that foundation has no
    /// check underway.
    fn unfreeze_pairs(&mut self) {
        let foundations: Vec<(u64, u64)> = self
            .pairs
            .iter()
            .map(|pair| {
                (
                    self.local_candidates[pair.local].foundation,
                    self.remote_candidates[pair.remote].foundation,
                )
            })
            .collect();

        for i in 0..self.pairs.len() {
            if self.pairs[i].state != PairState::Frozen {
                continue;
            }

            let busy = self.pairs.iter().enumerate().any(|(j, other)| {
                i != j
                    && foundations[j] == foundations[i]
                    && (other.state == PairState::InProgress || other.state == PairState::Waiting)
            });

            if !busy {
                self.pairs[i].state = PairState::Waiting;
            }
        }
    }

    /// Username for checks we send: `<remote-ufrag>:<local-ufrag>`.
    fn outbound_username(&self) -> Option<String> {
        Some(format!("{}:{}", self.remote_ufrag.as_ref()?, self.local_ufrag))
    }

    /// Username expected on checks we receive: `<local-ufrag>:<remote-ufrag>`.
    fn expected_username(&self) -> Option<String> {
        Some(format!("{}:{}", self.local_ufrag, self.remote_ufrag.as_ref()?))
    }

    /// Periodic driver: gather retries, connectivity check pacing, check
    /// retransmission, keepalive.
    pub fn think(&mut self, sockets: &SocketTable, now_usec: u64) {
        self.drive_gathering(sockets, now_usec);
        self.drive_checks(sockets, now_usec);
        self.drive_keepalive(sockets, now_usec);
    }

    fn drive_gathering(&mut self, sockets: &SocketTable, now_usec: u64) {
        if self.state != IceSessionState::GatheringCandidates {
            return;
        }

        let mut all_done = true;

        for i in 0..self.gather.len() {
            if self.gather[i].done {
                continue;
            }

            if now_usec < self.gather[i].next_send_usec {
                all_done = false;
                continue;
            }

            // Exhausted this server: move to the next, or give up on SRFLX
            // for this interface
            if self.gather[i].attempts >= MAX_ATTEMPTS {
                self.gather[i].server_index += 1;
                self.gather[i].attempts = 0;

                if self.gather[i].server_index >= self.stun_servers.len() {
                    logging::debug!(self.log, "server reflexive discovery failed";
                                    "context" => "gather",
                                    "candidate" => self.gather[i].host_candidate);
                    self.gather[i].done = true;
                    continue;
                }
            }

            let server = self.stun_servers[self.gather[i].server_index];
            let host = &self.local_candidates[self.gather[i].host_candidate];

            let request = StunMessage::binding_request();
            self.gather[i].txid = request.transaction_id;

            if let Some(shared) = host.socket.and_then(|token| sockets.get(token)) {
                let wire = request.encode(None);
                drop(shared.bound().send_gather(server, &[&wire]));
            }

            let attempt = self.gather[i].attempts;
            self.gather[i].attempts += 1;
            self.gather[i].next_send_usec = now_usec + backoff_usec(attempt);
            all_done = false;
        }

        if all_done {
            self.finish_gathering();
        }
    }

    fn drive_checks(&mut self, sockets: &SocketTable, now_usec: u64) {
        if self.state != IceSessionState::TestingPeerConnectivity
            && self.state != IceSessionState::Selected
        {
            return;
        }

        if self.remote_pwd.is_none() {
            return;
        }

        // Retransmit or expire in-progress checks
        for i in 0..self.pairs.len() {
            if self.pairs[i].state != PairState::InProgress {
                continue;
            }

            let due = match &self.pairs[i].tx {
                Some(tx) => now_usec >= tx.next_send_usec,
                None => false,
            };
            if !due {
                continue;
            }

            let exhausted = self.pairs[i]
                .tx
                .as_ref()
                .map(|tx| tx.attempts >= MAX_ATTEMPTS)
                .unwrap_or(false);

            if exhausted {
                logging::debug!(self.log, "pair failed";
                                "context" => "checks",
                                "pair" => i);
                self.pairs[i].state = PairState::Failed;
                self.pairs[i].tx = None;
                continue;
            }

            self.transmit_check(sockets, i, now_usec);
        }

        // Launch one new check per wake: triggered checks first, then the
        // highest-priority Waiting pair
        let next = self
            .pairs
            .iter()
            .position(|pair| pair.triggered && pair.state != PairState::InProgress && pair.state != PairState::Failed)
            .or_else(|| {
                self.pairs
                    .iter()
                    .position(|pair| pair.state == PairState::Waiting)
            });

        if let Some(i) = next {
            self.pairs[i].state = PairState::InProgress;
            self.pairs[i].triggered = false;

            // Ordinary checks never nominate; the controlling side schedules
            // its USE-CANDIDATE re-check from the success response handler
            self.pairs[i].tx = Some(CheckTx {
                txid: [0u8; TRANSACTION_ID_SIZE],
                attempts: 0,
                next_send_usec: now_usec,
                nominate: false,
            });

            self.transmit_check(sockets, i, now_usec);
        }

        // All pairs failed and nothing remains to try
        if !self.pairs.is_empty()
            && self.selected.is_none()
            && self
                .pairs
                .iter()
                .all(|pair| pair.state == PairState::Failed)
        {
            if self.state != IceSessionState::Failed {
                self.state = IceSessionState::Failed;
                self.events.push_back(IceEvent::Failed);
            }
        }

        self.unfreeze_pairs();
    }

    fn transmit_check(&mut self, sockets: &SocketTable, pair_index: usize, now_usec: u64) {
        let username = match self.outbound_username() {
            Some(username) => username,
            None => return,
        };
        let password = match &self.remote_pwd {
            Some(pwd) => pwd.clone(),
            None => return,
        };

        let nominate = self.pairs[pair_index]
            .tx
            .as_ref()
            .map(|tx| tx.nominate)
            .unwrap_or(false);

        let local = &self.local_candidates[self.pairs[pair_index].local];
        let remote = &self.remote_candidates[self.pairs[pair_index].remote];

        // PRIORITY is recomputed as if this check discovered a peer-reflexive
        // candidate on the same interface
        let prflx_priority =
            candidate_priority(CandidateKind::PeerReflexive, (local.priority >> 8) & 0xFFFF);

        let mut request = StunMessage::binding_request()
            .attr(Attribute::Username(username))
            .attr(Attribute::Priority(prflx_priority));

        request = match self.role {
            IceRole::Controlling => request.attr(Attribute::IceControlling(self.tiebreaker)),
            IceRole::Controlled => request.attr(Attribute::IceControlled(self.tiebreaker)),
        };

        if nominate {
            request = request.attr(Attribute::UseCandidate);
        }

        let txid = request.transaction_id;
        let wire = request.encode(Some(password.as_bytes()));
        let target = remote.mapped;

        if let Some(shared) = local.socket.and_then(|token| sockets.get(token)) {
            logging::trace!(self.log, "connectivity check";
                            "context" => "checks",
                            "pair" => pair_index,
                            "target" => %target,
                            "nominate" => nominate);
            drop(shared.bound().send_gather(target, &[&wire]));
        }

        if let Some(tx) = &mut self.pairs[pair_index].tx {
            tx.txid = txid;
            let attempt = tx.attempts;
            tx.attempts += 1;
            tx.next_send_usec = now_usec + backoff_usec(attempt);
        }
    }

    fn drive_keepalive(&mut self, sockets: &SocketTable, now_usec: u64) {
        if self.state != IceSessionState::Selected || now_usec < self.keepalive_due_usec {
            return;
        }

        self.keepalive_due_usec = now_usec + KEEPALIVE_INTERVAL_USEC;

        let (token, _) = match self.selected_route() {
            Some(route) => route,
            None => return,
        };

        // Refresh the NAT binding toward the STUN server on the selected
        // socket; the peer path stays warm through data and acks.
        if let (Some(&server), Some(shared)) = (self.stun_servers.first(), sockets.get(token)) {
            let request = StunMessage::binding_request();
            drop(shared.bound().send_gather(server, &[&request.encode(None)]));
        }
    }

    /// Entry point for any STUN datagram that arrived on a socket this
    /// session owns.
    pub fn handle_stun(
        &mut self,
        socket: SocketToken,
        source: SocketAddr,
        datagram: &[u8],
        sockets: &SocketTable,
        now_usec: u64,
    ) {
        let local_pwd = self.local_pwd.clone();
        let decoded = StunMessage::decode(datagram, Some(local_pwd.as_bytes()));

        let (message, integrity) = match decoded {
            Ok(result) => result,
            Err(_) => {
                logging::trace!(self.log, "malformed stun packet dropped";
                                "context" => "stun",
                                "source" => %source);
                return;
            }
        };

        if message.method != METHOD_BINDING {
            return;
        }

        match message.class {
            MessageClass::SuccessResponse => {
                self.handle_binding_response(socket, source, &message, now_usec)
            }
            MessageClass::Request => {
                self.handle_binding_request(socket, source, &message, integrity, sockets, now_usec)
            }
            _ => (),
        }
    }

    fn handle_binding_response(
        &mut self,
        _socket: SocketToken,
        source: SocketAddr,
        message: &StunMessage,
        now_usec: u64,
    ) {
        // Server-reflexive discovery response?
        for i in 0..self.gather.len() {
            if self.gather[i].done || self.gather[i].txid != message.transaction_id {
                continue;
            }

            self.gather[i].done = true;

            let mapped = match message.xor_mapped_address() {
                Some(addr) => addr,
                None => return,
            };

            let host = &self.local_candidates[self.gather[i].host_candidate];
            let server = self.stun_servers[self.gather[i].server_index];

            // The mapping may coincide with the host address (no NAT)
            if self
                .local_candidates
                .iter()
                .any(|c| c.mapped == mapped)
            {
                return;
            }

            let local_pref = 65535u32.saturating_sub(self.local_candidates.len() as u32);
            let candidate = Candidate {
                kind: CandidateKind::ServerReflexive,
                base: host.base,
                mapped,
                stun_server: Some(server),
                priority: candidate_priority(CandidateKind::ServerReflexive, local_pref),
                socket: host.socket,
                foundation: compute_foundation(
                    CandidateKind::ServerReflexive,
                    host.base,
                    Some(server),
                ),
            };

            logging::debug!(self.log, "server reflexive candidate";
                            "context" => "gather",
                            "mapped" => %mapped);

            self.events
                .push_back(IceEvent::LocalCandidate(candidate.render()));
            self.local_candidates.push(candidate);
            self.form_pairs();
            return;
        }

        // Connectivity check response?
        for i in 0..self.pairs.len() {
            let matches = self.pairs[i]
                .tx
                .as_ref()
                .map(|tx| tx.txid == message.transaction_id)
                .unwrap_or(false);
            if !matches {
                continue;
            }

            let nominated_by_us = self.pairs[i].tx.as_ref().map(|tx| tx.nominate).unwrap_or(false);
            self.pairs[i].tx = None;

            if self.pairs[i].state != PairState::Succeeded {
                logging::debug!(self.log, "pair succeeded";
                                "context" => "checks",
                                "pair" => i,
                                "source" => %source);
            }
            self.pairs[i].state = PairState::Succeeded;

            if nominated_by_us {
                self.pairs[i].nominated = true;
            }

            if self.pairs[i].nominated {
                self.select_pair(i, now_usec);
            } else if self.role == IceRole::Controlling {
                // Nominate: re-check with USE-CANDIDATE
                self.pairs[i].tx = Some(CheckTx {
                    txid: [0u8; TRANSACTION_ID_SIZE],
                    attempts: 0,
                    next_send_usec: now_usec,
                    nominate: true,
                });
                self.pairs[i].state = PairState::InProgress;
            }
            return;
        }
    }

    fn handle_binding_request(
        &mut self,
        socket: SocketToken,
        source: SocketAddr,
        message: &StunMessage,
        integrity: Integrity,
        sockets: &SocketTable,
        now_usec: u64,
    ) {
        let expected = match self.expected_username() {
            Some(expected) => expected,
            None => return,
        };

        if message.username() != Some(expected.as_str()) || integrity != Integrity::Verified {
            logging::trace!(self.log, "binding request rejected";
                            "context" => "stun",
                            "source" => %source);
            return;
        }

        // Unknown (socket, source) combination: synthesize a peer-reflexive
        // remote candidate
        let remote_index = match self.remote_candidates.iter().position(|c| c.mapped == source) {
            Some(index) => index,
            None => {
                let priority = message
                    .priority()
                    .unwrap_or_else(|| candidate_priority(CandidateKind::PeerReflexive, 0));

                logging::debug!(self.log, "peer reflexive candidate";
                                "context" => "pairing",
                                "source" => %source);

                self.remote_candidates.push(Candidate {
                    kind: CandidateKind::PeerReflexive,
                    base: source,
                    mapped: source,
                    stun_server: None,
                    priority,
                    socket: None,
                    foundation: compute_foundation(CandidateKind::PeerReflexive, source, None),
                });
                self.form_pairs();
                self.remote_candidates.len() - 1
            }
        };

        let local_index = self
            .local_candidates
            .iter()
            .position(|c| c.socket == Some(socket));

        let pair_index = self.pairs.iter().position(|pair| {
            Some(pair.local) == local_index && pair.remote == remote_index
        });

        // Answer with the reflexive transport address of the asker
        let response = StunMessage::binding_response(message.transaction_id)
            .attr(Attribute::XorMappedAddress(source));
        let wire = response.encode(Some(self.local_pwd.as_bytes()));

        if let Some(shared) = sockets.get(socket) {
            drop(shared.bound().send_gather(source, &[&wire]));
        }

        let pair_index = match pair_index {
            Some(index) => index,
            None => return,
        };

        if message.has_use_candidate() {
            self.pairs[pair_index].nominated = true;

            match self.pairs[pair_index].state {
                PairState::Succeeded => self.select_pair(pair_index, now_usec),
                _ => self.pairs[pair_index].triggered = true,
            }
        } else if self.pairs[pair_index].state == PairState::Frozen
            || self.pairs[pair_index].state == PairState::Failed
        {
            // The peer can clearly reach us; try the reverse direction soon
            self.pairs[pair_index].triggered = true;
        }
    }

    /// Promotes a succeeded, nominated pair to the data path. The selected
    /// pair only changes through this path.
    fn select_pair(&mut self, pair_index: usize, now_usec: u64) {
        if self.selected == Some(pair_index) {
            return;
        }

        self.pairs[pair_index].nominated = true;
        self.selected = Some(pair_index);
        self.state = IceSessionState::Selected;
        self.keepalive_due_usec = now_usec + KEEPALIVE_INTERVAL_USEC;

        let local = &self.local_candidates[self.pairs[pair_index].local];
        let remote = &self.remote_candidates[self.pairs[pair_index].remote];

        logging::info!(self.log, "pair selected";
                       "context" => "checks",
                       "local" => %local.mapped,
                       "remote" => %remote.mapped);

        if let Some(token) = local.socket {
            self.events.push_back(IceEvent::PairSelected {
                socket: token,
                remote: remote.mapped,
            });
        }
    }

    /// Sends application data over the selected route.
    pub fn send_data(&self, sockets: &SocketTable, chunks: &[&[u8]]) -> NetworkResult<usize> {
        let (token, remote) = self
            .selected_route()
            .ok_or(NetworkError::Wait)?;

        let shared = sockets
            .get(token)
            .ok_or(NetworkError::Wait)?;

        shared.bound().send_gather(remote, chunks)
    }

    /// Earliest deadline at which `think` has work to do.
    pub fn next_think_usec(&self) -> Option<u64> {
        let mut next: Option<u64> = None;
        let mut fold = |candidate: u64| {
            next = Some(match next {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        for tx in &self.gather {
            if !tx.done {
                fold(tx.next_send_usec);
            }
        }

        for pair in &self.pairs {
            if let Some(tx) = &pair.tx {
                fold(tx.next_send_usec);
            }
        }

        if self.remote_pwd.is_some()
            && self
                .pairs
                .iter()
                .any(|p| p.state == PairState::Waiting || p.triggered)
        {
            fold(0);
        }

        if self.state == IceSessionState::Selected {
            fold(self.keepalive_due_usec);
        }

        next
    }

    /// Closes every socket the session opened.
    pub fn free_resources(&mut self, sockets: &mut SocketTable, registry: Option<&Registry>) {
        for candidate in &self.local_candidates {
            if let Some(token) = candidate.socket {
                sockets.close(token, registry);
            }
        }

        self.local_candidates.clear();
        self.pairs.clear();
        self.selected = None;
    }
}

/// Demultiplexes a datagram arriving on an ICE-owned socket: STUN noise goes
/// to the session, anything else is connection data. A datagram is never
/// split between the two.
#[inline]
pub fn is_ice_packet(datagram: &[u8]) -> bool {
    is_stun_packet(datagram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketTable;

    fn session(role: IceRole) -> IceSession {
        IceSession::new(role, Vec::new(), candidate_mask::ALL, None)
    }

    fn host_candidate(addr: &str, priority: u32) -> Candidate {
        let mapped: SocketAddr = addr.parse().unwrap();
        Candidate {
            kind: CandidateKind::Host,
            base: mapped,
            mapped,
            stun_server: None,
            priority,
            socket: Some(0),
            foundation: compute_foundation(CandidateKind::Host, mapped, None),
        }
    }

    #[test]
    fn test_candidate_priority_formula() {
        let priority = candidate_priority(CandidateKind::Host, 65535);
        assert_eq!(priority, (126 << 24) | (65535 << 8) | 255);

        assert!(
            candidate_priority(CandidateKind::Host, 0)
                > candidate_priority(CandidateKind::PeerReflexive, 65535)
        );
        assert!(
            candidate_priority(CandidateKind::PeerReflexive, 0)
                > candidate_priority(CandidateKind::ServerReflexive, 65535)
        );
    }

    #[test]
    fn test_candidate_render_parse_roundtrip() {
        let candidate = host_candidate("192.0.2.5:40000", 0x7e00ffff);
        let text = candidate.render();

        let parsed = Candidate::parse(&text).unwrap();
        assert_eq!(parsed.kind, CandidateKind::Host);
        assert_eq!(parsed.mapped, candidate.mapped);
        assert_eq!(parsed.priority, candidate.priority);
        assert_eq!(parsed.foundation, candidate.foundation);
    }

    #[test]
    fn test_srflx_candidate_carries_related_address() {
        let base: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.9:62000".parse().unwrap();

        let candidate = Candidate {
            kind: CandidateKind::ServerReflexive,
            base,
            mapped,
            stun_server: Some("198.51.100.1:3478".parse().unwrap()),
            priority: candidate_priority(CandidateKind::ServerReflexive, 100),
            socket: Some(1),
            foundation: 0xabc,
        };

        let text = candidate.render();
        assert!(text.contains("typ srflx"));
        assert!(text.contains("raddr 10.0.0.2"));

        let parsed = Candidate::parse(&text).unwrap();
        assert_eq!(parsed.mapped, mapped);
        assert_eq!(parsed.base, base);
    }

    #[test]
    fn test_candidate_parse_rejects_garbage() {
        assert!(Candidate::parse("").is_none());
        assert!(Candidate::parse("candidate:zz 1 udp x y z typ host").is_none());
        assert!(Candidate::parse("candidate:1 2 udp 1 1.2.3.4 5 typ host").is_none());
        assert!(Candidate::parse("candidate:1 1 tcp 1 1.2.3.4 5 typ host").is_none());
        assert!(Candidate::parse("candidate:1 1 udp 1 1.2.3.4 5 typ relay").is_none());
    }

    #[test]
    fn test_pair_priority_role_symmetry() {
        // Both agents must compute the same priority for the same pair
        let mut controlling = session(IceRole::Controlling);
        let mut controlled = session(IceRole::Controlled);

        controlling.state = IceSessionState::TestingPeerConnectivity;
        controlled.state = IceSessionState::TestingPeerConnectivity;

        controlling
            .local_candidates
            .push(host_candidate("10.0.0.1:1000", 100));
        controlled
            .local_candidates
            .push(host_candidate("10.0.0.2:2000", 200));

        controlling.remote_candidates.push(host_candidate("10.0.0.2:2000", 200));
        controlled.remote_candidates.push(host_candidate("10.0.0.1:1000", 100));

        controlling.form_pairs();
        controlled.form_pairs();

        assert_eq!(controlling.pairs.len(), 1);
        assert_eq!(controlled.pairs.len(), 1);
        assert_eq!(controlling.pairs[0].priority, controlled.pairs[0].priority);
    }

    #[test]
    fn test_pairs_respect_address_family() {
        let mut s = session(IceRole::Controlling);
        s.state = IceSessionState::TestingPeerConnectivity;

        s.local_candidates.push(host_candidate("10.0.0.1:1000", 100));
        s.remote_candidates.push(host_candidate("[2001:db8::1]:2000", 200));
        s.form_pairs();
        assert!(s.pairs.is_empty());

        s.remote_candidates.push(host_candidate("10.9.9.9:2000", 200));
        s.form_pairs();
        assert_eq!(s.pairs.len(), 1);
    }

    #[test]
    fn test_add_remote_candidate_dedupes() {
        let mut s = session(IceRole::Controlling);
        s.state = IceSessionState::TestingPeerConnectivity;

        let text = host_candidate("10.1.1.1:1234", 50).render();
        assert!(s.add_remote_candidate(&text));
        assert!(s.add_remote_candidate(&text));
        assert_eq!(s.remote_candidates.len(), 1);
    }

    #[test]
    fn test_unfreeze_one_per_foundation() {
        let mut s = session(IceRole::Controlling);
        s.state = IceSessionState::TestingPeerConnectivity;

        // Two local candidates sharing a foundation (same base/kind), two
        // distinct remotes
        let local = host_candidate("10.0.0.1:1000", 100);
        s.local_candidates.push(local.clone());
        s.remote_candidates.push(host_candidate("10.2.0.1:1000", 90));
        s.remote_candidates.push(host_candidate("10.2.0.2:1000", 80));

        s.form_pairs();

        // Pairs share the local foundation but differ in remote foundation,
        // so both may thaw
        assert!(s.pairs.iter().all(|p| p.state == PairState::Waiting));
    }

    #[test]
    fn test_incoming_request_creates_prflx_pair() {
        let mut s = session(IceRole::Controlled);
        s.state = IceSessionState::TestingPeerConnectivity;
        s.set_remote_auth("rfrag", "rpwd");

        s.local_candidates.push(host_candidate("10.0.0.1:1000", 100));

        let sockets = SocketTable::new(None);
        let source: SocketAddr = "198.51.100.7:61000".parse().unwrap();

        let (local_ufrag, local_pwd) = {
            let (u, p) = s.local_auth();
            (u.to_owned(), p.to_owned())
        };

        let request = StunMessage::binding_request()
            .attr(Attribute::Username(format!("{}:rfrag", local_ufrag)))
            .attr(Attribute::Priority(12345))
            .attr(Attribute::IceControlling(1));
        let wire = request.encode(Some(local_pwd.as_bytes()));

        s.handle_stun(0, source, &wire, &sockets, 0);

        assert_eq!(s.remote_candidates.len(), 1);
        assert_eq!(s.remote_candidates[0].kind, CandidateKind::PeerReflexive);
        assert_eq!(s.remote_candidates[0].mapped, source);
        assert_eq!(s.remote_candidates[0].priority, 12345);
        assert_eq!(s.pairs.len(), 1);
    }

    #[test]
    fn test_incoming_request_bad_username_ignored() {
        let mut s = session(IceRole::Controlled);
        s.state = IceSessionState::TestingPeerConnectivity;
        s.set_remote_auth("rfrag", "rpwd");
        s.local_candidates.push(host_candidate("10.0.0.1:1000", 100));

        let sockets = SocketTable::new(None);
        let source: SocketAddr = "198.51.100.7:61000".parse().unwrap();

        let local_pwd = s.local_auth().1.to_owned();
        let request = StunMessage::binding_request()
            .attr(Attribute::Username("wrong:rfrag".to_owned()));
        let wire = request.encode(Some(local_pwd.as_bytes()));

        s.handle_stun(0, source, &wire, &sockets, 0);
        assert!(s.remote_candidates.is_empty());
    }

    #[test]
    fn test_use_candidate_on_succeeded_pair_selects() {
        let mut s = session(IceRole::Controlled);
        s.state = IceSessionState::TestingPeerConnectivity;
        s.set_remote_auth("rfrag", "rpwd");
        s.local_candidates.push(host_candidate("10.0.0.1:1000", 100));

        let source: SocketAddr = "198.51.100.7:61000".parse().unwrap();
        s.remote_candidates.push(Candidate {
            kind: CandidateKind::Host,
            base: source,
            mapped: source,
            stun_server: None,
            priority: 50,
            socket: None,
            foundation: 1,
        });
        s.form_pairs();
        s.pairs[0].state = PairState::Succeeded;

        let sockets = SocketTable::new(None);
        let local_ufrag = s.local_auth().0.to_owned();
        let local_pwd = s.local_auth().1.to_owned();

        let request = StunMessage::binding_request()
            .attr(Attribute::Username(format!("{}:rfrag", local_ufrag)))
            .attr(Attribute::UseCandidate)
            .attr(Attribute::IceControlling(1));
        let wire = request.encode(Some(local_pwd.as_bytes()));

        s.handle_stun(0, source, &wire, &sockets, 1_000);

        assert_eq!(s.state(), IceSessionState::Selected);
        assert_eq!(
            s.poll_events_vec(),
            vec![IceEvent::PairSelected {
                socket: 0,
                remote: source
            }]
        );
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_usec(0), 500_000);
        assert_eq!(backoff_usec(1), 1_000_000);
        assert_eq!(backoff_usec(6), 32_000_000);
        assert_eq!(backoff_usec(7), RETRY_CAP_USEC);
        assert_eq!(backoff_usec(30), RETRY_CAP_USEC);
    }

    impl IceSession {
        fn poll_events_vec(&mut self) -> Vec<IceEvent> {
            let mut events = Vec::new();
            while let Some(event) = self.poll_event() {
                events.push(event);
            }
            events
        }
    }
}
