//! Per-negotiation state machine.
//!
//! Every negotiation runs as its own task. The task owns all sockets and
//! outstanding operations of the negotiation; the operations it spawns
//! (signaling requests and candidate races) report back through the task's
//! event channel, tagged with a generation so that results of operations
//! the session has since abandoned are discarded.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

use crate::common::{random_id, DnsResolver, S5bConfig};
use crate::connection::ConnectionEvent;
use crate::connector::{CandidateConnector, ConnectedCandidate, ConnectorError, UdpLink};
use crate::error::NegotiationError;
use crate::protocol::{self, StanzaError, ERR_NOT_FOUND};
use crate::registry::{EntryId, RegistryRef};
use crate::server::RelayServer;
use crate::signaling::{self, StanzaTransport};
use crate::socks5::{self, REPLY_CONNECTION_NOT_ALLOWED, REPLY_SUCCEEDED};
use crate::streamhost::{make_key, NegotiationRequest, PeerId, StreamHost, StreamHostList, StreamMode};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Initiator,
    Target,
    Active,
}

/// What the initiator knows about the target's negotiation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    #[default]
    Unknown,
    Fast,
    NotFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Target,
}

/// Flags accumulated while a negotiation progresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// One of our outbound connection attempts succeeded.
    pub conn_success: bool,
    /// All of our outbound attempts failed.
    pub local_failed: bool,
    /// The peer reported failure on our offer.
    pub remote_failed: bool,
    pub activated: bool,
    /// Proxy candidates were held back for a second round.
    pub late_proxy: bool,
    /// Inbound relay connections are still welcome.
    pub allow_incoming: bool,
}

/// Decides whether the negotiation has definitively failed, and how.
///
/// `fast` is the target's own fast flag and is ignored for initiators;
/// `status_code` is the code of the peer's error reply.
pub fn decide_overall_failure(
    role: Role,
    flags: &SessionFlags,
    target_mode: TargetMode,
    fast: bool,
    status_code: u16,
) -> Option<NegotiationError> {
    match role {
        Role::Initiator => {
            let failed = flags.remote_failed
                && ((flags.local_failed && target_mode == TargetMode::Fast)
                    || target_mode == TargetMode::NotFast);
            failed.then(|| {
                if status_code == ERR_NOT_FOUND {
                    NegotiationError::ConnectFailed
                } else {
                    NegotiationError::Refused
                }
            })
        }
        Role::Target => {
            let failed = flags.local_failed && ((flags.remote_failed && fast) || !fast);
            failed.then_some(NegotiationError::ConnectFailed)
        }
    }
}

/// Which of the two candidate sockets is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Reached us through our own relay server or our proxy.
    Inbound,
    /// We connected out to one of the peer's hosts.
    Outbound,
}

/// First byte observed on a candidate socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationByte {
    Nothing,
    CarriageReturn,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The socket carries the stream.
    Adopt,
    /// The socket misbehaved; drop it and stop looking.
    Discard,
    /// Not decided yet for this socket.
    Skip,
}

/// Decides whether `slot` wins activation on the target.
///
/// Without fast mode the first existing socket wins. With fast TCP the
/// winner is the socket that delivered the activation byte. With fast UDP
/// the initiator's activation notice names the winner in `notice`.
pub fn decide_activation_winner(
    fast: bool,
    datagram: bool,
    slot: Slot,
    byte: ActivationByte,
    notice: Option<Slot>,
) -> Verdict {
    if !fast {
        return Verdict::Adopt;
    }
    if datagram {
        return if notice == Some(slot) {
            Verdict::Adopt
        } else {
            Verdict::Skip
        };
    }
    match byte {
        ActivationByte::Nothing => Verdict::Skip,
        ActivationByte::CarriageReturn => Verdict::Adopt,
        ActivationByte::Other(_) => Verdict::Discard,
    }
}

/// The socket pair handed to a connection once negotiation succeeded.
#[derive(Debug)]
pub struct Transport {
    pub stream: TcpStream,
    /// Present when datagrams travel over a UDP association we opened.
    pub udp: Option<UdpLink>,
}

/// Session state visible to the registry.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub target_mode: TargetMode,
    pub out_id: Option<String>,
    pub in_id: Option<String>,
    /// A candidate race toward the peer is in progress.
    pub connecting: bool,
}

/// Messages from a session to its connection.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    Progress(ConnectionEvent),
    Connected(Transport),
    Failed(NegotiationError),
}

/// Inputs of the session task.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    OfferFinished {
        gen: u64,
        result: Result<Option<PeerId>, StanzaError>,
    },
    Connected {
        gen: u64,
        result: Result<ConnectedCandidate, ConnectorError>,
    },
    ProxyConnected {
        gen: u64,
        result: Result<ConnectedCandidate, ConnectorError>,
    },
    ProxyActivated {
        gen: u64,
        result: Result<(), StanzaError>,
    },
    /// A relay connection presented our key; the SOCKS request is not yet
    /// answered.
    IncomingClient(TcpStream),
    /// The peer's UDP activation notice.
    IncomingActivate(PeerId),
    /// The stream host with this id confirmed one of our UDP probes.
    UdpSuccess(PeerId),
    /// The target's own offer on a fast negotiation.
    HandleFast { hosts: StreamHostList, id: String },
}

/// How a session begins.
pub(crate) enum Start {
    Initiator,
    Target(NegotiationRequest),
}

/// Fixed inputs of one session.
pub(crate) struct SessionParams {
    pub sid: String,
    pub peer: PeerId,
    pub mode: StreamMode,
    pub proxy: Option<StreamHost>,
    pub want_fast: bool,
}

/// Everything a session needs from its surroundings.
pub(crate) struct SessionContext {
    pub transport: Arc<dyn StanzaTransport>,
    pub config: S5bConfig,
    pub resolver: DnsResolver,
    pub server: Option<RelayServer>,
    pub registry: RegistryRef,
    pub entry: EntryId,
    pub signals: mpsc::UnboundedSender<SessionSignal>,
}

/// Registry-side handle of a running session. Dropping it stops the session.
pub(crate) struct SessionHandle {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub status: Arc<Mutex<SessionStatus>>,
    _task: AbortOnDropHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    /// Hands a relay connection to the session, or gives it back when the
    /// session task has already ended.
    pub fn pass_client(&self, stream: TcpStream) -> Result<(), TcpStream> {
        if self.events.is_closed() {
            return Err(stream);
        }
        self.send(SessionEvent::IncomingClient(stream));
        Ok(())
    }
}

/// Computes the pair of keys for a negotiation seen from `self_id`.
///
/// The first key is the one the peer uses when reaching our hosts, the
/// second the one we use when reaching the peer's hosts.
pub fn session_keys(sid: &str, self_id: &PeerId, peer: &PeerId) -> (String, String) {
    (make_key(sid, self_id, peer), make_key(sid, peer, self_id))
}

enum Wake {
    Event(SessionEvent),
    Readable(std::io::Result<()>),
}

struct Pending {
    gen: u64,
    _task: AbortOnDropHandle<()>,
}

struct Race {
    gen: u64,
    udp_success: mpsc::UnboundedSender<PeerId>,
    _task: AbortOnDropHandle<()>,
}

#[derive(Debug)]
struct Candidate {
    stream: TcpStream,
    udp: Option<UdpLink>,
}

impl From<ConnectedCandidate> for Candidate {
    fn from(c: ConnectedCandidate) -> Self {
        Self {
            stream: c.stream,
            udp: c.udp,
        }
    }
}

pub(crate) struct Session {
    ctx: SessionContext,
    self_id: PeerId,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: Arc<Mutex<SessionStatus>>,

    state: SessionState,
    sid: String,
    peer: PeerId,
    key: String,
    out_key: String,
    mode: StreamMode,
    proxy: Option<StreamHost>,
    want_fast: bool,
    fast: bool,
    target_mode: TargetMode,
    flags: SessionFlags,
    status_code: u16,

    in_hosts: StreamHostList,
    in_id: Option<String>,
    out_id: Option<String>,
    activated_stream: Option<PeerId>,

    client: Option<Candidate>,
    client_out: Option<Candidate>,
    task: Option<Pending>,
    proxy_task: Option<Pending>,
    conn: Option<Race>,
    proxy_conn: Option<Race>,

    next_gen: u64,
    done: bool,
}

impl Session {
    /// Starts a session task.
    pub fn spawn(ctx: SessionContext, params: SessionParams, start: Start) -> SessionHandle {
        let (events, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(SessionStatus {
            state: match start {
                Start::Initiator => SessionState::Initiator,
                Start::Target(_) => SessionState::Target,
            },
            ..SessionStatus::default()
        }));
        let session = Session::new(ctx, params, events.clone(), Arc::clone(&status));
        let task = AbortOnDropHandle::new(tokio::spawn(session.run(start, rx)));
        SessionHandle {
            events,
            status,
            _task: task,
        }
    }

    fn new(
        ctx: SessionContext,
        params: SessionParams,
        events: mpsc::UnboundedSender<SessionEvent>,
        status: Arc<Mutex<SessionStatus>>,
    ) -> Self {
        let self_id = ctx.transport.local_id();
        let (key, out_key) = session_keys(&params.sid, &self_id, &params.peer);
        Self {
            ctx,
            self_id,
            events,
            status,
            state: SessionState::Idle,
            sid: params.sid,
            peer: params.peer,
            key,
            out_key,
            mode: params.mode,
            proxy: params.proxy,
            want_fast: params.want_fast,
            fast: false,
            target_mode: TargetMode::Unknown,
            flags: SessionFlags::default(),
            status_code: 0,
            in_hosts: StreamHostList::new(),
            in_id: None,
            out_id: None,
            activated_stream: None,
            client: None,
            client_out: None,
            task: None,
            proxy_task: None,
            conn: None,
            proxy_conn: None,
            next_gen: 0,
            done: false,
        }
    }

    async fn run(mut self, start: Start, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        match start {
            Start::Initiator => self.start_initiator(),
            Start::Target(request) => self.start_target(request),
        }

        while !self.done {
            self.publish();
            let wake = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => break,
                },
                readable = wait_readable(self.client.as_ref(), self.client_out.as_ref()), if self.watching_activation() => {
                    Wake::Readable(readable)
                }
            };
            match wake {
                Wake::Event(event) => self.handle(event).await,
                Wake::Readable(Ok(())) => self.check_for_activation(),
                Wake::Readable(Err(e)) => {
                    tracing::debug!(sid = %self.sid, error = %e, "candidate socket failed");
                    self.fail(NegotiationError::ConnectFailed);
                }
            }
        }
        // relay connections that raced with the end of the negotiation
        rx.close();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::IncomingClient(mut stream) = event {
                tracing::debug!(sid = %self.sid, "denying relay connection after negotiation ended");
                let _ = socks5::send_reply_unspecified(&mut stream, REPLY_CONNECTION_NOT_ALLOWED).await;
            }
        }
        tracing::trace!(sid = %self.sid, "session task finished");
    }

    fn publish(&self) {
        let mut status = self.status.lock();
        status.state = self.state;
        status.target_mode = self.target_mode;
        status.out_id = self.out_id.clone();
        status.in_id = self.in_id.clone();
        status.connecting = self.conn.is_some();
    }

    /// Only a fast TCP target reads activation bytes, and only once it has
    /// no outstanding request of its own.
    fn watching_activation(&self) -> bool {
        self.state == SessionState::Target
            && self.fast
            && !self.mode.is_datagram()
            && !self.flags.activated
            && self.task.is_none()
            && self.proxy_task.is_none()
            && (self.client.is_some() || self.client_out.is_some())
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::OfferFinished { gen, result } => {
                if self.task.as_ref().is_some_and(|t| t.gen == gen) {
                    self.task = None;
                    self.offer_finished(result).await;
                }
            }
            SessionEvent::Connected { gen, result } => {
                if self.conn.as_ref().is_some_and(|c| c.gen == gen) {
                    self.conn = None;
                    self.conn_result(result).await;
                }
            }
            SessionEvent::ProxyConnected { gen, result } => {
                if self.proxy_conn.as_ref().is_some_and(|c| c.gen == gen) {
                    self.proxy_conn = None;
                    self.proxy_result(result);
                }
            }
            SessionEvent::ProxyActivated { gen, result } => {
                if self.proxy_task.as_ref().is_some_and(|t| t.gen == gen) {
                    self.proxy_task = None;
                    self.proxy_finished(result).await;
                }
            }
            SessionEvent::IncomingClient(stream) => self.set_incoming_client(stream).await,
            SessionEvent::IncomingActivate(streamhost) => {
                if !self.flags.activated {
                    self.activated_stream = Some(streamhost);
                    self.check_for_activation();
                }
            }
            SessionEvent::UdpSuccess(jid) => {
                for race in [&self.conn, &self.proxy_conn].into_iter().flatten() {
                    let _ = race.udp_success.send(jid.clone());
                }
            }
            SessionEvent::HandleFast { hosts, id } => self.handle_fast(hosts, id),
        }
    }

    fn role(&self) -> Role {
        if self.state == SessionState::Initiator {
            Role::Initiator
        } else {
            Role::Target
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.ctx.signals.send(SessionSignal::Progress(event));
    }

    fn gen(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }

    fn start_initiator(&mut self) {
        tracing::debug!(sid = %self.sid, peer = %self.peer, "starting negotiation as initiator");
        self.state = SessionState::Initiator;
        self.do_outgoing();
    }

    fn start_target(&mut self, request: NegotiationRequest) {
        tracing::debug!(sid = %self.sid, peer = %self.peer, fast = request.fast, "starting negotiation as target");
        self.state = SessionState::Target;
        self.in_hosts = request.hosts;
        self.in_id = Some(request.id);
        self.fast = request.fast;
        if self.fast {
            self.do_outgoing();
        }
        self.do_incoming();
    }

    fn handle_fast(&mut self, hosts: StreamHostList, id: String) {
        if self.target_mode != TargetMode::Unknown {
            tracing::warn!(sid = %self.sid, peer = %self.peer, "repeated fast-mode offer");
            self.ctx
                .transport
                .send(protocol::error_reply(&self.peer, &id, StanzaError::not_acceptable()));
            return;
        }
        // the target is fast even when its hosts are no longer needed
        self.target_mode = TargetMode::Fast;
        self.emit(ConnectionEvent::Accepted);
        if self.client.is_some() {
            self.ctx
                .transport
                .send(protocol::error_reply(&self.peer, &id, StanzaError::not_acceptable()));
            return;
        }
        self.in_hosts = hosts;
        self.in_id = Some(id);
        self.do_incoming();
    }

    /// Offers our own hosts (and proxy) to the peer.
    fn do_outgoing(&mut self) {
        let mut hosts = StreamHostList::new();
        if let Some(server) = self.ctx.server.as_ref().filter(|s| s.is_active()) {
            if !self.in_hosts.contains_peer(&self.self_id) {
                if let Some(port) = server.port() {
                    for host in server.host_list() {
                        hosts.push(StreamHost::new(self.self_id.clone(), host, port));
                    }
                }
            }
        }
        if let Some(proxy) = &self.proxy {
            hosts.push(proxy.clone());
        }

        if self.state == SessionState::Target && hosts.is_empty() {
            self.fast = false;
            return;
        }

        self.flags.allow_incoming = true;
        let fast = self.state == SessionState::Initiator && self.want_fast;
        let id = random_id("s5b_req_");
        let stanza = protocol::offer(&self.peer, &id, &self.sid, &hosts, fast, self.mode);
        self.out_id = Some(id);
        // a loopback offer must find our request id already published
        self.publish();
        tracing::debug!(sid = %self.sid, hosts = hosts.len(), fast, "sending offer");

        let gen = self.gen();
        let transport = Arc::clone(&self.ctx.transport);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = signaling::request(transport.as_ref(), stanza)
                .await
                .and_then(|reply| protocol::parse_offer_result(&reply));
            let _ = events.send(SessionEvent::OfferFinished { gen, result });
        });
        self.task = Some(Pending {
            gen,
            _task: AbortOnDropHandle::new(task),
        });
    }

    /// Races the peer's hosts.
    fn do_incoming(&mut self) {
        if self.in_hosts.is_empty() {
            self.do_connect_error();
            return;
        }

        let list = if self.flags.late_proxy {
            self.flags.late_proxy = false;
            self.in_hosts.filter_proxy(true)
        } else if (self.state == SessionState::Initiator || (self.state == SessionState::Target && self.fast))
            && self.proxy.is_none()
        {
            let direct = self.in_hosts.filter_proxy(false);
            if self.in_hosts.has_proxy() {
                self.flags.late_proxy = true;
                // wait for the peer's answer before trying proxies
                if direct.is_empty() {
                    return;
                }
            }
            direct
        } else {
            self.in_hosts.clone()
        };

        self.emit(ConnectionEvent::TryingHosts(list.clone()));
        let timeout = if self.flags.late_proxy {
            self.ctx.config.late_proxy_timeout
        } else {
            self.ctx.config.race_timeout
        };
        let race = self.start_race(list, self.out_key.clone(), timeout, |gen, result| {
            SessionEvent::Connected { gen, result }
        });
        self.conn = Some(race);
    }

    fn start_race(
        &mut self,
        hosts: StreamHostList,
        key: String,
        timeout: std::time::Duration,
        report: fn(u64, Result<ConnectedCandidate, ConnectorError>) -> SessionEvent,
    ) -> Race {
        tracing::debug!(sid = %self.sid, hosts = hosts.len(), "racing stream hosts");
        let gen = self.gen();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let connector = CandidateConnector::new(self.self_id.clone(), hosts, key, &self.ctx.config)
            .datagram(self.mode.is_datagram())
            .timeout(timeout)
            .resolver(self.ctx.resolver.clone());
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = connector.run(udp_rx).await;
            let _ = events.send(report(gen, result));
        });
        Race {
            gen,
            udp_success: udp_tx,
            _task: AbortOnDropHandle::new(task),
        }
    }

    async fn set_incoming_client(&mut self, mut stream: TcpStream) {
        if !self.flags.allow_incoming {
            tracing::warn!(sid = %self.sid, "denying unexpected relay connection");
            let _ = socks5::send_reply_unspecified(&mut stream, REPLY_CONNECTION_NOT_ALLOWED).await;
            return;
        }
        if let Err(e) = socks5::send_reply_unspecified(&mut stream, REPLY_SUCCEEDED).await {
            tracing::debug!(sid = %self.sid, error = %e, "failed to grant relay connection");
            return;
        }
        tracing::debug!(sid = %self.sid, peer = %self.peer, "incoming relay connection");
        self.client = Some(Candidate { stream, udp: None });
        self.flags.allow_incoming = false;
    }

    async fn offer_finished(&mut self, result: Result<Option<PeerId>, StanzaError>) {
        if self.state == SessionState::Initiator && self.target_mode == TargetMode::Unknown {
            self.target_mode = TargetMode::NotFast;
            self.emit(ConnectionEvent::Accepted);
        }

        // the peer already has our answer; this reply no longer matters
        if self.state == SessionState::Initiator && self.flags.conn_success {
            self.try_activation().await;
            return;
        }

        match result {
            Ok(used) => {
                if self.conn.is_some() || self.flags.late_proxy {
                    self.conn = None;
                    self.do_connect_error();
                    if self.done {
                        return;
                    }
                }

                let Some(used) = used else {
                    tracing::warn!(sid = %self.sid, "offer accepted without a stream host");
                    self.fail(NegotiationError::WrongHost);
                    return;
                };

                if used == self.self_id {
                    if self.client.is_none() {
                        tracing::warn!(sid = %self.sid, "peer claims a connection we never saw");
                        self.fail(NegotiationError::WrongHost);
                    } else if self.state == SessionState::Initiator {
                        self.activated_stream = Some(used);
                        self.try_activation().await;
                    } else {
                        self.check_for_activation();
                    }
                } else if let Some(proxy) = self.proxy.clone().filter(|p| p.jid() == &used) {
                    self.client = None;
                    self.flags.allow_incoming = false;
                    self.emit(ConnectionEvent::ProxyConnect);
                    let mut list = StreamHostList::new();
                    list.push(proxy);
                    let race = self.start_race(list, self.key.clone(), self.ctx.config.race_timeout, |gen, result| {
                        SessionEvent::ProxyConnected { gen, result }
                    });
                    self.proxy_conn = Some(race);
                } else {
                    tracing::warn!(sid = %self.sid, host = %used, "peer used a stream host we never offered");
                    self.fail(NegotiationError::WrongHost);
                }
            }
            Err(e) => {
                tracing::warn!(sid = %self.sid, code = e.code, error = %e, "peer failed our offer");
                self.flags.remote_failed = true;
                self.status_code = e.code;

                if self.flags.late_proxy {
                    if self.conn.is_none() {
                        self.do_incoming();
                    }
                } else if self.flags.conn_success {
                    self.check_for_activation();
                } else {
                    self.check_failure();
                }
            }
        }
    }

    async fn conn_result(&mut self, result: Result<ConnectedCandidate, ConnectorError>) {
        match result {
            Ok(connected) => {
                tracing::debug!(sid = %self.sid, host = %connected.host, "outgoing connection succeeded");
                self.flags.conn_success = true;
                if let Some(in_id) = &self.in_id {
                    self.ctx.transport.send(protocol::streamhost_used(
                        &self.peer,
                        in_id,
                        Some(connected.host.jid()),
                    ));
                }
                // the first round worked; proxies are not needed
                self.flags.late_proxy = false;

                if self.state == SessionState::Initiator {
                    self.client = Some(connected.into());
                    self.flags.allow_incoming = false;
                    self.activated_stream = Some(self.peer.clone());
                    self.try_activation().await;
                } else {
                    self.client_out = Some(connected.into());
                    self.check_for_activation();
                }
            }
            Err(e) => {
                tracing::debug!(sid = %self.sid, error = %e, "outgoing connection failed");
                if self.flags.late_proxy {
                    if self.flags.remote_failed {
                        self.do_incoming();
                    }
                } else {
                    self.do_connect_error();
                }
            }
        }
    }

    fn proxy_result(&mut self, result: Result<ConnectedCandidate, ConnectorError>) {
        let (connected, proxy) = match (result, self.proxy.clone()) {
            (Ok(connected), Some(proxy)) => (connected, proxy),
            (result, _) => {
                if let Err(e) = result {
                    tracing::debug!(sid = %self.sid, error = %e, "proxy connection failed");
                }
                self.fail(NegotiationError::ProxyFailed);
                return;
            }
        };
        self.client = Some(connected.into());

        tracing::debug!(sid = %self.sid, proxy = %proxy, "activating proxy stream");
        let gen = self.gen();
        let stanza = protocol::proxy_activate(proxy.jid(), &random_id("s5b_act_"), &self.sid, &self.peer);
        let transport = Arc::clone(&self.ctx.transport);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = signaling::request(transport.as_ref(), stanza)
                .await
                .and_then(|reply| protocol::parse_empty_result(&reply));
            let _ = events.send(SessionEvent::ProxyActivated { gen, result });
        });
        self.proxy_task = Some(Pending {
            gen,
            _task: AbortOnDropHandle::new(task),
        });
    }

    async fn proxy_finished(&mut self, result: Result<(), StanzaError>) {
        if let Err(e) = result {
            tracing::debug!(sid = %self.sid, error = %e, "proxy activation failed");
            self.fail(NegotiationError::ProxyFailed);
            return;
        }
        if self.state == SessionState::Initiator {
            self.activated_stream = self.proxy.as_ref().map(|p| p.jid().clone());
            self.try_activation().await;
        } else {
            self.check_for_activation();
        }
    }

    async fn try_activation(&mut self) {
        if self.flags.activated {
            return;
        }
        match self.target_mode {
            TargetMode::NotFast => self.finish(),
            TargetMode::Fast => {
                // in fast mode the reply to our offer is not awaited
                self.task = None;
                self.flags.activated = true;

                if self.mode.is_datagram() {
                    if let Some(stream) = &self.activated_stream {
                        self.ctx
                            .transport
                            .send(protocol::activate(&self.peer, &self.sid, stream));
                    }
                    self.finish();
                    return;
                }

                let written = match self.client.as_mut() {
                    Some(client) => client.stream.write_all(b"\r").await,
                    None => Err(std::io::ErrorKind::NotConnected.into()),
                };
                match written {
                    Ok(()) => self.finish(),
                    Err(e) => {
                        tracing::debug!(sid = %self.sid, error = %e, "failed to send activation byte");
                        self.fail(NegotiationError::ConnectFailed);
                    }
                }
            }
            TargetMode::Unknown => {}
        }
    }

    /// Picks the socket that carries the stream, on the target side.
    fn check_for_activation(&mut self) {
        let notice = self.activated_stream.as_ref().map(|stream| {
            let ours = stream == &self.self_id || self.proxy.as_ref().is_some_and(|p| p.jid() == stream);
            if ours {
                Slot::Inbound
            } else {
                Slot::Outbound
            }
        });

        for slot in [Slot::Inbound, Slot::Outbound] {
            let candidate = match slot {
                Slot::Inbound => self.client.as_ref(),
                Slot::Outbound => self.client_out.as_ref(),
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let byte = if self.fast && !self.mode.is_datagram() {
                match read_activation_byte(&candidate.stream) {
                    Ok(byte) => byte,
                    Err(e) => {
                        // the initiator closes the candidate it did not pick
                        tracing::debug!(sid = %self.sid, ?slot, error = %e, "candidate socket closed");
                        match slot {
                            Slot::Inbound => self.client = None,
                            Slot::Outbound => self.client_out = None,
                        }
                        continue;
                    }
                }
            } else {
                ActivationByte::Nothing
            };

            match decide_activation_winner(self.fast, self.mode.is_datagram(), slot, byte, notice) {
                Verdict::Adopt => {
                    let winner = match slot {
                        Slot::Inbound => self.client.take(),
                        Slot::Outbound => self.client_out.take(),
                    };
                    self.client = winner;
                    self.client_out = None;
                    self.flags.activated = true;
                    break;
                }
                Verdict::Discard => {
                    tracing::warn!(sid = %self.sid, ?slot, "dropping candidate with bad activation byte");
                    match slot {
                        Slot::Inbound => self.client = None,
                        Slot::Outbound => self.client_out = None,
                    }
                    return;
                }
                Verdict::Skip => {}
            }
        }

        if self.flags.activated {
            self.finish();
        } else if self.client.is_none()
            && self.client_out.is_none()
            && self.flags.conn_success
            && self.conn.is_none()
            && self.proxy_conn.is_none()
        {
            self.fail(NegotiationError::ConnectFailed);
        } else if (self.flags.conn_success || self.flags.local_failed)
            && self.proxy_task.is_none()
            && self.proxy_conn.is_none()
        {
            self.emit(ConnectionEvent::WaitingForActivation);
        }
    }

    fn do_connect_error(&mut self) {
        self.flags.local_failed = true;
        if let Some(in_id) = &self.in_id {
            self.ctx.transport.send(protocol::error_reply(
                &self.peer,
                in_id,
                StanzaError::new(ERR_NOT_FOUND, "Could not connect to given hosts"),
            ));
        }
        self.check_failure();
    }

    fn check_failure(&mut self) {
        if let Some(error) =
            decide_overall_failure(self.role(), &self.flags, self.target_mode, self.fast, self.status_code)
        {
            self.fail(error);
        }
    }

    fn reset(&mut self) {
        self.task = None;
        self.proxy_task = None;
        self.conn = None;
        self.proxy_conn = None;
        self.client = None;
        self.client_out = None;
    }

    fn finish(&mut self) {
        let Some(client) = self.client.take() else {
            self.fail(NegotiationError::ConnectFailed);
            return;
        };
        self.reset();
        self.done = true;
        self.state = SessionState::Active;
        self.publish();
        tracing::info!(sid = %self.sid, peer = %self.peer, "bytestream linked");
        let _ = self.ctx.signals.send(SessionSignal::Connected(Transport {
            stream: client.stream,
            udp: client.udp,
        }));
    }

    fn fail(&mut self, error: NegotiationError) {
        tracing::info!(sid = %self.sid, peer = %self.peer, %error, "negotiation failed");
        self.reset();
        self.done = true;
        self.state = SessionState::Idle;
        self.publish();
        self.ctx.registry.retire(self.ctx.entry);
        let _ = self.ctx.signals.send(SessionSignal::Failed(error));
    }
}

/// Reads at most one byte without blocking.
fn read_activation_byte(stream: &TcpStream) -> std::io::Result<ActivationByte> {
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Ok(0) => Err(std::io::ErrorKind::UnexpectedEof.into()),
        Ok(_) if byte[0] == b'\r' => Ok(ActivationByte::CarriageReturn),
        Ok(_) => Ok(ActivationByte::Other(byte[0])),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ActivationByte::Nothing),
        Err(e) => Err(e),
    }
}

async fn wait_readable(a: Option<&Candidate>, b: Option<&Candidate>) -> std::io::Result<()> {
    match (a, b) {
        (Some(a), Some(b)) => tokio::select! {
            r = a.stream.readable() => r,
            r = b.stream.readable() => r,
        },
        (Some(c), None) | (None, Some(c)) => c.stream.readable().await,
        (None, None) => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(local_failed: bool, remote_failed: bool) -> SessionFlags {
        SessionFlags {
            local_failed,
            remote_failed,
            ..SessionFlags::default()
        }
    }

    #[test]
    fn test_initiator_not_fast_fails_on_remote_error() {
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(false, true), TargetMode::NotFast, false, 406),
            Some(NegotiationError::Refused)
        );
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(false, true), TargetMode::NotFast, false, 404),
            Some(NegotiationError::ConnectFailed)
        );
    }

    #[test]
    fn test_initiator_fast_needs_both_sides_failed() {
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(false, true), TargetMode::Fast, false, 404),
            None
        );
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(true, false), TargetMode::Fast, false, 0),
            None
        );
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(true, true), TargetMode::Fast, false, 404),
            Some(NegotiationError::ConnectFailed)
        );
    }

    #[test]
    fn test_initiator_unknown_mode_never_fails() {
        assert_eq!(
            decide_overall_failure(Role::Initiator, &flags(true, true), TargetMode::Unknown, false, 404),
            None
        );
    }

    #[test]
    fn test_target_failure() {
        // without fast mode our own failure is final
        assert_eq!(
            decide_overall_failure(Role::Target, &flags(true, false), TargetMode::Unknown, false, 0),
            Some(NegotiationError::ConnectFailed)
        );
        assert_eq!(
            decide_overall_failure(Role::Target, &flags(true, false), TargetMode::Unknown, true, 0),
            None
        );
        assert_eq!(
            decide_overall_failure(Role::Target, &flags(true, true), TargetMode::Unknown, true, 406),
            Some(NegotiationError::ConnectFailed)
        );
        assert_eq!(
            decide_overall_failure(Role::Target, &flags(false, true), TargetMode::Unknown, true, 406),
            None
        );
    }

    #[test]
    fn test_activation_not_fast_adopts_first() {
        assert_eq!(
            decide_activation_winner(false, false, Slot::Inbound, ActivationByte::Nothing, None),
            Verdict::Adopt
        );
        assert_eq!(
            decide_activation_winner(false, true, Slot::Outbound, ActivationByte::Nothing, None),
            Verdict::Adopt
        );
    }

    #[test]
    fn test_activation_fast_tcp_needs_carriage_return() {
        assert_eq!(
            decide_activation_winner(true, false, Slot::Inbound, ActivationByte::Nothing, None),
            Verdict::Skip
        );
        assert_eq!(
            decide_activation_winner(true, false, Slot::Outbound, ActivationByte::CarriageReturn, None),
            Verdict::Adopt
        );
        assert_eq!(
            decide_activation_winner(true, false, Slot::Inbound, ActivationByte::Other(b'x'), None),
            Verdict::Discard
        );
    }

    #[test]
    fn test_activation_fast_udp_follows_notice() {
        assert_eq!(
            decide_activation_winner(true, true, Slot::Inbound, ActivationByte::Nothing, Some(Slot::Inbound)),
            Verdict::Adopt
        );
        assert_eq!(
            decide_activation_winner(true, true, Slot::Inbound, ActivationByte::Nothing, Some(Slot::Outbound)),
            Verdict::Skip
        );
        assert_eq!(
            decide_activation_winner(true, true, Slot::Outbound, ActivationByte::Nothing, Some(Slot::Outbound)),
            Verdict::Adopt
        );
        assert_eq!(
            decide_activation_winner(true, true, Slot::Outbound, ActivationByte::Nothing, None),
            Verdict::Skip
        );
    }

    #[test]
    fn test_session_keys_are_mirrored() {
        let a = PeerId::parse("a@x/r").unwrap();
        let b = PeerId::parse("b@x/r").unwrap();
        let (key_a, out_a) = session_keys("s", &a, &b);
        let (key_b, out_b) = session_keys("s", &b, &a);
        assert_eq!(key_a, out_b);
        assert_eq!(out_a, key_b);
        assert_ne!(key_a, out_a);
    }

    #[tokio::test]
    async fn test_read_activation_byte() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        assert_eq!(read_activation_byte(&server).unwrap(), ActivationByte::Nothing);

        client.write_all(b"\rx").await.unwrap();
        server.readable().await.unwrap();
        assert_eq!(read_activation_byte(&server).unwrap(), ActivationByte::CarriageReturn);
        server.readable().await.unwrap();
        assert_eq!(read_activation_byte(&server).unwrap(), ActivationByte::Other(b'x'));

        drop(client);
        server.readable().await.unwrap();
        assert!(read_activation_byte(&server).is_err());
    }
}
