//! Bookkeeping of all negotiations of one local identity.
//!
//! The registry routes inbound signaling to the right session, enforces
//! session id uniqueness, hands inbound offers to the application as
//! [`Connection`]s and serves the relay server's key lookups.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

use crate::common::{random_id, DnsResolver, S5bConfig};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::protocol::{self, Stanza, StanzaError};
use crate::server::RelayServer;
use crate::session::{
    session_keys, Session, SessionContext, SessionEvent, SessionHandle, SessionParams, SessionSignal,
    SessionState, Start, TargetMode,
};
use crate::signaling::{self, Inbound, StanzaTransport};
use crate::streamhost::{NegotiationRequest, PeerId, StreamHost, StreamMode};

pub(crate) type EntryId = u64;

/// Channels from the registry side to one connection.
pub(crate) struct ConnectionChannels {
    pub signals: mpsc::UnboundedSender<SessionSignal>,
    pub datagrams: mpsc::UnboundedSender<Bytes>,
}

struct Entry {
    peer: PeerId,
    sid: String,
    mode: StreamMode,
    key: String,
    out_key: String,
    /// Inbound offer not yet accepted or rejected.
    request: Option<NegotiationRequest>,
    channels: ConnectionChannels,
    session: Option<SessionHandle>,
    /// Proxy query running before the session starts.
    query: Option<AbortOnDropHandle<()>>,
    /// Sender our relay server locked on to for datagrams.
    udp_peer: Option<SocketAddr>,
}

#[derive(Default)]
struct RegistryState {
    next_id: EntryId,
    entries: HashMap<EntryId, Entry>,
}

impl RegistryState {
    fn find(&self, pred: impl Fn(&Entry) -> bool) -> Option<(EntryId, &Entry)> {
        self.entries
            .iter()
            .filter(|(_, e)| pred(e))
            .min_by_key(|(id, _)| **id)
            .map(|(id, e)| (*id, e))
    }

    fn find_session(&self, pred: impl Fn(&Entry) -> bool) -> Option<&SessionHandle> {
        self.find(|e| e.session.is_some() && pred(e))
            .and_then(|(_, e)| e.session.as_ref())
    }
}

struct RegistryInner {
    transport: Arc<dyn StanzaTransport>,
    self_id: PeerId,
    config: S5bConfig,
    resolver: DnsResolver,
    state: Mutex<RegistryState>,
    server: Mutex<Option<RelayServer>>,
    incoming_tx: mpsc::UnboundedSender<Connection>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
}

/// Weak handle to a registry, held by sessions and relay servers.
#[derive(Clone)]
pub(crate) struct RegistryRef(Weak<RegistryInner>);

impl RegistryRef {
    pub fn upgrade(&self) -> Option<SessionRegistry> {
        self.0.upgrade().map(|inner| SessionRegistry { inner })
    }

    pub fn is(&self, registry: &SessionRegistry) -> bool {
        Weak::ptr_eq(&self.0, &Arc::downgrade(&registry.inner))
    }

    /// Removes an entry whose session ended in failure.
    pub fn retire(&self, entry: EntryId) {
        if let Some(registry) = self.upgrade() {
            let removed = registry.inner.state.lock().entries.remove(&entry);
            drop(removed);
        }
    }
}

/// Negotiation manager of one local identity.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn StanzaTransport>, config: S5bConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RegistryInner {
                self_id: transport.local_id(),
                transport,
                config,
                resolver: DnsResolver::new(),
                state: Mutex::new(RegistryState::default()),
                server: Mutex::new(None),
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    pub fn config(&self) -> &S5bConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> RegistryRef {
        RegistryRef(Arc::downgrade(&self.inner))
    }

    /// Attaches a relay server (or detaches with `None`).
    pub fn set_server(&self, server: Option<&RelayServer>) {
        let previous = std::mem::replace(&mut *self.inner.server.lock(), server.cloned());
        if let Some(previous) = previous {
            previous.unlink(self);
        }
        if let Some(server) = server {
            server.link(self);
        }
    }

    pub fn server(&self) -> Option<RelayServer> {
        self.inner.server.lock().clone()
    }

    /// Creates an idle connection bound to this registry.
    pub fn create_connection(&self) -> Connection {
        Connection::new(self.clone())
    }

    /// Waits for the next inbound offer.
    pub async fn next_incoming(&self) -> Option<Connection> {
        self.inner.incoming_rx.lock().await.recv().await
    }

    /// Feeds inbound stanzas to the registry until the stream ends.
    pub async fn run_inbound(self, mut stanzas: mpsc::UnboundedReceiver<Stanza>) {
        while let Some(stanza) = stanzas.recv().await {
            self.handle_stanza(&stanza);
        }
        tracing::debug!(id = %self.inner.self_id, "inbound stanza stream ended");
    }

    /// Acts on one inbound stanza; anything unrelated is ignored.
    pub fn handle_stanza(&self, stanza: &Stanza) {
        match signaling::classify(stanza) {
            Ok(Some(Inbound::Offer(request))) => self.on_offer(request),
            Ok(Some(Inbound::UdpSuccess { from, key })) => self.on_udp_success(from, &key),
            Ok(Some(Inbound::Activate { from, sid, streamhost })) => {
                self.on_activation_notice(&from, &sid, streamhost)
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring malformed bytestream stanza"),
        }
    }

    /// Returns true if neither key of `peer`/`sid` is in use here or in any
    /// registry sharing our relay server.
    pub fn is_acceptable_sid(&self, peer: &PeerId, sid: &str) -> bool {
        let (key, out_key) = session_keys(sid, &self.inner.self_id, peer);
        let registries = match self.server() {
            Some(server) => server.registries(),
            None => vec![self.clone()],
        };
        !registries
            .iter()
            .any(|r| r.owns_key(&key) || r.owns_key(&out_key))
    }

    /// Generates a session id that is acceptable for `peer`.
    pub fn gen_unique_sid(&self, peer: &PeerId) -> String {
        loop {
            let sid = random_id("s5b_");
            if self.is_acceptable_sid(peer, &sid) {
                return sid;
            }
        }
    }

    fn owns_key(&self, key: &str) -> bool {
        let state = self.inner.state.lock();
        state.entries.values().any(|e| e.key == key || e.out_key == key)
    }

    fn on_offer(&self, request: NegotiationRequest) {
        let mut state = self.inner.state.lock();
        let same_sid = |e: &Entry| e.peer == request.from && e.sid == request.sid;

        let allowed = match state.find(same_sid) {
            // a pending offer, or an entry still waiting for its proxy
            Some((_, entry)) if entry.session.is_none() => false,
            Some(_) => {
                let Some(session) = state.find_session(same_sid) else {
                    return;
                };
                let status = session.status();
                if request.from == self.inner.self_id && status.out_id.as_deref() == Some(request.id.as_str()) {
                    true
                } else if status.state == SessionState::Initiator && status.target_mode == TargetMode::Unknown {
                    tracing::debug!(sid = %request.sid, peer = %request.from, "fast-mode offer from target");
                    session.send(SessionEvent::HandleFast {
                        hosts: request.hosts,
                        id: request.id,
                    });
                    return;
                } else {
                    false
                }
            }
            None => true,
        };

        if !allowed {
            drop(state);
            tracing::warn!(sid = %request.sid, peer = %request.from, "rejecting offer for sid in use");
            self.inner
                .transport
                .send(protocol::error_reply(&request.from, &request.id, StanzaError::sid_in_use()));
            return;
        }

        tracing::debug!(sid = %request.sid, peer = %request.from, hosts = request.hosts.len(), "incoming offer");
        let (key, out_key) = session_keys(&request.sid, &self.inner.self_id, &request.from);
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (datagrams, datagrams_rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                peer: request.from.clone(),
                sid: request.sid.clone(),
                mode: request.mode,
                key,
                out_key,
                request: Some(request.clone()),
                channels: ConnectionChannels { signals, datagrams },
                session: None,
                query: None,
                udp_peer: None,
            },
        );
        drop(state);

        let connection = Connection::incoming(self.clone(), id, request, signals_rx, datagrams_rx);
        if self.inner.incoming_tx.send(connection).is_err() {
            tracing::warn!("incoming connection queue closed");
        }
    }

    fn on_udp_success(&self, from: PeerId, key: &str) {
        let state = self.inner.state.lock();
        if let Some(session) = state.find_session(|e| e.key == key || e.out_key == key) {
            session.send(SessionEvent::UdpSuccess(from));
        }
    }

    fn on_activation_notice(&self, from: &PeerId, sid: &str, streamhost: PeerId) {
        let state = self.inner.state.lock();
        if let Some(session) = state.find_session(|e| &e.peer == from && e.sid == sid) {
            session.send(SessionEvent::IncomingActivate(streamhost));
        }
    }

    /// Registers an outgoing negotiation and starts it.
    pub(crate) fn begin_outgoing(
        &self,
        peer: &PeerId,
        sid: &str,
        mode: StreamMode,
        proxy: Option<PeerId>,
        channels: ConnectionChannels,
    ) -> Result<EntryId> {
        if !self.is_acceptable_sid(peer, sid) {
            return Err(Error::SidInUse(sid.to_string()));
        }
        let (key, out_key) = session_keys(sid, &self.inner.self_id, peer);
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                Entry {
                    peer: peer.clone(),
                    sid: sid.to_string(),
                    mode,
                    key,
                    out_key,
                    request: None,
                    channels,
                    session: None,
                    query: None,
                    udp_peer: None,
                },
            );
            id
        };
        tracing::debug!(%sid, %peer, ?mode, "starting outgoing negotiation");
        self.continue_with_proxy(id, proxy);
        Ok(id)
    }

    /// Accepts a pending inbound offer.
    pub(crate) fn accept_incoming(&self, id: EntryId, proxy: Option<PeerId>) -> Result<()> {
        let offer_proxy = {
            let state = self.inner.state.lock();
            let entry = state.entries.get(&id).ok_or(Error::Closed)?;
            let request = entry
                .request
                .as_ref()
                .filter(|_| entry.session.is_none() && entry.query.is_none())
                .ok_or_else(|| Error::InvalidState("offer already answered".into()))?;
            request.fast && target_should_offer_proxy(proxy.as_ref(), request)
        };
        self.continue_with_proxy(id, if offer_proxy { proxy } else { None });
        Ok(())
    }

    /// Answers a pending inbound offer with "not acceptable".
    pub(crate) fn reject_incoming(&self, id: EntryId) {
        let entry = self.inner.state.lock().entries.remove(&id);
        if let Some(request) = entry.and_then(|e| e.request) {
            tracing::warn!(sid = %request.sid, peer = %request.from, "rejecting offer");
            self.inner.transport.send(protocol::error_reply(
                &request.from,
                &request.id,
                StanzaError::not_acceptable(),
            ));
        }
    }

    /// Drops an entry, cancelling its session.
    pub(crate) fn unlink(&self, id: EntryId) {
        let Some(entry) = self.inner.state.lock().entries.remove(&id) else {
            return;
        };
        if let Some(session) = &entry.session {
            let status = session.status();
            if status.connecting {
                if let Some(in_id) = &status.in_id {
                    self.inner.transport.send(protocol::error_reply(
                        &entry.peer,
                        in_id,
                        StanzaError::not_acceptable(),
                    ));
                }
            }
        }
        tracing::debug!(sid = %entry.sid, peer = %entry.peer, "negotiation unlinked");
    }

    /// Runs the optional proxy query, then starts the session.
    fn continue_with_proxy(&self, id: EntryId, proxy: Option<PeerId>) {
        let Some(proxy) = proxy else {
            self.start_session(id, None);
            return;
        };

        let signals = {
            let state = self.inner.state.lock();
            match state.entries.get(&id) {
                Some(entry) => entry.channels.signals.clone(),
                None => return,
            }
        };
        let _ = signals.send(SessionSignal::Progress(ConnectionEvent::ProxyQuery));

        let registry = self.downgrade();
        let transport = Arc::clone(&self.inner.transport);
        let timeout = self.inner.config.proxy_query_timeout;
        let task = tokio::spawn(async move {
            let result = query_proxy(transport.as_ref(), &proxy, timeout).await;
            // an answer without a stream host still counts as a successful query
            let _ = signals.send(SessionSignal::Progress(ConnectionEvent::ProxyResult(result.is_ok())));
            let host = result.ok().flatten();
            if let Some(registry) = registry.upgrade() {
                registry.start_session(id, host);
            }
        });

        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.query = Some(AbortOnDropHandle::new(task));
        }
    }

    fn start_session(&self, id: EntryId, proxy: Option<StreamHost>) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.query = None;

        let (start, want_fast) = match entry.request.take() {
            Some(request) => (Start::Target(request), false),
            None => (Start::Initiator, self.inner.config.fast),
        };
        let is_initiator = matches!(start, Start::Initiator);
        let ctx = SessionContext {
            transport: Arc::clone(&self.inner.transport),
            config: self.inner.config.clone(),
            resolver: self.inner.resolver.clone(),
            server: self.inner.server.lock().clone(),
            registry: self.downgrade(),
            entry: id,
            signals: entry.channels.signals.clone(),
        };
        let params = SessionParams {
            sid: entry.sid.clone(),
            peer: entry.peer.clone(),
            mode: entry.mode,
            proxy,
            want_fast,
        };
        entry.session = Some(Session::spawn(ctx, params, start));
        if is_initiator {
            let _ = entry
                .channels
                .signals
                .send(SessionSignal::Progress(ConnectionEvent::Requesting));
        }
    }

    /// Hands a relay connection presenting `key` to its session.
    ///
    /// Returns the stream back when no running session owns the key.
    pub(crate) fn incoming_client(
        &self,
        key: &str,
        stream: tokio::net::TcpStream,
    ) -> std::result::Result<(), tokio::net::TcpStream> {
        let state = self.inner.state.lock();
        match state.find_session(|e| e.key == key) {
            Some(session) => session.pass_client(stream),
            None => Err(stream),
        }
    }

    /// Returns true if a live session is reachable under `key`.
    pub(crate) fn serves_key(&self, key: &str) -> bool {
        let state = self.inner.state.lock();
        state.find_session(|e| e.key == key).is_some()
    }

    /// Handles a relayed datagram addressed to `key`.
    ///
    /// The first init probe locks the entry onto its sender and is confirmed
    /// to the peer; data is only accepted from that sender afterwards.
    pub(crate) fn incoming_udp(&self, key: &str, from: SocketAddr, init: bool, payload: &[u8]) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state
            .entries
            .values_mut()
            .find(|e| e.session.is_some() && e.key == key)
        else {
            return;
        };
        if !entry.mode.is_datagram() {
            return;
        }

        if init {
            if entry.udp_peer.is_some() {
                return;
            }
            tracing::debug!(sid = %entry.sid, %from, "locked on to datagram sender");
            entry.udp_peer = Some(from);
            let peer = entry.peer.clone();
            drop(state);
            self.inner.transport.send(protocol::udp_success(&peer, key));
            return;
        }

        if entry.udp_peer != Some(from) {
            return;
        }
        let _ = entry.channels.datagrams.send(Bytes::copy_from_slice(payload));
    }

    /// Sends a datagram payload back through our relay server.
    pub(crate) async fn send_udp(&self, id: EntryId, payload: &[u8]) -> Result<()> {
        let target = {
            let state = self.inner.state.lock();
            state
                .entries
                .get(&id)
                .and_then(|e| e.udp_peer.map(|addr| (addr, e.key.clone())))
        };
        let Some((addr, key)) = target else {
            return Err(Error::InvalidState("no datagram peer".into()));
        };
        let server = self.server().ok_or(Error::Closed)?;
        server.write_udp(addr, &key, payload).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("self_id", &self.inner.self_id)
            .field("entries", &self.inner.state.lock().entries.len())
            .finish()
    }
}

/// A fast-mode target offers its own proxy only when the initiator offered
/// none and the initiator's hosts do not already include it.
pub fn target_should_offer_proxy(proxy: Option<&PeerId>, request: &NegotiationRequest) -> bool {
    let Some(proxy) = proxy else {
        return false;
    };
    !request.hosts.has_proxy() && !request.hosts.contains_peer(proxy)
}

/// Asks a proxy service for its address.
async fn query_proxy(
    transport: &dyn StanzaTransport,
    proxy: &PeerId,
    timeout: std::time::Duration,
) -> std::result::Result<Option<StreamHost>, StanzaError> {
    let stanza = protocol::proxy_info_query(proxy, &random_id("s5b_q_"));
    let result = match tokio::time::timeout(timeout, signaling::request(transport, stanza)).await {
        Ok(reply) => reply.and_then(|reply| protocol::parse_proxy_info(&reply)),
        Err(_) => Err(StanzaError::timed_out()),
    };
    match &result {
        Ok(Some(host)) => tracing::debug!(%proxy, %host, "proxy query succeeded"),
        Ok(None) => tracing::debug!(%proxy, "proxy returned no stream host"),
        Err(e) => tracing::warn!(%proxy, error = %e, "proxy query failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LoopbackHub;
    use crate::streamhost::StreamHostList;
    use std::time::Duration;

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn offer_from(from: &str, to: &str, id: &str, sid: &str) -> Stanza {
        let mut stanza = protocol::offer(&jid(to), id, sid, &StreamHostList::new(), false, StreamMode::Stream);
        stanza.set_from(&jid(from));
        stanza
    }

    fn request(hosts: StreamHostList, fast: bool) -> NegotiationRequest {
        NegotiationRequest {
            from: jid("a@x/r"),
            id: "i".into(),
            sid: "s".into(),
            hosts,
            fast,
            mode: StreamMode::Stream,
        }
    }

    #[test]
    fn test_target_should_offer_proxy() {
        let proxy = jid("proxy.x");
        let direct: StreamHostList = [StreamHost::new(jid("a@x/r"), "10.0.0.1", 1)].into_iter().collect();
        assert!(target_should_offer_proxy(Some(&proxy), &request(direct.clone(), true)));
        assert!(!target_should_offer_proxy(None, &request(direct, true)));

        let with_proxy: StreamHostList = [StreamHost::proxy(jid("other.x"), "10.0.0.2", 1)].into_iter().collect();
        assert!(!target_should_offer_proxy(Some(&proxy), &request(with_proxy, true)));

        let same: StreamHostList = [StreamHost::new(jid("proxy.x"), "10.0.0.3", 1)].into_iter().collect();
        assert!(!target_should_offer_proxy(Some(&proxy), &request(same, true)));
    }

    #[tokio::test]
    async fn test_incoming_offer_is_queued() {
        let hub = LoopbackHub::new();
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());

        registry.handle_stanza(&offer_from("a@x/r", "b@x/r", "i1", "s1"));
        let conn = registry.next_incoming().await.unwrap();
        assert_eq!(conn.sid(), Some("s1"));
        assert_eq!(conn.peer(), Some(&jid("a@x/r")));
        assert!(conn.is_remote());
        assert!(!registry.is_acceptable_sid(&jid("a@x/r"), "s1"));
        assert!(registry.is_acceptable_sid(&jid("a@x/r"), "s2"));
    }

    #[tokio::test]
    async fn test_duplicate_offer_rejected_with_sid_in_use() {
        let hub = LoopbackHub::new();
        let (a, mut a_rx) = hub.endpoint(jid("a@x/r"));
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());

        registry.handle_stanza(&offer_from("a@x/r", "b@x/r", "i1", "s1"));
        registry.handle_stanza(&offer_from("a@x/r", "b@x/r", "i2", "s1"));

        let reply = a_rx.recv().await.unwrap();
        let iq = reply.as_reply().unwrap();
        assert_eq!(iq.id, "i2");
        assert_eq!(iq.error, Some(StanzaError::sid_in_use()));
        drop(a);
    }

    #[tokio::test]
    async fn test_reject_answers_not_acceptable() {
        let hub = LoopbackHub::new();
        let (_a, mut a_rx) = hub.endpoint(jid("a@x/r"));
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());

        registry.handle_stanza(&offer_from("a@x/r", "b@x/r", "i1", "s1"));
        let mut conn = registry.next_incoming().await.unwrap();
        conn.close();

        let reply = a_rx.recv().await.unwrap();
        let iq = reply.as_reply().unwrap();
        assert_eq!(iq.id, "i1");
        assert_eq!(iq.error, Some(StanzaError::not_acceptable()));
        assert!(registry.is_acceptable_sid(&jid("a@x/r"), "s1"));
    }

    #[tokio::test]
    async fn test_gen_unique_sid() {
        let hub = LoopbackHub::new();
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());
        let sid = registry.gen_unique_sid(&jid("a@x/r"));
        assert!(sid.starts_with("s5b_"));
        assert_eq!(sid.len(), 20);
        assert!(registry.is_acceptable_sid(&jid("a@x/r"), &sid));
    }

    #[tokio::test]
    async fn test_outgoing_sid_conflicts_with_incoming() {
        let hub = LoopbackHub::new();
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());

        registry.handle_stanza(&offer_from("a@x/r", "b@x/r", "i1", "s1"));
        let _incoming = registry.next_incoming().await.unwrap();

        let mut conn = registry.create_connection();
        let result = conn.connect_to(jid("a@x/r"), "s1", StreamMode::Stream);
        assert!(matches!(result, Err(Error::SidInUse(_))));
    }

    #[tokio::test]
    async fn test_sid_uniqueness_spans_shared_server() {
        let hub = LoopbackHub::new();
        let (b1, _rx1) = hub.endpoint(jid("b@x/one"));
        let (b2, _rx2) = hub.endpoint(jid("b@x/one"));
        let server = RelayServer::new(&S5bConfig::default());
        let first = SessionRegistry::new(b1, S5bConfig::default());
        let second = SessionRegistry::new(b2, S5bConfig::default());
        first.set_server(Some(&server));
        second.set_server(Some(&server));

        first.handle_stanza(&offer_from("a@x/r", "b@x/one", "i1", "s1"));
        let _incoming = first.next_incoming().await.unwrap();
        assert!(!second.is_acceptable_sid(&jid("a@x/r"), "s1"));

        second.set_server(None);
        assert!(second.is_acceptable_sid(&jid("a@x/r"), "s1"));
    }

    #[tokio::test]
    async fn test_proxy_query_timeout_continues_without_proxy() {
        let hub = LoopbackHub::new();
        let (a, _a_rx) = hub.endpoint(jid("a@x/r"));
        let (_proxy, _proxy_rx) = hub.endpoint(jid("proxy.x"));
        let (_b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let config = S5bConfig {
            proxy_query_timeout: Duration::from_millis(100),
            ..S5bConfig::default()
        };
        let registry = SessionRegistry::new(a, config);

        let mut conn = registry.create_connection();
        conn.set_proxy(Some(jid("proxy.x")));
        conn.connect_to(jid("b@x/r"), "s1", StreamMode::Stream).unwrap();
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::ProxyQuery));
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::ProxyResult(false)));
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::Requesting));
    }

    #[tokio::test]
    async fn test_empty_proxy_answer_counts_as_success() {
        let hub = LoopbackHub::new();
        let (a, _a_rx) = hub.endpoint(jid("a@x/r"));
        let (proxy, mut proxy_rx) = hub.endpoint(jid("proxy.x"));
        let (_b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let _service = AbortOnDropHandle::new(tokio::spawn(async move {
            while let Some(Stanza::Iq(iq)) = proxy_rx.recv().await {
                if let Some(from) = iq.from.as_deref().and_then(PeerId::parse) {
                    proxy.send(protocol::empty_result(&from, &iq.id));
                }
            }
        }));
        let registry = SessionRegistry::new(a, S5bConfig::default());

        let mut conn = registry.create_connection();
        conn.set_proxy(Some(jid("proxy.x")));
        conn.connect_to(jid("b@x/r"), "s1", StreamMode::Stream).unwrap();
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::ProxyQuery));
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::ProxyResult(true)));
        assert_eq!(conn.next_event().await, Some(ConnectionEvent::Requesting));
    }

    #[tokio::test]
    async fn test_datagrams_only_from_locked_sender() {
        let hub = LoopbackHub::new();
        let (_a, mut a_rx) = hub.endpoint(jid("a@x/r"));
        let (b, _b_rx) = hub.endpoint(jid("b@x/r"));
        let registry = SessionRegistry::new(b, S5bConfig::default());

        // a host that never answers the SOCKS greeting keeps the session racing
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let hosts: StreamHostList = [StreamHost::new(jid("a@x/r"), "127.0.0.1", port)].into_iter().collect();
        let mut offer = protocol::offer(&jid("b@x/r"), "i1", "s1", &hosts, false, StreamMode::Datagram);
        offer.set_from(&jid("a@x/r"));
        registry.handle_stanza(&offer);
        let mut conn = registry.next_incoming().await.unwrap();
        conn.accept().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = registry.inner.state.lock();
            let entry = state.entries.values_mut().find(|e| e.sid == "s1").unwrap();
            assert!(entry.session.is_some());
            entry.channels.datagrams = tx;
        }

        let (key, _) = session_keys("s1", &jid("b@x/r"), &jid("a@x/r"));
        let first: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        registry.incoming_udp(&key, first, false, b"before lock-on");
        registry.incoming_udp(&key, first, true, b"a@x/r");
        match a_rx.recv().await.unwrap() {
            Stanza::Message(message) => {
                assert_eq!(message.udpsuccess.map(|u| u.dstaddr), Some(key.clone()));
            }
            other => panic!("expected udpsuccess, got {:?}", other),
        }

        registry.incoming_udp(&key, second, true, b"a@x/r");
        registry.incoming_udp(&key, second, false, b"from elsewhere");
        registry.incoming_udp(&key, first, false, b"data");

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"data"));
        assert!(rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
        drop(silent);
    }
}
