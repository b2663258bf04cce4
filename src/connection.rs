//! Application-facing bytestream handle.
//!
//! A [`Connection`] is created idle by [`SessionRegistry::create_connection`]
//! for outgoing streams, or handed out by
//! [`SessionRegistry::next_incoming`] for inbound offers. Negotiation
//! progress is observed through [`Connection::next_event`]; once
//! [`ConnectionState::Active`] the connection reads and writes the
//! negotiated socket.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::common::READ_BUFFER_SIZE;
use crate::connector::UdpLink;
use crate::error::{Error, NegotiationError, Result};
use crate::protocol::Datagram;
use crate::registry::{ConnectionChannels, EntryId, SessionRegistry};
use crate::session::SessionSignal;
use crate::streamhost::{NegotiationRequest, PeerId, StreamHostList, StreamMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Outgoing offer in progress.
    Requesting,
    /// Inbound offer accepted, negotiation in progress.
    Connecting,
    /// Inbound offer waiting for [`Connection::accept`] or [`Connection::close`].
    WaitingForAccept,
    Active,
}

/// Progress and data notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The offer was sent.
    Requesting,
    /// Asking the configured proxy for its address.
    ProxyQuery,
    /// The proxy query finished; `false` means continuing without the proxy.
    ProxyResult(bool),
    /// The target took the offer.
    Accepted,
    TryingHosts(StreamHostList),
    /// Connecting to our own proxy, which the peer chose.
    ProxyConnect,
    /// Everything we could do is done; the peer has to activate.
    WaitingForActivation,
    Connected,
    /// Data is available to read.
    ReadyRead,
    /// The peer closed the stream.
    Closed,
    Error(NegotiationError),
}

/// One bytestream, outgoing or incoming.
pub struct Connection {
    registry: SessionRegistry,
    entry: Option<EntryId>,
    state: ConnectionState,
    peer: Option<PeerId>,
    sid: Option<String>,
    mode: StreamMode,
    remote: bool,
    proxy: Option<PeerId>,
    request: Option<NegotiationRequest>,

    signals: Option<mpsc::UnboundedReceiver<SessionSignal>>,
    datagram_rx: Option<mpsc::UnboundedReceiver<Bytes>>,

    stream: Option<TcpStream>,
    udp: Option<UdpLink>,
    read_ahead: BytesMut,
    datagrams: VecDeque<Datagram>,
    pending: VecDeque<ConnectionEvent>,
    peer_closed: bool,
}

impl Connection {
    pub(crate) fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            entry: None,
            state: ConnectionState::Idle,
            peer: None,
            sid: None,
            mode: StreamMode::Stream,
            remote: false,
            proxy: None,
            request: None,
            signals: None,
            datagram_rx: None,
            stream: None,
            udp: None,
            read_ahead: BytesMut::new(),
            datagrams: VecDeque::new(),
            pending: VecDeque::new(),
            peer_closed: false,
        }
    }

    pub(crate) fn incoming(
        registry: SessionRegistry,
        entry: EntryId,
        request: NegotiationRequest,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        datagrams: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let mut conn = Self::new(registry);
        conn.entry = Some(entry);
        conn.state = ConnectionState::WaitingForAccept;
        conn.remote = true;
        conn.peer = Some(request.from.clone());
        conn.sid = Some(request.sid.clone());
        conn.mode = request.mode;
        conn.request = Some(request);
        conn.signals = Some(signals);
        conn.datagram_rx = Some(datagrams);
        conn
    }

    /// Starts an outgoing bytestream to `peer`.
    ///
    /// Any previous negotiation or stream of this connection is dropped.
    pub fn connect_to(&mut self, peer: PeerId, sid: &str, mode: StreamMode) -> Result<()> {
        self.reset(true);

        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (datagrams, datagrams_rx) = mpsc::unbounded_channel();
        let entry = self.registry.begin_outgoing(
            &peer,
            sid,
            mode,
            self.proxy.clone(),
            ConnectionChannels { signals, datagrams },
        )?;

        tracing::debug!(%peer, %sid, ?mode, "connecting");
        self.entry = Some(entry);
        self.peer = Some(peer);
        self.sid = Some(sid.to_string());
        self.mode = mode;
        self.state = ConnectionState::Requesting;
        self.signals = Some(signals_rx);
        self.datagram_rx = Some(datagrams_rx);
        Ok(())
    }

    /// Accepts an inbound offer.
    pub fn accept(&mut self) -> Result<()> {
        if self.state != ConnectionState::WaitingForAccept {
            return Err(Error::InvalidState(format!("cannot accept in state {:?}", self.state)));
        }
        let entry = self.entry.ok_or(Error::Closed)?;
        self.registry.accept_incoming(entry, self.proxy.clone())?;
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Closes the connection. Closing an idle connection does nothing.
    ///
    /// An inbound offer that was never accepted is answered as not
    /// acceptable.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Idle {
            return;
        }
        tracing::debug!(peer = ?self.peer, sid = ?self.sid, state = ?self.state, "closing");
        if self.state == ConnectionState::WaitingForAccept {
            if let Some(entry) = self.entry.take() {
                self.registry.reject_incoming(entry);
            }
        }
        self.reset(true);
    }

    /// Waits for the next notification.
    ///
    /// Returns `None` when nothing can happen without the application acting
    /// first: while idle, or while an inbound offer waits for an answer.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        if let Some(event) = self.pending.pop_front() {
            if event == ConnectionEvent::Closed {
                self.reset(false);
            }
            return Some(event);
        }

        match self.state {
            ConnectionState::Idle | ConnectionState::WaitingForAccept => None,
            ConnectionState::Requesting | ConnectionState::Connecting => {
                let signal = self.signals.as_mut()?.recv().await?;
                Some(self.on_signal(signal))
            }
            ConnectionState::Active => self.watch_active().await,
        }
    }

    fn on_signal(&mut self, signal: SessionSignal) -> ConnectionEvent {
        match signal {
            SessionSignal::Progress(event) => event,
            SessionSignal::Connected(transport) => {
                self.state = ConnectionState::Active;
                self.stream = Some(transport.stream);
                self.udp = transport.udp;
                self.check_pending();
                tracing::info!(peer = ?self.peer, sid = ?self.sid, "bytestream connected");
                ConnectionEvent::Connected
            }
            SessionSignal::Failed(error) => {
                self.reset(true);
                ConnectionEvent::Error(error)
            }
        }
    }

    /// Queues notifications for data or a close that arrived before the
    /// stream was handed over.
    fn check_pending(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                self.peer_closed = true;
                self.pending.push_back(ConnectionEvent::Closed);
            }
            Ok(n) => {
                self.read_ahead.extend_from_slice(&buf[..n]);
                self.pending.push_back(ConnectionEvent::ReadyRead);
            }
            Err(_) => {}
        }
    }

    async fn watch_active(&mut self) -> Option<ConnectionEvent> {
        enum Wake {
            Readable(std::io::Result<()>),
            Relayed(Option<Bytes>),
            Direct(std::io::Result<Bytes>),
        }

        loop {
            if self.peer_closed {
                return None;
            }
            let datagram = self.mode.is_datagram();
            let wake = {
                let stream = self.stream.as_ref()?;
                let relayed = self.datagram_rx.as_mut();
                let udp = self.udp.as_ref();
                tokio::select! {
                    readable = stream.readable() => Wake::Readable(readable),
                    payload = recv_relayed(relayed), if datagram => Wake::Relayed(payload),
                    payload = recv_direct(udp), if datagram => Wake::Direct(payload),
                }
            };

            match wake {
                Wake::Readable(Err(_)) => {
                    self.reset(false);
                    return Some(ConnectionEvent::Closed);
                }
                Wake::Readable(Ok(())) => {
                    let stream = self.stream.as_ref()?;
                    let mut buf = [0u8; READ_BUFFER_SIZE];
                    match stream.try_read(&mut buf) {
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Ok(0) | Err(_) => {
                            self.peer_closed = true;
                            self.reset(false);
                            return Some(ConnectionEvent::Closed);
                        }
                        Ok(n) if datagram => {
                            tracing::debug!(bytes = n, "ignoring stream data in datagram mode");
                        }
                        Ok(n) => {
                            self.read_ahead.extend_from_slice(&buf[..n]);
                            return Some(ConnectionEvent::ReadyRead);
                        }
                    }
                }
                Wake::Relayed(None) => self.datagram_rx = None,
                Wake::Relayed(Some(payload)) | Wake::Direct(Ok(payload)) => {
                    match Datagram::decode(&payload) {
                        Ok(datagram) => {
                            self.datagrams.push_back(datagram);
                            return Some(ConnectionEvent::ReadyRead);
                        }
                        Err(e) => tracing::debug!(error = %e, "dropping short datagram"),
                    }
                }
                Wake::Direct(Err(e)) => {
                    tracing::debug!(error = %e, "datagram receive failed");
                    self.udp = None;
                }
            }
        }
    }

    /// Reads stream data, returning 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_ahead.is_empty() {
            let n = buf.len().min(self.read_ahead.len());
            buf[..n].copy_from_slice(&self.read_ahead[..n]);
            self.read_ahead.advance(n);
            return Ok(n);
        }
        if self.peer_closed {
            return Ok(0);
        }
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        let n = stream.read(buf).await?;
        if n == 0 {
            self.peer_closed = true;
        }
        Ok(n)
    }

    /// Number of bytes that can be read without waiting.
    pub fn bytes_available(&self) -> usize {
        self.read_ahead.len()
    }

    /// Writes all of `data` to an active stream-mode connection.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Active || self.mode != StreamMode::Stream {
            return Err(Error::InvalidState("not an active stream".into()));
        }
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        stream.write_all(data).await?;
        Ok(())
    }

    /// Sends one datagram on an active datagram-mode connection.
    pub async fn send_datagram(&self, datagram: &Datagram) -> Result<()> {
        if self.state != ConnectionState::Active || !self.mode.is_datagram() {
            return Err(Error::InvalidState("not an active datagram connection".into()));
        }
        let mut buf = BytesMut::new();
        datagram.encode(&mut buf);
        match (&self.udp, self.entry) {
            (Some(link), _) => link.send_data(&buf).await.map_err(Error::from),
            (None, Some(entry)) => self.registry.send_udp(entry, &buf).await,
            (None, None) => Err(Error::Closed),
        }
    }

    /// Waits for the next datagram.
    pub async fn recv_datagram(&mut self) -> Result<Datagram> {
        loop {
            if let Some(datagram) = self.datagrams.pop_front() {
                return Ok(datagram);
            }
            if self.state != ConnectionState::Active || !self.mode.is_datagram() {
                return Err(Error::InvalidState("not an active datagram connection".into()));
            }
            match self.next_event().await {
                Some(ConnectionEvent::ReadyRead) => {}
                Some(ConnectionEvent::Closed) | None => return Err(Error::Closed),
                Some(_) => {}
            }
        }
    }

    pub fn datagrams_available(&self) -> usize {
        self.datagrams.len()
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// True for connections created from an inbound offer.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// The inbound offer, while one is held.
    pub fn request(&self) -> Option<&NegotiationRequest> {
        self.request.as_ref()
    }

    pub fn proxy(&self) -> Option<&PeerId> {
        self.proxy.as_ref()
    }

    /// Proxy service to query and offer on the next negotiation.
    pub fn set_proxy(&mut self, proxy: Option<PeerId>) {
        self.proxy = proxy;
    }

    /// Returns to idle. Buffered stream data survives unless `clear`.
    fn reset(&mut self, clear: bool) {
        if let Some(entry) = self.entry.take() {
            self.registry.unlink(entry);
        }
        self.stream = None;
        self.udp = None;
        self.signals = None;
        self.datagram_rx = None;
        if clear {
            self.read_ahead.clear();
            self.datagrams.clear();
            self.pending.clear();
            self.peer_closed = false;
        }
        self.state = ConnectionState::Idle;
        self.request = None;
        self.remote = false;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("sid", &self.sid)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .finish()
    }
}

async fn recv_relayed(rx: Option<&mut mpsc::UnboundedReceiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_direct(link: Option<&UdpLink>) -> std::io::Result<Bytes> {
    match link {
        Some(link) => {
            let mut buf = Vec::new();
            link.recv_data(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
        None => std::future::pending().await,
    }
}
