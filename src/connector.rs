//! Candidate racing.
//!
//! A [`CandidateConnector`] runs the SOCKS5 handshake against every offered
//! stream host at once and returns the first one that fully succeeds. In
//! datagram mode a candidate only succeeds once the peer confirms, through
//! signaling, that one of our UDP init probes reached it.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::common::{DnsResolver, S5bConfig};
use crate::socks5::{self, Socks5Error, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use crate::streamhost::{PeerId, StreamHost, StreamHostList};

/// SOCKS5 destination port of a UDP init probe.
pub const UDP_PORT_INIT: u16 = 1;
/// SOCKS5 destination port of UDP data.
pub const UDP_PORT_DATA: u16 = 0;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("no candidates to try")]
    NoCandidates,

    #[error("all candidates failed")]
    AllFailed,

    #[error("candidate race timed out")]
    Timeout,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("UDP probe not confirmed")]
    ProbeUnconfirmed,

    #[error("SOCKS5 handshake failed: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// UDP association with a stream host.
///
/// Every datagram carries a SOCKS5 UDP header addressed to the negotiation
/// key; the port selects init probes or data.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    key: String,
}

impl UdpLink {
    /// Binds a local socket and connects it to `relay`.
    pub async fn open(relay: SocketAddr, key: impl Into<String>) -> std::io::Result<Self> {
        let local: SocketAddr = if relay.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(relay).await?;
        Ok(Self {
            socket,
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sends an init probe carrying our identity.
    pub async fn send_init(&self, self_id: &PeerId) -> std::io::Result<()> {
        let packet = socks5::write_udp(&self.key, UDP_PORT_INIT, self_id.as_str().as_bytes());
        self.socket.send(&packet).await.map(|_| ())
    }

    /// Sends one data payload.
    pub async fn send_data(&self, payload: &[u8]) -> std::io::Result<()> {
        let packet = socks5::write_udp(&self.key, UDP_PORT_DATA, payload);
        self.socket.send(&packet).await.map(|_| ())
    }

    /// Receives the next data payload for our key, skipping anything else.
    pub async fn recv_data(&self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut packet = vec![0u8; crate::common::READ_BUFFER_SIZE];
        loop {
            let n = self.socket.recv(&mut packet).await?;
            match socks5::parse_udp(&packet[..n]) {
                Ok(p) if p.domain == self.key && p.port == UDP_PORT_DATA => {
                    buf.clear();
                    buf.extend_from_slice(p.payload);
                    return Ok(buf.len());
                }
                Ok(_) => tracing::debug!(key = %self.key, "ignoring datagram for another key"),
                Err(e) => tracing::debug!(key = %self.key, error = %e, "ignoring malformed datagram"),
            }
        }
    }
}

/// Winning candidate of a race.
#[derive(Debug)]
pub struct ConnectedCandidate {
    pub host: StreamHost,
    pub stream: TcpStream,
    /// Present in datagram mode.
    pub udp: Option<UdpLink>,
}

/// Races SOCKS5 handshakes against a list of stream hosts.
pub struct CandidateConnector {
    self_id: PeerId,
    hosts: StreamHostList,
    key: String,
    datagram: bool,
    timeout: Duration,
    connect_timeout: Duration,
    probe_interval: Duration,
    probe_attempts: u32,
    resolver: DnsResolver,
}

impl CandidateConnector {
    pub fn new(self_id: PeerId, hosts: StreamHostList, key: impl Into<String>, config: &S5bConfig) -> Self {
        Self {
            self_id,
            hosts,
            key: key.into(),
            datagram: false,
            timeout: config.race_timeout,
            connect_timeout: config.connect_timeout,
            probe_interval: config.udp_probe_interval,
            probe_attempts: config.udp_probe_attempts,
            resolver: DnsResolver::new(),
        }
    }

    pub fn datagram(mut self, datagram: bool) -> Self {
        self.datagram = datagram;
        self
    }

    /// Overall race timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolver(mut self, resolver: DnsResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Runs the race.
    ///
    /// `udp_success` delivers the ids of stream hosts whose UDP probe the
    /// peer confirmed. Dropping the returned future cancels every attempt.
    pub async fn run(
        self,
        mut udp_success: mpsc::UnboundedReceiver<PeerId>,
    ) -> Result<ConnectedCandidate, ConnectorError> {
        if self.hosts.is_empty() {
            return Err(ConnectorError::NoCandidates);
        }

        let (confirm_tx, _) = broadcast::channel::<PeerId>(16);
        let mut attempts = JoinSet::new();
        for host in self.hosts.iter().cloned() {
            let attempt = Attempt {
                self_id: self.self_id.clone(),
                host,
                key: self.key.clone(),
                datagram: self.datagram,
                connect_timeout: self.connect_timeout,
                probe_interval: self.probe_interval,
                probe_attempts: self.probe_attempts,
                resolver: self.resolver.clone(),
            };
            attempts.spawn(attempt.run(confirm_tx.subscribe()));
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(key = %self.key, "candidate race timed out");
                    return Err(ConnectorError::Timeout);
                }
                joined = attempts.join_next() => match joined {
                    Some(Ok(Ok(candidate))) => {
                        tracing::debug!(key = %self.key, host = %candidate.host, "candidate connected");
                        return Ok(candidate);
                    }
                    Some(Ok(Err((host, e)))) => {
                        tracing::debug!(key = %self.key, %host, error = %e, "candidate failed");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(key = %self.key, error = %e, "candidate task ended");
                    }
                    None => return Err(ConnectorError::AllFailed),
                },
                Some(jid) = udp_success.recv() => {
                    let _ = confirm_tx.send(jid);
                }
            }
        }
    }
}

/// One candidate's handshake.
struct Attempt {
    self_id: PeerId,
    host: StreamHost,
    key: String,
    datagram: bool,
    connect_timeout: Duration,
    probe_interval: Duration,
    probe_attempts: u32,
    resolver: DnsResolver,
}

impl Attempt {
    async fn run(
        self,
        confirmations: broadcast::Receiver<PeerId>,
    ) -> Result<ConnectedCandidate, (StreamHost, ConnectorError)> {
        let host = self.host.clone();
        self.connect(confirmations).await.map_err(|e| (host, e))
    }

    async fn connect(
        self,
        mut confirmations: broadcast::Receiver<PeerId>,
    ) -> Result<ConnectedCandidate, ConnectorError> {
        let command = if self.datagram { CMD_UDP_ASSOCIATE } else { CMD_CONNECT };
        let handshake = async {
            let addrs = self
                .resolver
                .lookup(self.host.host(), self.host.port())
                .await
                .map_err(|e| ConnectorError::Resolve(e.to_string()))?;
            let mut stream = TcpStream::connect(&addrs[..]).await?;
            let bound = socks5::client_handshake(&mut stream, &self.key, 0, command).await?;
            Ok::<_, ConnectorError>((stream, bound))
        };
        let (stream, bound) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| ConnectorError::ConnectTimeout)??;

        if !self.datagram {
            return Ok(ConnectedCandidate {
                host: self.host,
                stream,
                udp: None,
            });
        }

        // The relay listens for UDP on its TCP port unless it named another.
        let relay = match bound {
            Some(addr) if addr.port() != 0 && !addr.ip().is_unspecified() => addr,
            _ => stream.peer_addr()?,
        };
        let link = UdpLink::open(relay, self.key.clone()).await?;

        let mut ticker = tokio::time::interval(self.probe_interval);
        let mut sent = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if sent >= self.probe_attempts {
                        return Err(ConnectorError::ProbeUnconfirmed);
                    }
                    link.send_init(&self.self_id).await?;
                    sent += 1;
                }
                confirmed = confirmations.recv() => match confirmed {
                    Ok(jid) if &jid == self.host.jid() => {
                        return Ok(ConnectedCandidate {
                            host: self.host,
                            stream,
                            udp: Some(link),
                        });
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ConnectorError::ProbeUnconfirmed);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::{negotiate_method, read_request, send_reply_unspecified, REPLY_SUCCEEDED};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn config() -> S5bConfig {
        S5bConfig {
            connect_timeout: Duration::from_secs(2),
            race_timeout: Duration::from_secs(5),
            udp_probe_interval: Duration::from_millis(50),
            udp_probe_attempts: 3,
            ..S5bConfig::default()
        }
    }

    /// Returns a port on which nothing is listening.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// A SOCKS5 server that grants one CONNECT and reports the key it saw.
    async fn granting_server() -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            negotiate_method(&mut stream).await.unwrap();
            let req = read_request(&mut stream).await.unwrap();
            send_reply_unspecified(&mut stream, REPLY_SUCCEEDED).await.unwrap();
            stream.write_all(b"ok").await.unwrap();
            // Keep the stream open until the client is done with it
            tokio::time::sleep(Duration::from_millis(200)).await;
            req.domain().unwrap()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_single_reachable_candidate_wins() {
        let (good_port, server) = granting_server().await;
        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("a@x/r"), "127.0.0.1", closed_port().await));
        hosts.push(StreamHost::new(jid("b@x/r"), "127.0.0.1", good_port));
        hosts.push(StreamHost::new(jid("c@x/r"), "127.0.0.1", closed_port().await));

        let (_tx, rx) = mpsc::unbounded_channel();
        let result = CandidateConnector::new(jid("me@x/r"), hosts, "thekey", &config())
            .run(rx)
            .await
            .unwrap();

        assert_eq!(result.host.jid(), &jid("b@x/r"));
        assert!(result.udp.is_none());
        assert_eq!(server.await.unwrap(), "thekey");
    }

    #[tokio::test]
    async fn test_all_unreachable_fails_once() {
        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("a@x/r"), "127.0.0.1", closed_port().await));
        hosts.push(StreamHost::new(jid("b@x/r"), "127.0.0.1", closed_port().await));

        let (_tx, rx) = mpsc::unbounded_channel();
        let result = CandidateConnector::new(jid("me@x/r"), hosts, "k", &config())
            .run(rx)
            .await;
        assert!(matches!(result, Err(ConnectorError::AllFailed)));
    }

    #[tokio::test]
    async fn test_empty_list() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = CandidateConnector::new(jid("me@x/r"), StreamHostList::new(), "k", &config())
            .run(rx)
            .await;
        assert!(matches!(result, Err(ConnectorError::NoCandidates)));
    }

    #[tokio::test]
    async fn test_silent_candidate_hits_race_timeout() {
        // Accepts TCP but never answers the SOCKS5 greeting
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("a@x/r"), "127.0.0.1", port));

        let (_tx, rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let result = CandidateConnector::new(jid("me@x/r"), hosts, "k", &config())
            .timeout(Duration::from_millis(300))
            .run(rx)
            .await;
        assert!(matches!(result, Err(ConnectorError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_datagram_candidate_waits_for_confirmation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let udp = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            negotiate_method(&mut stream).await.unwrap();
            let req = read_request(&mut stream).await.unwrap();
            assert_eq!(req.command, CMD_UDP_ASSOCIATE);
            send_reply_unspecified(&mut stream, REPLY_SUCCEEDED).await.unwrap();

            let mut buf = [0u8; 512];
            let (n, _) = udp.recv_from(&mut buf).await.unwrap();
            let probe = socks5::parse_udp(&buf[..n]).unwrap();
            assert_eq!(probe.port, UDP_PORT_INIT);
            assert_eq!(probe.payload, b"me@x/r");
            stream
        });

        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("peer@x/r"), "127.0.0.1", port));

        let patient = S5bConfig {
            udp_probe_attempts: 100,
            ..config()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let race = tokio::spawn(
            CandidateConnector::new(jid("me@x/r"), hosts, "k", &patient)
                .datagram(true)
                .run(rx),
        );

        let _stream = server.await.unwrap();
        tx.send(jid("someone-else@x/r")).unwrap();
        tx.send(jid("peer@x/r")).unwrap();

        let winner = race.await.unwrap().unwrap();
        assert_eq!(winner.udp.as_ref().unwrap().key(), "k");
    }

    #[tokio::test]
    async fn test_datagram_candidate_gives_up_after_probes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            negotiate_method(&mut stream).await.unwrap();
            read_request(&mut stream).await.unwrap();
            send_reply_unspecified(&mut stream, REPLY_SUCCEEDED).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("peer@x/r"), "127.0.0.1", port));

        let (_tx, rx) = mpsc::unbounded_channel();
        let result = CandidateConnector::new(jid("me@x/r"), hosts, "k", &config())
            .datagram(true)
            .run(rx)
            .await;
        assert!(matches!(result, Err(ConnectorError::AllFailed)));
    }
}
