//! Local SOCKS5 relay server.
//!
//! The server accepts SOCKS5 connections whose destination is a negotiation
//! key and hands each one to the registry owning that key. The UDP socket
//! bound on the same port carries relayed datagrams in datagram mode.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio_util::task::AbortOnDropHandle;

use crate::common::{format_duration, S5bConfig, READ_BUFFER_SIZE};
use crate::connector::{UDP_PORT_DATA, UDP_PORT_INIT};
use crate::error::{Error, Result};
use crate::registry::{RegistryRef, SessionRegistry};
use crate::socks5::{self, CMD_CONNECT, CMD_UDP_ASSOCIATE, REPLY_CONNECTION_NOT_ALLOWED, REPLY_GENERAL_FAILURE};

struct Running {
    port: u16,
    udp: Arc<UdpSocket>,
    shutdown: broadcast::Sender<()>,
    _tasks: Vec<AbortOnDropHandle<()>>,
}

#[derive(Default)]
struct ServerState {
    running: Option<Running>,
    host_list: Vec<String>,
    registries: Vec<RegistryRef>,
}

struct ServerInner {
    handshake_expiry: Duration,
    state: Mutex<ServerState>,
}

/// Relay server shared by any number of registries.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl RelayServer {
    pub fn new(config: &S5bConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handshake_expiry: config.handshake_expiry,
                state: Mutex::new(ServerState::default()),
            }),
        }
    }

    /// Starts listening on `port` for TCP and UDP; port 0 picks a free port.
    ///
    /// A running server is stopped first.
    pub async fn start(&self, port: u16) -> Result<()> {
        self.stop();

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| Error::ListenFailed(format!("tcp port {}: {}", port, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::ListenFailed(e.to_string()))?
            .port();
        let udp = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| Error::ListenFailed(format!("udp port {}: {}", port, e)))?;
        let udp = Arc::new(udp);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let weak = Arc::downgrade(&self.inner);
        let accept = tokio::spawn(accept_loop(
            weak.clone(),
            listener,
            shutdown_tx.subscribe(),
            self.inner.handshake_expiry,
        ));
        let datagrams = tokio::spawn(udp_loop(weak, Arc::clone(&udp), shutdown_tx.subscribe()));

        tracing::info!(
            port,
            expiry = %format_duration(self.inner.handshake_expiry),
            "relay server listening"
        );
        self.inner.state.lock().running = Some(Running {
            port,
            udp,
            shutdown: shutdown_tx,
            _tasks: vec![AbortOnDropHandle::new(accept), AbortOnDropHandle::new(datagrams)],
        });
        Ok(())
    }

    /// Stops listening. Connections already handed to sessions are kept.
    pub fn stop(&self) {
        let running = self.inner.state.lock().running.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            tracing::info!(port = running.port, "relay server stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// Listening port while active.
    pub fn port(&self) -> Option<u16> {
        self.inner.state.lock().running.as_ref().map(|r| r.port)
    }

    /// Sets the addresses advertised for this server in offers.
    pub fn set_host_list(&self, hosts: Vec<String>) {
        self.inner.state.lock().host_list = hosts;
    }

    pub fn host_list(&self) -> Vec<String> {
        self.inner.state.lock().host_list.clone()
    }

    pub(crate) fn link(&self, registry: &SessionRegistry) {
        let mut state = self.inner.state.lock();
        if !state.registries.iter().any(|r| r.is(registry)) {
            state.registries.push(registry.downgrade());
        }
    }

    pub(crate) fn unlink(&self, registry: &SessionRegistry) {
        self.inner
            .state
            .lock()
            .registries
            .retain(|r| !r.is(registry) && r.upgrade().is_some());
    }

    /// Live registries linked to this server.
    pub(crate) fn registries(&self) -> Vec<SessionRegistry> {
        let mut state = self.inner.state.lock();
        state.registries.retain(|r| r.upgrade().is_some());
        state.registries.iter().filter_map(RegistryRef::upgrade).collect()
    }

    /// Sends a data datagram for `key` to `addr` from the server's UDP socket.
    pub async fn write_udp(&self, addr: SocketAddr, key: &str, payload: &[u8]) -> std::io::Result<()> {
        let socket = self
            .inner
            .state
            .lock()
            .running
            .as_ref()
            .map(|r| Arc::clone(&r.udp))
            .ok_or(std::io::ErrorKind::NotConnected)?;
        let packet = socks5::write_udp(key, UDP_PORT_DATA, payload);
        socket.send_to(&packet, addr).await.map(|_| ())
    }

    fn owner_of(&self, key: &str) -> Option<SessionRegistry> {
        self.registries().into_iter().find(|r| r.serves_key(key))
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("port", &self.port())
            .field("host_list", &self.host_list())
            .finish()
    }
}

async fn accept_loop(
    server: Weak<ServerInner>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
    expiry: Duration,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        tracing::debug!(?remote_addr, "relay connection accepted");
                        let server = server.clone();
                        let conn_shutdown_rx = shutdown_rx.resubscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(server, stream, expiry, conn_shutdown_rx).await {
                                tracing::debug!(?remote_addr, error = %e, "relay connection dropped");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept relay connection");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("accept loop received shutdown signal");
                break;
            }
        }
    }
}

/// Reads the SOCKS5 request and routes the connection by its key.
///
/// The reply to the request is left to the session that takes the
/// connection, so its ordering relative to signaling stays under the
/// session's control.
async fn handle_connection(
    server: Weak<ServerInner>,
    mut stream: TcpStream,
    expiry: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let handshake = async {
        socks5::negotiate_method(&mut stream).await?;
        socks5::read_request(&mut stream).await
    };
    let request = tokio::select! {
        result = tokio::time::timeout(expiry, handshake) => match result {
            Ok(request) => request.map_err(|e| Error::Relay(e.to_string()))?,
            Err(_) => return Err(Error::Relay("handshake expired".into())),
        },
        _ = shutdown_rx.recv() => return Ok(()),
    };

    let key = match request.domain() {
        Some(key) if request.port == 0 && matches!(request.command, CMD_CONNECT | CMD_UDP_ASSOCIATE) => key,
        _ => {
            socks5::send_reply_unspecified(&mut stream, REPLY_GENERAL_FAILURE).await?;
            return Err(Error::Relay("request does not address a bytestream".into()));
        }
    };

    let Some(inner) = server.upgrade() else {
        return Ok(());
    };
    let server = RelayServer { inner };
    let stream = match server.owner_of(&key) {
        Some(registry) => match registry.incoming_client(&key, stream) {
            Ok(()) => return Ok(()),
            Err(stream) => stream,
        },
        None => stream,
    };

    let mut stream = stream;
    socks5::send_reply_unspecified(&mut stream, REPLY_CONNECTION_NOT_ALLOWED).await?;
    Err(Error::Relay(format!("no negotiation owns key {}", key)))
}

async fn udp_loop(server: Weak<ServerInner>, socket: Arc<UdpSocket>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(error = %e, "relay UDP receive failed");
                        continue;
                    }
                };
                let packet = match socks5::parse_udp(&buf[..n]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!(%from, error = %e, "dropping malformed relay datagram");
                        continue;
                    }
                };
                let init = match packet.port {
                    UDP_PORT_INIT => true,
                    UDP_PORT_DATA => false,
                    port => {
                        tracing::debug!(%from, port, "dropping datagram for unknown port");
                        continue;
                    }
                };
                let Some(inner) = server.upgrade() else {
                    break;
                };
                if let Some(registry) = (RelayServer { inner }).owner_of(packet.domain) {
                    registry.incoming_udp(packet.domain, from, init, packet.payload);
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("UDP loop received shutdown signal");
                break;
            }
        }
    }
}
