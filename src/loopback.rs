//! In-process demo: two peers negotiate over a [`LoopbackHub`] and a local
//! [`RelayServer`], then move data across the bytestream.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio_util::task::AbortOnDropHandle;

use crate::cli::LoopbackArgs;
use crate::common::{format_duration, S5bConfig, READ_BUFFER_SIZE};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::hub::LoopbackHub;
use crate::protocol::Datagram;
use crate::registry::SessionRegistry;
use crate::server::RelayServer;
use crate::streamhost::{PeerId, StreamMode};

/// Largest payload of one demo datagram.
const DATAGRAM_CHUNK: usize = 1024;

/// How long the datagram receiver waits before treating the rest as lost.
const DATAGRAM_IDLE: Duration = Duration::from_secs(2);

/// Outcome of one demo run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub sent: u64,
    pub received: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    /// Received bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.received as f64 / secs
    }
}

/// Runs the loopback subcommand.
pub async fn run_loopback(args: &LoopbackArgs) -> Result<()> {
    let config = S5bConfig::from(args);
    let mode = if args.datagram {
        StreamMode::Datagram
    } else {
        StreamMode::Stream
    };
    tracing::debug!(?config, ?mode, "loopback configuration");

    let report = loopback_transfer(config, args.port, args.hosts.clone(), mode, args.bytes).await?;

    println!(
        "transferred {} of {} bytes in {} ({:.2} MB/s)",
        report.received,
        report.sent,
        format_duration(report.elapsed),
        report.throughput() / 1_000_000.0
    );
    Ok(())
}

/// Negotiates one bytestream between two local identities and sends
/// `bytes` bytes from the initiator to the target.
pub async fn loopback_transfer(
    config: S5bConfig,
    port: u16,
    hosts: Vec<String>,
    mode: StreamMode,
    bytes: u64,
) -> Result<TransferReport> {
    let initiator_id = demo_peer("initiator@loopback/demo")?;
    let target_id = demo_peer("target@loopback/demo")?;

    let server = RelayServer::new(&config);
    server.start(port).await?;
    server.set_host_list(hosts);

    let hub = LoopbackHub::new();
    let (initiator_transport, initiator_rx) = hub.endpoint(initiator_id.clone());
    let (target_transport, target_rx) = hub.endpoint(target_id.clone());

    let initiator = SessionRegistry::new(initiator_transport, config.clone());
    initiator.set_server(Some(&server));
    let target = SessionRegistry::new(target_transport, config);

    let _inbound = [
        AbortOnDropHandle::new(tokio::spawn(initiator.clone().run_inbound(initiator_rx))),
        AbortOnDropHandle::new(tokio::spawn(target.clone().run_inbound(target_rx))),
    ];

    let receiver = AbortOnDropHandle::new(tokio::spawn(receive_side(target.clone(), bytes)));

    let started = Instant::now();
    let sid = initiator.gen_unique_sid(&target_id);
    let mut conn = initiator.create_connection();
    conn.connect_to(target_id, &sid, mode)?;
    wait_connected(&mut conn).await?;
    tracing::info!(%sid, ?mode, "initiator connected");

    let sent = match mode {
        StreamMode::Stream => send_stream(&mut conn, bytes).await?,
        StreamMode::Datagram => send_datagrams(&conn, bytes).await?,
    };
    if mode == StreamMode::Stream {
        conn.close();
    }

    let received = receiver
        .await
        .map_err(|e| Error::InvalidState(format!("receiver task failed: {}", e)))??;
    conn.close();
    server.stop();

    Ok(TransferReport {
        sent,
        received,
        elapsed: started.elapsed(),
    })
}

fn demo_peer(id: &str) -> Result<PeerId> {
    PeerId::parse(id).ok_or_else(|| Error::Config(format!("invalid peer id '{}'", id)))
}

async fn wait_connected(conn: &mut Connection) -> Result<()> {
    loop {
        match conn.next_event().await {
            Some(ConnectionEvent::Connected) => return Ok(()),
            Some(ConnectionEvent::Error(e)) => return Err(e.into()),
            Some(event) => tracing::debug!(?event, sid = ?conn.sid(), "negotiation progress"),
            None => return Err(Error::Closed),
        }
    }
}

async fn receive_side(registry: SessionRegistry, expected: u64) -> Result<u64> {
    let mut conn = registry.next_incoming().await.ok_or(Error::Closed)?;
    tracing::info!(peer = ?conn.peer(), sid = ?conn.sid(), "accepting offer");
    conn.accept()?;
    wait_connected(&mut conn).await?;

    let mut received = 0u64;
    if conn.mode().is_datagram() {
        while received < expected {
            match tokio::time::timeout(DATAGRAM_IDLE, conn.recv_datagram()).await {
                Ok(Ok(datagram)) => received += datagram.data.len() as u64,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(received, expected, "datagrams stopped arriving");
                    break;
                }
            }
        }
    } else {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            received += n as u64;
        }
    }
    conn.close();
    Ok(received)
}

async fn send_stream(conn: &mut Connection, bytes: u64) -> Result<u64> {
    let chunk: Vec<u8> = (0..READ_BUFFER_SIZE).map(|i| i as u8).collect();
    let mut sent = 0u64;
    while sent < bytes {
        let n = (bytes - sent).min(chunk.len() as u64) as usize;
        conn.write_all(&chunk[..n]).await?;
        sent += n as u64;
    }
    Ok(sent)
}

async fn send_datagrams(conn: &Connection, bytes: u64) -> Result<u64> {
    let payload = Bytes::from(vec![0x5a; DATAGRAM_CHUNK]);
    let mut sent = 0u64;
    while sent < bytes {
        let n = (bytes - sent).min(DATAGRAM_CHUNK as u64) as usize;
        conn.send_datagram(&Datagram::new(0, 0, payload.slice(..n))).await?;
        sent += n as u64;
        tokio::task::yield_now().await;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput() {
        let report = TransferReport {
            sent: 2_000_000,
            received: 2_000_000,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(report.throughput(), 1_000_000.0);

        let instant = TransferReport {
            elapsed: Duration::ZERO,
            ..report
        };
        assert_eq!(instant.throughput(), 0.0);
    }

    #[tokio::test]
    async fn test_loopback_stream_transfer() {
        let report = loopback_transfer(
            S5bConfig::default(),
            0,
            vec!["127.0.0.1".to_string()],
            StreamMode::Stream,
            100_000,
        )
        .await
        .unwrap();

        assert_eq!(report.sent, 100_000);
        assert_eq!(report.received, 100_000);
    }
}
