//! Common types and functions shared across the negotiation modules.

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Buffer size for reading data from relayed TCP and UDP sockets.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default timeout for a single candidate's TCP connect plus SOCKS5 handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for a whole candidate race.
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the proxy-only retry race.
pub const DEFAULT_LATE_PROXY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between UDP init probes.
pub const DEFAULT_UDP_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of UDP init probes per candidate.
pub const DEFAULT_UDP_PROBE_ATTEMPTS: u32 = 5;

/// Default expiry for relay connections that never complete the handshake.
pub const DEFAULT_HANDSHAKE_EXPIRY: Duration = Duration::from_secs(30);

/// Default timeout of a proxy-info query.
pub const DEFAULT_PROXY_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeouts and policy knobs of the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S5bConfig {
    /// Per-candidate connect and handshake timeout.
    pub connect_timeout: Duration,
    /// Overall candidate race timeout.
    pub race_timeout: Duration,
    /// Race timeout when only proxies are retried.
    pub late_proxy_timeout: Duration,
    pub udp_probe_interval: Duration,
    pub udp_probe_attempts: u32,
    /// Expiry of unauthenticated relay connections.
    pub handshake_expiry: Duration,
    pub proxy_query_timeout: Duration,
    /// Whether an initiator asks for fast negotiation.
    pub fast: bool,
}

impl Default for S5bConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            race_timeout: DEFAULT_RACE_TIMEOUT,
            late_proxy_timeout: DEFAULT_LATE_PROXY_TIMEOUT,
            udp_probe_interval: DEFAULT_UDP_PROBE_INTERVAL,
            udp_probe_attempts: DEFAULT_UDP_PROBE_ATTEMPTS,
            handshake_expiry: DEFAULT_HANDSHAKE_EXPIRY,
            proxy_query_timeout: DEFAULT_PROXY_QUERY_TIMEOUT,
            fast: true,
        }
    }
}

/// Generates `prefix` followed by 16 random hex characters.
pub fn random_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("failed to generate random id");
    let mut id = String::with_capacity(prefix.len() + 16);
    id.push_str(prefix);
    for b in bytes {
        id.push_str(&format!("{:02x}", b));
    }
    id
}

type TokioResolver = hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>;

/// Shared DNS resolver used to turn stream host names into addresses.
///
/// The hickory resolver is built on the first name lookup, so sessions that
/// only ever see literal addresses never read the system configuration.
#[derive(Clone, Default)]
pub struct DnsResolver {
    resolver: Arc<OnceCell<TokioResolver>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every address `host` resolves to, paired with `port`.
    pub async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let resolver = self
            .resolver
            .get_or_try_init(|| async {
                TokioResolver::builder_tokio()
                    .map(|builder| builder.build())
                    .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))
            })
            .await?;

        let addrs: Vec<SocketAddr> = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Config(format!("failed to resolve stream host '{}': {}", host, e)))?
            .iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if addrs.is_empty() {
            return Err(Error::Config(format!("stream host '{}' has no addresses", host)));
        }
        Ok(addrs)
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("initialized", &self.resolver.initialized())
            .finish()
    }
}

/// Formats a duration for log lines: `1h30m10s`, `2.5s`, `250ms`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let millis = d.subsec_millis();
    if total == 0 {
        return format!("{}ms", millis);
    }

    let (h, m, s) = (total / 3600, total / 60 % 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out += &format!("{}h", h);
    }
    if m > 0 {
        out += &format!("{}m", m);
    }
    match (s, millis) {
        (0, 0) if !out.is_empty() => {}
        (s, 0) => out += &format!("{}s", s),
        (s, ms) => out += &format!("{}.{}s", s, format!("{:03}", ms).trim_end_matches('0')),
    }
    out
}
