//! CLI definitions for s5b.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::time::Duration;

use crate::common::S5bConfig;

/// Default amount of data the loopback demo transfers (1MB).
pub const DEFAULT_TRANSFER_BYTES: u64 = 1_048_576;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// SOCKS5 bytestream negotiation and relay engine.
#[derive(Debug, Parser)]
#[command(name = "s5b")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Negotiate a bytestream between two in-process peers and transfer data
    Loopback(LoopbackArgs),

    /// Show version information
    Version,
}

/// Arguments for the loopback subcommand.
#[derive(Debug, Parser)]
pub struct LoopbackArgs {
    /// Relay server port, TCP and UDP (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Host advertised for the relay server (repeatable)
    #[arg(long = "host", default_value = "127.0.0.1")]
    pub hosts: Vec<String>,

    /// Use datagram mode instead of a stream
    #[arg(long, default_value_t = false)]
    pub datagram: bool,

    /// Do not ask for fast negotiation
    #[arg(long, default_value_t = false)]
    pub no_fast: bool,

    /// Number of bytes to transfer
    #[arg(long, default_value_t = DEFAULT_TRANSFER_BYTES)]
    pub bytes: u64,

    /// Per-candidate connect timeout
    #[arg(long, value_parser = parse_duration, default_value = "15s")]
    pub connect_timeout: Duration,

    /// Candidate race timeout
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub race_timeout: Duration,

    /// Race timeout while proxies are held back
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub late_proxy_timeout: Duration,

    /// Interval between UDP init probes
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub udp_probe_interval: Duration,

    /// Expiry of relay connections that never authenticate
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub handshake_expiry: Duration,

    /// Proxy-info query timeout
    #[arg(long, value_parser = parse_duration, default_value = "15s")]
    pub proxy_query_timeout: Duration,
}

impl From<&LoopbackArgs> for S5bConfig {
    fn from(args: &LoopbackArgs) -> Self {
        Self {
            connect_timeout: args.connect_timeout,
            race_timeout: args.race_timeout,
            late_proxy_timeout: args.late_proxy_timeout,
            udp_probe_interval: args.udp_probe_interval,
            handshake_expiry: args.handshake_expiry,
            proxy_query_timeout: args.proxy_query_timeout,
            fast: !args.no_fast,
            ..Self::default()
        }
    }
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("S5B_COMMIT").unwrap_or("unknown"),
            built: option_env!("S5B_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "s5b version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
