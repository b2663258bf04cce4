//! s5b - SOCKS5 bytestream negotiation and relay engine.
//!
//! Two peers that only share a signaling channel negotiate a direct TCP or
//! UDP link: each offers the stream hosts it can be reached at (its own relay
//! server, a third-party proxy), both race connections to the other's hosts,
//! and one winner is activated.

pub mod cli;
pub mod common;
pub mod connection;
pub mod connector;
pub mod error;
pub mod hub;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod signaling;
pub mod socks5;
pub mod streamhost;

pub use cli::{BuildInfo, Cli, Command, LoopbackArgs};
pub use common::{format_duration, random_id, DnsResolver, S5bConfig, READ_BUFFER_SIZE};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use connector::{CandidateConnector, ConnectedCandidate, ConnectorError, UdpLink};
pub use error::{Error, ExitCode, NegotiationError, Result};
pub use hub::{HubTransport, LoopbackHub};
pub use loopback::{loopback_transfer, run_loopback, TransferReport};
pub use protocol::{Datagram, ProtocolError, ProtocolResult, Stanza, StanzaError};
pub use registry::{target_should_offer_proxy, SessionRegistry};
pub use server::RelayServer;
pub use session::{decide_activation_winner, decide_overall_failure, SessionFlags, SessionState};
pub use signaling::StanzaTransport;
pub use streamhost::{make_key, NegotiationRequest, PeerId, StreamHost, StreamHostList, StreamMode};
