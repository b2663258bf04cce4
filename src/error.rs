//! Error types for s5b.

use thiserror::Error;

/// Exit codes for the binary subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Relay listener could not be started
    ListenFailed = 10,
    /// Peer refused the offer
    Refused = 20,
    /// No candidate could be reached
    ConnectFailed = 21,
    /// Peer named a host that was never offered
    WrongHost = 22,
    /// Proxy connect or activation failed
    ProxyFailed = 23,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Terminal failure of a negotiation, as surfaced to the connection owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer refused the bytestream")]
    Refused,

    #[error("could not connect to any stream host")]
    ConnectFailed,

    #[error("peer reported a stream host that was not offered")]
    WrongHost,

    #[error("proxy connect or activation failed")]
    ProxyFailed,
}

/// Main error type for s5b.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("relay connection failed: {0}")]
    Relay(String),

    #[error("session id in use: {0}")]
    SidInUse(String),

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::Negotiation(NegotiationError::Refused) => ExitCode::Refused,
            Error::Negotiation(NegotiationError::ConnectFailed) => ExitCode::ConnectFailed,
            Error::Negotiation(NegotiationError::WrongHost) => ExitCode::WrongHost,
            Error::Negotiation(NegotiationError::ProxyFailed) => ExitCode::ProxyFailed,
            Error::Relay(_) => ExitCode::ConnectFailed,
            Error::InvalidState(_) | Error::SidInUse(_) => ExitCode::Refused,
            Error::Closed => ExitCode::Success,
            Error::Io(_) => ExitCode::ConnectFailed,
            Error::Config(_) => ExitCode::ListenFailed,
        }
    }
}

/// Result type alias for s5b operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_returns_success_exit_code() {
        assert_eq!(Error::Closed.exit_code(), ExitCode::Success);
    }

    #[test]
    fn negotiation_errors_map_to_distinct_exit_codes() {
        let codes = [
            Error::from(NegotiationError::Refused).exit_code(),
            Error::from(NegotiationError::ConnectFailed).exit_code(),
            Error::from(NegotiationError::WrongHost).exit_code(),
            Error::from(NegotiationError::ProxyFailed).exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(i32::from(ExitCode::WrongHost), 22);
    }

    #[test]
    fn negotiation_display_is_wrapped() {
        let err = Error::from(NegotiationError::ProxyFailed);
        assert!(err.to_string().contains("proxy"));
    }
}
