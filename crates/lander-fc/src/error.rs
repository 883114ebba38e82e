use std::io;

use thiserror::Error;

use crate::mission::ControlLoop;

pub type Result<T> = std::result::Result<T, FcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Refused,
    Aborted,
    Reset,
    Closed,
    Other,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionKind::Refused => "refused",
            ConnectionKind::Aborted => "aborted",
            ConnectionKind::Reset => "reset",
            ConnectionKind::Closed => "closed",
            ConnectionKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum FcError {
    #[error("connection {kind}: {detail}")]
    Connection { kind: ConnectionKind, detail: String },

    #[error("could not find mission program {0}")]
    InvalidActivation(String),

    #[error("not connected")]
    NotConnected,

    #[error("telemetry source: {0}")]
    Source(String),

    #[error("{what} of the {control_loop} loop is not editable in the active program")]
    EditRejected { control_loop: ControlLoop, what: &'static str },
}

impl FcError {
    pub fn connection(kind: ConnectionKind, detail: impl Into<String>) -> Self {
        FcError::Connection { kind, detail: detail.into() }
    }

    /// True for network failures that mean the provider is gone and the
    /// engine has to disconnect. A refused connect is not a loss.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            FcError::Connection { kind: ConnectionKind::Aborted | ConnectionKind::Reset | ConnectionKind::Closed, .. }
        )
    }
}

impl From<io::Error> for FcError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionKind::Refused,
            io::ErrorKind::ConnectionAborted => ConnectionKind::Aborted,
            io::ErrorKind::ConnectionReset => ConnectionKind::Reset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected => {
                ConnectionKind::Closed
            }
            _ => ConnectionKind::Other,
        };
        FcError::Connection { kind, detail: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_connection_kinds() {
        let e: FcError = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset").into();
        assert!(e.is_connection_loss());
        let e: FcError = io::Error::new(io::ErrorKind::ConnectionAborted, "aborted").into();
        assert!(e.is_connection_loss());
        let e: FcError = io::Error::new(io::ErrorKind::ConnectionRefused, "no server").into();
        assert!(!e.is_connection_loss());
        let e: FcError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(!e.is_connection_loss());
    }

    #[test]
    fn non_network_errors_are_not_loss() {
        assert!(!FcError::NotConnected.is_connection_loss());
        assert!(!FcError::Source("bad field".into()).is_connection_loss());
        assert!(!FcError::InvalidActivation("warp".into()).is_connection_loss());
    }
}
