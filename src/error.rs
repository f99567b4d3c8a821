use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[source] io::Error),

    #[error("Client connection error: {0}")]
    Client(#[source] io::Error),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Unsupported method ('{0}')")]
    UnsupportedMethod(String),

    #[error("Upstream closed the connection without a response")]
    UpstreamClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// True when the peer on the client side went away mid-response.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            RelayError::Client(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }

    /// Process exit code used when this error aborts startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Resolve { .. } => exit_code::RESOLVE_FAILURE,
            RelayError::Bind { .. } => exit_code::BIND_FAILURE,
            RelayError::Config(_) => exit_code::CONFIG_INVALID,
            _ => exit_code::FAILURE,
        }
    }
}

pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

pub mod exit_code {
    pub const FAILURE: i32 = 1;
    pub const CONFIG_INVALID: i32 = 2;
    pub const RESOLVE_FAILURE: i32 = 3;
    pub const BIND_FAILURE: i32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(RelayError::Client(io::Error::from(kind)).is_client_disconnect());
            // The same condition on the upstream side is a genuine failure.
            assert!(!RelayError::Upstream(io::Error::from(kind)).is_client_disconnect());
        }

        assert!(!RelayError::Client(io::Error::from(io::ErrorKind::TimedOut)).is_client_disconnect());
        assert!(!RelayError::UpstreamClosed.is_client_disconnect());
    }

    #[test]
    fn test_startup_exit_codes_are_distinct() {
        let resolve = RelayError::Resolve { host: "nowhere.invalid".into(), reason: "no such host".into() };
        let bind = RelayError::Bind {
            addr: "0.0.0.0:1".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };

        assert_ne!(resolve.exit_code(), bind.exit_code());
        assert_ne!(resolve.exit_code(), 0);
        assert_ne!(bind.exit_code(), 0);
        assert_eq!(RelayError::Config("x".into()).exit_code(), exit_code::CONFIG_INVALID);
    }
}
