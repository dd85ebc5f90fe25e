//! Error types surfaced by the client.

use std::io;
use std::sync::Arc;

/// An error reported by the remote server for a single call.
///
/// Carries the server-supplied exception class and message verbatim, so
/// callers can inspect both. The connection that delivered it stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Server-side exception class name.
    pub class: String,
    /// Server-side message.
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Error from making a call.
///
/// Local transport failures are wrapped in an envelope that names the peer
/// and categorizes the failure; the underlying I/O error stays reachable
/// through [`source`](std::error::Error::source). Remote errors are raised
/// as-is, without an envelope.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The peer refused the connection.
    ConnectRefused {
        /// Address the call was routed to.
        peer: String,
        /// Underlying I/O error.
        source: Arc<io::Error>,
    },

    /// A socket operation timed out.
    Timeout {
        /// Address the call was routed to.
        peer: String,
        /// Underlying I/O error.
        source: Arc<io::Error>,
    },

    /// Any other local transport failure.
    Io {
        /// Address the call was routed to.
        peer: String,
        /// Underlying I/O error.
        source: Arc<io::Error>,
    },

    /// The server answered the call with an error.
    Remote(RemoteError),

    /// The client was stopped before or while the call was in flight.
    ClientStopped,

    /// The peer address did not resolve to any socket address.
    UnknownHost {
        /// The unresolvable address.
        peer: String,
    },
}

impl CallError {
    /// Wrap a local I/O failure in the envelope matching its kind.
    pub(crate) fn envelope(peer: &str, source: Arc<io::Error>) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => CallError::ConnectRefused {
                peer: peer.to_owned(),
                source,
            },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CallError::Timeout {
                peer: peer.to_owned(),
                source,
            },
            _ => CallError::Io {
                peer: peer.to_owned(),
                source,
            },
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::ConnectRefused { peer, source } => {
                write!(f, "call to {peer} failed on connection refused: {source}")
            }
            CallError::Timeout { peer, source } => {
                write!(f, "call to {peer} failed on socket timeout: {source}")
            }
            CallError::Io { peer, source } => {
                write!(f, "call to {peer} failed on local I/O error: {source}")
            }
            CallError::Remote(e) => write!(f, "remote error: {e}"),
            CallError::ClientStopped => write!(f, "the client is stopped"),
            CallError::UnknownHost { peer } => write!(f, "unknown host: {peer}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::ConnectRefused { source, .. }
            | CallError::Timeout { source, .. }
            | CallError::Io { source, .. } => Some(source.as_ref()),
            CallError::Remote(e) => Some(e),
            CallError::ClientStopped | CallError::UnknownHost { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn envelope_categorizes_by_kind() {
        let refused = Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(
            CallError::envelope("peer:1", refused),
            CallError::ConnectRefused { .. }
        ));

        let timeout = Arc::new(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            CallError::envelope("peer:1", timeout),
            CallError::Timeout { .. }
        ));

        let reset = Arc::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(
            CallError::envelope("peer:1", reset),
            CallError::Io { .. }
        ));
    }

    #[test]
    fn envelope_preserves_cause_chain() {
        let source = Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let err = CallError::envelope("region-a:60020", source);

        assert!(err.to_string().contains("region-a:60020"));
        let cause = err.source().expect("cause preserved");
        assert_eq!(cause.to_string(), "refused");
    }

    #[test]
    fn remote_error_is_inspectable() {
        let err = CallError::Remote(RemoteError {
            class: "NotServingRegion".into(),
            message: "region is offline".into(),
        });
        match &err {
            CallError::Remote(remote) => {
                assert_eq!(remote.class, "NotServingRegion");
                assert_eq!(remote.message, "region is offline");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
