//! Session-level errors.
//!
//! Every variant ends the session it occurred in and nothing else; the
//! acceptor never sees them. `is_protocol_violation` picks the log level.

use crate::protocol::{HandshakeError, ProposalError};
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum SessionError {
    /// Greeting, framing or indicator failure.
    Handshake(HandshakeError),
    /// Malformed TCP proposal.
    Proposal(ProposalError),
    /// Socket setup failed before the test started.
    Resource {
        context: &'static str,
        source: io::Error,
    },
    /// Fatal socket error while the test was running.
    Io {
        context: &'static str,
        source: io::Error,
    },
    /// Test socket did not end up with the listening socket's window.
    WindowMismatch { listen: u32, test: u32 },
    /// Client sent data on the control connection during the test.
    UnexpectedControlData { len: usize },
}

impl SessionError {
    /// Protocol violations are logged as warnings, the rest as errors.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            SessionError::Handshake(HandshakeError::Io(_)) => false,
            SessionError::Handshake(_)
            | SessionError::Proposal(_)
            | SessionError::UnexpectedControlData { .. } => true,
            SessionError::Resource { .. }
            | SessionError::Io { .. }
            | SessionError::WindowMismatch { .. } => false,
        }
    }

    pub(crate) fn resource(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| SessionError::Resource { context, source }
    }

    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| SessionError::Io { context, source }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Handshake(e) => write!(f, "{e}"),
            SessionError::Proposal(e) => write!(f, "{e}"),
            SessionError::Resource { context, source } => write!(f, "{context}: {source}"),
            SessionError::Io { context, source } => {
                write!(f, "premature end of test ({context}: {source})")
            }
            SessionError::WindowMismatch { listen, test } => write!(
                f,
                "failed to set window size of test socket to window size of listen socket \
                 (listen = {listen}, test = {test})"
            ),
            SessionError::UnexpectedControlData { len } => write!(
                f,
                "client sent {len} bytes of unexpected data on control connection"
            ),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Handshake(e) => Some(e),
            SessionError::Proposal(e) => Some(e),
            SessionError::Resource { source, .. } | SessionError::Io { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<HandshakeError> for SessionError {
    fn from(e: HandshakeError) -> Self {
        SessionError::Handshake(e)
    }
}

impl From<ProposalError> for SessionError {
    fn from(e: ProposalError) -> Self {
        SessionError::Proposal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violations_are_warnings() {
        assert!(SessionError::from(HandshakeError::UnknownTestType).is_protocol_violation());
        assert!(SessionError::from(ProposalError::ZeroBlockSize).is_protocol_violation());
        assert!(SessionError::UnexpectedControlData { len: 3 }.is_protocol_violation());
    }

    #[test]
    fn test_resource_failures_are_errors() {
        let bind = SessionError::resource("bind test socket")(io::Error::from(
            io::ErrorKind::AddrInUse,
        ));
        assert!(!bind.is_protocol_violation());
        assert!(bind.to_string().starts_with("bind test socket"));
        assert!(!SessionError::WindowMismatch { listen: 1, test: 2 }.is_protocol_violation());
    }
}
