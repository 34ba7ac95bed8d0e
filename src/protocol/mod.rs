//! Control-channel wire protocol.
//!
//! Plaintext frames terminated by `+`:
//!
//! ```text
//! daemon -> client   flowgrind/1+
//! client -> daemon   flowgrind/1:t:<server>:<port>:<window>:<delay>:<duration>:<read>:<write>:<pushy>:<shutdown>:<rr>+
//! daemon -> client   <port>:<window>+
//! daemon -> client   24-byte reply block per completed read block
//! ```

pub mod handshake;
pub mod proposal;
pub mod reply;

pub use handshake::{parse_request, read_frame, HandshakeError, TestRequest};
pub use proposal::{ProposalError, TestProposal};

/// Protocol name sent in the greeting and expected in proposals.
pub const INDICATOR: &str = "flowgrind";

/// Protocol version.
pub const VERSION: &str = "1";

/// Frame terminator on the control channel.
pub const TERMINATOR: u8 = b'+';

/// Greeting written as soon as a control connection is accepted.
pub const GREETING: &[u8] = b"flowgrind/1+";

/// Largest proposal frame accepted, terminator included.
pub const MAX_PROPOSAL_LEN: usize = 1024;

/// Format the negotiation reply `<port>:<window>+`.
pub fn negotiation_reply(port: u16, window: u32) -> String {
    format!("{port}:{window}+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_matches_indicator() {
        let expected = format!("{INDICATOR}/{VERSION}+");
        assert_eq!(GREETING, expected.as_bytes());
    }

    #[test]
    fn test_negotiation_reply() {
        assert_eq!(negotiation_reply(40123, 131072), "40123:131072+");
    }
}
