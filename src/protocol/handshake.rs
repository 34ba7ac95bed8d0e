//! Session handshake: proposal framing, indicator validation and dispatch.

use super::{INDICATOR, TERMINATOR, VERSION};
use bytes::BytesMut;
use std::fmt;
use std::io::{self, Read};

/// A validated session request, borrowing the proposal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRequest<'a> {
    /// `t:` proposal; carries everything after the type tag.
    Tcp(&'a str),
}

/// Handshake failures. All of them end the session.
#[derive(Debug)]
pub enum HandshakeError {
    /// Peer closed before sending a complete proposal.
    Closed,
    /// Frame limit reached without a terminator.
    NoTerminator,
    /// Bytes followed the terminator in the same read.
    TrailingData,
    /// No proposal arrived within the handshake timeout.
    TimedOut,
    /// Read or write failure on the control socket.
    Io(io::Error),
    /// Proposal is not valid UTF-8.
    NotText,
    /// Proposal does not start with the protocol name.
    MalformedIndicator,
    /// Protocol name not followed by '/'.
    MissingSlash,
    /// Version differs from ours.
    MalformedVersion,
    /// Version not followed by ':'.
    MissingColon,
    /// Type tag other than `t:`.
    UnknownTestType,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Closed => write!(f, "connection closed before session proposal"),
            HandshakeError::NoTerminator => write!(f, "session proposal not terminated"),
            HandshakeError::TrailingData => write!(f, "unexpected data after session proposal"),
            HandshakeError::TimedOut => write!(f, "timed out waiting for session proposal"),
            HandshakeError::Io(e) => write!(f, "could not read session proposal: {e}"),
            HandshakeError::NotText => write!(f, "session proposal is not text"),
            HandshakeError::MalformedIndicator => write!(f, "malformed protocol indicator"),
            HandshakeError::MissingSlash => write!(f, "protocol indicator not followed by '/'"),
            HandshakeError::MalformedVersion => write!(f, "malformed protocol version"),
            HandshakeError::MissingColon => write!(f, "protocol version not followed by ':'"),
            HandshakeError::UnknownTestType => write!(f, "unknown test proposal type"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Read one `+`-terminated frame, returning it without the terminator.
///
/// At most `max_len` bytes are read. The peer must not send anything
/// past the terminator before it gets our reply.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<BytesMut, HandshakeError> {
    let mut frame = BytesMut::with_capacity(max_len.min(1024));
    let mut chunk = [0u8; 256];

    loop {
        let room = max_len - frame.len();
        if room == 0 {
            return Err(HandshakeError::NoTerminator);
        }
        let want = room.min(chunk.len());

        let n = match reader.read(&mut chunk[..want]) {
            Ok(0) => return Err(HandshakeError::Closed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(HandshakeError::TimedOut)
            }
            Err(e) => return Err(HandshakeError::Io(e)),
        };

        let start = frame.len();
        frame.extend_from_slice(&chunk[..n]);

        if let Some(pos) = frame[start..].iter().position(|&b| b == TERMINATOR) {
            let end = start + pos;
            if end + 1 != frame.len() {
                return Err(HandshakeError::TrailingData);
            }
            frame.truncate(end);
            return Ok(frame);
        }
    }
}

/// Validate `flowgrind/1:` and dispatch on the type tag.
pub fn parse_request(frame: &[u8]) -> Result<TestRequest<'_>, HandshakeError> {
    let rest = frame
        .strip_prefix(INDICATOR.as_bytes())
        .ok_or(HandshakeError::MalformedIndicator)?;
    let rest = rest.strip_prefix(b"/").ok_or(HandshakeError::MissingSlash)?;
    let rest = rest
        .strip_prefix(VERSION.as_bytes())
        .ok_or(HandshakeError::MalformedVersion)?;
    let rest = rest.strip_prefix(b":").ok_or(HandshakeError::MissingColon)?;

    match rest {
        [b't', b':', payload @ ..] => {
            let payload = std::str::from_utf8(payload).map_err(|_| HandshakeError::NotText)?;
            Ok(TestRequest::Tcp(payload))
        }
        _ => Err(HandshakeError::UnknownTestType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_tcp_request() {
        let frame = b"flowgrind/1:t:host.example:0:65536:0:2.0:1460:1460:0:1:0";
        match parse_request(frame) {
            Ok(TestRequest::Tcp(payload)) => {
                assert_eq!(payload, "host.example:0:65536:0:2.0:1460:1460:0:1:0")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reject_bad_indicator() {
        assert!(matches!(
            parse_request(b"flowgrand/1:t:x"),
            Err(HandshakeError::MalformedIndicator)
        ));
        assert!(matches!(
            parse_request(b"flow"),
            Err(HandshakeError::MalformedIndicator)
        ));
    }

    #[test]
    fn test_reject_missing_separators() {
        assert!(matches!(
            parse_request(b"flowgrind:1:t:x"),
            Err(HandshakeError::MissingSlash)
        ));
        assert!(matches!(
            parse_request(b"flowgrind/2:t:x"),
            Err(HandshakeError::MalformedVersion)
        ));
        assert!(matches!(
            parse_request(b"flowgrind/1/t:x"),
            Err(HandshakeError::MissingColon)
        ));
    }

    #[test]
    fn test_reject_unknown_type() {
        assert!(matches!(
            parse_request(b"flowgrind/1:u:x"),
            Err(HandshakeError::UnknownTestType)
        ));
        assert!(matches!(
            parse_request(b"flowgrind/1:t"),
            Err(HandshakeError::UnknownTestType)
        ));
    }

    #[test]
    fn test_empty_tcp_payload_dispatches() {
        assert!(matches!(
            parse_request(b"flowgrind/1:t:"),
            Ok(TestRequest::Tcp(""))
        ));
    }

    #[test]
    fn test_read_frame_strips_terminator() {
        let mut input = Cursor::new(b"flowgrind/1:t:abc+".to_vec());
        let frame = read_frame(&mut input, 1024).unwrap();
        assert_eq!(&frame[..], b"flowgrind/1:t:abc");
    }

    #[test]
    fn test_read_frame_closed_without_terminator() {
        let mut input = Cursor::new(b"flowgrind/1:t:abc".to_vec());
        assert!(matches!(
            read_frame(&mut input, 1024),
            Err(HandshakeError::Closed)
        ));
    }

    #[test]
    fn test_read_frame_limit() {
        let mut input = Cursor::new(vec![b'a'; 64]);
        assert!(matches!(
            read_frame(&mut input, 16),
            Err(HandshakeError::NoTerminator)
        ));

        // Terminator as the very last allowed byte is fine.
        let mut input = Cursor::new(b"abcdefghijklmno+".to_vec());
        let frame = read_frame(&mut input, 16).unwrap();
        assert_eq!(frame.len(), 15);
    }

    #[test]
    fn test_read_frame_trailing_data() {
        let mut input = Cursor::new(b"abc+def".to_vec());
        assert!(matches!(
            read_frame(&mut input, 1024),
            Err(HandshakeError::TrailingData)
        ));
    }
}
