//! Per-connection session: greeting, proposal, dispatch.
//!
//! Runs inside the session's own worker thread with a blocking control
//! socket. Every failure ends this session only.

use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::protocol::{self, HandshakeError, TestRequest};
use crate::tcp_test::{self, SessionSummary};
use std::io::Write;
use std::net::TcpStream;
use tracing::debug;

/// Drive one control connection through the handshake and its test.
pub fn serve_client(
    mut control: TcpStream,
    settings: &SessionSettings,
) -> Result<SessionSummary, SessionError> {
    control
        .write_all(protocol::GREETING)
        .map_err(HandshakeError::Io)?;

    control
        .set_read_timeout(settings.handshake_timeout)
        .map_err(SessionError::resource("set proposal timeout"))?;
    let frame = protocol::read_frame(&mut control, protocol::MAX_PROPOSAL_LEN)?;
    control
        .set_read_timeout(None)
        .map_err(SessionError::resource("clear proposal timeout"))?;

    debug!(proposal = %String::from_utf8_lossy(&frame), "Session proposal");

    match protocol::parse_request(&frame)? {
        TestRequest::Tcp(payload) => tcp_test::run(control, payload, settings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn spawn_session(
        settings: SessionSettings,
    ) -> (TcpStream, JoinHandle<Result<SessionSummary, SessionError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (daemon, _) = listener.accept().unwrap();
        let handle = thread::spawn(move || serve_client(daemon, &settings));
        (client, handle)
    }

    fn expect_greeting(client: &mut TcpStream) {
        let mut greeting = [0u8; 12];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, protocol::GREETING);
    }

    #[test]
    fn test_full_handshake_reaches_negotiation() {
        let (mut client, handle) = spawn_session(SessionSettings::default());
        expect_greeting(&mut client);

        client
            .write_all(b"flowgrind/1:t:127.0.0.1:0:0:0:0:64:64:0:0:0+")
            .unwrap();
        let reply = protocol::read_frame(&mut client, 64).unwrap();
        let text = std::str::from_utf8(&reply).unwrap();
        let (port, _window) = text.split_once(':').unwrap();
        let port: u16 = port.parse().unwrap();

        let data = TcpStream::connect(("127.0.0.1", port)).unwrap();
        drop(data);
        drop(client);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_bad_indicator_closes_without_reply() {
        let (mut client, handle) = spawn_session(SessionSettings::default());
        expect_greeting(&mut client);

        client.write_all(b"flowgrand/1:t:x+").unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::MalformedIndicator)
        ));
        assert!(err.is_protocol_violation());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_unknown_test_type() {
        let (mut client, handle) = spawn_session(SessionSettings::default());
        expect_greeting(&mut client);

        client.write_all(b"flowgrind/1:u:whatever+").unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::UnknownTestType)
        ));
    }

    #[test]
    fn test_client_hangs_up_during_handshake() {
        let (mut client, handle) = spawn_session(SessionSettings::default());
        expect_greeting(&mut client);
        client.write_all(b"flowgrind/1:t:").unwrap();
        drop(client);

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Handshake(HandshakeError::Closed)));
    }

    #[test]
    fn test_silent_client_times_out() {
        let settings = SessionSettings {
            handshake_timeout: Some(Duration::from_millis(200)),
            ..SessionSettings::default()
        };
        let (mut client, handle) = spawn_session(settings);
        expect_greeting(&mut client);

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::TimedOut)
        ));
    }
}
