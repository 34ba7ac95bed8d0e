//! TCP test engine.
//!
//! Negotiates the data connection for an accepted proposal, then runs the
//! traffic loop until the client closes the control connection.

mod buffer;
mod event_loop;
mod replies;
mod socket;
mod timing;

pub use event_loop::{Counters, SessionEnd};

use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::protocol::{self, ProposalError, TestProposal};
use event_loop::{LoopOptions, TestSession};
use socket::TestListener;
use socket2::Socket;
use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use timing::FlowSchedule;
use tracing::{debug, info, warn};

/// Outcome of a finished test.
#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub counters: Counters,
    pub elapsed: Duration,
    pub port: u16,
    pub window: u32,
}

/// Run one TCP test over an established control connection.
///
/// `payload` is the proposal text that followed `t:` in the handshake.
/// The control connection must be in blocking mode.
pub fn run(
    mut control: TcpStream,
    payload: &str,
    settings: &SessionSettings,
) -> Result<SessionSummary, SessionError> {
    let proposal = TestProposal::parse(payload)?;
    for size in [proposal.read_block_size, proposal.write_block_size] {
        if size > settings.max_block_size {
            return Err(ProposalError::BlockTooLarge {
                size,
                max: settings.max_block_size,
            }
            .into());
        }
    }
    debug!(?proposal, "TCP test proposal");

    let listener = TestListener::open(
        &proposal.server_name,
        proposal.port,
        proposal.window_size,
    )
    .map_err(SessionError::resource("create listen socket"))?;
    let port = listener.local_addr().port();
    let listen_window = listener.window();

    let reply = protocol::negotiation_reply(port, listen_window);
    debug!(%reply, "Proposal reply");
    control
        .write_all(reply.as_bytes())
        .map_err(SessionError::io("send proposal reply"))?;

    let (data, data_peer) = listener
        .accept()
        .map_err(SessionError::resource("accept test connection"))?;
    log_data_peer(&control, data_peer);

    let window = if proposal.window_size > 0 {
        confirm_window(&data, listen_window)?
    } else {
        listen_window
    };

    if proposal.route_record {
        if let Err(e) = socket::set_route_record(&data) {
            warn!(error = %e, "Could not enable route record option");
        }
    }

    let start = Instant::now();
    let schedule = FlowSchedule::new(start, proposal.flow_delay(), proposal.flow_duration());
    let options = LoopOptions {
        read_block_size: proposal.read_block_size,
        write_block_size: proposal.write_block_size,
        pushy: proposal.pushy,
        shutdown_on_stop: proposal.shutdown,
        reply_queue: settings.reply_queue,
    };
    let mut session = TestSession::new(control, data.into(), schedule, options)
        .map_err(SessionError::resource("register test sockets"))?;

    info!(port, window, "Test started");
    let result = session.run(settings.poll_interval);
    debug!(counters = ?session.counters(), "Test loop finished");

    Ok(SessionSummary {
        end: result?,
        counters: session.counters(),
        elapsed: session.elapsed(),
        port,
        window,
    })
}

fn log_data_peer(control: &TcpStream, data_peer: Option<std::net::SocketAddr>) {
    let Some(peer) = data_peer else {
        info!("Client connected for testing");
        return;
    };
    info!(peer = %peer, "Client connected for testing");
    if let Ok(control_peer) = control.peer_addr() {
        if control_peer.ip().to_canonical() != peer.ip().to_canonical() {
            warn!(
                control = %control_peer.ip(),
                data = %peer.ip(),
                "Test connection comes from a different host than the control connection"
            );
        }
    }
}

/// Make the accepted socket carry the listener's window.
///
/// The accepted socket normally inherits it. Only when it does not is the
/// size applied again, and the result must then match.
fn confirm_window(data: &Socket, listen_window: u32) -> Result<u32, SessionError> {
    let inherited =
        socket::window_size(data).map_err(SessionError::resource("read test socket window"))?;
    if inherited == listen_window {
        return Ok(inherited);
    }

    let test = socket::set_window_size(data, listen_window)
        .map_err(SessionError::resource("set test socket window"))?;
    if !socket::window_matches(listen_window, test) {
        return Err(SessionError::WindowMismatch {
            listen: listen_window,
            test,
        });
    }
    Ok(test)
}
