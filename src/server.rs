//! Control connection acceptor.
//!
//! A single thread polls the listening socket, checks each peer against
//! the access list and hands allowed connections to a dedicated session
//! worker thread. A failing or panicking session never reaches the
//! acceptor; finished workers are joined on every pass through the loop.

use crate::acl::AccessControlList;
use crate::config::{Config, SessionSettings};
use crate::session;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Pending connection queue on the control socket.
const LISTEN_BACKLOG: i32 = 64;

/// Upper bound on a poll wait, so finished workers, a backlog left by a
/// failed accept and the stop flag are seen even when no client connects.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// A running session.
struct Worker {
    handle: JoinHandle<()>,
    peer: SocketAddr,
    started: Instant,
}

/// Access gate and worker registry.
struct Sessions {
    acl: Arc<AccessControlList>,
    settings: Arc<SessionSettings>,
    workers: Slab<Worker>,
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Sessions,
}

impl Server {
    /// Bind the control listener. Failure here is fatal for the daemon.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(config.listen)?);
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            sessions: Sessions {
                acl: Arc::new(config.acl.clone()),
                settings: Arc::new(config.session.clone()),
                workers: Slab::new(),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever.
    pub fn run(self) -> io::Result<()> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Accept connections until `stop` is set.
    ///
    /// Sessions still running at that point are left to finish on their own.
    pub fn run_until(mut self, stop: &AtomicBool) -> io::Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(64);
        poll.registry()
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %self.local_addr,
            acl_entries = self.sessions.acl.len(),
            "Listening for control connections"
        );

        // Set while connections may be queued that no new edge will report.
        let mut backlog = false;

        while !stop.load(Ordering::Relaxed) {
            match poll.poll(&mut events, Some(REAP_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            backlog |= events.iter().any(|event| event.token() == LISTENER_TOKEN);
            if backlog {
                backlog = !self.accept_connections();
            }

            self.sessions.reap();
        }

        let running = self.sessions.workers.len();
        if running > 0 {
            info!(sessions = running, "Acceptor stopped with sessions running");
        }
        Ok(())
    }

    /// Returns false when an accept error left the queue undrained.
    fn accept_connections(&mut self) -> bool {
        let Self {
            listener, sessions, ..
        } = self;
        drain_backlog(
            || listener.accept(),
            |stream, peer| sessions.start(into_std(stream), peer),
        )
    }
}

/// Accept until the queue reports would-block.
///
/// Returns false when another error ended the pass early, so the caller
/// must retry without waiting for a new readiness edge.
fn drain_backlog<S>(
    mut accept: impl FnMut() -> io::Result<(S, SocketAddr)>,
    mut handle: impl FnMut(S, SocketAddr),
) -> bool {
    loop {
        match accept() {
            Ok((stream, peer)) => handle(stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept() failed, retrying later");
                return false;
            }
        }
    }
}

fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    // SAFETY: the descriptor comes straight from a stream we own and give up.
    unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

impl Sessions {
    fn start(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.acl.is_allowed(peer.ip()) {
            warn!(peer = %peer.ip(), "Access denied for host");
            return;
        }

        // Sessions drive the control socket with blocking calls.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(peer = %peer, error = %e, "Could not prepare control connection");
            return;
        }

        let entry = self.workers.vacant_entry();
        let id = entry.key();
        let settings = Arc::clone(&self.settings);

        let spawned = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let span = info_span!("session", id, peer = %peer);
                let _enter = span.enter();
                serve(stream, &settings);
            });

        match spawned {
            Ok(handle) => {
                debug!(id, peer = %peer, "Session worker started");
                entry.insert(Worker {
                    handle,
                    peer,
                    started: Instant::now(),
                });
            }
            Err(e) => error!(peer = %peer, error = %e, "Could not start session worker"),
        }
    }

    fn reap(&mut self) {
        let finished: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(id, _)| id)
            .collect();

        for id in finished {
            let worker = self.workers.remove(id);
            let elapsed = worker.started.elapsed();
            match worker.handle.join() {
                Ok(()) => debug!(id, peer = %worker.peer, ?elapsed, "Session worker reaped"),
                Err(_) => error!(id, peer = %worker.peer, "Session worker panicked"),
            }
        }
    }
}

/// Session worker body. Outcomes are logged, never propagated.
fn serve(stream: TcpStream, settings: &SessionSettings) {
    info!("Accepted control connection");

    match session::serve_client(stream, settings) {
        Ok(summary) => info!(
            end = ?summary.end,
            port = summary.port,
            window = summary.window,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            bytes_read = summary.counters.bytes_read,
            bytes_written = summary.counters.bytes_written,
            replies = summary.counters.replies,
            replies_dropped = summary.counters.replies_dropped,
            "Session finished"
        ),
        Err(e) if e.is_protocol_violation() => warn!(error = %e, "Session aborted"),
        Err(e) => error!(error = %e, "Session failed"),
    }
}

/// Create the control listener: reuse-address, keepalive, non-blocking.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
