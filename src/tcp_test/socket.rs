//! Test socket setup: ephemeral listener, window sizing, IP options.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// Smallest buffer size we retry down to when the OS rejects a request.
const MIN_WINDOW: usize = 2048;

/// Listening socket for the client's data connection.
pub struct TestListener {
    socket: Socket,
    local_addr: SocketAddr,
    window: u32,
}

impl TestListener {
    /// Bind a listener for `server_name:port` with the requested window.
    ///
    /// Every resolved address is tried in order. If none binds at a
    /// non-zero `port`, the OS picks one instead.
    pub fn open(server_name: &str, port: u16, window: u32) -> io::Result<Self> {
        match Self::bind_any(server_name, port, window) {
            Ok(listener) => Ok(listener),
            Err(e) if port != 0 => {
                warn!(port, error = %e, "Requested test port unavailable, letting the OS choose");
                Self::bind_any(server_name, 0, window)
            }
            Err(e) => Err(e),
        }
    }

    fn bind_any(server_name: &str, port: u16, window: u32) -> io::Result<Self> {
        let mut last_err = None;

        for addr in resolve(server_name, port)? {
            match bind_candidate(addr, window) {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Bind candidate failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for '{server_name}'"),
            )
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Window size obtained from the OS, not the requested one.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Block until the client connects. The listener is closed afterwards.
    pub fn accept(self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let (socket, peer) = self.socket.accept()?;
        Ok((socket, peer.as_socket()))
    }
}

fn resolve(server_name: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if server_name.is_empty() {
        return Ok(vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))]);
    }
    Ok((server_name, port).to_socket_addrs()?.collect())
}

fn bind_candidate(addr: SocketAddr, window: u32) -> io::Result<TestListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "setsockopt(SO_REUSEADDR) failed, continuing");
    }

    // Window scaling is negotiated in the handshake, so the size must be
    // in place before the socket starts listening.
    let window = set_window_size(&socket, window)?;

    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1)?;

    let local_addr = socket.local_addr()?.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Unsupported, "unknown address family")
    })?;

    Ok(TestListener {
        socket,
        local_addr,
        window,
    })
}

/// Apply `requested` to both socket buffers and report what the OS granted.
///
/// A request of 0 leaves the buffers alone.
pub fn set_window_size(socket: &Socket, requested: u32) -> io::Result<u32> {
    if requested > 0 {
        apply_directed(requested, |size| socket.set_send_buffer_size(size))?;
        apply_directed(requested, |size| socket.set_recv_buffer_size(size))?;
    }
    window_size(socket)
}

fn apply_directed(requested: u32, mut set: impl FnMut(usize) -> io::Result<()>) -> io::Result<()> {
    let mut attempt = requested as usize;
    loop {
        match set(attempt) {
            Ok(()) => return Ok(()),
            Err(e) if attempt > MIN_WINDOW => {
                debug!(attempt, error = %e, "Buffer size rejected, retrying smaller");
                attempt = attempt / 8 * 7;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Current window: the smaller of the send and receive buffers.
pub fn window_size(socket: &Socket) -> io::Result<u32> {
    let send = socket.send_buffer_size()?;
    let recv = socket.recv_buffer_size()?;
    Ok(u32::try_from(send.min(recv)).unwrap_or(u32::MAX))
}

/// Whether the test socket's window agrees with the listener's.
///
/// Linux doubles buffer sizes on set, so re-applying an already doubled
/// value may double it again.
pub fn window_matches(listen: u32, test: u32) -> bool {
    test == listen || (cfg!(target_os = "linux") && listen.checked_mul(2) == Some(test))
}

/// Ask routers to record the path via the IPv4 record-route option.
pub fn set_route_record(socket: &Socket) -> io::Result<()> {
    const IPOPT_NOP: u8 = 1;
    const IPOPT_RR: u8 = 7;
    const IPOPT_MINOFF: u8 = 4;
    const ROUTES: usize = 9;

    let mut options = [0u8; 3 + 4 * ROUTES + 1];
    options[0] = IPOPT_NOP;
    options[1] = IPOPT_RR;
    options[2] = (options.len() - 1) as u8;
    options[3] = IPOPT_MINOFF;

    // SAFETY: the pointer and length describe `options`, which outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_OPTIONS,
            options.as_ptr().cast(),
            options.len() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
