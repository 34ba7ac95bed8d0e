//! Timing-gated traffic loop for one TCP test.
//!
//! Readiness-based model on top of mio: poll reports which of the two
//! sockets became readable or writable, then non-blocking read/write
//! calls move at most one block (or, in pushy mode, everything until the
//! socket would block).
//!
//! mio readiness is edge-triggered. The loop keeps its own level-style
//! flags and only clears one when the socket reports would-block, so a
//! burst that yields after one block resumes on the next iteration
//! without waiting for a new edge.

use super::buffer::BlockBuffer;
use super::replies::ReplyQueue;
use super::timing::FlowSchedule;
use crate::error::SessionError;
use crate::protocol::reply::{self, Timestamp, REPLY_BLOCK_LEN};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const CONTROL: Token = Token(0);
const DATA: Token = Token(1);

/// How a test loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed the control connection.
    ControlClosed,
}

/// Traffic counters for one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub replies: u64,
    pub replies_dropped: u64,
}

/// Per-test options taken from the proposal and daemon settings.
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub read_block_size: usize,
    pub write_block_size: usize,
    pub pushy: bool,
    pub shutdown_on_stop: bool,
    /// Reply blocks that may wait for the control socket.
    pub reply_queue: usize,
}

/// Level-style readiness, set by poll events and cleared on would-block.
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    control_readable: bool,
    control_writable: bool,
    data_readable: bool,
    data_writable: bool,
}

/// Live state of one test. Dropping it closes both sockets.
pub struct TestSession {
    control: TcpStream,
    data: TcpStream,
    poll: Poll,
    schedule: FlowSchedule,
    read_block: BlockBuffer,
    write_block: BlockBuffer,
    /// Completion time of the previous read block.
    last_block_read: Option<Instant>,
    replies: ReplyQueue,
    ready: Readiness,
    pushy: bool,
    shutdown_on_stop: bool,
    data_read_open: bool,
    write_shut: bool,
    counters: Counters,
}

impl TestSession {
    /// Take ownership of both sockets and register them for readiness.
    pub fn new(
        control: std::net::TcpStream,
        data: std::net::TcpStream,
        schedule: FlowSchedule,
        options: LoopOptions,
    ) -> io::Result<Self> {
        data.set_nonblocking(true)?;
        control.set_nonblocking(true)?;
        control.set_nodelay(true)?;

        let mut control = TcpStream::from_std(control);
        let mut data = TcpStream::from_std(data);

        let poll = Poll::new()?;
        let interest = Interest::READABLE | Interest::WRITABLE;
        poll.registry().register(&mut control, CONTROL, interest)?;
        poll.registry().register(&mut data, DATA, interest)?;

        Ok(Self {
            control,
            data,
            poll,
            schedule,
            read_block: BlockBuffer::new(options.read_block_size),
            write_block: BlockBuffer::new(options.write_block_size),
            last_block_read: None,
            replies: ReplyQueue::new(options.reply_queue.saturating_mul(REPLY_BLOCK_LEN)),
            ready: Readiness::default(),
            pushy: options.pushy,
            shutdown_on_stop: options.shutdown_on_stop,
            data_read_open: true,
            write_shut: false,
            counters: Counters::default(),
        })
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Time since the test started.
    pub fn elapsed(&self) -> Duration {
        self.schedule.start().elapsed()
    }

    /// Run until the client closes the control connection or a socket fails.
    ///
    /// `interval` bounds every poll wait so flow start/stop are never
    /// missed by more than that.
    pub fn run(&mut self, interval: Duration) -> Result<SessionEnd, SessionError> {
        let mut events = Events::with_capacity(8);

        loop {
            let timeout = self.poll_timeout(Instant::now(), interval);
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::io("poll")(e)),
            }

            for event in events.iter() {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_error();
                match event.token() {
                    CONTROL => {
                        self.ready.control_readable |= readable;
                        self.ready.control_writable |= writable;
                    }
                    DATA => {
                        self.ready.data_readable |= readable;
                        self.ready.data_writable |= writable;
                    }
                    _ => {}
                }
            }
            trace!(ready = ?self.ready, "Poll returned");

            if self.ready.data_readable && self.data_read_open {
                self.read_path()?;
            }

            if self.ready.control_readable {
                if let Some(end) = self.control_path()? {
                    return Ok(end);
                }
            }

            if self.ready.control_writable && !self.replies.is_empty() {
                self.flush_replies()?;
            }

            if self.ready.data_writable && !self.write_shut {
                self.write_path()?;
            }

            self.check_flow_stop(Instant::now());
        }
    }

    /// Zero while there is work a previous burst left behind, otherwise
    /// the interval shortened to the next schedule transition.
    fn poll_timeout(&self, now: Instant, interval: Duration) -> Duration {
        let busy = (self.ready.data_readable && self.data_read_open)
            || (self.ready.data_writable && !self.write_shut && self.schedule.may_write(now))
            || (self.ready.control_writable && !self.replies.is_empty());
        if busy {
            return Duration::ZERO;
        }
        self.schedule
            .next_transition(now)
            .map_or(interval, |d| d.min(interval))
    }

    fn read_path(&mut self) -> Result<(), SessionError> {
        loop {
            match self.data.read(self.read_block.pending_mut()) {
                Ok(0) => {
                    debug!("Client shut down flow");
                    self.data_read_open = false;
                    self.ready.data_readable = false;
                    return Ok(());
                }
                Ok(n) => {
                    trace!(n, "Received bytes");
                    self.counters.bytes_read += n as u64;
                    if self.read_block.advance(n) {
                        self.complete_read_block();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.data_readable = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::io("recv on test socket")(e)),
            }

            if !self.pushy {
                return Ok(());
            }
        }
    }

    /// Stamp the IAT slot of a full read block and queue its reply.
    fn complete_read_block(&mut self) {
        self.read_block.reset();
        self.counters.blocks_read += 1;

        if self.read_block.size() < REPLY_BLOCK_LEN {
            return;
        }

        let now = Instant::now();
        let iat = self
            .last_block_read
            .map(|prev| now.duration_since(prev).as_secs_f64());
        self.last_block_read = Some(now);

        let block = self.read_block.block_mut();
        reply::write_iat(block, iat);

        if self.replies.push(&block[..REPLY_BLOCK_LEN]) {
            self.counters.replies += 1;
            trace!(iat_ms = iat.map(|s| s * 1e3), "Queued reply block");
        } else {
            self.counters.replies_dropped += 1;
            warn!(
                queued = self.replies.len(),
                "Congestion on control connection, dropping reply block"
            );
        }
    }

    /// Any data on the control socket during a test is a violation.
    fn control_path(&mut self) -> Result<Option<SessionEnd>, SessionError> {
        let mut buf = [0u8; 1024];
        loop {
            match self.control.read(&mut buf) {
                Ok(0) => {
                    debug!("Client shut down control connection");
                    return Ok(Some(SessionEnd::ControlClosed));
                }
                Ok(n) => return Err(SessionError::UnexpectedControlData { len: n }),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.control_readable = false;
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::io("recv on control socket")(e)),
            }
        }
    }

    fn flush_replies(&mut self) -> Result<(), SessionError> {
        let drained = self
            .replies
            .flush(&mut self.control)
            .map_err(SessionError::io("send reply block"))?;
        if !drained {
            self.ready.control_writable = false;
        }
        Ok(())
    }

    fn write_path(&mut self) -> Result<(), SessionError> {
        loop {
            if !self.schedule.may_write(Instant::now()) {
                return Ok(());
            }

            if self.write_block.is_fresh() {
                Timestamp::now().encode_into(self.write_block.block_mut());
            }

            match self.data.write(self.write_block.pending()) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    trace!(n, "Sent bytes");
                    self.counters.bytes_written += n as u64;
                    if self.write_block.advance(n) {
                        self.write_block.reset();
                        self.counters.blocks_written += 1;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.data_writable = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::io("send on test socket")(e)),
            }

            if !self.pushy {
                return Ok(());
            }
        }
    }

    fn check_flow_stop(&mut self, now: Instant) {
        if !self.shutdown_on_stop || self.write_shut || !self.schedule.has_stopped(now) {
            return;
        }
        debug!("Flow finished, shutting down write side of test socket");
        if let Err(e) = self.data.shutdown(Shutdown::Write) {
            warn!(error = %e, "shutdown() of test socket failed");
        }
        self.write_shut = true;
    }
}
