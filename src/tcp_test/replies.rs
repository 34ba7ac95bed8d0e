//! Outbound reply blocks waiting for the control socket.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Room for 64 reply blocks before the buffer has to grow.
const INITIAL_CAPACITY: usize = 64 * 24;

/// Bounded queue of whole reply blocks.
///
/// A block is either queued entirely or dropped, so the control stream
/// never carries a truncated reply.
pub struct ReplyQueue {
    pending: BytesMut,
    limit: usize,
}

impl ReplyQueue {
    /// `limit` is in bytes. The buffer grows on demand up to it.
    pub fn new(limit: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(limit.min(INITIAL_CAPACITY)),
            limit,
        }
    }

    /// Queue a reply. Returns false when there is no room for it.
    pub fn push(&mut self, reply: &[u8]) -> bool {
        if self.pending.len() + reply.len() > self.limit {
            return false;
        }
        self.pending.extend_from_slice(reply);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Write as much as the socket takes.
    ///
    /// Returns `Ok(true)` once the queue is drained, `Ok(false)` when the
    /// socket would block first.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while !self.pending.is_empty() {
            match writer.write(&self.pending) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then reports would-block.
    struct Throttled {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_respects_limit() {
        let mut queue = ReplyQueue::new(48);
        assert!(queue.push(&[1; 24]));
        assert!(queue.push(&[2; 24]));
        assert!(!queue.push(&[3; 24]));
        assert_eq!(queue.len(), 48);
    }

    #[test]
    fn test_unbounded_limit_does_not_preallocate() {
        let mut queue = ReplyQueue::new(usize::MAX);
        assert!(queue.push(&[1; 24]));
        assert_eq!(queue.len(), 24);
    }

    #[test]
    fn test_partial_flush_keeps_remainder() {
        let mut queue = ReplyQueue::new(48);
        queue.push(&[1; 24]);
        queue.push(&[2; 24]);

        let mut sink = Throttled {
            out: Vec::new(),
            budget: 30,
        };
        assert!(!queue.flush(&mut sink).unwrap());
        assert_eq!(queue.len(), 18);

        sink.budget = 100;
        assert!(queue.flush(&mut sink).unwrap());
        assert!(queue.is_empty());

        let mut expected = vec![1u8; 24];
        expected.extend_from_slice(&[2u8; 24]);
        assert_eq!(sink.out, expected);
    }
}
