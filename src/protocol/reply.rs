//! Timestamp and reply-block layout embedded at the start of data blocks.
//!
//! ```text
//! offset  size  field
//!      0     8  seconds since the Unix epoch (i64, big-endian)
//!      8     4  nanoseconds (u32, big-endian)
//!     12     4  reserved, zero
//!     16     8  inter-arrival time in seconds (f64, big-endian), NaN for the first block
//! ```
//!
//! Write blocks carry only the 16-byte timestamp. Completed read blocks
//! get their IAT slot overwritten and the first 24 bytes are echoed over
//! the control channel.

#![allow(dead_code)] // Decoders serve controllers and tests

use chrono::{DateTime, Utc};

/// Length of the encoded timestamp.
pub const TIMESTAMP_LEN: usize = 16;

/// Offset of the inter-arrival time slot.
pub const IAT_OFFSET: usize = TIMESTAMP_LEN;

/// Length of a reply block echoed on the control channel.
pub const REPLY_BLOCK_LEN: usize = IAT_OFFSET + 8;

/// Wall-clock timestamp with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Encode into the first 16 bytes of `buf`.
    ///
    /// Returns false, leaving `buf` untouched, when it is too short.
    pub fn encode_into(&self, buf: &mut [u8]) -> bool {
        if buf.len() < TIMESTAMP_LEN {
            return false;
        }
        buf[0..8].copy_from_slice(&self.secs.to_be_bytes());
        buf[8..12].copy_from_slice(&self.nanos.to_be_bytes());
        buf[12..16].fill(0);
        true
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let secs = i64::from_be_bytes(buf.get(0..8)?.try_into().ok()?);
        let nanos = u32::from_be_bytes(buf.get(8..12)?.try_into().ok()?);
        Some(Self { secs, nanos })
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, self.nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            secs: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }
}

/// Store the inter-arrival time in a read block. `None` writes NaN.
///
/// Returns false when the block is shorter than a reply block.
pub fn write_iat(block: &mut [u8], iat: Option<f64>) -> bool {
    let Some(slot) = block.get_mut(IAT_OFFSET..REPLY_BLOCK_LEN) else {
        return false;
    };
    slot.copy_from_slice(&iat.unwrap_or(f64::NAN).to_be_bytes());
    true
}

/// Decoded reply block, as seen by a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplyBlock {
    /// Timestamp the client placed in the block it sent.
    pub sent: Timestamp,
    /// Seconds since the previous completed block, `None` for the first.
    pub iat: Option<f64>,
}

impl ReplyBlock {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let sent = Timestamp::decode(buf)?;
        let raw = f64::from_be_bytes(buf.get(IAT_OFFSET..REPLY_BLOCK_LEN)?.try_into().ok()?);
        let iat = if raw.is_nan() { None } else { Some(raw) };
        Some(Self { sent, iat })
    }

    pub fn encode(&self) -> [u8; REPLY_BLOCK_LEN] {
        let mut buf = [0u8; REPLY_BLOCK_LEN];
        self.sent.encode_into(&mut buf);
        write_iat(&mut buf, self.iat);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_layout() {
        let ts = Timestamp {
            secs: 0x0102_0304_0506_0708,
            nanos: 0x0a0b_0c0d,
        };
        let mut buf = [0xffu8; 20];
        assert!(ts.encode_into(&mut buf));
        assert_eq!(
            &buf[..16],
            &[1, 2, 3, 4, 5, 6, 7, 8, 0x0a, 0x0b, 0x0c, 0x0d, 0, 0, 0, 0]
        );
        // Bytes past the timestamp are untouched.
        assert_eq!(&buf[16..], &[0xff; 4]);
        assert_eq!(Timestamp::decode(&buf), Some(ts));
    }

    #[test]
    fn test_short_buffers() {
        let mut small = [0u8; 10];
        assert!(!Timestamp::now().encode_into(&mut small));
        assert_eq!(small, [0u8; 10]);
        assert!(!write_iat(&mut [0u8; 23], Some(1.0)));
        assert!(ReplyBlock::decode(&[0u8; 23]).is_none());
    }

    #[test]
    fn test_first_block_iat_is_nan() {
        let mut block = vec![0u8; 64];
        assert!(write_iat(&mut block, None));
        let raw = f64::from_be_bytes(block[16..24].try_into().unwrap());
        assert!(raw.is_nan());
        assert_eq!(ReplyBlock::decode(&block).unwrap().iat, None);
    }

    #[test]
    fn test_iat_slot_big_endian() {
        let mut block = vec![0u8; 24];
        write_iat(&mut block, Some(0.25));
        assert_eq!(&block[16..24], &0.25f64.to_be_bytes());
    }

    #[test]
    fn test_reply_block_encode_decode() {
        let reply = ReplyBlock {
            sent: Timestamp {
                secs: 1_700_000_000,
                nanos: 123_456_789,
            },
            iat: Some(0.0125),
        };
        assert_eq!(ReplyBlock::decode(&reply.encode()), Some(reply));
    }

    #[test]
    fn test_now_is_plausible() {
        let dt = Timestamp::now().to_datetime().unwrap();
        assert!((Utc::now() - dt).num_seconds().abs() < 5);
    }
}
