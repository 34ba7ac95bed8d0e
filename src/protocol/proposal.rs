//! TCP test proposal parsing.
//!
//! Payload format (after the `t:` tag):
//!
//! ```text
//! <server>:<port>:<window>:<delay>:<duration>:<read>:<write>:<pushy>:<shutdown>:<rr>
//! ```
//!
//! The server name ends at the first ':', so IPv6 literals cannot be used
//! there. An empty server name binds the wildcard address.

use std::fmt;
use std::time::Duration;

/// Number of fields after the server name.
pub const FIELD_COUNT: usize = 9;

/// Negotiated parameters for one TCP test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestProposal {
    pub server_name: String,
    /// Requested test port, 0 lets the daemon choose.
    pub port: u16,
    /// Requested socket buffer size, 0 keeps the OS default.
    pub window_size: u32,
    /// Seconds between negotiation and the first write.
    pub delay: f64,
    /// Seconds of writing; negative means unbounded.
    pub duration: f64,
    pub read_block_size: usize,
    pub write_block_size: usize,
    pub pushy: bool,
    pub shutdown: bool,
    pub route_record: bool,
}

impl TestProposal {
    /// Parse a proposal payload. No partial results.
    pub fn parse(payload: &str) -> Result<Self, ProposalError> {
        let (server_name, params) = payload
            .split_once(':')
            .ok_or(ProposalError::MissingServerName)?;

        let fields: Vec<&str> = params.split(':').collect();
        if fields.len() != FIELD_COUNT {
            return Err(ProposalError::FieldCount {
                found: fields.len(),
            });
        }

        let proposal = TestProposal {
            server_name: server_name.to_string(),
            port: number("port", fields[0])?,
            window_size: number("window", fields[1])?,
            delay: seconds("delay", fields[2])?,
            duration: seconds("duration", fields[3])?,
            read_block_size: number::<u32>("read block size", fields[4])? as usize,
            write_block_size: number::<u32>("write block size", fields[5])? as usize,
            pushy: flag("pushy", fields[6])?,
            shutdown: flag("shutdown", fields[7])?,
            route_record: flag("route record", fields[8])?,
        };

        if proposal.read_block_size == 0 || proposal.write_block_size == 0 {
            return Err(ProposalError::ZeroBlockSize);
        }

        Ok(proposal)
    }

    /// Write duration, or `None` when unbounded.
    pub fn flow_duration(&self) -> Option<Duration> {
        if self.duration < 0.0 {
            None
        } else {
            Some(Duration::try_from_secs_f64(self.duration).unwrap_or(Duration::MAX))
        }
    }

    /// Delay before the first write. Negative delays start immediately.
    pub fn flow_delay(&self) -> Duration {
        if self.delay <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(self.delay).unwrap_or(Duration::MAX)
        }
    }
}

/// Reasons a proposal payload is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    /// No ':' after the server name.
    MissingServerName,
    /// Wrong number of parameter fields.
    FieldCount { found: usize },
    /// A field did not parse.
    InvalidField { name: &'static str, value: String },
    /// Read or write block size of zero.
    ZeroBlockSize,
    /// Block size above the configured limit.
    BlockTooLarge { size: usize, max: usize },
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalError::MissingServerName => write!(f, "malformed server name in proposal"),
            ProposalError::FieldCount { found } => write!(
                f,
                "malformed TCP session proposal: expected {FIELD_COUNT} fields, got {found}"
            ),
            ProposalError::InvalidField { name, value } => {
                write!(f, "malformed TCP session proposal: bad {name} '{value}'")
            }
            ProposalError::ZeroBlockSize => write!(f, "block size must be non-zero"),
            ProposalError::BlockTooLarge { size, max } => {
                write!(f, "block size {size} exceeds limit {max}")
            }
        }
    }
}

impl std::error::Error for ProposalError {}

fn number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ProposalError> {
    value.parse().map_err(|_| ProposalError::InvalidField {
        name,
        value: value.to_string(),
    })
}

fn seconds(name: &'static str, value: &str) -> Result<f64, ProposalError> {
    let secs: f64 = number(name, value)?;
    if !secs.is_finite() {
        return Err(ProposalError::InvalidField {
            name,
            value: value.to_string(),
        });
    }
    Ok(secs)
}

fn flag(name: &'static str, value: &str) -> Result<bool, ProposalError> {
    number::<i8>(name, value).map(|v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_proposal() {
        let p = TestProposal::parse("testhost:5001:65536:0.5:2.0:1460:8192:1:0:1").unwrap();
        assert_eq!(
            p,
            TestProposal {
                server_name: "testhost".to_string(),
                port: 5001,
                window_size: 65536,
                delay: 0.5,
                duration: 2.0,
                read_block_size: 1460,
                write_block_size: 8192,
                pushy: true,
                shutdown: false,
                route_record: true,
            }
        );
        assert_eq!(p.flow_delay(), Duration::from_millis(500));
        assert_eq!(p.flow_duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_negative_duration_is_unbounded() {
        let p = TestProposal::parse(":0:0:0:-1:100:100:0:0:0").unwrap();
        assert_eq!(p.server_name, "");
        assert_eq!(p.flow_duration(), None);
    }

    #[test]
    fn test_negative_delay_starts_immediately() {
        let p = TestProposal::parse("h:0:0:-3:1:100:100:0:0:0").unwrap();
        assert_eq!(p.flow_delay(), Duration::ZERO);
    }

    #[test]
    fn test_missing_field_rejected() {
        assert_eq!(
            TestProposal::parse("h:0:0:0:1:100:100:0:0"),
            Err(ProposalError::FieldCount { found: 8 })
        );
    }

    #[test]
    fn test_extra_field_rejected() {
        assert_eq!(
            TestProposal::parse("h:0:0:0:1:100:100:0:0:0:7"),
            Err(ProposalError::FieldCount { found: 10 })
        );
    }

    #[test]
    fn test_missing_server_name_rejected() {
        assert_eq!(
            TestProposal::parse("no-separator"),
            Err(ProposalError::MissingServerName)
        );
    }

    #[test]
    fn test_bad_numbers_rejected() {
        assert!(matches!(
            TestProposal::parse("h:70000:0:0:1:100:100:0:0:0"),
            Err(ProposalError::InvalidField { name: "port", .. })
        ));
        assert!(matches!(
            TestProposal::parse("h:0:0:soon:1:100:100:0:0:0"),
            Err(ProposalError::InvalidField { name: "delay", .. })
        ));
        assert!(matches!(
            TestProposal::parse("h:0:0:0:NaN:100:100:0:0:0"),
            Err(ProposalError::InvalidField { name: "duration", .. })
        ));
        assert!(matches!(
            TestProposal::parse("h:0:0:0:1:100:100:yes:0:0"),
            Err(ProposalError::InvalidField { name: "pushy", .. })
        ));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert_eq!(
            TestProposal::parse("h:0:0:0:1:0:100:0:0:0"),
            Err(ProposalError::ZeroBlockSize)
        );
    }
}
