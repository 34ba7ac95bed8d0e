//! Host/subnet access control for incoming control connections.
//!
//! The list is an ordered set of CIDR prefixes built once at startup.
//! A peer is served when the list is empty or when at least one entry
//! of the same address family covers it.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A single permitted network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControlEntry {
    network: IpAddr,
    prefix_len: u8,
}

impl AccessControlEntry {
    /// Create an entry. `None` selects the full address width (32 or 128).
    pub fn new(network: IpAddr, prefix_len: Option<u8>) -> Result<Self, AclError> {
        let max = max_prefix(&network);
        let prefix_len = prefix_len.unwrap_or(max);
        if prefix_len > max {
            return Err(AclError::BadPrefix {
                entry: format!("{network}/{prefix_len}"),
            });
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Check whether `addr` falls inside this prefix.
    ///
    /// Entries never match addresses of the other family.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (&self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for AccessControlEntry {
    type Err = AclError;

    /// Parse `address[/prefix]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr.trim().parse().map_err(|_| AclError::BadAddress {
            entry: s.to_string(),
        })?;

        let prefix_len = match prefix {
            Some(p) => Some(p.trim().parse::<u8>().map_err(|_| AclError::BadPrefix {
                entry: s.to_string(),
            })?),
            None => None,
        };

        AccessControlEntry::new(network, prefix_len).map_err(|_| AclError::BadPrefix {
            entry: s.to_string(),
        })
    }
}

impl fmt::Display for AccessControlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Ordered allow-list of network prefixes.
#[derive(Debug, Clone, Default)]
pub struct AccessControlList {
    entries: Vec<AccessControlEntry>,
}

impl AccessControlList {
    pub fn new(entries: Vec<AccessControlEntry>) -> Self {
        Self { entries }
    }

    /// Parse every CIDR string, failing on the first bad entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AclError> {
        let entries = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(entries))
    }

    /// Decide whether a control connection from `client` may be served.
    ///
    /// An empty list allows everything.
    pub fn is_allowed(&self, client: IpAddr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        // A mapped peer matches either IPv4 entries or mapped IPv6 entries.
        let canonical = client.to_canonical();
        self.entries
            .iter()
            .any(|entry| entry.contains(&client) || entry.contains(&canonical))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessControlEntry> {
        self.entries.iter()
    }
}

/// Errors raised while building the access list from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclError {
    /// The address part is not a numeric IPv4/IPv6 address.
    BadAddress { entry: String },
    /// The prefix is not a number or exceeds the address width.
    BadPrefix { entry: String },
}

impl fmt::Display for AclError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclError::BadAddress { entry } => write!(f, "invalid ACL address '{entry}'"),
            AclError::BadPrefix { entry } => write!(f, "bad netmask in ACL entry '{entry}'"),
        }
    }
}

impl std::error::Error for AclError {}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
