//! iSCSI portal addresses.
//!
//! A portal is a `host:port` endpoint. The host can be an IP address (v4 or
//! v6) or a hostname; no resolution is attempted. IPv6 hosts are written in
//! brackets so the port separator stays unambiguous.

use std::fmt::{self, Display};
use std::str::FromStr;

use super::error::{IscsiError, Result};

/// Default iSCSI target port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    /// Host address (IP or hostname, not resolved)
    pub host: String,
    pub port: u16,
}

impl Portal {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`, applying
    /// [`DEFAULT_ISCSI_PORT`] when no port is given.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || {
            IscsiError::InvalidArgument(format!(
                "invalid portal '{}': expected 'host:port' or 'host'",
                s
            ))
        };

        if s.is_empty() {
            return Err(invalid());
        }

        // Handle IPv6 with brackets: [::1]:port
        if let Some(rest) = s.strip_prefix('[') {
            let bracket_end = rest.find(']').ok_or_else(invalid)?;
            let host = &rest[..bracket_end];
            let tail = &rest[bracket_end + 1..];

            if host.is_empty() {
                return Err(invalid());
            }
            if tail.is_empty() {
                return Ok(Self::new(host, DEFAULT_ISCSI_PORT));
            }
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(invalid)?;
            return Ok(Self::new(host, port));
        }

        // More than one colon without brackets is a bare IPv6 address
        if s.matches(':').count() > 1 {
            return Ok(Self::new(s, DEFAULT_ISCSI_PORT));
        }

        match s.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_ISCSI_PORT)),
        }
    }
}

impl Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Portal {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Normalize portal strings to `host:port` and drop duplicates, keeping the
/// first occurrence. Empty entries are skipped.
pub fn normalize_portals<'a, I>(portals: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut normalized: Vec<String> = Vec::new();

    for raw in portals {
        if raw.trim().is_empty() {
            continue;
        }
        let portal = Portal::parse(raw)?.to_string();
        if !normalized.contains(&portal) {
            normalized.push(portal);
        }
    }

    Ok(normalized)
}
