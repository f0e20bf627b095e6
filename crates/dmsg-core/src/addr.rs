//! dmsg addresses.

use crate::error::Error;
use dmsg_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Endpoint of a dmsg stream: an entity key plus a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    /// Entity public key
    pub pk: PublicKey,
    /// Port on the entity
    pub port: u16,
}

impl Addr {
    /// Create an address
    #[must_use]
    pub const fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }

    /// Compact rendering for logs
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}:{}", self.pk.short(), self.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}:~", self.pk)
        } else {
            write!(f, "{}:{}", self.pk, self.port)
        }
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let pk_str = parts.next().unwrap_or_default();
        let port_str = parts.next();
        if parts.next().is_some() {
            return Err(Error::InvalidAddr(s.to_string()));
        }

        let pk = pk_str
            .parse::<PublicKey>()
            .map_err(|_| Error::InvalidAddr(s.to_string()))?;
        let port = match port_str {
            None | Some("") | Some("~") => 0,
            Some(p) => p.parse().map_err(|_| Error::InvalidAddr(s.to_string()))?,
        };
        Ok(Self { pk, port })
    }
}
