//! Protocol versions.
//!
//! The client puts its version in the `protocol` query parameter of the
//! connection URL. The server may answer with its own in the `connected`
//! frame; only a differing major version is fatal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Version spoken by this client.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a peer speaking `other` can be talked to.
    ///
    /// Minor versions only add frames and fields, so any two versions with
    /// the same major interoperate.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    /// Accepts `major` or `major.minor`; a missing minor is `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::Invalid(format!("bad protocol version: {s:?}"));
        let (major, minor) = match s.trim().split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (s.trim(), None),
        };
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.map_or(Ok(0), str::parse).map_err(|_| invalid())?;
        Ok(Self { major, minor })
    }
}
