//! Server release versions and wire-protocol version negotiation.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A parsed Cassandra release version (`major.minor.patch`).
///
/// The 3.0 threshold decides between the legacy (`system.schema_*`) and
/// modern (`system_schema.*`) schema table layouts; 2.1 and 2.2 gate user
/// types and functions/aggregates on the legacy layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const V2_1: ServerVersion = ServerVersion::new(2, 1, 0);
    pub const V2_2: ServerVersion = ServerVersion::new(2, 2, 0);
    pub const V3_0: ServerVersion = ServerVersion::new(3, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        ServerVersion {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Release version string could not be parsed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid release version string")]
pub struct ServerVersionParseError;

impl FromStr for ServerVersion {
    type Err = ServerVersionParseError;

    /// Parses `"3.11.0"`-style strings. Trailing non-numeric suffixes such
    /// as `"2.1.9-SNAPSHOT"` are tolerated; a missing patch component
    /// defaults to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn leading_number(component: &str) -> Option<u32> {
            let digits: &str = component
                .split_once(|c: char| !c.is_ascii_digit())
                .map(|(digits, _)| digits)
                .unwrap_or(component);
            digits.parse().ok()
        }

        let mut components = s.split('.');
        let major = components
            .next()
            .and_then(leading_number)
            .ok_or(ServerVersionParseError)?;
        let minor = components
            .next()
            .and_then(leading_number)
            .ok_or(ServerVersionParseError)?;
        let patch = components.next().and_then(leading_number).unwrap_or(0);

        Ok(ServerVersion::new(major, minor, patch))
    }
}

const DSE_VERSION_BIT: u8 = 0x40;
const DSE_VERSION_MASK: u8 = 0x3f;

/// A negotiated wire-protocol version.
///
/// Two lineages share the integer space: plain Cassandra versions, and DSE
/// versions marked by a high bit with the DSE subversion in the low bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    /// The highest Cassandra protocol version this core speaks.
    pub const HIGHEST_SUPPORTED: ProtocolVersion = ProtocolVersion::cassandra(4);

    pub const fn cassandra(version: u8) -> Self {
        ProtocolVersion(version & DSE_VERSION_MASK)
    }

    pub const fn dse(version: u8) -> Self {
        ProtocolVersion(DSE_VERSION_BIT | (version & DSE_VERSION_MASK))
    }

    pub fn is_dse(self) -> bool {
        self.0 & DSE_VERSION_BIT != 0
    }

    fn subversion(self) -> u8 {
        self.0 & DSE_VERSION_MASK
    }

    /// The next version to try after the server rejected this one with an
    /// `invalid protocol` error, or `None` when negotiation is exhausted.
    ///
    /// DSE versions step down within their lineage first and then cross over
    /// to the highest supported Cassandra version. Negotiation always
    /// retries the same host: which versions a server accepts is a property
    /// of the server, not of the network.
    pub fn step_down(self) -> Option<ProtocolVersion> {
        if self.is_dse() {
            if self.subversion() > 1 {
                Some(ProtocolVersion(self.0 - 1))
            } else {
                Some(Self::HIGHEST_SUPPORTED)
            }
        } else if self.subversion() > 1 {
            Some(ProtocolVersion(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dse() {
            write!(f, "DSEv{}", self.subversion())
        } else {
            write!(f, "v{}", self.subversion())
        }
    }
}
