//! Relay protocol version, carried as `"major.minor"` in the `connected`
//! greeting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A `major.minor` pair. Peers interoperate when the majors match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// A version string that is not `major.minor`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed protocol version {0:?}")]
pub struct VersionError(String);

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionError(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(malformed)?;
        Ok(Self {
            major: major.parse().map_err(|_| malformed())?,
            minor: minor.parse().map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majors_must_match() {
        assert!(PROTOCOL_VERSION.is_compatible_with(&Version::new(1, 7)));
        assert!(!PROTOCOL_VERSION.is_compatible_with(&Version::new(2, 0)));
    }

    #[test]
    fn test_parse() {
        assert_eq!("1.3".parse::<Version>().unwrap(), Version::new(1, 3));
        assert!("1".parse::<Version>().is_err());
        assert!("one.two".parse::<Version>().is_err());
        assert!("1.300".parse::<Version>().is_err());
    }

    #[test]
    fn test_serialized_as_string() {
        let json = serde_json::to_string(&PROTOCOL_VERSION).unwrap();
        assert_eq!(json, "\"1.0\"");
        assert_eq!(serde_json::from_str::<Version>(&json).unwrap(), PROTOCOL_VERSION);
    }
}
