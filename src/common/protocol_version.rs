// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The wire-format version number carried on every request, response, and telemetry message,
//! used to detect incompatible senders and receivers before any other field is trusted.

use std::fmt::{self, Display, Formatter};

/// A `major.minor` protocol version number.
///
/// Receivers check only the major component against their own supported set: a minor version
/// bump must remain backward compatible, while a major version bump signals a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// The major version. Bumped on breaking wire-format changes.
    pub major: u16,
    /// The minor version. Bumped on backward-compatible additions.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parses a `"<major>.<minor>"` string into a [`ProtocolVersion`].
    ///
    /// Returns `None` if the string is not exactly two dot-separated non-negative integers.
    #[must_use]
    pub fn parse_protocol_version(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Returns whether this version's major component is in `supported_major_versions`.
    #[must_use]
    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_version() {
        assert_eq!(
            ProtocolVersion::parse_protocol_version("1.2"),
            Some(ProtocolVersion { major: 1, minor: 2 })
        );
    }

    #[test]
    fn rejects_malformed_version() {
        assert_eq!(ProtocolVersion::parse_protocol_version("1"), None);
        assert_eq!(ProtocolVersion::parse_protocol_version("a.b"), None);
        assert_eq!(ProtocolVersion::parse_protocol_version("1.2.3"), None);
    }

    #[test]
    fn is_supported_checks_major_only() {
        let version = ProtocolVersion { major: 1, minor: 7 };
        assert!(version.is_supported(&[1, 2]));
        assert!(!version.is_supported(&[2, 3]));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let version = ProtocolVersion { major: 3, minor: 0 };
        assert_eq!(
            ProtocolVersion::parse_protocol_version(&version.to_string()),
            Some(version)
        );
    }
}
