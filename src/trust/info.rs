// trust/info.rs - Trust Levels and Derived Trust Information

use serde::{Deserialize, Serialize};
use std::fmt;

/// How far the local owner trusts a subject
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// No valid certification path
    #[default]
    Unknown = 0,

    /// Vouched for by a trusted subject or enough known ones
    Known = 1,

    /// Directly certified by the owner
    Trusted = 2,

    /// The owner itself
    Ultimate = 3,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Known => "known",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Ultimate => "ultimate",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust level plus the certification distance from the owner
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustInfo {
    pub level: TrustLevel,

    /// Hops from the owner; -1 when no path is known
    pub degree: i32,
}

impl TrustInfo {
    pub const UNKNOWN: TrustInfo = TrustInfo {
        level: TrustLevel::Unknown,
        degree: -1,
    };

    pub const OWNER: TrustInfo = TrustInfo {
        level: TrustLevel::Ultimate,
        degree: 0,
    };

    pub fn new(level: TrustLevel, degree: i32) -> Self {
        Self { level, degree }
    }

    /// Valid subjects have a known level and sit within `max_degree` hops
    pub fn is_valid(&self, max_degree: i32) -> bool {
        self.level != TrustLevel::Unknown && (0..=max_degree).contains(&self.degree)
    }
}

impl Default for TrustInfo {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Display metadata for a subject
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInformation {
    /// Aliases given by issuers, closest issuer first
    pub aliases: Vec<String>,

    /// Last successful sync with the subject (ms since epoch, 0 = never)
    pub last_sync: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(TrustLevel::Ultimate > TrustLevel::Trusted);
        assert!(TrustLevel::Trusted > TrustLevel::Known);
        assert!(TrustLevel::Known > TrustLevel::Unknown);
        assert_eq!(TrustLevel::default(), TrustLevel::Unknown);
    }

    #[test]
    fn test_validity() {
        assert!(TrustInfo::OWNER.is_valid(3));
        assert!(TrustInfo::new(TrustLevel::Known, 3).is_valid(3));
        assert!(!TrustInfo::new(TrustLevel::Known, 4).is_valid(3));
        assert!(!TrustInfo::new(TrustLevel::Unknown, 1).is_valid(3));
        assert!(!TrustInfo::new(TrustLevel::Trusted, -1).is_valid(3));
        assert_eq!(TrustInfo::default(), TrustInfo::UNKNOWN);
    }
}
