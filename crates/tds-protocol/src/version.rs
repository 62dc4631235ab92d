//! TDS protocol versions and the ordered protocol tier derived from them.

use core::fmt;

use crate::error::ProtocolError;

/// Raw TDS protocol version as exchanged in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0).
    pub const V7_0: Self = Self(0x0700_0000);
    /// TDS 7.1 (SQL Server 2000).
    pub const V7_1: Self = Self(0x0701_0000);
    /// TDS 7.1 revision 1 (SQL Server 2000 SP1).
    pub const V7_1_REV1: Self = Self(0x7100_0001);
    /// TDS 7.2 (SQL Server 2005).
    pub const V7_2: Self = Self(0x7209_0002);
    /// TDS 7.3A (SQL Server 2008).
    pub const V7_3A: Self = Self(0x730A_0003);
    /// TDS 7.3B (SQL Server 2008 R2).
    pub const V7_3B: Self = Self(0x730B_0003);
    /// TDS 7.4 (SQL Server 2012 and later).
    pub const V7_4: Self = Self(0x7400_0004);
    /// TDS 8.0 (strict encryption).
    pub const V8_0: Self = Self(0x0800_0000);

    /// Wrap a raw version value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the TDS 8.0 strict-encryption version.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// Map the version onto its protocol tier.
    pub fn tier(self) -> Result<ProtocolTier, ProtocolError> {
        ProtocolTier::from_version(self)
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V7_0 => write!(f, "TDS 7.0"),
            Self::V7_1 | Self::V7_1_REV1 => write!(f, "TDS 7.1"),
            Self::V7_2 => write!(f, "TDS 7.2"),
            Self::V7_3A => write!(f, "TDS 7.3A"),
            Self::V7_3B => write!(f, "TDS 7.3B"),
            Self::V7_4 => write!(f, "TDS 7.4"),
            Self::V8_0 => write!(f, "TDS 8.0"),
            Self(raw) => write!(f, "TDS 0x{raw:08X}"),
        }
    }
}

/// Ordered protocol capability tier.
///
/// Feature gates compare tiers with `>=`: `tier >= ProtocolTier::Katmai`
/// means the date/time family is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolTier {
    /// TDS 7.0 (SQL Server 7.0, "Sphinx").
    Sphinx,
    /// TDS 7.1 (SQL Server 2000, "Shiloh"): collations on character types.
    Shiloh,
    /// TDS 7.2 (SQL Server 2005, "Yukon"): PLP types, 8-byte DONE row
    /// counts, 4-byte ERROR line numbers, MARS, transaction manager.
    Yukon,
    /// TDS 7.3 (SQL Server 2008, "Katmai"): date/time family, UDT.
    Katmai,
    /// TDS 7.4 and later ("Denali"): session recovery, feature extensions.
    Denali,
}

impl ProtocolTier {
    /// Tier this client asks for in LOGIN7.
    pub const LATEST: Self = Self::Denali;

    /// Derive the tier from a LOGINACK version.
    pub fn from_version(version: TdsVersion) -> Result<Self, ProtocolError> {
        let raw = version.raw();
        if version.is_tds_8() {
            return Ok(Self::Denali);
        }
        let major_minor = raw & 0xFF00_FFFF;
        let increment = (raw >> 16) & 0xFF;
        match (major_minor, increment) {
            (0x0700_0000, 0) => Ok(Self::Sphinx),
            (0x0701_0000, 0) | (0x7100_0001, 0) => Ok(Self::Shiloh),
            (0x7200_0002, 0x09) => Ok(Self::Yukon),
            (0x7300_0003, 0x0A | 0x0B) => Ok(Self::Katmai),
            (0x7400_0004, 0) => Ok(Self::Denali),
            _ => Err(ProtocolError::UnsupportedVersion(raw)),
        }
    }

    /// Version value sent in LOGIN7 for this tier.
    #[must_use]
    pub const fn version(self) -> TdsVersion {
        match self {
            Self::Sphinx => TdsVersion::V7_0,
            Self::Shiloh => TdsVersion::V7_1,
            Self::Yukon => TdsVersion::V7_2,
            Self::Katmai => TdsVersion::V7_3B,
            Self::Denali => TdsVersion::V7_4,
        }
    }

    /// DONE row counts are 8 bytes wide.
    #[must_use]
    pub fn has_long_row_count(self) -> bool {
        self >= Self::Yukon
    }

    /// Character types carry a collation.
    #[must_use]
    pub fn has_collation(self) -> bool {
        self >= Self::Shiloh
    }

    /// `max` types use PLP encoding.
    #[must_use]
    pub fn has_plp(self) -> bool {
        self >= Self::Yukon
    }

    /// DATE, TIME, DATETIME2 and DATETIMEOFFSET exist.
    #[must_use]
    pub fn has_date_time_family(self) -> bool {
        self >= Self::Katmai
    }

    /// LOGIN7 may carry feature extensions.
    #[must_use]
    pub fn has_feature_ext(self) -> bool {
        self >= Self::Denali
    }
}

impl fmt::Display for ProtocolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sphinx => "Sphinx",
            Self::Shiloh => "Shiloh",
            Self::Yukon => "Yukon",
            Self::Katmai => "Katmai",
            Self::Denali => "Denali",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(ProtocolTier::Sphinx < ProtocolTier::Shiloh);
        assert!(ProtocolTier::Shiloh < ProtocolTier::Yukon);
        assert!(ProtocolTier::Katmai < ProtocolTier::Denali);
        assert!(ProtocolTier::Denali.has_long_row_count());
        assert!(!ProtocolTier::Shiloh.has_long_row_count());
    }

    #[test]
    fn loginack_versions_map_to_tiers() {
        let cases = [
            (0x0700_0000, ProtocolTier::Sphinx),
            (0x0701_0000, ProtocolTier::Shiloh),
            (0x7100_0001, ProtocolTier::Shiloh),
            (0x7209_0002, ProtocolTier::Yukon),
            (0x730A_0003, ProtocolTier::Katmai),
            (0x730B_0003, ProtocolTier::Katmai),
            (0x7400_0004, ProtocolTier::Denali),
            (0x0800_0000, ProtocolTier::Denali),
        ];
        for (raw, tier) in cases {
            assert_eq!(TdsVersion::new(raw).tier().unwrap(), tier, "0x{raw:08X}");
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(
            TdsVersion::new(0x7500_0005).tier(),
            Err(ProtocolError::UnsupportedVersion(0x7500_0005))
        );
        assert!(TdsVersion::new(0x7208_0002).tier().is_err());
    }

    #[test]
    fn tier_version_round_trips() {
        for tier in [
            ProtocolTier::Sphinx,
            ProtocolTier::Shiloh,
            ProtocolTier::Yukon,
            ProtocolTier::Katmai,
            ProtocolTier::Denali,
        ] {
            assert_eq!(tier.version().tier().unwrap(), tier);
        }
    }

    #[test]
    fn display() {
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
        assert_eq!(ProtocolTier::Yukon.to_string(), "Yukon");
    }
}
