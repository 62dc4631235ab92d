//! Collations and their mapping to Windows code pages.
//!
//! A collation is 5 bytes on the wire: a little-endian info word (LCID in
//! the low 20 bits, comparison flags and version above it) followed by a
//! SQL sort id. A non-zero sort id selects the code page directly; else the
//! LCID does.
//!
//! # Legacy locale remaps
//!
//! A few alternate-sort LCIDs used by older servers no longer resolve on
//! current platforms. They are retried with the sort bits masked off
//! (East-Asian locales) or redirected to the supported locale (the old
//! Lithuanian id). See [`LEGACY_LCID_REMAP`].
//!
//! | Code Page | Encoding | Languages |
//! |-----------|----------|-----------|
//! | 874 | Windows-874 | Thai |
//! | 932 | Shift_JIS | Japanese |
//! | 936 | GBK/GB18030 | Simplified Chinese |
//! | 949 | EUC-KR | Korean |
//! | 950 | Big5 | Traditional Chinese |
//! | 1250..=1258 | Windows-125x | European, Cyrillic, Greek, Turkish, Hebrew, Arabic, Baltic, Vietnamese |

#[cfg(feature = "encoding")]
use encoding_rs::Encoding;

use crate::error::ProtocolError;
use crate::wire::{Reader, WireResult};

/// Flag bit indicating a UTF-8 collation.
pub const COLLATION_FLAG_UTF8: u32 = 0x0800_0000;

/// Mask extracting the LCID (with sort version bits) from the info word.
pub const LCID_MASK: u32 = 0x000F_FFFF;

/// Code page reported for UTF-8 collations.
pub const CODE_PAGE_UTF8: u16 = 65001;

/// Alternate-sort LCIDs that must be retried under another id.
///
/// The list reflects what older platform locale tables dropped. It is kept
/// exactly as observed and is not assumed to be exhaustive.
pub const LEGACY_LCID_REMAP: &[(u32, u32)] = &[
    (0x10404, 0x10404 & 0x3FFF),
    (0x10804, 0x10804 & 0x3FFF),
    (0x10C04, 0x10C04 & 0x3FFF),
    (0x11004, 0x11004 & 0x3FFF),
    (0x11404, 0x11404 & 0x3FFF),
    (0x10411, 0x10411 & 0x3FFF),
    (0x10412, 0x10412 & 0x3FFF),
    (0x00827, 0x00427),
];

/// SQL Server collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Collation {
    /// Info word: LCID, comparison flags, version.
    pub info: u32,
    /// SQL sort order id; 0 for Windows collations.
    pub sort_id: u8,
}

impl Collation {
    /// Wire size in bytes.
    pub const SIZE: usize = 5;

    /// Build a collation from its parts.
    #[must_use]
    pub const fn new(info: u32, sort_id: u8) -> Self {
        Self { info, sort_id }
    }

    /// Decode the 5-byte wire form.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let info = r.read_u32_le()?;
        let sort_id = r.read_u8()?;
        Ok(Self { info, sort_id })
    }

    /// Decode from a byte slice (the ENVCHANGE collation payload).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                what: "collation",
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            info: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sort_id: bytes[4],
        })
    }

    /// Encode the 5-byte wire form.
    pub fn encode(&self, dst: &mut impl bytes::BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }

    /// LCID including sort version bits.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & LCID_MASK
    }

    /// Whether this is a UTF-8 collation.
    #[must_use]
    pub const fn is_utf8(&self) -> bool {
        self.info & COLLATION_FLAG_UTF8 != 0
    }

    /// Resolve the Windows code page for single-byte character data.
    pub fn code_page(&self) -> Result<u16, ProtocolError> {
        if self.is_utf8() {
            return Ok(CODE_PAGE_UTF8);
        }
        if self.sort_id != 0 {
            return code_page_for_sort_id(self.sort_id).ok_or(ProtocolError::InvalidField {
                field: "collation sort id",
                value: u64::from(self.sort_id),
            });
        }
        code_page_for_lcid(self.lcid()).ok_or(ProtocolError::InvalidField {
            field: "collation LCID",
            value: u64::from(self.lcid()),
        })
    }

    /// Character encoding for single-byte character data.
    #[cfg(feature = "encoding")]
    pub fn encoding(&self) -> Result<&'static Encoding, ProtocolError> {
        let code_page = self.code_page()?;
        encoding_for_code_page(code_page).ok_or(ProtocolError::InvalidField {
            field: "collation code page",
            value: u64::from(code_page),
        })
    }
}

/// Apply the legacy remap table to an LCID.
#[must_use]
pub fn remap_legacy_lcid(lcid: u32) -> u32 {
    LEGACY_LCID_REMAP
        .iter()
        .find(|(from, _)| *from == lcid)
        .map_or(lcid, |(_, to)| *to)
}

/// Code page for a SQL sort order id.
#[must_use]
pub fn code_page_for_sort_id(sort_id: u8) -> Option<u16> {
    match sort_id {
        30..=34 => Some(437),
        40..=44 | 49 | 55..=61 => Some(850),
        50..=54 | 71 | 183..=186 => Some(1252),
        80..=96 => Some(1250),
        104..=108 => Some(1251),
        112..=114 | 120..=124 => Some(1253),
        128..=130 => Some(1254),
        136..=138 => Some(1255),
        144..=146 => Some(1256),
        152..=160 => Some(1257),
        192..=193 | 200..=201 => Some(932),
        194..=195 | 202..=203 => Some(949),
        196..=197 | 204..=205 => Some(950),
        198..=199 | 206..=207 => Some(936),
        208..=210 => Some(874),
        _ => None,
    }
}

/// Code page for an LCID, after legacy remapping.
#[must_use]
pub fn code_page_for_lcid(lcid: u32) -> Option<u16> {
    let lcid = remap_legacy_lcid(lcid);
    let language = lcid & 0xFFFF;

    match language {
        0x0411 => Some(932),
        0x0804 | 0x1004 => Some(936),
        0x0404 | 0x0C04 | 0x1404 => Some(950),
        0x0412 => Some(949),
        0x041E => Some(874),
        0x042A => Some(1258),

        0x0405 | 0x0415 | 0x040E | 0x041A | 0x081A | 0x141A | 0x101A | 0x041B | 0x0424 | 0x0418
        | 0x041C => Some(1250),

        0x0419 | 0x0422 | 0x0423 | 0x0402 | 0x042F | 0x0C1A | 0x201A | 0x0440 | 0x0843 | 0x0444
        | 0x0450 | 0x0485 | 0x043F | 0x082C => Some(1251),

        0x0408 => Some(1253),
        0x041F | 0x042C => Some(1254),
        0x040D => Some(1255),

        0x0401 | 0x0801 | 0x0C01 | 0x1001 | 0x1401 | 0x1801 | 0x1C01 | 0x2001 | 0x2401 | 0x2801
        | 0x2C01 | 0x3001 | 0x3401 | 0x3801 | 0x3C01 | 0x4001 | 0x0429 | 0x0420 | 0x048C
        | 0x0463 => Some(1256),

        0x0425..=0x0427 => Some(1257),

        _ => western_code_page(language),
    }
}

/// Western European languages, matched on the primary language id.
fn western_code_page(language: u32) -> Option<u16> {
    match language & 0x03FF {
        0x03 | 0x06 | 0x07 | 0x09 | 0x0A | 0x0B | 0x0C | 0x0F | 0x10 | 0x13 | 0x14 | 0x16
        | 0x1D | 0x21 | 0x2D | 0x36 | 0x38 | 0x3E | 0x41 | 0x56 => Some(1252),
        _ => None,
    }
}

/// `encoding_rs` encoding for a Windows code page.
#[cfg(feature = "encoding")]
#[must_use]
pub fn encoding_for_code_page(code_page: u16) -> Option<&'static Encoding> {
    match code_page {
        874 => Some(encoding_rs::WINDOWS_874),
        932 => Some(encoding_rs::SHIFT_JIS),
        936 => Some(encoding_rs::GB18030),
        949 => Some(encoding_rs::EUC_KR),
        950 => Some(encoding_rs::BIG5),
        1250 => Some(encoding_rs::WINDOWS_1250),
        1251 => Some(encoding_rs::WINDOWS_1251),
        1252 => Some(encoding_rs::WINDOWS_1252),
        1253 => Some(encoding_rs::WINDOWS_1253),
        1254 => Some(encoding_rs::WINDOWS_1254),
        1255 => Some(encoding_rs::WINDOWS_1255),
        1256 => Some(encoding_rs::WINDOWS_1256),
        1257 => Some(encoding_rs::WINDOWS_1257),
        1258 => Some(encoding_rs::WINDOWS_1258),
        CODE_PAGE_UTF8 => Some(encoding_rs::UTF_8),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_little_endian_info_then_sort_id() {
        let bytes = [0x09, 0x04, 0xD0, 0x00, 0x34];
        let mut r = Reader::new(&bytes);
        let c = Collation::decode(&mut r).unwrap();
        assert_eq!(c.info, 0x00D0_0409);
        assert_eq!(c.lcid(), 0x0409);
        assert_eq!(c.sort_id, 0x34);
    }

    #[test]
    fn sort_id_wins_over_lcid() {
        let c = Collation::new(0x0411, 52);
        assert_eq!(c.code_page().unwrap(), 1252);
    }

    #[test]
    fn utf8_flag() {
        let c = Collation::new(0x0800_0409, 0);
        assert!(c.is_utf8());
        assert_eq!(c.code_page().unwrap(), CODE_PAGE_UTF8);
    }

    #[test]
    fn legacy_east_asian_sorts_are_masked() {
        assert_eq!(code_page_for_lcid(0x10411), Some(932));
        assert_eq!(code_page_for_lcid(0x10412), Some(949));
        assert_eq!(code_page_for_lcid(0x10804), Some(936));
        assert_eq!(code_page_for_lcid(0x10404), Some(950));
        assert_eq!(code_page_for_lcid(0x11404), Some(950));
    }

    #[test]
    fn legacy_lithuanian_is_redirected() {
        assert_eq!(remap_legacy_lcid(0x0827), 0x0427);
        assert_eq!(code_page_for_lcid(0x0827), Some(1257));
    }

    #[test]
    fn remap_leaves_other_ids_alone() {
        assert_eq!(remap_legacy_lcid(0x0409), 0x0409);
        assert_eq!(remap_legacy_lcid(0x10407), 0x10407);
    }

    #[test]
    fn western_languages_by_primary_id() {
        assert_eq!(code_page_for_lcid(0x0409), Some(1252));
        assert_eq!(code_page_for_lcid(0x1C09), Some(1252));
        assert_eq!(code_page_for_lcid(0x10407), Some(1252));
    }

    #[test]
    fn unknown_lcid_is_an_error() {
        assert!(code_page_for_lcid(0x0439).is_none());
        assert!(Collation::new(0x0439, 0).code_page().is_err());
    }

    #[cfg(feature = "encoding")]
    #[test]
    fn encodings_decode_text() {
        let enc = Collation::new(0x0419, 0).encoding().unwrap();
        let (decoded, _, had_errors) = enc.decode(&[0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2]);
        assert!(!had_errors);
        assert_eq!(decoded, "Привет");

        let enc = Collation::new(0x0411, 0).encoding().unwrap();
        let (decoded, _, _) = enc.decode(&[0x93, 0xFA, 0x96, 0x7B, 0x8C, 0xEA]);
        assert_eq!(decoded, "日本語");
    }

    #[cfg(feature = "encoding")]
    #[test]
    fn code_page_without_encoding_is_reported() {
        assert!(Collation::new(0x0409, 30).encoding().is_err());
    }
}
