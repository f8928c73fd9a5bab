// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use enumn::N;

use crate::error::{NtfsError, Result};

/// The collation rule of an index, determining the total order its keys
/// are kept in.
/// The discriminants are the values stored in the `$INDEX_ROOT` attribute.
#[derive(Clone, Copy, Debug, Eq, N, PartialEq)]
#[repr(u32)]
pub enum NtfsCollationRule {
    /// Plain byte-wise comparison.
    Binary = 0x00,
    /// Case-insensitive UTF-16LE comparison, used for file names.
    Filename = 0x01,
    /// Case-sensitive UTF-16LE comparison.
    UnicodeString = 0x02,
    /// A single little-endian u32, used for `$SII` and `$Q`.
    UnsignedLong = 0x10,
    /// A Security Identifier, compared by length, then content.
    Sid = 0x11,
    /// A security hash followed by a SID, used for `$SDH`.
    SecurityHash = 0x12,
    /// A sequence of little-endian u32s, used for `$O` (Object IDs).
    MultipleUnsignedLongs = 0x13,
}

impl NtfsCollationRule {
    /// Resolves an on-disk collation rule value.
    /// Unknown values fail to resolve, as they indicate a corrupt or
    /// unsupported index root.
    pub fn from_u32(value: u32) -> Result<Self> {
        Self::n(value).ok_or(NtfsError::UnsupportedCollationRule { actual: value })
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Compares two raw keys under this rule.
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Binary => a.cmp(b),
            Self::Filename => compare_utf16le(a, b, true),
            Self::UnicodeString => compare_utf16le(a, b, false),
            Self::UnsignedLong => read_u32_key(a).cmp(&read_u32_key(b)),
            Self::Sid => compare_sid(a, b),
            Self::SecurityHash => {
                // The hash comes first; the SID only breaks ties.
                read_u32_key(a)
                    .cmp(&read_u32_key(b))
                    .then_with(|| compare_sid(&a[4.min(a.len())..], &b[4.min(b.len())..]))
            }
            Self::MultipleUnsignedLongs => compare_u32_sequence(a, b),
        }
    }
}

fn read_u32_key(key: &[u8]) -> u32 {
    // Keys of integer-collated indexes are exactly 4 bytes; short keys
    // read as zero-padded so that comparison remains total.
    let mut buf = [0u8; 4];
    let len = key.len().min(4);
    buf[..len].copy_from_slice(&key[..len]);
    u32::from_le_bytes(buf)
}

fn compare_utf16le(a: &[u8], b: &[u8], case_insensitive: bool) -> Ordering {
    let a_units = a.chunks_exact(2).map(LittleEndian::read_u16);
    let b_units = b.chunks_exact(2).map(LittleEndian::read_u16);

    for (a_unit, b_unit) in a_units.clone().zip(b_units.clone()) {
        let (a_unit, b_unit) = if case_insensitive {
            (upcase(a_unit), upcase(b_unit))
        } else {
            (a_unit, b_unit)
        };

        match a_unit.cmp(&b_unit) {
            Ordering::Equal => continue,
            ordering => return ordering,
        }
    }

    a_units.len().cmp(&b_units.len())
}

/// Uppercases a single UTF-16 code unit the way the `$UpCase` table does
/// for the Basic Multilingual Plane: a plain code-unit mapping without
/// expansion.
fn upcase(unit: u16) -> u16 {
    match char::from_u32(unit as u32) {
        Some(c) => {
            let mut upper = c.to_uppercase();
            let first = upper.next().unwrap_or(c);
            if upper.next().is_none() && (first as u32) <= u16::MAX as u32 {
                first as u16
            } else {
                // Multi-unit expansions are not representable in a
                // code-unit table; such characters collate as themselves.
                unit
            }
        }
        None => unit,
    }
}

fn compare_sid(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_u32_sequence(a: &[u8], b: &[u8]) -> Ordering {
    let a_values = a.chunks_exact(4).map(LittleEndian::read_u32);
    let b_values = b.chunks_exact(4).map(LittleEndian::read_u32);

    for (a_value, b_value) in a_values.clone().zip(b_values.clone()) {
        match a_value.cmp(&b_value) {
            Ordering::Equal => continue,
            ordering => return ordering,
        }
    }

    a_values.len().cmp(&b_values.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn test_from_u32() {
        assert_eq!(
            NtfsCollationRule::from_u32(0x10).unwrap(),
            NtfsCollationRule::UnsignedLong
        );
        assert!(matches!(
            NtfsCollationRule::from_u32(0x20),
            Err(NtfsError::UnsupportedCollationRule { actual: 0x20 })
        ));
    }

    #[test]
    fn test_binary_collation() {
        let rule = NtfsCollationRule::Binary;
        assert_eq!(rule.cmp(b"abc", b"abd"), Ordering::Less);
        assert_eq!(rule.cmp(b"ab", b"abc"), Ordering::Less);
        assert_eq!(rule.cmp(b"ab", b"ab"), Ordering::Equal);
    }

    #[test]
    fn test_unicode_string_collation() {
        let rule = NtfsCollationRule::UnicodeString;
        assert_eq!(
            rule.cmp(&utf16le("Apple"), &utf16le("apple")),
            Ordering::Less
        );
        assert_eq!(
            rule.cmp(&utf16le("apple"), &utf16le("banana")),
            Ordering::Less
        );
    }

    #[test]
    fn test_filename_collation_is_case_insensitive() {
        let rule = NtfsCollationRule::Filename;
        assert_eq!(
            rule.cmp(&utf16le("Apple"), &utf16le("aPPLE")),
            Ordering::Equal
        );
        assert_eq!(
            rule.cmp(&utf16le("apple"), &utf16le("Banana")),
            Ordering::Less
        );
    }

    #[test]
    fn test_unsigned_long_collation() {
        let rule = NtfsCollationRule::UnsignedLong;
        // 0x0100 < 0x00ff would hold byte-wise, but not as u32.
        assert_eq!(
            rule.cmp(&0x0100u32.to_le_bytes(), &0x00ffu32.to_le_bytes()),
            Ordering::Greater
        );
    }

    #[test]
    fn test_sid_collation_compares_length_first() {
        let rule = NtfsCollationRule::Sid;
        assert_eq!(rule.cmp(b"\xff", b"\x00\x00"), Ordering::Less);
        assert_eq!(rule.cmp(b"\x01\x02", b"\x01\x03"), Ordering::Less);
    }

    #[test]
    fn test_multiple_unsigned_longs_collation() {
        let rule = NtfsCollationRule::MultipleUnsignedLongs;
        let a = [1u32, 2, 3].map(u32::to_le_bytes).concat();
        let b = [1u32, 2, 4].map(u32::to_le_bytes).concat();
        assert_eq!(rule.cmp(&a, &b), Ordering::Less);
        assert_eq!(rule.cmp(&a, &a.clone()), Ordering::Equal);
    }
}
