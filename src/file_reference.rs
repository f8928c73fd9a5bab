// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

/// An absolute reference to a File Record within the Master File Table
/// (MFT), packing a 48-bit record number and a 16-bit sequence number into
/// 8 bytes.
///
/// The sequence number invalidates stale references after an MFT slot has
/// been reused.
/// Ordering is by raw little-endian value.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NtfsFileReference(u64);

impl NtfsFileReference {
    pub const fn new(file_record_number: u64, sequence_number: u16) -> Self {
        Self((file_record_number & 0xffff_ffff_ffff) | ((sequence_number as u64) << 48))
    }

    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub const fn file_record_number(&self) -> u64 {
        self.0 & 0xffff_ffff_ffff
    }

    pub const fn sequence_number(&self) -> u16 {
        (self.0 >> 48) as u16
    }
}

/// A reference to one attribute instance, as stored in `$ATTRIBUTE_LIST`
/// entries: the File Record holding the attribute plus the attribute's
/// instance id within that record.
///
/// Ordered lexicographically by file reference, then attribute id.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NtfsAttributeReference {
    file_reference: NtfsFileReference,
    attribute_id: u16,
}

impl NtfsAttributeReference {
    pub const fn new(file_reference: NtfsFileReference, attribute_id: u16) -> Self {
        Self {
            file_reference,
            attribute_id,
        }
    }

    pub const fn attribute_id(&self) -> u16 {
        self.attribute_id
    }

    pub const fn file_reference(&self) -> NtfsFileReference {
        self.file_reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_reference_packing() {
        let reference = NtfsFileReference::new(0x0000_1234_5678_9abc, 0xfeed);
        assert_eq!(reference.file_record_number(), 0x0000_1234_5678_9abc);
        assert_eq!(reference.sequence_number(), 0xfeed);

        let round_tripped = NtfsFileReference::from_le_bytes(reference.to_le_bytes());
        assert_eq!(round_tripped, reference);
    }

    #[test]
    fn test_reference_ordering() {
        // A reused slot (higher sequence number) must order after the stale
        // reference to the same record number.
        let stale = NtfsFileReference::new(5, 1);
        let reused = NtfsFileReference::new(5, 2);
        assert!(stale < reused);

        let a = NtfsAttributeReference::new(stale, 7);
        let b = NtfsAttributeReference::new(stale, 8);
        let c = NtfsAttributeReference::new(reused, 0);
        assert!(a < b && b < c);
    }
}
