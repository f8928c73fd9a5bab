// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NtfsError, Result};
use crate::helpers::align_up_8;
use crate::index_node::{IndexNode, INDEX_NODE_HEADER_SIZE};
use crate::record::{Record, RECORD_HEADER_SIZE};
use crate::types::Vcn;

/// Size of the Index Record header: the multi-sector record header plus
/// the record's own VCN.
const INDEX_RECORD_HEADER_SIZE: usize = RECORD_HEADER_SIZE + 8;

const INDEX_RECORD_SIGNATURE: &[u8; 4] = b"INDX";

/// One physical unit of an index's `$INDEX_ALLOCATION` stream: a B-tree
/// node framed as a fixup-protected multi-sector record, persisted at a
/// fixed VCN.
#[derive(Clone, Debug)]
pub struct NtfsIndexRecord {
    vcn: Vcn,
    logfile_sequence_number: u64,
    node: IndexNode,
    record_size: u32,
    sector_size: u16,
    position: u64,
}

impl NtfsIndexRecord {
    /// Initializes a fresh, empty Index Record at the given VCN.
    pub fn create(vcn: Vcn, record_size: u32, sector_size: u16) -> Result<Self> {
        Self::validate_geometry(record_size, sector_size)?;

        Ok(Self {
            vcn,
            logfile_sequence_number: 0,
            node: IndexNode::new(),
            record_size,
            sector_size,
            position: 0,
        })
    }

    /// Reads an Index Record from its raw on-disk bytes: validates the
    /// signature, applies the sector fixup, verifies the stored VCN
    /// against the one it was addressed by, and parses the node.
    pub fn from_bytes(
        data: Vec<u8>,
        position: u64,
        sector_size: u16,
        expected_vcn: Vcn,
    ) -> Result<Self> {
        let record_size = data.len() as u32;
        Self::validate_geometry(record_size, sector_size)?;

        let mut record = Record::new(data, position, sector_size)?;
        Self::validate_signature(&record)?;
        record.fixup()?;

        let vcn = Vcn::from(LittleEndian::read_i64(&record.data()[RECORD_HEADER_SIZE..]));
        if vcn != expected_vcn {
            return Err(NtfsError::VcnMismatchInIndexRecord {
                position,
                expected: expected_vcn,
                actual: vcn,
            });
        }

        let logfile_sequence_number = record.logfile_sequence_number();
        let node = IndexNode::from_slice(
            &record.data()[INDEX_RECORD_HEADER_SIZE..],
            position + INDEX_RECORD_HEADER_SIZE as u64,
        )?;

        Ok(Self {
            vcn,
            logfile_sequence_number,
            node,
            record_size,
            sector_size,
            position,
        })
    }

    /// Serializes this record, protecting it with the given fresh Update
    /// Sequence Number.
    pub fn to_bytes(&self, usn: u16) -> Result<Vec<u8>> {
        let sector_count = (self.record_size / self.sector_size as u32) as u16;
        // The Update Sequence Array lives between the node header and the
        // entry list.
        let usa_offset = (INDEX_RECORD_HEADER_SIZE + INDEX_NODE_HEADER_SIZE) as u16;
        let mut record = Record::create(
            *INDEX_RECORD_SIGNATURE,
            usa_offset,
            self.sector_size,
            sector_count,
        );
        record.set_logfile_sequence_number(self.logfile_sequence_number);
        record.set_position(self.position);
        LittleEndian::write_i64(
            &mut record.data_mut()[RECORD_HEADER_SIZE..],
            self.vcn.value(),
        );

        let entries_offset = Self::entries_offset(self.record_size, self.sector_size);
        let used = self
            .node
            .serialize_into(&mut record.data_mut()[INDEX_RECORD_HEADER_SIZE..], entries_offset)?;

        let capacity = Self::entry_capacity(self.record_size, self.sector_size);
        if self.node.entry_bytes() > capacity {
            return Err(NtfsError::InvalidIndexUsedSize {
                position: self.position,
                expected: used,
                actual: capacity as u32,
            });
        }

        record.insert_fixup(usn)?;
        Ok(record.into_data())
    }

    /// Offset of the entry list from the node header, leaving room for the
    /// Update Sequence Array.
    fn entries_offset(record_size: u32, sector_size: u16) -> usize {
        let sector_count = record_size / sector_size as u32;
        let usa_size = 2 * (sector_count as usize + 1);

        // The USA begins right after the node header.
        align_up_8(INDEX_NODE_HEADER_SIZE + usa_size)
    }

    /// The byte budget available for index entries in a record of the
    /// given geometry.
    pub fn entry_capacity(record_size: u32, sector_size: u16) -> usize {
        record_size as usize
            - INDEX_RECORD_HEADER_SIZE
            - Self::entries_offset(record_size, sector_size)
    }

    fn validate_geometry(record_size: u32, sector_size: u16) -> Result<()> {
        let valid = sector_size >= 256
            && record_size >= 2 * sector_size as u32
            && record_size % sector_size as u32 == 0;
        if !valid {
            return Err(NtfsError::InvalidIndexRecordSize {
                index_record_size: record_size,
                cluster_size: sector_size as u32,
            });
        }

        Ok(())
    }

    fn validate_signature(record: &Record) -> Result<()> {
        let signature = record.signature();
        if &signature == INDEX_RECORD_SIGNATURE {
            Ok(())
        } else {
            Err(NtfsError::InvalidIndexSignature {
                position: record.position(),
                expected: INDEX_RECORD_SIGNATURE,
                actual: signature,
            })
        }
    }

    pub fn logfile_sequence_number(&self) -> u64 {
        self.logfile_sequence_number
    }

    pub fn node(&self) -> &IndexNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut IndexNode {
        &mut self.node
    }

    pub fn into_node(self) -> IndexNode {
        self.node
    }

    pub fn set_node(&mut self, node: IndexNode) {
        self.node = node;
    }

    pub fn vcn(&self) -> Vcn {
        self.vcn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_node::NtfsIndexEntry;

    fn sample_record() -> NtfsIndexRecord {
        let mut record = NtfsIndexRecord::create(Vcn::from(2i64), 4096, 512).unwrap();
        let entries = record.node_mut().entries_mut();
        entries.insert(0, NtfsIndexEntry::new(b"alpha".to_vec(), b"a".to_vec()));
        entries.insert(1, NtfsIndexEntry::new(b"beta".to_vec(), b"b".to_vec()));
        record
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record();
        let bytes = record.to_bytes(0x42).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[..4], b"INDX");

        let reloaded =
            NtfsIndexRecord::from_bytes(bytes, 0, 512, Vcn::from(2i64)).unwrap();
        assert_eq!(reloaded.vcn(), Vcn::from(2i64));
        assert_eq!(reloaded.node(), record.node());
    }

    #[test]
    fn test_vcn_mismatch_is_detected() {
        let bytes = sample_record().to_bytes(1).unwrap();
        let err = NtfsIndexRecord::from_bytes(bytes, 0, 512, Vcn::from(3i64));
        assert!(matches!(
            err,
            Err(NtfsError::VcnMismatchInIndexRecord { .. })
        ));
    }

    #[test]
    fn test_torn_write_is_detected() {
        let mut bytes = sample_record().to_bytes(7).unwrap();
        bytes[2 * 512 - 1] ^= 0xff;

        let err = NtfsIndexRecord::from_bytes(bytes, 0, 512, Vcn::from(2i64));
        assert!(matches!(
            err,
            Err(NtfsError::UpdateSequenceNumberMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let mut bytes = sample_record().to_bytes(1).unwrap();
        bytes[..4].copy_from_slice(b"BAAD");

        let err = NtfsIndexRecord::from_bytes(bytes, 0, 512, Vcn::from(2i64));
        assert!(matches!(err, Err(NtfsError::InvalidIndexSignature { .. })));
    }
}
