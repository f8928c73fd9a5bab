// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::mem;

use byteorder::{ByteOrder, LittleEndian};
use memoffset::{offset_of, span_of};

use crate::error::{NtfsError, Result};

/// Size of all [`RecordHeader`] fields.
pub(crate) const RECORD_HEADER_SIZE: usize = 16;

#[repr(C, packed)]
pub(crate) struct RecordHeader {
    signature: [u8; 4],
    update_sequence_offset: u16,
    update_sequence_count: u16,
    logfile_sequence_number: u64,
}

/// A multi-sector record protected by an Update Sequence Array (USA).
///
/// Before such a record is written to disk, the last 2 bytes of each sector
/// are saved into the array and overwritten with a shared Update Sequence
/// Number (USN).
/// A torn write then leaves at least one sector whose trailing bytes no
/// longer match the USN, which [`Record::fixup`] detects on the next read.
///
/// File Records and Index Records both embed this framing; the payload
/// codec on top of it is theirs.
#[derive(Clone, Debug)]
pub struct Record {
    data: Vec<u8>,
    position: u64,
    sector_size: u16,
}

impl Record {
    /// Frames an existing on-disk record buffer.
    ///
    /// The caller is expected to validate the signature and call
    /// [`Record::fixup`] before parsing the payload.
    pub fn new(data: Vec<u8>, position: u64, sector_size: u16) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(NtfsError::InvalidRecordSize {
                position,
                expected: RECORD_HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            position,
            sector_size,
        })
    }

    /// Creates a fresh zeroed record of `sector_count` sectors with the
    /// given signature and Update Sequence Array location.
    pub fn create(
        signature: [u8; 4],
        update_sequence_offset: u16,
        sector_size: u16,
        sector_count: u16,
    ) -> Self {
        let mut data = vec![0u8; sector_size as usize * sector_count as usize];
        data[span_of!(RecordHeader, signature)].copy_from_slice(&signature);

        // The Update Sequence Count includes the USN element itself.
        let update_sequence_count = sector_count + 1;
        LittleEndian::write_u16(
            &mut data[offset_of!(RecordHeader, update_sequence_offset)..],
            update_sequence_offset,
        );
        LittleEndian::write_u16(
            &mut data[offset_of!(RecordHeader, update_sequence_count)..],
            update_sequence_count,
        );

        Self {
            data,
            position: 0,
            sector_size,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Verifies each sector's trailing USN and restores the real trailing
    /// bytes from the Update Sequence Array.
    ///
    /// On a USN mismatch, the remaining sectors are still restored before
    /// the corruption error is reported, so that a caller following a
    /// log-and-continue recovery policy can keep using the payload.
    pub fn fixup(&mut self) -> Result<()> {
        let update_sequence_number = self.update_sequence_number()?;
        let array_count = self.update_sequence_array_count()?;
        let (array_start, array_end) = self.update_sequence_array_range(array_count)?;

        let mut mismatch = None;
        let mut array_position = array_start;

        // The Update Sequence Number (USN) is written to the last 2 bytes of each sector.
        let mut sector_position = self.sector_size as usize - mem::size_of::<u16>();

        while array_position < array_end {
            let array_position_end = array_position + mem::size_of::<u16>();
            let sector_position_end = sector_position + mem::size_of::<u16>();

            // The array contains the actual 2 bytes that need to be at `sector_position` after the fixup.
            let new_bytes: [u8; 2] = self.data[array_position..array_position_end]
                .try_into()
                .unwrap();

            // The current 2 bytes at `sector_position` before the fixup should equal the Update Sequence Number (USN).
            // Otherwise, this sector is corrupted.
            let bytes_to_update = &mut self.data[sector_position..sector_position_end];
            if bytes_to_update != update_sequence_number && mismatch.is_none() {
                mismatch = Some(NtfsError::UpdateSequenceNumberMismatch {
                    position: self.position + sector_position as u64,
                    expected: update_sequence_number,
                    actual: (&*bytes_to_update).try_into().unwrap(),
                });
            }

            // Perform the actual fixup.
            bytes_to_update.copy_from_slice(&new_bytes);

            // Advance to the next array entry and sector.
            array_position += mem::size_of::<u16>();
            sector_position += self.sector_size as usize;
        }

        match mismatch {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Protects this record for writing: saves each sector's current
    /// trailing 2 bytes into the Update Sequence Array and overwrites them
    /// with the given fresh USN.
    ///
    /// Callers supply a monotonically increasing `usn` per rewrite, so that
    /// a write torn across sectors mixes old and new USNs and fails the
    /// next [`Record::fixup`].
    pub fn insert_fixup(&mut self, usn: u16) -> Result<()> {
        let array_count = self.update_sequence_array_count()?;
        let (array_start, array_end) = self.update_sequence_array_range(array_count)?;

        let usn_bytes = usn.to_le_bytes();
        let usn_start = self.update_sequence_offset() as usize;
        self.data[usn_start..usn_start + mem::size_of::<u16>()].copy_from_slice(&usn_bytes);

        let mut array_position = array_start;
        let mut sector_position = self.sector_size as usize - mem::size_of::<u16>();

        while array_position < array_end {
            let array_position_end = array_position + mem::size_of::<u16>();
            let sector_position_end = sector_position + mem::size_of::<u16>();

            let saved_bytes: [u8; 2] = self.data[sector_position..sector_position_end]
                .try_into()
                .unwrap();
            self.data[array_position..array_position_end].copy_from_slice(&saved_bytes);
            self.data[sector_position..sector_position_end].copy_from_slice(&usn_bytes);

            array_position += mem::size_of::<u16>();
            sector_position += self.sector_size as usize;
        }

        Ok(())
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> u32 {
        // A record is never larger than a u32.
        // Usually, it shouldn't even exceed a u16, but our code can handle that.
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn logfile_sequence_number(&self) -> u64 {
        let start = offset_of!(RecordHeader, logfile_sequence_number);
        LittleEndian::read_u64(&self.data[start..])
    }

    pub fn set_logfile_sequence_number(&mut self, lsn: u64) {
        let start = offset_of!(RecordHeader, logfile_sequence_number);
        LittleEndian::write_u64(&mut self.data[start..], lsn);
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn signature(&self) -> [u8; 4] {
        self.data[span_of!(RecordHeader, signature)]
            .try_into()
            .unwrap()
    }

    fn update_sequence_array_count(&self) -> Result<u16> {
        let start = offset_of!(RecordHeader, update_sequence_count);
        let update_sequence_count = LittleEndian::read_u16(&self.data[start..]);

        // Subtract the Update Sequence Number (USN) element, so that only the number of array elements remains.
        update_sequence_count
            .checked_sub(1)
            .ok_or(NtfsError::InvalidUpdateSequenceCount {
                position: self.position,
                update_sequence_count,
            })
    }

    /// Returns the byte range of the Update Sequence Array after validating
    /// that both the array and the sectors it covers fit into this record.
    fn update_sequence_array_range(&self, array_count: u16) -> Result<(usize, usize)> {
        let array_start = self.update_sequence_offset() as usize + mem::size_of::<u16>();
        let array_end = array_start + array_count as usize * mem::size_of::<u16>();
        let sectors_end = array_count as usize * self.sector_size as usize;

        if array_end > self.data.len() || sectors_end > self.data.len() {
            return Err(NtfsError::UpdateSequenceArrayExceedsRecordSize {
                position: self.position,
                array_count,
                sector_size: self.sector_size,
                record_size: self.data.len(),
            });
        }

        Ok((array_start, array_end))
    }

    fn update_sequence_number(&self) -> Result<[u8; 2]> {
        let start = self.update_sequence_offset() as usize;
        let end = start + mem::size_of::<u16>();
        self.data
            .get(start..end)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(NtfsError::InvalidUpdateSequenceNumberRange {
                position: self.position,
                range: start..end,
                size: self.data.len(),
            })
    }

    fn update_sequence_offset(&self) -> u16 {
        let start = offset_of!(RecordHeader, update_sequence_offset);
        LittleEndian::read_u16(&self.data[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Payload area begins past the record header and the Update Sequence
    // Array, which insert_fixup overwrites by design.
    const PAYLOAD_START: usize = 64;

    fn patterned_record(sector_size: u16, sector_count: u16) -> Record {
        let mut record =
            Record::create(*b"INDX", RECORD_HEADER_SIZE as u16, sector_size, sector_count);
        for (i, byte) in record.data_mut()[PAYLOAD_START..].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        record
    }

    #[test]
    fn test_fixup_round_trip() {
        let mut record = patterned_record(512, 4);
        let payload = record.data().to_vec();

        record.insert_fixup(0x1234).unwrap();
        // Each sector now ends in the USN.
        for sector in 1..=4usize {
            assert_eq!(&record.data()[sector * 512 - 2..sector * 512], &[0x34, 0x12]);
        }

        record.fixup().unwrap();
        assert_eq!(record.data()[PAYLOAD_START..], payload[PAYLOAD_START..]);
    }

    #[test]
    fn test_fixup_detects_torn_write() {
        let mut record = patterned_record(512, 4);
        record.insert_fixup(7).unwrap();

        // Simulate a torn write: the third sector still carries stale bytes.
        record.data_mut()[3 * 512 - 2..3 * 512].copy_from_slice(&[0xde, 0xad]);

        let err = record.fixup().unwrap_err();
        assert!(matches!(
            err,
            NtfsError::UpdateSequenceNumberMismatch {
                expected: [7, 0],
                actual: [0xde, 0xad],
                ..
            }
        ));
    }

    #[test]
    fn test_fixup_restores_despite_mismatch() {
        let mut record = patterned_record(512, 2);
        let payload = record.data().to_vec();
        record.insert_fixup(1).unwrap();

        record.data_mut()[511] ^= 0xff;
        assert!(record.fixup().is_err());

        // Per the recovery policy, the true bytes of every sector are
        // restored even when a mismatch is reported.
        assert_eq!(record.data()[PAYLOAD_START..512], payload[PAYLOAD_START..512]);
        assert_eq!(record.data()[512..1022], payload[512..1022]);
    }

    proptest! {
        #[test]
        fn test_fixup_round_trip_any_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..1984),
            usn in 1u16..,
        ) {
            let mut record = Record::create(*b"FILE", RECORD_HEADER_SIZE as u16, 512, 4);
            let len = payload.len();
            record.data_mut()[PAYLOAD_START..PAYLOAD_START + len].copy_from_slice(&payload);
            let before = record.data().to_vec();

            record.insert_fixup(usn).unwrap();
            record.fixup().unwrap();

            prop_assert_eq!(&record.data()[PAYLOAD_START..], &before[PAYLOAD_START..]);
        }

        #[test]
        fn test_corrupting_any_sector_is_detected(sector in 0usize..4, usn in 1u16..) {
            let mut record = patterned_record(512, 4);
            record.insert_fixup(usn).unwrap();

            let end = (sector + 1) * 512;
            record.data_mut()[end - 2] ^= 0x55;

            prop_assert!(record.fixup().is_err());
        }
    }
}
