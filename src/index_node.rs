// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use memoffset::offset_of;

use crate::collation::NtfsCollationRule;
use crate::error::{NtfsError, Result};
use crate::helpers::align_up_8;
use crate::types::Vcn;

/// Size of all [`IndexNodeHeader`] fields plus some reserved bytes.
pub(crate) const INDEX_NODE_HEADER_SIZE: usize = 16;

#[repr(C, packed)]
pub(crate) struct IndexNodeHeader {
    pub(crate) entries_offset: u32,
    pub(crate) index_size: u32,
    pub(crate) allocated_size: u32,
    pub(crate) flags: u8,
}

const HAS_SUBNODES_FLAG: u8 = 0x01;

/// Size of all [`IndexEntryHeader`] fields plus some reserved bytes.
const INDEX_ENTRY_HEADER_SIZE: usize = 16;

#[repr(C, packed)]
struct IndexEntryHeader {
    data_offset: u16,
    data_length: u16,
    reserved: u32,
    index_entry_length: u16,
    key_length: u16,
    flags: u8,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct NtfsIndexEntryFlags: u8 {
        /// This index entry points to a sub-node.
        const HAS_SUBNODE = 0x01;
        /// This is the last index entry in the list.
        const LAST_ENTRY = 0x02;
    }
}

/// One entry of an index node: a key, its data, and (in internal nodes) a
/// reference to the sub-node holding all keys collating before this one.
///
/// Every node is terminated by a synthetic "End" entry carrying no key or
/// data, only possibly a sub-node reference for the keys collating after
/// all real entries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NtfsIndexEntry {
    key: Vec<u8>,
    data: Vec<u8>,
    subnode_vcn: Option<Vcn>,
    is_end: bool,
}

impl NtfsIndexEntry {
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            subnode_vcn: None,
            is_end: false,
        }
    }

    /// Creates the terminating entry of a node.
    pub fn new_end(subnode_vcn: Option<Vcn>) -> Self {
        Self {
            key: Vec::new(),
            data: Vec::new(),
            subnode_vcn,
            is_end: true,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_key_and_data(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.data)
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        debug_assert!(!self.is_end);
        self.data = data;
    }

    /// Replaces key and data, keeping the sub-node reference.
    /// This is how an internal entry is substituted by its in-order
    /// successor on removal.
    pub fn replace_key_and_data(&mut self, key: Vec<u8>, data: Vec<u8>) {
        debug_assert!(!self.is_end);
        self.key = key;
        self.data = data;
    }

    pub fn is_end(&self) -> bool {
        self.is_end
    }

    pub fn flags(&self) -> NtfsIndexEntryFlags {
        let mut flags = NtfsIndexEntryFlags::empty();
        if self.subnode_vcn.is_some() {
            flags |= NtfsIndexEntryFlags::HAS_SUBNODE;
        }
        if self.is_end {
            flags |= NtfsIndexEntryFlags::LAST_ENTRY;
        }
        flags
    }

    pub fn subnode_vcn(&self) -> Option<Vcn> {
        self.subnode_vcn
    }

    pub fn set_subnode_vcn(&mut self, subnode_vcn: Option<Vcn>) {
        self.subnode_vcn = subnode_vcn;
    }

    /// Byte size of this entry in its on-disk form.
    pub fn serialized_size(&self) -> usize {
        let mut size = align_up_8(INDEX_ENTRY_HEADER_SIZE + self.key.len() + self.data.len());
        if self.subnode_vcn.is_some() {
            size += core::mem::size_of::<i64>();
        }
        size
    }

    /// Parses one entry from the beginning of `slice`.
    /// Returns the entry and the number of bytes it occupied.
    pub(crate) fn from_slice(slice: &[u8], position: u64) -> Result<(Self, usize)> {
        if slice.len() < INDEX_ENTRY_HEADER_SIZE {
            return Err(NtfsError::InvalidIndexEntrySize {
                position,
                expected: INDEX_ENTRY_HEADER_SIZE as u16,
                actual: slice.len() as u16,
            });
        }

        let entry_length =
            LittleEndian::read_u16(&slice[offset_of!(IndexEntryHeader, index_entry_length)..])
                as usize;
        if entry_length < INDEX_ENTRY_HEADER_SIZE || entry_length > slice.len() {
            return Err(NtfsError::InvalidIndexEntrySize {
                position,
                expected: entry_length as u16,
                actual: slice.len() as u16,
            });
        }

        let flags = NtfsIndexEntryFlags::from_bits_truncate(
            slice[offset_of!(IndexEntryHeader, flags)],
        );
        let is_end = flags.contains(NtfsIndexEntryFlags::LAST_ENTRY);

        let subnode_vcn = if flags.contains(NtfsIndexEntryFlags::HAS_SUBNODE) {
            // The sub-node VCN sits in the last 8 bytes of the entry.
            let start = entry_length - core::mem::size_of::<i64>();
            if start < INDEX_ENTRY_HEADER_SIZE {
                return Err(NtfsError::InvalidIndexEntrySize {
                    position,
                    expected: (INDEX_ENTRY_HEADER_SIZE + core::mem::size_of::<i64>()) as u16,
                    actual: entry_length as u16,
                });
            }
            Some(Vcn::from(LittleEndian::read_i64(&slice[start..])))
        } else {
            None
        };

        let (key, data) = if is_end {
            (Vec::new(), Vec::new())
        } else {
            let key_length =
                LittleEndian::read_u16(&slice[offset_of!(IndexEntryHeader, key_length)..]) as usize;
            let key_range = INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + key_length;
            if key_range.end > entry_length {
                return Err(NtfsError::InvalidIndexEntryDataRange {
                    position,
                    range: key_range,
                    size: entry_length as u16,
                });
            }

            let data_offset =
                LittleEndian::read_u16(&slice[offset_of!(IndexEntryHeader, data_offset)..])
                    as usize;
            let data_length =
                LittleEndian::read_u16(&slice[offset_of!(IndexEntryHeader, data_length)..])
                    as usize;
            let data_range = data_offset..data_offset + data_length;
            if data_length > 0 && (data_range.start < key_range.end || data_range.end > entry_length)
            {
                return Err(NtfsError::InvalidIndexEntryDataRange {
                    position,
                    range: data_range,
                    size: entry_length as u16,
                });
            }

            (
                slice[key_range].to_vec(),
                slice[data_range].to_vec(),
            )
        };

        Ok((
            Self {
                key,
                data,
                subnode_vcn,
                is_end,
            },
            entry_length,
        ))
    }

    /// Appends the on-disk form of this entry to `buffer`.
    pub(crate) fn write_to(&self, buffer: &mut Vec<u8>) {
        let entry_length = self.serialized_size();
        let data_offset = if self.data.is_empty() {
            0
        } else {
            INDEX_ENTRY_HEADER_SIZE + self.key.len()
        };

        let start = buffer.len();
        buffer.resize(start + entry_length, 0);
        let entry = &mut buffer[start..];

        LittleEndian::write_u16(
            &mut entry[offset_of!(IndexEntryHeader, data_offset)..],
            data_offset as u16,
        );
        LittleEndian::write_u16(
            &mut entry[offset_of!(IndexEntryHeader, data_length)..],
            self.data.len() as u16,
        );
        LittleEndian::write_u16(
            &mut entry[offset_of!(IndexEntryHeader, index_entry_length)..],
            entry_length as u16,
        );
        LittleEndian::write_u16(
            &mut entry[offset_of!(IndexEntryHeader, key_length)..],
            self.key.len() as u16,
        );
        entry[offset_of!(IndexEntryHeader, flags)] = self.flags().bits();

        entry[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + self.key.len()]
            .copy_from_slice(&self.key);
        if !self.data.is_empty() {
            entry[data_offset..data_offset + self.data.len()].copy_from_slice(&self.data);
        }

        if let Some(vcn) = self.subnode_vcn {
            let vcn_start = entry_length - core::mem::size_of::<i64>();
            LittleEndian::write_i64(&mut entry[vcn_start..], vcn.value());
        }
    }
}

/// Outcome of locating a key within one node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EntryLookup {
    /// The key is at this entry index.
    Found(usize),
    /// The key is not in this node; it would be inserted at this entry
    /// index, and in an internal node the descent continues through the
    /// sub-node of the entry at this index.
    NotFound(usize),
}

/// One B-tree node: the ordered entry list of either the resident index
/// root or one Index Record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexNode {
    entries: Vec<NtfsIndexEntry>,
}

impl IndexNode {
    /// Creates an empty leaf node, holding only the End entry.
    pub fn new() -> Self {
        Self {
            entries: vec![NtfsIndexEntry::new_end(None)],
        }
    }

    pub(crate) fn from_entries(entries: Vec<NtfsIndexEntry>) -> Self {
        debug_assert!(matches!(entries.last(), Some(e) if e.is_end()));
        Self { entries }
    }

    pub fn entries(&self) -> &[NtfsIndexEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<NtfsIndexEntry> {
        &mut self.entries
    }

    /// Number of real (non-End) entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_leaf(&self) -> bool {
        self.entries.iter().all(|e| e.subnode_vcn().is_none())
    }

    pub fn has_children(&self) -> bool {
        !self.is_leaf()
    }

    /// Total byte size of all entries in their on-disk form.
    pub fn entry_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.serialized_size()).sum()
    }

    /// Binary-searches the real entries under the given collation rule.
    pub(crate) fn locate(&self, rule: NtfsCollationRule, key: &[u8]) -> EntryLookup {
        let real_entries = &self.entries[..self.entries.len() - 1];

        match real_entries.binary_search_by(|entry| rule.cmp(entry.key(), key)) {
            Ok(index) => EntryLookup::Found(index),
            Err(index) => EntryLookup::NotFound(index),
        }
    }

    /// Parses a node from its on-disk form: a node header followed by the
    /// entry list.
    /// `position` is the absolute byte position of the node header.
    pub fn from_slice(data: &[u8], position: u64) -> Result<Self> {
        if data.len() < INDEX_NODE_HEADER_SIZE {
            return Err(NtfsError::BufferTooSmall {
                expected: INDEX_NODE_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let entries_offset =
            LittleEndian::read_u32(&data[offset_of!(IndexNodeHeader, entries_offset)..]) as usize;
        let index_size =
            LittleEndian::read_u32(&data[offset_of!(IndexNodeHeader, index_size)..]) as usize;
        let allocated_size =
            LittleEndian::read_u32(&data[offset_of!(IndexNodeHeader, allocated_size)..]) as usize;

        if index_size > allocated_size {
            return Err(NtfsError::InvalidIndexUsedSize {
                position,
                expected: index_size as u32,
                actual: allocated_size as u32,
            });
        }
        if entries_offset < INDEX_NODE_HEADER_SIZE || index_size > data.len() {
            return Err(NtfsError::InvalidIndexAllocatedSize {
                position,
                expected: index_size as u32,
                actual: data.len() as u32,
            });
        }

        let mut entries = Vec::new();
        let mut offset = entries_offset;

        loop {
            let (entry, consumed) =
                NtfsIndexEntry::from_slice(&data[offset..index_size], position + offset as u64)?;
            let is_end = entry.is_end();
            entries.push(entry);
            offset += consumed;

            if is_end {
                break;
            }
        }

        Ok(Self { entries })
    }

    /// Serializes this node into `buffer`, placing entries at
    /// `entries_offset` from the node header.
    /// The buffer length is recorded as the allocated size.
    /// Returns the used size.
    pub fn serialize_into(&self, buffer: &mut [u8], entries_offset: usize) -> Result<u32> {
        let used_size = entries_offset + self.entry_bytes();
        if used_size > buffer.len() {
            return Err(NtfsError::BufferTooSmall {
                expected: used_size,
                actual: buffer.len(),
            });
        }

        let mut entry_bytes = Vec::with_capacity(self.entry_bytes());
        for entry in &self.entries {
            entry.write_to(&mut entry_bytes);
        }

        LittleEndian::write_u32(
            &mut buffer[offset_of!(IndexNodeHeader, entries_offset)..],
            entries_offset as u32,
        );
        LittleEndian::write_u32(
            &mut buffer[offset_of!(IndexNodeHeader, index_size)..],
            used_size as u32,
        );
        let allocated_size = buffer.len() as u32;
        LittleEndian::write_u32(
            &mut buffer[offset_of!(IndexNodeHeader, allocated_size)..],
            allocated_size,
        );
        buffer[offset_of!(IndexNodeHeader, flags)] = if self.has_children() {
            HAS_SUBNODES_FLAG
        } else {
            0
        };

        buffer[entries_offset..used_size].copy_from_slice(&entry_bytes);

        Ok(used_size as u32)
    }
}

impl Default for IndexNode {
    fn default() -> Self {
        Self::new()
    }
}
