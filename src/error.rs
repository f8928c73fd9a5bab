// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::types::{Lcn, Vcn};
use core::ops::Range;
use displaydoc::Display;
use std::io;

/// Central result type of ntfs-meta.
pub type Result<T, E = NtfsError> = core::result::Result<T, E>;

/// Central error type of ntfs-meta.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum NtfsError {
    /// The cluster allocator has only {free} free clusters left, but {requested} were requested
    BitmapExhausted { requested: u64, free: u64 },
    /// The given buffer should have at least {expected} bytes, but it only has {actual} bytes
    BufferTooSmall { expected: usize, actual: usize },
    /// The cluster range starting at VCN {vcn} spanning {cluster_count} clusters contains unallocated clusters and cannot be written
    ClustersNotAllocated { vcn: Vcn, cluster_count: u64 },
    /// The compression unit size of {cluster_count} clusters is not a power of two
    InvalidCompressionUnitSize { cluster_count: u64 },
    /// The NTFS Data Run header at byte position {position:#010x} indicates a maximum byte count of {expected}, but {actual} is the limit
    InvalidByteCountInDataRunHeader {
        position: u64,
        expected: u8,
        actual: u8,
    },
    /// The cluster count {cluster_count} is too big
    InvalidClusterCount { cluster_count: u64 },
    /// The NTFS Data Run with a cluster count of {cluster_count} cannot be encoded
    InvalidDataRunCount { cluster_count: u64 },
    /// The NTFS Index Record at byte position {position:#010x} indicates an allocated size of {expected} bytes, but the record only has a size of {actual} bytes
    InvalidIndexAllocatedSize {
        position: u64,
        expected: u32,
        actual: u32,
    },
    /// The NTFS Index Entry at byte position {position:#010x} references a data field in the range {range:?}, but the entry only has a size of {size} bytes
    InvalidIndexEntryDataRange {
        position: u64,
        range: Range<usize>,
        size: u16,
    },
    /// The NTFS Index Entry at byte position {position:#010x} reports a size of {expected} bytes, but it only has {actual} bytes
    InvalidIndexEntrySize {
        position: u64,
        expected: u16,
        actual: u16,
    },
    /// The NTFS Index Record at byte position {position:#010x} should have signature {expected:?}, but it has signature {actual:?}
    InvalidIndexSignature {
        position: u64,
        expected: &'static [u8],
        actual: [u8; 4],
    },
    /// The NTFS Index Record at byte position {position:#010x} indicates a used size of {expected} bytes, but only {actual} bytes are allocated
    InvalidIndexUsedSize {
        position: u64,
        expected: u32,
        actual: u32,
    },
    /// An Index Record size of {index_record_size} bytes is invalid for a cluster size of {cluster_size} bytes
    InvalidIndexRecordSize {
        index_record_size: u32,
        cluster_size: u32,
    },
    /// The resident root budget of {resident_budget} bytes is outside the usable range for an Index Record entry capacity of {capacity} bytes
    InvalidResidentBudget { resident_budget: u32, capacity: u32 },
    /// The record at byte position {position:#010x} declares a size of {expected} bytes, but only {actual} bytes were given
    InvalidRecordSize {
        position: u64,
        expected: usize,
        actual: usize,
    },
    /// A sector size of {sector_size} bytes or a cluster size of {cluster_size} bytes is unsupported
    InvalidVolumeGeometry { sector_size: u16, cluster_size: u32 },
    /// The Update Sequence Count {update_sequence_count} of the record at byte position {position:#010x} is invalid
    InvalidUpdateSequenceCount {
        position: u64,
        update_sequence_count: u16,
    },
    /// The Update Sequence Number of the record at byte position {position:#010x} is located in the range {range:?}, which exceeds the record size of {size} bytes
    InvalidUpdateSequenceNumberRange {
        position: u64,
        range: Range<usize>,
        size: usize,
    },
    /// The VCN {vcn} read from the NTFS Data Run header at byte position {position:#010x} cannot be added to the LCN {previous_lcn} calculated from previous data runs
    InvalidVcnInDataRunHeader {
        position: u64,
        vcn: Vcn,
        previous_lcn: Lcn,
    },
    /// The Index Entry with a serialized size of {size} bytes cannot fit into an Index Record with an entry capacity of {capacity} bytes
    IndexEntryTooLarge { size: usize, capacity: usize },
    /// I/O error: {0:?}
    Io(io::Error),
    /// The Logical Cluster Number (LCN) {lcn} is too big to be processed
    LcnTooBig { lcn: Lcn },
    /// The Logical Cluster Number (LCN) {lcn} is outside the volume or not allocated
    LcnNotAllocated { lcn: Lcn },
    /// The Index Record at byte position {position:#010x} contains no entries where at least one was expected
    EmptyIndexNode { position: u64 },
    /// The index root at byte position {position:#010x} has sub-nodes, but no matching index allocation stream was provided
    MissingIndexAllocation { position: u64 },
    /// The collation rule value {actual:#010x} is not supported
    UnsupportedCollationRule { actual: u32 },
    /// The Update Sequence Array (USA) of the record at byte position {position:#010x} has entries for {array_count} sectors of {sector_size} bytes, but the record is only {record_size} bytes long
    UpdateSequenceArrayExceedsRecordSize {
        position: u64,
        array_count: u16,
        sector_size: u16,
        record_size: usize,
    },
    /// Sector corruption: The 2 bytes at byte position {position:#010x} should match the Update Sequence Number (USN) {expected:?}, but they are {actual:?}
    UpdateSequenceNumberMismatch {
        position: u64,
        expected: [u8; 2],
        actual: [u8; 2],
    },
    /// The Index Record at byte position {position:#010x} should have the Virtual Cluster Number (VCN) {expected}, but a record with VCN {actual} is found at that offset
    VcnMismatchInIndexRecord {
        position: u64,
        expected: Vcn,
        actual: Vcn,
    },
    /// The Virtual Cluster Number (VCN) {vcn} is negative, which is invalid in this place
    VcnIsNegative { vcn: Vcn },
    /// The cluster range starting at VCN {vcn} spanning {cluster_count} clusters exceeds the covered extent of {total} clusters
    VcnOutOfBounds {
        vcn: Vcn,
        cluster_count: u64,
        total: u64,
    },
    /// The Virtual Cluster Number (VCN) {vcn} is too big to be processed
    VcnTooBig { vcn: Vcn },
}

impl From<io::Error> for NtfsError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

// To stay compatible with standardized interfaces (e.g. io::Read, io::Seek),
// we sometimes need to convert from NtfsError to io::Error.
impl From<NtfsError> for io::Error {
    fn from(error: NtfsError) -> Self {
        if let NtfsError::Io(io_error) = error {
            io_error
        } else {
            io::Error::new(io::ErrorKind::Other, error)
        }
    }
}

impl std::error::Error for NtfsError {}
