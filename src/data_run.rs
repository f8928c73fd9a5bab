// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::iter::FusedIterator;
use core::mem;

use crate::error::{NtfsError, Result};
use crate::types::{Lcn, Vcn};

/// One run of an attribute's cluster mapping, in the compact on-disk form:
/// a cluster count plus a signed LCN delta relative to the previous run's
/// start LCN.
///
/// Sparse runs carry no LCN delta at all; they map their clusters to
/// zeroed holes and do not advance the LCN chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NtfsDataRun {
    cluster_count: u64,
    lcn_offset: i64,
    is_sparse: bool,
}

impl NtfsDataRun {
    pub fn new_stored(cluster_count: u64, lcn_offset: i64) -> Self {
        Self {
            cluster_count,
            lcn_offset,
            is_sparse: false,
        }
    }

    pub fn new_sparse(cluster_count: u64) -> Self {
        Self {
            cluster_count,
            lcn_offset: 0,
            is_sparse: true,
        }
    }

    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    /// Truncates this run to the given cluster count.
    /// Only the length of a run is mutable; its offset is fixed once read.
    pub fn truncate(&mut self, cluster_count: u64) {
        debug_assert!(cluster_count <= self.cluster_count);
        self.cluster_count = cluster_count;
    }

    pub fn is_sparse(&self) -> bool {
        self.is_sparse
    }

    pub fn lcn_offset(&self) -> i64 {
        self.lcn_offset
    }

    /// Appends the encoded form of this run to `buffer`.
    ///
    /// The header byte packs the byte width of the cluster count field into
    /// its lower nibble and the byte width of the LCN offset field into its
    /// upper nibble; both fields use the minimal width that represents
    /// their value.
    /// A zero-length run cannot be encoded, as a zero header byte is the
    /// run list terminator.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if self.cluster_count == 0 {
            return Err(NtfsError::InvalidDataRunCount {
                cluster_count: self.cluster_count,
            });
        }

        let count_width = unsigned_byte_width(self.cluster_count);
        let offset_width = if self.is_sparse {
            0
        } else {
            signed_byte_width(self.lcn_offset)
        };

        buffer.push((offset_width << 4) | count_width);
        buffer.extend_from_slice(&self.cluster_count.to_le_bytes()[..count_width as usize]);
        buffer.extend_from_slice(&self.lcn_offset.to_le_bytes()[..offset_width as usize]);

        Ok(())
    }
}

/// Returns the minimal number of bytes representing `value` unsigned.
fn unsigned_byte_width(value: u64) -> u8 {
    let bits = 64 - value.leading_zeros();
    core::cmp::max(1, bits.div_ceil(8)) as u8
}

/// Returns the minimal number of bytes whose sign extension reproduces
/// `value`.
fn signed_byte_width(value: i64) -> u8 {
    for width in 1u8..8 {
        let shift = 64 - width as u32 * 8;
        let truncated = (value << shift) >> shift;
        if truncated == value {
            return width;
        }
    }

    8
}

/// Encodes a whole run list, including the terminating zero byte.
pub fn encode_data_runs(runs: &[NtfsDataRun]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for run in runs {
        run.encode(&mut buffer)?;
    }
    buffer.push(0);

    Ok(buffer)
}

/// Iterator decoding the data runs of one attribute extent from their
/// on-disk byte form.
#[derive(Clone, Debug)]
pub struct NtfsDataRuns<'d> {
    data: &'d [u8],
    position: u64,
}

impl<'d> NtfsDataRuns<'d> {
    pub fn new(data: &'d [u8], position: u64) -> Self {
        Self { data, position }
    }

    fn read_variable_length_bytes(&self, data: &[u8], byte_count: u8) -> Result<[u8; 8]> {
        const MAX_BYTE_COUNT: u8 = mem::size_of::<u64>() as u8;

        if byte_count > MAX_BYTE_COUNT {
            return Err(NtfsError::InvalidByteCountInDataRunHeader {
                position: self.position,
                expected: byte_count,
                actual: MAX_BYTE_COUNT,
            });
        }

        let bytes = data
            .get(..byte_count as usize)
            .ok_or(NtfsError::BufferTooSmall {
                expected: byte_count as usize,
                actual: data.len(),
            })?;

        let mut buf = [0u8; MAX_BYTE_COUNT as usize];
        buf[..byte_count as usize].copy_from_slice(bytes);

        Ok(buf)
    }

    fn read_variable_length_signed_integer(&self, data: &[u8], byte_count: u8) -> Result<i64> {
        let buf = self.read_variable_length_bytes(data, byte_count)?;
        let mut integer = i64::from_le_bytes(buf);

        // We have read `byte_count` bytes into a zeroed buffer and just interpreted that as an `i64`.
        // Sign-extend `integer` to make it replicate the proper value.
        let unused_bits = (mem::size_of::<i64>() as u32 - byte_count as u32) * 8;
        integer = integer.wrapping_shl(unused_bits).wrapping_shr(unused_bits);

        Ok(integer)
    }

    fn read_variable_length_unsigned_integer(&self, data: &[u8], byte_count: u8) -> Result<u64> {
        let buf = self.read_variable_length_bytes(data, byte_count)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Iterator for NtfsDataRuns<'_> {
    type Item = Result<NtfsDataRun>;

    fn next(&mut self) -> Option<Result<NtfsDataRun>> {
        if self.data.is_empty() {
            return None;
        }

        // Read the single header byte.
        let header = self.data[0];

        // A zero byte marks the end of the data runs.
        if header == 0 {
            // Ensure `self.data.is_empty` returns true, so any further call uses the fast path above.
            self.data = &[];
            return None;
        }

        // The lower nibble indicates the length of the following cluster count variable length integer.
        let cluster_count_byte_count = header & 0x0f;

        // The upper nibble indicates the length of the following LCN offset variable length integer.
        // A width of zero denotes a sparse run, which has no stored offset.
        let offset_byte_count = (header & 0xf0) >> 4;

        let cluster_count = iter_try!(
            self.read_variable_length_unsigned_integer(&self.data[1..], cluster_count_byte_count)
        );

        let offset_start = 1 + cluster_count_byte_count as usize;
        let run = if offset_byte_count == 0 {
            NtfsDataRun::new_sparse(cluster_count)
        } else {
            let lcn_offset = iter_try!(self
                .read_variable_length_signed_integer(&self.data[offset_start..], offset_byte_count));
            NtfsDataRun::new_stored(cluster_count, lcn_offset)
        };

        // Only advance after having checked for success.
        // In case of an error, a subsequent call shall output the same error again.
        let bytes_to_advance = offset_start + offset_byte_count as usize;
        self.data = &self.data[bytes_to_advance..];
        self.position += bytes_to_advance as u64;

        Some(Ok(run))
    }
}

impl FusedIterator for NtfsDataRuns<'_> {}

/// A data run resolved against the cumulative VCN/LCN state of its run
/// list: absolute coordinates usable by callers.
///
/// Cooked runs are derived, never independently persisted.
/// `run_index` points back into the owning run table, so they can be
/// re-resolved in full whenever any raw run changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CookedDataRun {
    vcn: Vcn,
    lcn: Option<Lcn>,
    cluster_count: u64,
    run_index: usize,
}

impl CookedDataRun {
    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }

    /// The absolute start LCN, or `None` for a sparse run.
    pub fn lcn(&self) -> Option<Lcn> {
        self.lcn
    }

    /// Index of the raw run this was resolved from, within the owning run
    /// table.
    pub fn run_index(&self) -> usize {
        self.run_index
    }

    pub fn vcn(&self) -> Vcn {
        self.vcn
    }

    /// The first VCN after this run.
    pub fn end_vcn(&self) -> Vcn {
        Vcn::from(self.vcn.value() + self.cluster_count as i64)
    }
}

/// Resolves a raw run list into absolute cooked runs.
///
/// The LCN chain starts at zero; each stored run advances it by its offset,
/// while sparse runs leave it untouched.
/// A chain that drops below LCN zero or overflows is reported as corrupt.
pub fn cook_data_runs(runs: &[NtfsDataRun], position: u64) -> Result<Vec<CookedDataRun>> {
    let mut cooked = Vec::with_capacity(runs.len());
    let mut vcn = 0i64;
    let mut previous_lcn = Lcn::from(0u64);

    for (run_index, run) in runs.iter().enumerate() {
        let lcn = if run.is_sparse() {
            None
        } else {
            let lcn = previous_lcn
                .checked_add(Vcn::from(run.lcn_offset()))
                .ok_or(NtfsError::InvalidVcnInDataRunHeader {
                    position,
                    vcn: Vcn::from(run.lcn_offset()),
                    previous_lcn,
                })?;
            previous_lcn = lcn;
            Some(lcn)
        };

        cooked.push(CookedDataRun {
            vcn: Vcn::from(vcn),
            lcn,
            cluster_count: run.cluster_count(),
            run_index,
        });

        vcn = vcn
            .checked_add(run.cluster_count() as i64)
            .ok_or(NtfsError::InvalidClusterCount {
                cluster_count: run.cluster_count(),
            })?;
    }

    Ok(cooked)
}
