// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{NtfsError, Result};
use crate::types::Lcn;
use log::trace;

/// Geometry of the volume this engine operates on, as read from the BIOS
/// Parameter Block by the (out of scope) mount layer.
#[derive(Clone, Copy, Debug)]
pub struct Volume {
    sector_size: u16,
    cluster_size: u32,
}

impl Volume {
    pub fn new(sector_size: u16, cluster_size: u32) -> Result<Self> {
        let valid = sector_size.is_power_of_two()
            && sector_size >= 256
            && cluster_size.is_power_of_two()
            && cluster_size >= sector_size as u32;
        if !valid {
            return Err(NtfsError::InvalidVolumeGeometry {
                sector_size,
                cluster_size,
            });
        }

        Ok(Self {
            sector_size,
            cluster_size,
        })
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }
}

/// A contiguous range of physical clusters handed out by a
/// [`ClusterAllocator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LcnRange {
    pub start: Lcn,
    pub cluster_count: u64,
}

impl LcnRange {
    pub fn new(start: Lcn, cluster_count: u64) -> Self {
        Self {
            start,
            cluster_count,
        }
    }

    /// Returns the first LCN after this range.
    pub fn end(&self) -> Lcn {
        Lcn::from(self.start.value() + self.cluster_count)
    }
}

/// The volume-wide free-space account every non-resident attribute
/// allocates against.
///
/// All physical cluster allocation funnels through one implementation of
/// this trait, so that no two extents are ever granted overlapping ranges.
/// The engine assumes a single writer and does not lock internally.
pub trait ClusterAllocator {
    /// Allocates `cluster_count` clusters, preferring ranges at or after
    /// `hint` for locality with an existing run.
    ///
    /// The result may be fragmented into multiple ranges, but always covers
    /// exactly `cluster_count` clusters.
    /// Fails with [`NtfsError::BitmapExhausted`] if the volume does not
    /// have enough free clusters.
    fn allocate(&mut self, cluster_count: u64, hint: Option<Lcn>) -> Result<Vec<LcnRange>>;

    /// Returns the given ranges to the free pool.
    ///
    /// Freeing a cluster that is not currently allocated fails with
    /// [`NtfsError::LcnNotAllocated`], as that indicates a corrupt run
    /// chain referencing foreign clusters.
    fn free(&mut self, ranges: &[LcnRange]) -> Result<()>;

    /// Returns whether the given LCN is currently allocated.
    fn is_allocated(&self, lcn: Lcn) -> bool;

    /// Returns the number of free clusters.
    fn free_cluster_count(&self) -> u64;
}

/// An in-memory cluster bitmap, one bit per cluster of the volume.
///
/// This mirrors the `$Bitmap` file of a real volume; persisting it back is
/// the concern of the layer that loaded it.
#[derive(Clone, Debug)]
pub struct ClusterBitmap {
    bits: Vec<u8>,
    cluster_count: u64,
    free_count: u64,
}

impl ClusterBitmap {
    pub fn new(cluster_count: u64) -> Self {
        let byte_count = cluster_count.div_ceil(8) as usize;

        Self {
            bits: vec![0u8; byte_count],
            cluster_count,
            free_count: cluster_count,
        }
    }

    /// Builds a bitmap from the raw bytes of a `$Bitmap` data attribute.
    pub fn from_bytes(bits: Vec<u8>, cluster_count: u64) -> Result<Self> {
        if (bits.len() as u64) < cluster_count.div_ceil(8) {
            return Err(NtfsError::BufferTooSmall {
                expected: cluster_count.div_ceil(8) as usize,
                actual: bits.len(),
            });
        }

        let mut bitmap = Self {
            bits,
            cluster_count,
            free_count: 0,
        };
        bitmap.free_count = (0..cluster_count)
            .filter(|&lcn| !bitmap.get(lcn))
            .count() as u64;

        Ok(bitmap)
    }

    /// Returns the raw bitmap bytes for persisting.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    fn get(&self, lcn: u64) -> bool {
        let byte = (lcn / 8) as usize;
        let bit = lcn % 8;
        (self.bits[byte] >> bit) & 1 == 1
    }

    fn set(&mut self, lcn: u64) {
        let byte = (lcn / 8) as usize;
        let bit = lcn % 8;
        self.bits[byte] |= 1 << bit;
    }

    fn clear(&mut self, lcn: u64) {
        let byte = (lcn / 8) as usize;
        let bit = lcn % 8;
        self.bits[byte] &= !(1 << bit);
    }

    /// Finds the next free run at or after `start`, without wrapping.
    /// Returns its start LCN and length, capped at `max_count`.
    fn find_free_run(&self, start: u64, max_count: u64) -> Option<(u64, u64)> {
        let mut lcn = start;

        while lcn < self.cluster_count && self.get(lcn) {
            lcn += 1;
        }
        if lcn >= self.cluster_count {
            return None;
        }

        let mut end = lcn;
        while end < self.cluster_count && end - lcn < max_count && !self.get(end) {
            end += 1;
        }

        Some((lcn, end - lcn))
    }
}

impl ClusterAllocator for ClusterBitmap {
    fn allocate(&mut self, cluster_count: u64, hint: Option<Lcn>) -> Result<Vec<LcnRange>> {
        if cluster_count > self.free_count {
            return Err(NtfsError::BitmapExhausted {
                requested: cluster_count,
                free: self.free_count,
            });
        }

        let hint = hint.map(|lcn| lcn.value()).unwrap_or(0);
        let mut ranges = Vec::new();
        let mut remaining = cluster_count;
        let mut search_start = hint.min(self.cluster_count);
        let mut wrapped = false;

        while remaining > 0 {
            match self.find_free_run(search_start, remaining) {
                Some((start, count)) => {
                    for lcn in start..start + count {
                        self.set(lcn);
                    }
                    self.free_count -= count;
                    remaining -= count;
                    search_start = start + count;

                    trace!("allocated cluster run [{start}, {})", start + count);
                    ranges.push(LcnRange::new(Lcn::from(start), count));
                }
                None if !wrapped => {
                    // Nothing free after the hint. Wrap around once.
                    wrapped = true;
                    search_start = 0;
                }
                None => {
                    // The free count said there was enough space, so running
                    // dry after a wrap means the bitmap is inconsistent.
                    self.free(&ranges)?;
                    return Err(NtfsError::BitmapExhausted {
                        requested: cluster_count,
                        free: self.free_count,
                    });
                }
            }
        }

        Ok(ranges)
    }

    fn free(&mut self, ranges: &[LcnRange]) -> Result<()> {
        // Validate all ranges before mutating, so a bad range frees nothing.
        for range in ranges {
            for lcn in range.start.value()..range.end().value() {
                if lcn >= self.cluster_count || !self.get(lcn) {
                    return Err(NtfsError::LcnNotAllocated {
                        lcn: Lcn::from(lcn),
                    });
                }
            }
        }

        for range in ranges {
            trace!(
                "freed cluster run [{}, {})",
                range.start.value(),
                range.end().value()
            );
            for lcn in range.start.value()..range.end().value() {
                self.clear(lcn);
            }
            self.free_count += range.cluster_count;
        }

        Ok(())
    }

    fn is_allocated(&self, lcn: Lcn) -> bool {
        lcn.value() < self.cluster_count && self.get(lcn.value())
    }

    fn free_cluster_count(&self) -> u64 {
        self.free_count
    }
}
