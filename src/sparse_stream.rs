// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Read, Seek, Write};

use crate::cluster_stream::{RawClusterStream, VcnRange};
use crate::error::{NtfsError, Result};
use crate::helpers::{round_down_to_unit, round_up_to_unit};
use crate::types::Vcn;
use crate::volume::ClusterAllocator;

/// A cluster stream whose allocation and truncation boundaries are aligned
/// to the owning attribute's compression unit, as required for sparse and
/// compressed attributes.
///
/// Growth is always aligned; holes punched via
/// [`SparseClusterStream::clear_clusters`] are exact, so partial-unit holes
/// remain possible.
#[derive(Clone, Debug)]
pub struct SparseClusterStream {
    inner: RawClusterStream,
    compression_unit: u64,
}

impl SparseClusterStream {
    /// Wraps a raw stream, aligning to `compression_unit` clusters.
    /// The unit must be a power of two (it is stored as a log2 exponent on
    /// disk).
    pub fn new(inner: RawClusterStream, compression_unit: u64) -> Result<Self> {
        if !compression_unit.is_power_of_two() {
            return Err(NtfsError::InvalidCompressionUnitSize {
                cluster_count: compression_unit,
            });
        }

        Ok(Self {
            inner,
            compression_unit,
        })
    }

    pub fn compression_unit(&self) -> u64 {
        self.compression_unit
    }

    pub fn inner(&self) -> &RawClusterStream {
        &self.inner
    }

    pub fn into_inner(self) -> RawClusterStream {
        self.inner
    }

    pub fn total_clusters(&self) -> u64 {
        self.inner.total_clusters()
    }

    pub fn allocated_cluster_count(&self) -> u64 {
        self.inner.allocated_cluster_count()
    }

    pub fn stored_clusters(&self) -> Vec<VcnRange> {
        self.inner.stored_clusters()
    }

    pub fn encode_runs(&self) -> Result<Vec<u8>> {
        self.inner.encode_runs()
    }

    pub fn read_clusters<T>(
        &self,
        fs: &mut T,
        start_vcn: Vcn,
        cluster_count: u64,
        buffer: &mut [u8],
    ) -> Result<()>
    where
        T: Read + Seek,
    {
        self.inner.read_clusters(fs, start_vcn, cluster_count, buffer)
    }

    /// Ensures compression-unit-aligned allocation around the requested
    /// range, then writes.
    pub fn write_clusters<T, A>(
        &mut self,
        fs: &mut T,
        allocator: &mut A,
        start_vcn: Vcn,
        cluster_count: u64,
        buffer: &[u8],
    ) -> Result<()>
    where
        T: Read + Write + Seek,
        A: ClusterAllocator,
    {
        self.allocate_clusters(allocator, start_vcn, cluster_count)?;
        self.inner.write_clusters(fs, start_vcn, cluster_count, buffer)
    }

    /// Allocates the requested range, widened outward to compression-unit
    /// boundaries.
    /// Returns the number of newly allocated clusters.
    pub fn allocate_clusters<A>(
        &mut self,
        allocator: &mut A,
        start_vcn: Vcn,
        cluster_count: u64,
    ) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        if cluster_count == 0 {
            return Ok(0);
        }

        let start = start_vcn.index()?;
        let aligned_start = round_down_to_unit(start, self.compression_unit);
        let aligned_end = round_up_to_unit(start + cluster_count, self.compression_unit);

        self.inner.allocate_clusters(
            allocator,
            Vcn::from(aligned_start as i64),
            aligned_end - aligned_start,
        )
    }

    /// Punches a hole over exactly the requested range, without any
    /// alignment.
    /// Returns the number of clusters freed.
    pub fn clear_clusters<A>(
        &mut self,
        allocator: &mut A,
        start_vcn: Vcn,
        cluster_count: u64,
    ) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        self.inner.release_clusters(allocator, start_vcn, cluster_count)
    }

    /// Extends the covered extent to the aligned boundary above
    /// `cluster_count`, appending a hole.
    pub fn expand_to_clusters(&mut self, cluster_count: u64) -> Result<()> {
        self.inner
            .expand_to_clusters(round_up_to_unit(cluster_count, self.compression_unit))
    }

    /// Shrinks to the aligned boundary above `cluster_count`, then releases
    /// the tail between the true requested length and that boundary, so a
    /// shrink never leaves allocated-but-unaddressable clusters.
    /// Returns the number of clusters freed.
    pub fn truncate_to_clusters<A>(&mut self, allocator: &mut A, cluster_count: u64) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        let aligned = round_up_to_unit(cluster_count, self.compression_unit);
        let mut freed = self.inner.truncate_to_clusters(allocator, aligned)?;
        freed += self
            .inner
            .release_clusters(allocator, Vcn::from(cluster_count as i64), aligned - cluster_count)?;

        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::tests::memory_volume;

    fn sparse_stream(unit: u64) -> (SparseClusterStream, crate::volume::ClusterBitmap) {
        let (volume, _, bitmap) = memory_volume(128);
        let stream = SparseClusterStream::new(RawClusterStream::new(volume), unit).unwrap();
        (stream, bitmap)
    }

    #[test]
    fn test_rejects_non_power_of_two_unit() {
        let (volume, ..) = memory_volume(8);
        let err = SparseClusterStream::new(RawClusterStream::new(volume), 3);
        assert!(matches!(
            err,
            Err(NtfsError::InvalidCompressionUnitSize { cluster_count: 3 })
        ));
    }

    #[test]
    fn test_allocation_is_unit_aligned() {
        let (mut stream, mut bitmap) = sparse_stream(16);

        // Allocating [18, 21) must widen to [16, 32).
        let newly = stream
            .allocate_clusters(&mut bitmap, Vcn::from(18i64), 3)
            .unwrap();
        assert_eq!(newly, 16);
        assert_eq!(
            stream.stored_clusters(),
            vec![VcnRange::new(Vcn::from(16i64), 16)]
        );
        // The head of the extent stays a hole.
        assert_eq!(stream.total_clusters(), 32);
        assert_eq!(stream.allocated_cluster_count(), 16);
    }

    #[test]
    fn test_truncate_releases_aligned_tail() {
        let (mut stream, mut bitmap) = sparse_stream(16);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 48).unwrap();

        // Shrinking to 20 keeps the aligned length at 32, but clusters
        // [20, 32) become a hole rather than unaddressable allocations.
        let freed = stream.truncate_to_clusters(&mut bitmap, 20).unwrap();
        assert_eq!(freed, 28);
        assert_eq!(stream.total_clusters(), 32);
        assert_eq!(
            stream.stored_clusters(),
            vec![VcnRange::new(Vcn::from(0i64), 20)]
        );
        assert_eq!(bitmap.free_cluster_count(), 128 - 20);
    }

    #[test]
    fn test_clear_clusters_is_exact() {
        let (mut stream, mut bitmap) = sparse_stream(16);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 32).unwrap();

        // Partial-unit holes are allowed even though growth is aligned.
        let freed = stream.clear_clusters(&mut bitmap, Vcn::from(5i64), 3).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(
            stream.stored_clusters(),
            vec![
                VcnRange::new(Vcn::from(0i64), 5),
                VcnRange::new(Vcn::from(8i64), 24),
            ]
        );
    }

    #[test]
    fn test_write_allocates_on_demand() {
        let (volume, mut device, mut bitmap) = memory_volume(128);
        let mut stream = SparseClusterStream::new(RawClusterStream::new(volume), 4).unwrap();

        let data = vec![0x5au8; 2 * 4096];
        stream
            .write_clusters(&mut device, &mut bitmap, Vcn::from(5i64), 2, &data)
            .unwrap();

        // [4, 8) was materialized around the write.
        assert_eq!(stream.stored_clusters(), vec![VcnRange::new(Vcn::from(4i64), 4)]);

        let mut read_back = vec![0u8; 2 * 4096];
        stream
            .read_clusters(&mut device, Vcn::from(5i64), 2, &mut read_back)
            .unwrap();
        assert_eq!(read_back, data);
    }
}
