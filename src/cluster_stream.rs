// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Read, Seek, SeekFrom, Write};

use log::trace;

use crate::data_run::{cook_data_runs, encode_data_runs, CookedDataRun, NtfsDataRun, NtfsDataRuns};
use crate::error::{NtfsError, Result};
use crate::types::{Lcn, Vcn};
use crate::volume::{ClusterAllocator, LcnRange, Volume};

/// A contiguous range of virtual clusters within one attribute's content.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VcnRange {
    pub start: Vcn,
    pub cluster_count: u64,
}

impl VcnRange {
    pub fn new(start: Vcn, cluster_count: u64) -> Self {
        Self {
            start,
            cluster_count,
        }
    }
}

/// One segment of the mapping in absolute coordinates, used while editing
/// the run table.
/// `lcn` is `None` for a sparse segment.
#[derive(Clone, Copy, Debug)]
struct Segment {
    cluster_count: u64,
    lcn: Option<u64>,
}

/// The ordered cluster mapping of one non-resident attribute's content,
/// covering `[0, total_clusters)` VCNs.
///
/// The raw run table is the canonical state; the cooked runs are a derived
/// cache that is rebuilt in full after every mutation, since LCNs are
/// offset-chained and not independently stored.
///
/// Physical cluster allocation and release funnel through the caller's
/// [`ClusterAllocator`]; device access goes through the `fs` parameter of
/// the individual operation.
#[derive(Clone, Debug)]
pub struct RawClusterStream {
    volume: Volume,
    runs: Vec<NtfsDataRun>,
    cooked: Vec<CookedDataRun>,
    position: u64,
}

impl RawClusterStream {
    /// Creates an empty stream covering no clusters.
    pub fn new(volume: Volume) -> Self {
        Self {
            volume,
            runs: Vec::new(),
            cooked: Vec::new(),
            position: 0,
        }
    }

    /// Rebuilds a stream from the encoded run list of an attribute extent.
    /// `position` is the absolute byte position of the run data, used in
    /// error messages.
    pub fn from_encoded_runs(volume: Volume, data: &[u8], position: u64) -> Result<Self> {
        let runs = NtfsDataRuns::new(data, position).collect::<Result<Vec<_>>>()?;
        let cooked = cook_data_runs(&runs, position)?;

        Ok(Self {
            volume,
            runs,
            cooked,
            position,
        })
    }

    /// Returns the encoded run list for persisting into an attribute
    /// extent, including the terminator.
    pub fn encode_runs(&self) -> Result<Vec<u8>> {
        encode_data_runs(&self.runs)
    }

    pub fn runs(&self) -> &[NtfsDataRun] {
        &self.runs
    }

    pub fn cooked_runs(&self) -> &[CookedDataRun] {
        &self.cooked
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Total number of clusters covered by this stream, sparse or stored.
    pub fn total_clusters(&self) -> u64 {
        self.cooked
            .last()
            .map(|run| run.end_vcn().value() as u64)
            .unwrap_or(0)
    }

    /// Number of physically stored (non-sparse) clusters.
    pub fn allocated_cluster_count(&self) -> u64 {
        self.cooked
            .iter()
            .filter(|run| !run.is_sparse())
            .map(|run| run.cluster_count())
            .sum()
    }

    /// Returns the ordered stored (non-sparse) VCN ranges, merged where
    /// adjacent: the sparse-file map of this attribute.
    pub fn stored_clusters(&self) -> Vec<VcnRange> {
        let mut ranges: Vec<VcnRange> = Vec::new();

        for run in self.cooked.iter().filter(|run| !run.is_sparse()) {
            if let Some(last) = ranges.last_mut() {
                if last.start.value() + last.cluster_count as i64 == run.vcn().value() {
                    last.cluster_count += run.cluster_count();
                    continue;
                }
            }

            ranges.push(VcnRange::new(run.vcn(), run.cluster_count()));
        }

        ranges
    }

    /// Reads `cluster_count` clusters starting at `start_vcn` into `buffer`.
    /// Sparse ranges are synthesized as zeroes; a range past the covered
    /// extent is an error.
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
        let start = start_vcn.index()?;
        let cluster_size = self.volume.cluster_size() as u64;
        self.check_buffer_and_bounds(start_vcn, cluster_count, buffer.len())?;

        for (range_start, range_count, lcn) in self.overlapping_runs(start, cluster_count) {
            let buffer_start = ((range_start - start) * cluster_size) as usize;
            let buffer_end = buffer_start + (range_count * cluster_size) as usize;
            let work_slice = &mut buffer[buffer_start..buffer_end];

            match lcn {
                Some(lcn) => {
                    fs.seek(SeekFrom::Start(lcn.position(&self.volume)?))?;
                    fs.read_exact(work_slice)?;
                }
                None => {
                    // This range is sparse.
                    work_slice.fill(0);
                }
            }
        }

        Ok(())
    }

    /// Writes `cluster_count` clusters starting at `start_vcn` from
    /// `buffer`.
    /// The entire range must be physically stored; writing into a hole is
    /// reported as [`NtfsError::ClustersNotAllocated`] without touching the
    /// device.
    pub fn write_clusters<T>(
        &self,
        fs: &mut T,
        start_vcn: Vcn,
        cluster_count: u64,
        buffer: &[u8],
    ) -> Result<()>
    where
        T: Read + Write + Seek,
    {
        let start = start_vcn.index()?;
        let cluster_size = self.volume.cluster_size() as u64;
        self.check_buffer_and_bounds(start_vcn, cluster_count, buffer.len())?;

        let overlaps = self.overlapping_runs(start, cluster_count);
        if overlaps.iter().any(|(_, _, lcn)| lcn.is_none()) {
            return Err(NtfsError::ClustersNotAllocated {
                vcn: start_vcn,
                cluster_count,
            });
        }

        // All sparse overlaps have been rejected above.
        for (range_start, range_count, lcn) in overlaps {
            let buffer_start = ((range_start - start) * cluster_size) as usize;
            let buffer_end = buffer_start + (range_count * cluster_size) as usize;

            if let Some(lcn) = lcn {
                fs.seek(SeekFrom::Start(lcn.position(&self.volume)?))?;
                fs.write_all(&buffer[buffer_start..buffer_end])?;
            }
        }

        Ok(())
    }

    /// Ensures that `[start_vcn, start_vcn + cluster_count)` is physically
    /// stored, extending the covered extent if needed.
    ///
    /// Physical ranges come from `allocator`, hinted at the closest
    /// preceding stored run for locality.
    /// Already stored sub-ranges are left alone, making this idempotent.
    /// Returns the number of newly allocated clusters; on error, nothing is
    /// changed and nothing stays allocated.
    pub fn allocate_clusters<A>(
        &mut self,
        allocator: &mut A,
        start_vcn: Vcn,
        cluster_count: u64,
    ) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        let start = start_vcn.index()?;
        let end = start + cluster_count;
        if cluster_count == 0 {
            return Ok(0);
        }

        let mut segments = self.segments();
        let total = self.total_clusters();
        if end > total {
            segments.push(Segment {
                cluster_count: end - total,
                lcn: None,
            });
        }

        let mut result = Vec::new();
        let mut allocated_ranges = Vec::new();
        let mut newly_allocated = 0u64;
        let mut hint: Option<Lcn> = None;
        let mut vcn = 0u64;

        for segment in segments {
            let segment_start = vcn;
            let segment_end = vcn + segment.cluster_count;
            vcn = segment_end;

            if let Some(lcn) = segment.lcn {
                hint = Some(Lcn::from(lcn + segment.cluster_count));
                result.push(segment);
                continue;
            }
            if segment_end <= start || segment_start >= end {
                result.push(segment);
                continue;
            }

            // This sparse segment overlaps the requested range.
            // Keep its head and tail, materialize the middle.
            let middle_start = segment_start.max(start);
            let middle_end = segment_end.min(end);

            if middle_start > segment_start {
                result.push(Segment {
                    cluster_count: middle_start - segment_start,
                    lcn: None,
                });
            }

            let middle_count = middle_end - middle_start;
            let ranges = match allocator.allocate(middle_count, hint) {
                Ok(ranges) => ranges,
                Err(e) => {
                    // Roll back everything this call allocated so far.
                    allocator.free(&allocated_ranges)?;
                    return Err(e);
                }
            };
            for range in &ranges {
                result.push(Segment {
                    cluster_count: range.cluster_count,
                    lcn: Some(range.start.value()),
                });
                hint = Some(range.end());
            }
            allocated_ranges.extend_from_slice(&ranges);
            newly_allocated += middle_count;

            if segment_end > middle_end {
                result.push(Segment {
                    cluster_count: segment_end - middle_end,
                    lcn: None,
                });
            }
        }

        if let Err(e) = self.set_segments(result) {
            allocator.free(&allocated_ranges)?;
            return Err(e);
        }

        trace!(
            "allocated {newly_allocated} clusters for VCN range [{start}, {end})"
        );
        Ok(newly_allocated)
    }

    /// Releases the stored clusters within `[start_vcn, start_vcn +
    /// cluster_count)` back to the allocator, converting the range into a
    /// hole.
    /// The covered extent length is unchanged; adjacent sparse runs are
    /// merged.
    /// Returns the number of clusters freed.
    pub fn release_clusters<A>(
        &mut self,
        allocator: &mut A,
        start_vcn: Vcn,
        cluster_count: u64,
    ) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        let start = start_vcn.index()?;
        let end = (start + cluster_count).min(self.total_clusters());
        if start >= end {
            return Ok(0);
        }

        let mut result = Vec::new();
        let mut freed_ranges = Vec::new();
        let mut freed = 0u64;
        let mut vcn = 0u64;

        for segment in self.segments() {
            let segment_start = vcn;
            let segment_end = vcn + segment.cluster_count;
            vcn = segment_end;

            let lcn = match segment.lcn {
                Some(lcn) if segment_start < end && segment_end > start => lcn,
                _ => {
                    result.push(segment);
                    continue;
                }
            };

            let middle_start = segment_start.max(start);
            let middle_end = segment_end.min(end);

            if middle_start > segment_start {
                result.push(Segment {
                    cluster_count: middle_start - segment_start,
                    lcn: Some(lcn),
                });
            }

            let middle_count = middle_end - middle_start;
            freed_ranges.push(LcnRange::new(
                Lcn::from(lcn + (middle_start - segment_start)),
                middle_count,
            ));
            freed += middle_count;
            result.push(Segment {
                cluster_count: middle_count,
                lcn: None,
            });

            if segment_end > middle_end {
                result.push(Segment {
                    cluster_count: segment_end - middle_end,
                    lcn: Some(lcn + (middle_end - segment_start)),
                });
            }
        }

        allocator.free(&freed_ranges)?;
        self.set_segments(result)?;

        trace!("released {freed} clusters from VCN range [{start}, {end})");
        Ok(freed)
    }

    /// Extends the covered extent to `cluster_count` clusters by appending
    /// a hole.
    /// No physical clusters are allocated.
    pub fn expand_to_clusters(&mut self, cluster_count: u64) -> Result<()> {
        let total = self.total_clusters();
        if cluster_count <= total {
            return Ok(());
        }

        let mut segments = self.segments();
        segments.push(Segment {
            cluster_count: cluster_count - total,
            lcn: None,
        });
        self.set_segments(segments)
    }

    /// Shrinks the covered extent to `cluster_count` clusters, freeing all
    /// stored clusters beyond the new end.
    /// Returns the number of clusters freed.
    pub fn truncate_to_clusters<A>(&mut self, allocator: &mut A, cluster_count: u64) -> Result<u64>
    where
        A: ClusterAllocator,
    {
        if cluster_count >= self.total_clusters() {
            return Ok(0);
        }

        let mut result = Vec::new();
        let mut freed_ranges = Vec::new();
        let mut freed = 0u64;
        let mut vcn = 0u64;

        for segment in self.segments() {
            let segment_start = vcn;
            let segment_end = vcn + segment.cluster_count;
            vcn = segment_end;

            if segment_end <= cluster_count {
                result.push(segment);
                continue;
            }

            let keep = cluster_count.saturating_sub(segment_start);
            if keep > 0 {
                result.push(Segment {
                    cluster_count: keep,
                    lcn: segment.lcn,
                });
            }

            if let Some(lcn) = segment.lcn {
                let cut = segment.cluster_count - keep;
                freed_ranges.push(LcnRange::new(Lcn::from(lcn + keep), cut));
                freed += cut;
            }
        }

        allocator.free(&freed_ranges)?;
        self.set_segments(result)?;

        Ok(freed)
    }

    fn check_buffer_and_bounds(
        &self,
        start_vcn: Vcn,
        cluster_count: u64,
        buffer_len: usize,
    ) -> Result<()> {
        let cluster_size = self.volume.cluster_size() as u64;
        let byte_count = cluster_count
            .checked_mul(cluster_size)
            .ok_or(NtfsError::InvalidClusterCount { cluster_count })?;
        if (buffer_len as u64) < byte_count {
            return Err(NtfsError::BufferTooSmall {
                expected: byte_count as usize,
                actual: buffer_len,
            });
        }

        let start = start_vcn.index()?;
        let total = self.total_clusters();
        if start + cluster_count > total {
            return Err(NtfsError::VcnOutOfBounds {
                vcn: start_vcn,
                cluster_count,
                total,
            });
        }

        Ok(())
    }

    /// Collects `(vcn, cluster_count, lcn)` tuples for the parts of the
    /// cooked runs overlapping `[start, start + count)`.
    fn overlapping_runs(&self, start: u64, count: u64) -> Vec<(u64, u64, Option<Lcn>)> {
        let end = start + count;
        let mut overlaps = Vec::new();

        for run in &self.cooked {
            let run_start = run.vcn().value() as u64;
            let run_end = run_start + run.cluster_count();
            if run_end <= start {
                continue;
            }
            if run_start >= end {
                break;
            }

            let overlap_start = run_start.max(start);
            let overlap_end = run_end.min(end);
            let lcn = run
                .lcn()
                .map(|lcn| Lcn::from(lcn.value() + (overlap_start - run_start)));

            overlaps.push((overlap_start, overlap_end - overlap_start, lcn));
        }

        overlaps
    }

    fn segments(&self) -> Vec<Segment> {
        self.cooked
            .iter()
            .map(|run| Segment {
                cluster_count: run.cluster_count(),
                lcn: run.lcn().map(|lcn| lcn.value()),
            })
            .collect()
    }

    /// Replaces the whole mapping with the given segments, normalizing them
    /// and rebuilding both the raw run table and the cooked cache.
    fn set_segments(&mut self, segments: Vec<Segment>) -> Result<()> {
        // Merge adjacent segments of the same kind.
        // Stored segments only merge when physically contiguous.
        let mut normalized: Vec<Segment> = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.cluster_count == 0 {
                continue;
            }

            if let Some(last) = normalized.last_mut() {
                let mergeable = match (last.lcn, segment.lcn) {
                    (None, None) => true,
                    (Some(last_lcn), Some(lcn)) => last_lcn + last.cluster_count == lcn,
                    _ => false,
                };
                if mergeable {
                    last.cluster_count += segment.cluster_count;
                    continue;
                }
            }

            normalized.push(segment);
        }

        // Rebuild the offset-chained raw runs.
        let mut runs = Vec::with_capacity(normalized.len());
        let mut previous_lcn = 0i64;
        for segment in &normalized {
            match segment.lcn {
                Some(lcn) => {
                    let offset = lcn as i64 - previous_lcn;
                    runs.push(NtfsDataRun::new_stored(segment.cluster_count, offset));
                    previous_lcn = lcn as i64;
                }
                None => runs.push(NtfsDataRun::new_sparse(segment.cluster_count)),
            }
        }

        self.cooked = cook_data_runs(&runs, self.position)?;
        self.runs = runs;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::tests::memory_volume;

    #[test]
    fn test_allocate_and_read_write_round_trip() {
        let (volume, mut device, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);

        assert_eq!(stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 4).unwrap(), 4);
        assert_eq!(stream.total_clusters(), 4);

        let data = vec![0xabu8; 4 * 4096];
        stream.write_clusters(&mut device, Vcn::from(0i64), 4, &data).unwrap();

        let mut read_back = vec![0u8; 4 * 4096];
        stream.read_clusters(&mut device, Vcn::from(0i64), 4, &mut read_back).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let (volume, _, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);

        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 6).unwrap();
        let newly = stream.allocate_clusters(&mut bitmap, Vcn::from(2i64), 4).unwrap();
        assert_eq!(newly, 0);
        assert_eq!(bitmap.free_cluster_count(), 58);
    }

    #[test]
    fn test_sparse_read_synthesizes_zeroes() {
        // A 10-cluster extent with a hole at [3, 5).
        let (volume, mut device, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.expand_to_clusters(10).unwrap();
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 3).unwrap();
        stream.allocate_clusters(&mut bitmap, Vcn::from(5i64), 5).unwrap();

        let mut buffer = vec![0xffu8; 2 * 4096];
        stream.read_clusters(&mut device, Vcn::from(3i64), 2, &mut buffer).unwrap();
        assert!(buffer.iter().all(|&byte| byte == 0));

        assert_eq!(
            stream.stored_clusters(),
            vec![
                VcnRange::new(Vcn::from(0i64), 3),
                VcnRange::new(Vcn::from(5i64), 5),
            ]
        );
    }

    #[test]
    fn test_write_into_hole_fails() {
        let (volume, mut device, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.expand_to_clusters(4).unwrap();
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 2).unwrap();

        let data = vec![0u8; 2 * 4096];
        let err = stream.write_clusters(&mut device, Vcn::from(1i64), 2, &data);
        assert!(matches!(err, Err(NtfsError::ClustersNotAllocated { .. })));
    }

    #[test]
    fn test_read_past_extent_fails() {
        let (volume, mut device, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 2).unwrap();

        let mut buffer = vec![0u8; 4 * 4096];
        let err = stream.read_clusters(&mut device, Vcn::from(0i64), 4, &mut buffer);
        assert!(matches!(err, Err(NtfsError::VcnOutOfBounds { .. })));
    }

    #[test]
    fn test_release_punches_hole_and_frees() {
        let (volume, _, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 8).unwrap();

        let freed = stream.release_clusters(&mut bitmap, Vcn::from(2i64), 3).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(bitmap.free_cluster_count(), 59);
        assert_eq!(stream.total_clusters(), 8);
        assert_eq!(stream.allocated_cluster_count(), 5);
        assert_eq!(
            stream.stored_clusters(),
            vec![
                VcnRange::new(Vcn::from(0i64), 2),
                VcnRange::new(Vcn::from(5i64), 3),
            ]
        );
    }

    #[test]
    fn test_truncate_frees_tail() {
        let (volume, _, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 8).unwrap();

        let freed = stream.truncate_to_clusters(&mut bitmap, 3).unwrap();
        assert_eq!(freed, 5);
        assert_eq!(stream.total_clusters(), 3);
        assert_eq!(bitmap.free_cluster_count(), 61);
    }

    #[test]
    fn test_encoded_runs_round_trip_after_mutation() {
        let (volume, _, mut bitmap) = memory_volume(64);
        let mut stream = RawClusterStream::new(volume);
        stream.expand_to_clusters(12).unwrap();
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 4).unwrap();
        stream.allocate_clusters(&mut bitmap, Vcn::from(8i64), 4).unwrap();
        stream.release_clusters(&mut bitmap, Vcn::from(1i64), 2).unwrap();

        let encoded = stream.encode_runs().unwrap();
        let reloaded = RawClusterStream::from_encoded_runs(volume, &encoded, 0).unwrap();

        assert_eq!(reloaded.total_clusters(), stream.total_clusters());
        assert_eq!(reloaded.stored_clusters(), stream.stored_clusters());
        assert_eq!(reloaded.cooked_runs(), stream.cooked_runs());
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        let (volume, _, mut bitmap) = memory_volume(8);
        let mut stream = RawClusterStream::new(volume);
        stream.allocate_clusters(&mut bitmap, Vcn::from(0i64), 4).unwrap();

        // Requesting more than the volume has must leave everything as it was.
        let err = stream.allocate_clusters(&mut bitmap, Vcn::from(4i64), 8);
        assert!(matches!(err, Err(NtfsError::BitmapExhausted { .. })));
        assert_eq!(stream.total_clusters(), 4);
        assert_eq!(bitmap.free_cluster_count(), 4);
    }
}
