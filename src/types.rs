// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{NtfsError, Result};
use crate::volume::Volume;
use derive_more::{Binary, Display, From, LowerHex, Octal, UpperHex};

/// A Logical Cluster Number (LCN), denoting a cluster-granularity offset
/// within the physical volume.
#[derive(
    Binary,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Hash,
    LowerHex,
    Octal,
    Ord,
    PartialEq,
    PartialOrd,
    UpperHex,
)]
pub struct Lcn(u64);

impl Lcn {
    /// Performs a checked addition of the given Virtual Cluster Number
    /// (VCN), returning a new LCN.
    pub fn checked_add(&self, vcn: Vcn) -> Option<Lcn> {
        if vcn.0 >= 0 {
            self.0.checked_add(vcn.0 as u64).map(Into::into)
        } else {
            self.0
                .checked_sub(vcn.0.wrapping_neg() as u64)
                .map(Into::into)
        }
    }

    /// Performs a checked addition of a cluster count, returning a new LCN.
    pub fn checked_add_clusters(&self, cluster_count: u64) -> Option<Lcn> {
        self.0.checked_add(cluster_count).map(Into::into)
    }

    /// Returns the absolute byte position of this LCN on the given volume.
    pub fn position(&self, volume: &Volume) -> Result<u64> {
        self.0
            .checked_mul(volume.cluster_size() as u64)
            .ok_or(NtfsError::LcnTooBig { lcn: *self })
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A Virtual Cluster Number (VCN), denoting a cluster-granularity offset
/// within the logical content of one attribute.
///
/// VCNs are signed on disk, because data run offsets are stored as VCN
/// deltas that may go backwards.
#[derive(
    Binary,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Hash,
    LowerHex,
    Octal,
    Ord,
    PartialEq,
    PartialOrd,
    UpperHex,
)]
pub struct Vcn(i64);

impl Vcn {
    /// Returns the byte offset of this VCN on the given volume.
    pub fn offset(&self, volume: &Volume) -> Result<i64> {
        self.0
            .checked_mul(volume.cluster_size() as i64)
            .ok_or(NtfsError::VcnTooBig { vcn: *self })
    }

    /// Returns this VCN as an unsigned cluster index, or an error if it is
    /// negative (which indicates a corrupt run chain in this place).
    pub fn index(&self) -> Result<u64> {
        u64::try_from(self.0).map_err(|_| NtfsError::VcnIsNegative { vcn: *self })
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcn_checked_add() {
        let lcn = Lcn::from(10u64);
        assert_eq!(lcn.checked_add(Vcn::from(5i64)), Some(Lcn::from(15u64)));
        assert_eq!(lcn.checked_add(Vcn::from(-10i64)), Some(Lcn::from(0u64)));
        assert_eq!(lcn.checked_add(Vcn::from(-11i64)), None);
    }

    #[test]
    fn test_vcn_index() {
        assert_eq!(Vcn::from(42i64).index().unwrap(), 42);
        assert!(Vcn::from(-1i64).index().is_err());
    }
}
