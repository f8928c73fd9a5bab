// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

macro_rules! iter_try {
    ($e:expr) => {
        match $e {
            Ok(x) => x,
            Err(e) => return Some(Err(e.into())),
        }
    };
}

/// Rounds `value` up to the next multiple of `unit`.
/// `unit` must be a power of two.
pub(crate) const fn round_up_to_unit(value: u64, unit: u64) -> u64 {
    debug_assert!(unit.is_power_of_two());
    (value + unit - 1) & !(unit - 1)
}

/// Rounds `value` down to the previous multiple of `unit`.
/// `unit` must be a power of two.
pub(crate) const fn round_down_to_unit(value: u64, unit: u64) -> u64 {
    debug_assert!(unit.is_power_of_two());
    value & !(unit - 1)
}

/// Rounds `value` up to the next multiple of 8, the alignment of index
/// entries within a node.
pub(crate) const fn align_up_8(value: usize) -> usize {
    (value + 7) & !7
}
