// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A read/write engine for the on-disk metadata structures of an NTFS
//! filesystem.
//!
//! This crate implements the three mechanisms everything else in NTFS is
//! built on:
//!
//! * Multi-sector records protected by Update Sequence Arrays ([`Record`]),
//!   shared by File Records and Index Records.
//! * B-tree indexes with a resident root node and external Index Records
//!   ([`NtfsIndex`]), used for directories as well as the `$Secure`,
//!   `$ObjId` and `$Reparse` system indexes.
//! * Run-length cluster mapping of non-resident attribute data
//!   ([`RawClusterStream`], [`SparseClusterStream`]), backed by a
//!   volume-wide cluster allocator.
//!
//! Everything operates against a caller-supplied device implementing
//! [`std::io::Read`] + [`std::io::Write`] + [`std::io::Seek`], passed to
//! each operation that performs I/O.
//!
//! # Example
//!
//! ```no_run
//! use ntfs_meta::{ClusterBitmap, IndexConfig, NtfsCollationRule, NtfsIndex, Volume};
//! use std::fs::OpenOptions;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut device = OpenOptions::new().read(true).write(true).open("volume.img")?;
//!     let volume = Volume::new(512, 4096)?;
//!     let mut bitmap = ClusterBitmap::new(1 << 20);
//!
//!     let mut index = NtfsIndex::new(volume, NtfsCollationRule::Binary, IndexConfig::default())?;
//!     index.insert(&mut device, &mut bitmap, b"key", b"value")?;
//!     assert_eq!(index.get(&mut device, b"key")?, Some(b"value".to_vec()));
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

#[macro_use]
mod helpers;

mod cluster_stream;
mod collation;
mod data_run;
mod error;
mod file_reference;
mod index;
mod index_node;
mod index_record;
mod record;
mod sparse_stream;
mod types;
mod volume;

pub use crate::cluster_stream::*;
pub use crate::collation::*;
pub use crate::data_run::*;
pub use crate::error::*;
pub use crate::file_reference::*;
pub use crate::index::*;
pub use crate::index_node::*;
pub use crate::index_record::*;
pub use crate::record::*;
pub use crate::sparse_stream::*;
pub use crate::types::*;
pub use crate::volume::*;
