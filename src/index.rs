// Copyright 2023-2025 Colin Finck <colin@reactos.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::mem;
use std::io::{Read, Seek, Write};

use log::debug;

use crate::cluster_stream::RawClusterStream;
use crate::collation::NtfsCollationRule;
use crate::error::{NtfsError, Result};
use crate::index_node::{EntryLookup, IndexNode, NtfsIndexEntry, INDEX_NODE_HEADER_SIZE};
use crate::index_record::NtfsIndexRecord;
use crate::sparse_stream::SparseClusterStream;
use crate::types::Vcn;
use crate::volume::{ClusterAllocator, Volume};

/// Smallest resident root budget that still leaves room for one promoted
/// entry next to the End entry.
const MIN_RESIDENT_BUDGET: u32 = 64;

/// Tuning knobs of one index, as stored in its `$INDEX_ROOT` attribute.
#[derive(Clone, Copy, Debug)]
pub struct IndexConfig {
    /// Byte size of one Index Record of the allocation stream.
    /// Must be a multiple of the cluster size.
    pub index_record_size: u32,
    /// Byte budget for the entries of the resident root.
    /// Once the root outgrows it, the index moves to an allocation stream.
    pub resident_budget: u32,
    /// Minimum fill of an Index Record after a removal, as a percentage of
    /// its entry capacity. Values above 50 are treated as 50.
    pub min_fill_percent: u8,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_record_size: 4096,
            resident_budget: 448,
            min_fill_percent: 25,
        }
    }
}

/// Where the entries of an index currently live.
///
/// An index starts out with all entries resident in its root node and is
/// promoted to an allocation stream of Index Records once the root
/// overflows its budget. Promotion is one-way: a shrinking index inlines
/// its last Index Record back into the root, but keeps the (then empty)
/// allocation stream.
enum IndexRootState {
    Resident(IndexNode),
    Allocated {
        root: IndexNode,
        allocation: IndexAllocation,
    },
}

/// The `$INDEX_ALLOCATION` stream of one index: a sparse cluster stream
/// holding fixup-protected Index Records, addressed by VCN in
/// record-sized steps.
struct IndexAllocation {
    volume: Volume,
    stream: SparseClusterStream,
    record_size: u32,
    next_vcn: i64,
    free_vcns: Vec<i64>,
    next_usn: u16,
}

impl IndexAllocation {
    fn new(volume: Volume, record_size: u32) -> Result<Self> {
        let clusters_per_record = (record_size / volume.cluster_size()) as u64;
        let stream = SparseClusterStream::new(RawClusterStream::new(volume), clusters_per_record)?;

        Ok(Self {
            volume,
            stream,
            record_size,
            next_vcn: 0,
            free_vcns: Vec::new(),
            next_usn: 1,
        })
    }

    fn load(
        volume: Volume,
        record_size: u32,
        stream: SparseClusterStream,
        free_vcns: Vec<i64>,
    ) -> Result<Self> {
        let clusters_per_record = (record_size / volume.cluster_size()) as u64;
        if stream.compression_unit() != clusters_per_record {
            return Err(NtfsError::InvalidIndexRecordSize {
                index_record_size: record_size,
                cluster_size: volume.cluster_size(),
            });
        }

        let next_vcn = stream.total_clusters() as i64;

        Ok(Self {
            volume,
            stream,
            record_size,
            next_vcn,
            free_vcns,
            next_usn: 1,
        })
    }

    fn clusters_per_record(&self) -> u64 {
        (self.record_size / self.volume.cluster_size()) as u64
    }

    fn record_position(&self, vcn: Vcn) -> u64 {
        vcn.value().max(0) as u64 * self.volume.cluster_size() as u64
    }

    fn new_record(&self, vcn: Vcn) -> Result<NtfsIndexRecord> {
        NtfsIndexRecord::create(vcn, self.record_size, self.volume.sector_size())
    }

    fn read_record<T>(&self, fs: &mut T, vcn: Vcn) -> Result<NtfsIndexRecord>
    where
        T: Read + Seek,
    {
        let mut buffer = vec![0u8; self.record_size as usize];
        self.stream
            .read_clusters(fs, vcn, self.clusters_per_record(), &mut buffer)?;

        NtfsIndexRecord::from_bytes(
            buffer,
            self.record_position(vcn),
            self.volume.sector_size(),
            vcn,
        )
    }

    /// Serializes the record under a fresh Update Sequence Number and
    /// writes it out, making the mutation durable before the caller
    /// returns.
    fn write_record<T, A>(
        &mut self,
        fs: &mut T,
        allocator: &mut A,
        record: &NtfsIndexRecord,
    ) -> Result<()>
    where
        T: Read + Write + Seek,
        A: ClusterAllocator,
    {
        let usn = self.next_usn;
        self.next_usn = if self.next_usn == u16::MAX {
            1
        } else {
            self.next_usn + 1
        };

        let bytes = record.to_bytes(usn)?;
        self.stream.write_clusters(
            fs,
            allocator,
            record.vcn(),
            self.clusters_per_record(),
            &bytes,
        )
    }

    /// Hands out the VCN for a new Index Record, preferring one freed
    /// earlier over growing the stream.
    fn allocate_record<A>(&mut self, allocator: &mut A) -> Result<Vcn>
    where
        A: ClusterAllocator,
    {
        if let Some(vcn) = self.free_vcns.pop() {
            return Ok(Vcn::from(vcn));
        }

        let vcn = Vcn::from(self.next_vcn);
        self.stream
            .allocate_clusters(allocator, vcn, self.clusters_per_record())?;
        self.next_vcn += self.clusters_per_record() as i64;

        Ok(vcn)
    }

    /// Retires an Index Record.
    /// Its clusters stay allocated and the VCN is recycled by the next
    /// split, like a record marked free in the index bitmap.
    fn free_record(&mut self, vcn: Vcn) {
        debug!("retired the index record at VCN {vcn}");
        self.free_vcns.push(vcn.value());
    }
}

/// Shared context of one mutating tree walk.
struct TreeCtx<'a, T, A> {
    allocation: &'a mut IndexAllocation,
    fs: &'a mut T,
    bitmap: &'a mut A,
    rule: NtfsCollationRule,
    capacity: usize,
    min_fill: usize,
}

struct InsertResult {
    previous: Option<Vec<u8>>,
    promoted: Option<NtfsIndexEntry>,
}

struct RemoveResult {
    removed: Option<Vec<u8>>,
    promoted: Option<NtfsIndexEntry>,
}

/// One B-tree index over opaque keys and data, maintained with the
/// on-disk semantics of NTFS: every node is an ordered entry list closed
/// by an End entry, and an entry's sub-node holds all keys collating
/// before it.
///
/// All operations are synchronous; a dirtied Index Record is written back
/// before the operation returns. The caller persists the root via
/// [`NtfsIndex::serialize_root`] as part of its own record update.
pub struct NtfsIndex {
    volume: Volume,
    rule: NtfsCollationRule,
    config: IndexConfig,
    state: IndexRootState,
}

impl NtfsIndex {
    /// Creates an empty index, fully resident in its root.
    pub fn new(volume: Volume, rule: NtfsCollationRule, config: IndexConfig) -> Result<Self> {
        Self::validate_config(&volume, &config)?;

        Ok(Self {
            volume,
            rule,
            config,
            state: IndexRootState::Resident(IndexNode::new()),
        })
    }

    /// Rebuilds an index from its persisted parts: the serialized root
    /// node and, for a promoted index, its allocation stream plus the VCNs
    /// of retired Index Records.
    pub fn load(
        volume: Volume,
        rule: NtfsCollationRule,
        config: IndexConfig,
        root_data: &[u8],
        allocation_stream: Option<SparseClusterStream>,
        free_record_vcns: Vec<i64>,
    ) -> Result<Self> {
        Self::validate_config(&volume, &config)?;
        let root = IndexNode::from_slice(root_data, 0)?;

        let state = match allocation_stream {
            Some(stream) => IndexRootState::Allocated {
                root,
                allocation: IndexAllocation::load(
                    volume,
                    config.index_record_size,
                    stream,
                    free_record_vcns,
                )?,
            },
            None => {
                if root.has_children() {
                    return Err(NtfsError::MissingIndexAllocation { position: 0 });
                }
                IndexRootState::Resident(root)
            }
        };

        Ok(Self {
            volume,
            rule,
            config,
            state,
        })
    }

    fn validate_config(volume: &Volume, config: &IndexConfig) -> Result<()> {
        if config.index_record_size == 0
            || config.index_record_size % volume.cluster_size() != 0
        {
            return Err(NtfsError::InvalidIndexRecordSize {
                index_record_size: config.index_record_size,
                cluster_size: volume.cluster_size(),
            });
        }

        // Also checks the record against the sector geometry.
        NtfsIndexRecord::create(
            Vcn::from(0i64),
            config.index_record_size,
            volume.sector_size(),
        )?;

        let capacity =
            NtfsIndexRecord::entry_capacity(config.index_record_size, volume.sector_size()) as u32;
        if config.resident_budget < MIN_RESIDENT_BUDGET || config.resident_budget > capacity {
            return Err(NtfsError::InvalidResidentBudget {
                resident_budget: config.resident_budget,
                capacity,
            });
        }

        Ok(())
    }

    pub fn collation_rule(&self) -> NtfsCollationRule {
        self.rule
    }

    /// Returns whether this index has been promoted to an allocation
    /// stream.
    pub fn has_allocation_stream(&self) -> bool {
        matches!(self.state, IndexRootState::Allocated { .. })
    }

    /// The allocation stream for persisting, once the index is promoted.
    pub fn allocation_stream(&self) -> Option<&SparseClusterStream> {
        self.allocation().map(|allocation| &allocation.stream)
    }

    /// VCNs of retired Index Records, for persisting alongside the
    /// allocation stream.
    pub fn free_record_vcns(&self) -> Vec<i64> {
        self.allocation()
            .map(|allocation| allocation.free_vcns.clone())
            .unwrap_or_default()
    }

    /// Serializes the root node in the form it takes inside the
    /// `$INDEX_ROOT` attribute value.
    pub fn serialize_root(&self) -> Result<Vec<u8>> {
        let root = self.root();
        let size = INDEX_NODE_HEADER_SIZE + root.entry_bytes();
        let mut buffer = vec![0u8; size];
        root.serialize_into(&mut buffer, INDEX_NODE_HEADER_SIZE)?;

        Ok(buffer)
    }

    /// Looks up a key and returns a copy of its data.
    pub fn get<T>(&self, fs: &mut T, key: &[u8]) -> Result<Option<Vec<u8>>>
    where
        T: Read + Seek,
    {
        enum SearchStep {
            Done(Option<Vec<u8>>),
            Descend(Vcn),
        }

        fn search(rule: NtfsCollationRule, node: &IndexNode, key: &[u8]) -> SearchStep {
            match node.locate(rule, key) {
                EntryLookup::Found(index) => {
                    SearchStep::Done(Some(node.entries()[index].data().to_vec()))
                }
                EntryLookup::NotFound(index) => match node.entries()[index].subnode_vcn() {
                    Some(vcn) => SearchStep::Descend(vcn),
                    None => SearchStep::Done(None),
                },
            }
        }

        let mut step = search(self.rule, self.root(), key);

        loop {
            match step {
                SearchStep::Done(result) => return Ok(result),
                SearchStep::Descend(vcn) => {
                    let allocation = self
                        .allocation()
                        .ok_or(NtfsError::MissingIndexAllocation { position: 0 })?;
                    let record = allocation.read_record(fs, vcn)?;
                    step = search(self.rule, record.node(), key);
                }
            }
        }
    }

    /// Inserts a key with its data.
    /// If the key already exists under this index's collation rule, its
    /// data is replaced and the previous data is returned.
    pub fn insert<T, A>(
        &mut self,
        fs: &mut T,
        allocator: &mut A,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<Vec<u8>>>
    where
        T: Read + Write + Seek,
        A: ClusterAllocator,
    {
        let rule = self.rule;
        let capacity = self.record_entry_capacity();
        let min_fill = self.min_fill();

        // The entry must fit an Index Record next to the End entry, and
        // may still gain a sub-node reference when its node is split.
        let projected =
            NtfsIndexEntry::new(key.to_vec(), data.to_vec()).serialized_size() + mem::size_of::<i64>();
        if projected + NtfsIndexEntry::new_end(Some(Vcn::from(0i64))).serialized_size() > capacity {
            return Err(NtfsError::IndexEntryTooLarge {
                size: projected,
                capacity,
            });
        }

        let previous = match &mut self.state {
            IndexRootState::Resident(root) => match root.locate(rule, key) {
                EntryLookup::Found(index) => {
                    let entry = &mut root.entries_mut()[index];
                    let previous = entry.data().to_vec();
                    entry.set_data(data.to_vec());
                    Some(previous)
                }
                EntryLookup::NotFound(index) => {
                    root.entries_mut()
                        .insert(index, NtfsIndexEntry::new(key.to_vec(), data.to_vec()));
                    None
                }
            },
            IndexRootState::Allocated { root, allocation } => {
                let mut ctx = TreeCtx {
                    allocation,
                    fs,
                    bitmap: allocator,
                    rule,
                    capacity,
                    min_fill,
                };
                let result = insert_recursive(&mut ctx, root, usize::MAX, key, data)?;
                debug_assert!(result.promoted.is_none());
                result.previous
            }
        };

        self.handle_root_overflow(fs, allocator)?;
        Ok(previous)
    }

    /// Removes a key and returns its data.
    pub fn remove<T, A>(
        &mut self,
        fs: &mut T,
        allocator: &mut A,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>
    where
        T: Read + Write + Seek,
        A: ClusterAllocator,
    {
        let rule = self.rule;
        let capacity = self.record_entry_capacity();
        let min_fill = self.min_fill();

        let removed = match &mut self.state {
            IndexRootState::Resident(root) => match root.locate(rule, key) {
                EntryLookup::Found(index) => {
                    let entry = root.entries_mut().remove(index);
                    Some(entry.into_key_and_data().1)
                }
                EntryLookup::NotFound(_) => None,
            },
            IndexRootState::Allocated { root, allocation } => {
                let mut ctx = TreeCtx {
                    allocation,
                    fs,
                    bitmap: allocator,
                    rule,
                    capacity,
                    min_fill,
                };
                let result = remove_recursive(&mut ctx, root, usize::MAX, key)?;
                debug_assert!(result.promoted.is_none());
                result.removed
            }
        };

        // Substituting an internal entry by its successor may have grown
        // the root beyond its budget.
        self.handle_root_overflow(fs, allocator)?;
        self.collapse_root(fs)?;
        Ok(removed)
    }

    /// Returns a cursor over all entries in collation order.
    pub fn entries(&self) -> NtfsIndexEntries<'_> {
        NtfsIndexEntries::new(self)
    }

    fn root(&self) -> &IndexNode {
        match &self.state {
            IndexRootState::Resident(root) => root,
            IndexRootState::Allocated { root, .. } => root,
        }
    }

    fn allocation(&self) -> Option<&IndexAllocation> {
        match &self.state {
            IndexRootState::Resident(_) => None,
            IndexRootState::Allocated { allocation, .. } => Some(allocation),
        }
    }

    fn record_entry_capacity(&self) -> usize {
        NtfsIndexRecord::entry_capacity(self.config.index_record_size, self.volume.sector_size())
    }

    fn min_fill(&self) -> usize {
        self.record_entry_capacity() * self.config.min_fill_percent.min(50) as usize / 100
    }

    /// Splits the root down to its budget, promoting the index to an
    /// allocation stream first if it is still resident.
    fn handle_root_overflow<T, A>(&mut self, fs: &mut T, allocator: &mut A) -> Result<()>
    where
        T: Read + Write + Seek,
        A: ClusterAllocator,
    {
        let budget = self.config.resident_budget as usize;
        if self.root().entry_bytes() <= budget {
            return Ok(());
        }

        if matches!(self.state, IndexRootState::Resident(_)) {
            self.promote()?;
        }

        let rule = self.rule;
        let capacity = self.record_entry_capacity();
        let min_fill = self.min_fill();

        if let IndexRootState::Allocated { root, allocation } = &mut self.state {
            let mut ctx = TreeCtx {
                allocation,
                fs,
                bitmap: allocator,
                rule,
                capacity,
                min_fill,
            };

            while root.entry_bytes() > budget && root.entry_count() > 1 {
                let promoted = split_node(&mut ctx, root)?;
                // The promoted entry collates before everything the root
                // kept.
                root.entries_mut().insert(0, promoted);
            }

            // A single entry bigger than the budget cannot be split any
            // further; the whole root node moves into an Index Record and
            // the root keeps only an End entry pointing at it.
            if root.entry_bytes() > budget {
                let vcn = ctx.allocation.allocate_record(ctx.bitmap)?;
                let mut record = ctx.allocation.new_record(vcn)?;
                record.set_node(mem::take(root));
                ctx.allocation.write_record(ctx.fs, ctx.bitmap, &record)?;

                root.entries_mut()[0].set_subnode_vcn(Some(vcn));
                debug!("spilled the index root into the record at VCN {vcn}");
            }
        }

        Ok(())
    }

    fn promote(&mut self) -> Result<()> {
        let allocation = IndexAllocation::new(self.volume, self.config.index_record_size)?;

        if let IndexRootState::Resident(root) = &mut self.state {
            let root = mem::take(root);
            debug!("promoting the index root to an allocation stream");
            self.state = IndexRootState::Allocated { root, allocation };
        }

        Ok(())
    }

    /// Inlines the last Index Record back into an entry-less root if it
    /// fits the budget again.
    fn collapse_root<T>(&mut self, fs: &mut T) -> Result<()>
    where
        T: Read + Seek,
    {
        let budget = self.config.resident_budget as usize;

        if let IndexRootState::Allocated { root, allocation } = &mut self.state {
            if root.entry_count() != 0 {
                return Ok(());
            }

            if let Some(vcn) = root.entries()[0].subnode_vcn() {
                let record = allocation.read_record(fs, vcn)?;
                if record.node().entry_bytes() <= budget {
                    allocation.free_record(vcn);
                    debug!("collapsed the index root from the record at VCN {vcn}");
                    *root = record.into_node();
                }
            }
        }

        Ok(())
    }
}

fn insert_recursive<T, A>(
    ctx: &mut TreeCtx<'_, T, A>,
    node: &mut IndexNode,
    capacity: usize,
    key: &[u8],
    data: &[u8],
) -> Result<InsertResult>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let previous = match node.locate(ctx.rule, key) {
        EntryLookup::Found(index) => {
            let entry = &mut node.entries_mut()[index];
            let previous = entry.data().to_vec();
            entry.set_data(data.to_vec());
            Some(previous)
        }
        EntryLookup::NotFound(index) => match node.entries()[index].subnode_vcn() {
            Some(subnode_vcn) => {
                let record_capacity = ctx.capacity;
                let mut child = ctx.allocation.read_record(ctx.fs, subnode_vcn)?;
                let result = insert_recursive(ctx, child.node_mut(), record_capacity, key, data)?;

                if let Some(promoted) = result.promoted {
                    // The promoted entry collates before the entry we
                    // descended through.
                    node.entries_mut().insert(index, promoted);
                }
                ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;

                result.previous
            }
            None => {
                node.entries_mut()
                    .insert(index, NtfsIndexEntry::new(key.to_vec(), data.to_vec()));
                None
            }
        },
    };

    let promoted = if node.entry_bytes() > capacity && node.entry_count() > 1 {
        Some(split_node(ctx, node)?)
    } else {
        None
    };

    Ok(InsertResult { previous, promoted })
}

/// Splits an overflowing node: all entries before the byte-wise median
/// move into a fresh Index Record, the node keeps the rest, and the median
/// is returned for insertion into the parent, pointing at the new record.
fn split_node<T, A>(ctx: &mut TreeCtx<'_, T, A>, node: &mut IndexNode) -> Result<NtfsIndexEntry>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let entries = node.entries_mut();
    let real_count = entries.len() - 1;
    debug_assert!(real_count >= 2);

    // Pick the median by cumulative byte size, so both halves carry a
    // similar load even with variable-length keys.
    let total: usize = entries[..real_count]
        .iter()
        .map(NtfsIndexEntry::serialized_size)
        .sum();
    let mut cumulative = 0;
    let mut median_index = real_count - 1;
    for (index, entry) in entries[..real_count].iter().enumerate() {
        cumulative += entry.serialized_size();
        if cumulative * 2 > total {
            median_index = index;
            break;
        }
    }
    // The left half must take at least one entry, or the split cannot
    // shrink the node.
    let median_index = median_index.max(1);

    let right_entries = entries.split_off(median_index + 1);
    let mut left_entries = mem::replace(entries, right_entries);
    let mut median = left_entries.remove(median_index);
    // The median's sub-tree holds everything between the two halves; it
    // becomes the tail of the left node.
    left_entries.push(NtfsIndexEntry::new_end(median.subnode_vcn()));

    let left_vcn = ctx.allocation.allocate_record(ctx.bitmap)?;
    let mut left_record = ctx.allocation.new_record(left_vcn)?;
    left_record.set_node(IndexNode::from_entries(left_entries));
    ctx.allocation
        .write_record(ctx.fs, ctx.bitmap, &left_record)?;

    debug!("split an index node into the new record at VCN {left_vcn}");

    median.set_subnode_vcn(Some(left_vcn));
    Ok(median)
}

fn remove_recursive<T, A>(
    ctx: &mut TreeCtx<'_, T, A>,
    node: &mut IndexNode,
    capacity: usize,
    key: &[u8],
) -> Result<RemoveResult>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let removed = match node.locate(ctx.rule, key) {
        EntryLookup::Found(index) => {
            let subnode_vcn = match node.entries()[index].subnode_vcn() {
                Some(vcn) => vcn,
                None => {
                    // No sub-tree is anchored here; the entry can simply go.
                    let entry = node.entries_mut().remove(index);
                    return Ok(RemoveResult {
                        removed: Some(entry.into_key_and_data().1),
                        promoted: None,
                    });
                }
            };

            // The entry anchors the sub-tree of all smaller keys, so it is
            // substituted by a neighboring key instead of being removed.
            let removed_data = node.entries()[index].data().to_vec();

            if let Some(successor_vcn) = node.entries()[index + 1].subnode_vcn() {
                let (successor_key, successor_data) = take_min(ctx, successor_vcn)?;
                node.entries_mut()[index].replace_key_and_data(successor_key, successor_data);
                rebalance_child(ctx, node, index + 1)?;
            } else if !node.entries()[index + 1].is_end() {
                let successor = node.entries_mut().remove(index + 1);
                let (successor_key, successor_data) = successor.into_key_and_data();
                node.entries_mut()[index].replace_key_and_data(successor_key, successor_data);
            } else {
                // No key collates after this one below the node; fall back
                // to the predecessor from the entry's own sub-tree.
                let (predecessor_key, predecessor_data) = take_max(ctx, subnode_vcn)?;
                node.entries_mut()[index].replace_key_and_data(predecessor_key, predecessor_data);
                rebalance_child(ctx, node, index)?;
            }

            Some(removed_data)
        }
        EntryLookup::NotFound(index) => match node.entries()[index].subnode_vcn() {
            None => {
                return Ok(RemoveResult {
                    removed: None,
                    promoted: None,
                })
            }
            Some(subnode_vcn) => {
                let record_capacity = ctx.capacity;
                let mut child = ctx.allocation.read_record(ctx.fs, subnode_vcn)?;
                let result = remove_recursive(ctx, child.node_mut(), record_capacity, key)?;

                if let Some(promoted) = result.promoted {
                    // A substitution grew the child beyond its capacity.
                    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;
                    node.entries_mut().insert(index, promoted);
                } else if result.removed.is_some() {
                    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;
                    rebalance_child(ctx, node, index)?;
                }

                result.removed
            }
        },
    };

    let promoted = if node.entry_bytes() > capacity && node.entry_count() > 1 {
        Some(split_node(ctx, node)?)
    } else {
        None
    };

    Ok(RemoveResult { removed, promoted })
}

/// Removes and returns the smallest key below the given record, writing
/// back every node on the path.
fn take_min<T, A>(ctx: &mut TreeCtx<'_, T, A>, vcn: Vcn) -> Result<(Vec<u8>, Vec<u8>)>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let mut record = ctx.allocation.read_record(ctx.fs, vcn)?;
    let node = record.node_mut();

    let taken = if let Some(subnode_vcn) = node.entries()[0].subnode_vcn() {
        let taken = take_min(ctx, subnode_vcn)?;
        rebalance_child(ctx, node, 0)?;
        taken
    } else {
        if node.entry_count() == 0 {
            return Err(NtfsError::EmptyIndexNode {
                position: ctx.allocation.record_position(vcn),
            });
        }
        let entry = node.entries_mut().remove(0);
        entry.into_key_and_data()
    };

    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &record)?;
    Ok(taken)
}

/// Removes and returns the greatest key below the given record, writing
/// back every node on the path.
fn take_max<T, A>(ctx: &mut TreeCtx<'_, T, A>, vcn: Vcn) -> Result<(Vec<u8>, Vec<u8>)>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let mut record = ctx.allocation.read_record(ctx.fs, vcn)?;
    let node = record.node_mut();
    let end_index = node.entries().len() - 1;

    let taken = if let Some(subnode_vcn) = node.entries()[end_index].subnode_vcn() {
        let taken = take_max(ctx, subnode_vcn)?;
        rebalance_child(ctx, node, end_index)?;
        taken
    } else {
        if node.entry_count() == 0 {
            return Err(NtfsError::EmptyIndexNode {
                position: ctx.allocation.record_position(vcn),
            });
        }
        let entry = node.entries_mut().remove(end_index - 1);
        // The greatest entry may still anchor the sub-tree of keys before
        // it; that sub-tree now holds everything after the remaining
        // entries and moves to the End entry.
        node.entries_mut()[end_index - 1].set_subnode_vcn(entry.subnode_vcn());
        entry.into_key_and_data()
    };

    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &record)?;
    Ok(taken)
}

/// Restores the fill invariant of the child behind `parent`'s entry at
/// `index` after a removal below it: an empty leaf is pruned, an
/// undersized node is merged with a sibling if the result fits, and
/// otherwise borrows one entry through the separator.
fn rebalance_child<T, A>(
    ctx: &mut TreeCtx<'_, T, A>,
    parent: &mut IndexNode,
    index: usize,
) -> Result<()>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let child_vcn = match parent.entries()[index].subnode_vcn() {
        Some(vcn) => vcn,
        None => return Ok(()),
    };

    let child = ctx.allocation.read_record(ctx.fs, child_vcn)?;

    if child.node().entry_count() == 0 && child.node().is_leaf() {
        ctx.allocation.free_record(child_vcn);
        parent.entries_mut()[index].set_subnode_vcn(None);
        return Ok(());
    }
    if child.node().entry_bytes() >= ctx.min_fill {
        return Ok(());
    }

    // Prefer the right sibling; fall back to the left one.
    let right_vcn = parent
        .entries()
        .get(index + 1)
        .and_then(NtfsIndexEntry::subnode_vcn);
    if let Some(right_vcn) = right_vcn {
        return merge_or_borrow_right(ctx, parent, index, child, right_vcn);
    }
    if index > 0 {
        if let Some(left_vcn) = parent.entries()[index - 1].subnode_vcn() {
            return merge_or_borrow_left(ctx, parent, index, child, left_vcn);
        }
    }

    // No adjacent sub-node to rebalance with; an undersized node is
    // acceptable then.
    Ok(())
}

fn merge_or_borrow_right<T, A>(
    ctx: &mut TreeCtx<'_, T, A>,
    parent: &mut IndexNode,
    index: usize,
    mut child: NtfsIndexRecord,
    right_vcn: Vcn,
) -> Result<()>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let mut right = ctx.allocation.read_record(ctx.fs, right_vcn)?;

    // The separator moves down, inheriting the child's End sub-tree.
    let separator = &parent.entries()[index];
    let child_end = &child.node().entries()[child.node().entries().len() - 1];
    let mut moved_separator =
        NtfsIndexEntry::new(separator.key().to_vec(), separator.data().to_vec());
    moved_separator.set_subnode_vcn(child_end.subnode_vcn());

    let merged_bytes = child.node().entry_bytes() - child_end.serialized_size()
        + moved_separator.serialized_size()
        + right.node().entry_bytes();

    if merged_bytes <= ctx.capacity {
        let mut entries =
            child.node().entries()[..child.node().entries().len() - 1].to_vec();
        entries.push(moved_separator);
        entries.append(right.node_mut().entries_mut());

        right.set_node(IndexNode::from_entries(entries));
        ctx.allocation.write_record(ctx.fs, ctx.bitmap, &right)?;
        ctx.allocation.free_record(child.vcn());
        parent.entries_mut().remove(index);

        debug!("merged the index record at VCN {} into VCN {right_vcn}", child.vcn());
        return Ok(());
    }

    // Merging does not fit; rotate the right sibling's first entry
    // through the separator.
    if right.node().entry_count() == 0 {
        return Ok(());
    }
    let borrowed = right.node_mut().entries_mut().remove(0);
    let end_index = child.node().entries().len() - 1;
    child.node_mut().entries_mut()[end_index].set_subnode_vcn(borrowed.subnode_vcn());
    child.node_mut().entries_mut().insert(end_index, moved_separator);
    let (borrowed_key, borrowed_data) = borrowed.into_key_and_data();
    parent.entries_mut()[index].replace_key_and_data(borrowed_key, borrowed_data);

    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;
    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &right)?;
    Ok(())
}

fn merge_or_borrow_left<T, A>(
    ctx: &mut TreeCtx<'_, T, A>,
    parent: &mut IndexNode,
    index: usize,
    mut child: NtfsIndexRecord,
    left_vcn: Vcn,
) -> Result<()>
where
    T: Read + Write + Seek,
    A: ClusterAllocator,
{
    let mut left = ctx.allocation.read_record(ctx.fs, left_vcn)?;
    let separator_index = index - 1;

    let separator = &parent.entries()[separator_index];
    let left_end = &left.node().entries()[left.node().entries().len() - 1];
    let mut moved_separator =
        NtfsIndexEntry::new(separator.key().to_vec(), separator.data().to_vec());
    moved_separator.set_subnode_vcn(left_end.subnode_vcn());

    let merged_bytes = left.node().entry_bytes() - left_end.serialized_size()
        + moved_separator.serialized_size()
        + child.node().entry_bytes();

    if merged_bytes <= ctx.capacity {
        let mut entries = left.node().entries()[..left.node().entries().len() - 1].to_vec();
        entries.push(moved_separator);
        entries.append(child.node_mut().entries_mut());

        child.set_node(IndexNode::from_entries(entries));
        ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;
        ctx.allocation.free_record(left_vcn);
        parent.entries_mut().remove(separator_index);

        debug!("merged the index record at VCN {left_vcn} into VCN {}", child.vcn());
        return Ok(());
    }

    if left.node().entry_count() == 0 {
        return Ok(());
    }
    // Rotate the left sibling's last entry through the separator; its
    // End sub-tree moves below the separator into the child.
    let last_real = left.node().entries().len() - 2;
    let borrowed = left.node_mut().entries_mut().remove(last_real);
    let left_end_index = left.node().entries().len() - 1;
    left.node_mut().entries_mut()[left_end_index].set_subnode_vcn(borrowed.subnode_vcn());
    child.node_mut().entries_mut().insert(0, moved_separator);
    let (borrowed_key, borrowed_data) = borrowed.into_key_and_data();
    parent.entries_mut()[separator_index].replace_key_and_data(borrowed_key, borrowed_data);

    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &child)?;
    ctx.allocation.write_record(ctx.fs, ctx.bitmap, &left)?;
    Ok(())
}

struct EnumerationFrame {
    node: IndexNode,
    entry_index: usize,
    descended: bool,
}

/// Cursor over all entries of an index in collation order.
///
/// This is no [`Iterator`], as advancing requires access to the
/// filesystem object.
pub struct NtfsIndexEntries<'i> {
    index: &'i NtfsIndex,
    stack: Vec<EnumerationFrame>,
}

impl<'i> NtfsIndexEntries<'i> {
    fn new(index: &'i NtfsIndex) -> Self {
        let stack = vec![EnumerationFrame {
            node: index.root().clone(),
            entry_index: 0,
            descended: false,
        }];

        Self { index, stack }
    }

    /// Advances to the next entry, returning its key and data.
    pub fn next<T>(&mut self, fs: &mut T) -> Option<Result<(Vec<u8>, Vec<u8>)>>
    where
        T: Read + Seek,
    {
        loop {
            let frame = self.stack.last_mut()?;
            let entry = &frame.node.entries()[frame.entry_index];

            if !frame.descended {
                frame.descended = true;

                if let Some(subnode_vcn) = entry.subnode_vcn() {
                    let allocation = match self.index.allocation() {
                        Some(allocation) => allocation,
                        None => {
                            return Some(Err(NtfsError::MissingIndexAllocation { position: 0 }))
                        }
                    };
                    let record = match allocation.read_record(fs, subnode_vcn) {
                        Ok(record) => record,
                        Err(e) => return Some(Err(e)),
                    };

                    self.stack.push(EnumerationFrame {
                        node: record.into_node(),
                        entry_index: 0,
                        descended: false,
                    });
                    continue;
                }
            }

            // The sub-tree before this entry (if any) is exhausted.
            if entry.is_end() {
                self.stack.pop();
                continue;
            }

            let item = (entry.key().to_vec(), entry.data().to_vec());
            frame.entry_index += 1;
            frame.descended = false;
            return Some(Ok(item));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::ClusterBitmap;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    fn small_config(resident_budget: u32) -> (Volume, IndexConfig) {
        let volume = Volume::new(512, 512).unwrap();
        let config = IndexConfig {
            index_record_size: 1024,
            resident_budget,
            min_fill_percent: 25,
        };
        (volume, config)
    }

    fn small_index(
        rule: NtfsCollationRule,
        resident_budget: u32,
    ) -> (NtfsIndex, Cursor<Vec<u8>>, ClusterBitmap) {
        let (volume, config) = small_config(resident_budget);
        let index = NtfsIndex::new(volume, rule, config).unwrap();
        (index, Cursor::new(Vec::new()), ClusterBitmap::new(4096))
    }

    fn collect_keys(index: &NtfsIndex, device: &mut Cursor<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut cursor = index.entries();
        let mut keys = Vec::new();
        while let Some(item) = cursor.next(device) {
            keys.push(item.unwrap().0);
        }
        keys
    }

    #[test]
    fn test_config_validation() {
        let volume = Volume::new(512, 4096).unwrap();

        // 1024 is smaller than one cluster.
        let config = IndexConfig {
            index_record_size: 1024,
            resident_budget: 448,
            min_fill_percent: 25,
        };
        assert!(matches!(
            NtfsIndex::new(volume, NtfsCollationRule::Binary, config),
            Err(NtfsError::InvalidIndexRecordSize { .. })
        ));

        let config = IndexConfig {
            index_record_size: 4096,
            resident_budget: 8192,
            min_fill_percent: 25,
        };
        assert!(matches!(
            NtfsIndex::new(volume, NtfsCollationRule::Binary, config),
            Err(NtfsError::InvalidResidentBudget { .. })
        ));
    }

    #[test]
    fn test_insert_and_get_resident() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::UnicodeString, 400);

        assert_eq!(
            index
                .insert(&mut device, &mut bitmap, &utf16le("kiwi"), b"one")
                .unwrap(),
            None
        );
        assert_eq!(
            index
                .insert(&mut device, &mut bitmap, &utf16le("kiwi"), b"two")
                .unwrap(),
            Some(b"one".to_vec())
        );
        assert!(!index.has_allocation_stream());

        assert_eq!(
            index.get(&mut device, &utf16le("kiwi")).unwrap(),
            Some(b"two".to_vec())
        );
        assert_eq!(index.get(&mut device, &utf16le("mango")).unwrap(), None);
    }

    #[test]
    fn test_insert_promotes_overflowing_root() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::UnicodeString, 120);

        for name in ["apple", "banana", "cherry"] {
            index
                .insert(&mut device, &mut bitmap, &utf16le(name), b"")
                .unwrap();
        }
        assert!(!index.has_allocation_stream());

        // The fourth name overflows the 120-byte budget.
        index
            .insert(&mut device, &mut bitmap, &utf16le("date"), b"")
            .unwrap();
        assert!(index.has_allocation_stream());

        // All keys stay reachable, in collation order.
        assert_eq!(
            collect_keys(&index, &mut device),
            vec![
                utf16le("apple"),
                utf16le("banana"),
                utf16le("cherry"),
                utf16le("date"),
            ]
        );
        for name in ["apple", "banana", "cherry", "date"] {
            assert_eq!(
                index.get(&mut device, &utf16le(name)).unwrap(),
                Some(Vec::new())
            );
        }
        assert_eq!(index.get(&mut device, &utf16le("durian")).unwrap(), None);
    }

    #[test]
    fn test_remove_from_resident_root() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::UnicodeString, 400);

        index
            .insert(&mut device, &mut bitmap, &utf16le("alpha"), b"a")
            .unwrap();
        index
            .insert(&mut device, &mut bitmap, &utf16le("beta"), b"b")
            .unwrap();

        assert_eq!(
            index
                .remove(&mut device, &mut bitmap, &utf16le("beta"))
                .unwrap(),
            Some(b"b".to_vec())
        );
        assert_eq!(index.get(&mut device, &utf16le("beta")).unwrap(), None);
        assert_eq!(
            index
                .remove(&mut device, &mut bitmap, &utf16le("beta"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_remove_rebalances_and_prunes() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::UnicodeString, 120);

        let names = ["apple", "banana", "cherry", "date"];
        for name in names {
            index
                .insert(&mut device, &mut bitmap, &utf16le(name), b"")
                .unwrap();
        }
        assert!(index.has_allocation_stream());

        // Removing in this order exercises successor splicing, the
        // predecessor fallback, and pruning of the emptied record.
        for name in ["banana", "cherry", "date", "apple"] {
            assert_eq!(
                index
                    .remove(&mut device, &mut bitmap, &utf16le(name))
                    .unwrap(),
                Some(Vec::new()),
                "failed to remove {name}"
            );
        }

        assert!(collect_keys(&index, &mut device).is_empty());
        for name in names {
            assert_eq!(index.get(&mut device, &utf16le(name)).unwrap(), None);
        }
    }

    #[test]
    fn test_remove_all_keys_empties_the_index() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::UnicodeString, 120);

        let names: Vec<String> = (0..40).map(|i| format!("file{i:03}")).collect();
        for name in &names {
            index
                .insert(&mut device, &mut bitmap, &utf16le(name), name.as_bytes())
                .unwrap();
        }
        assert!(index.has_allocation_stream());
        assert_eq!(collect_keys(&index, &mut device).len(), 40);

        for name in &names {
            assert_eq!(
                index
                    .remove(&mut device, &mut bitmap, &utf16le(name))
                    .unwrap(),
                Some(name.as_bytes().to_vec()),
                "failed to remove {name}"
            );
        }

        assert!(collect_keys(&index, &mut device).is_empty());
        for name in &names {
            assert_eq!(index.get(&mut device, &utf16le(name)).unwrap(), None);
        }
    }

    #[test]
    fn test_root_split_with_a_dominant_first_entry() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::Binary, 120);

        index.insert(&mut device, &mut bitmap, b"x", b"1").unwrap();
        index.insert(&mut device, &mut bitmap, b"y", b"2").unwrap();

        // This key outweighs both others together, putting the byte-wise
        // median onto the very first entry.
        let heavy = vec![b'a'; 45];
        index.insert(&mut device, &mut bitmap, &heavy, b"3").unwrap();
        assert!(index.has_allocation_stream());

        // One record of two clusters must suffice for the split.
        assert_eq!(bitmap.free_cluster_count(), 4096 - 2);

        assert_eq!(
            index.get(&mut device, &heavy).unwrap(),
            Some(b"3".to_vec())
        );
        assert_eq!(index.get(&mut device, b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(index.get(&mut device, b"y").unwrap(), Some(b"2".to_vec()));
        assert_eq!(collect_keys(&index, &mut device).len(), 3);
    }

    #[test]
    fn test_oversized_entry_spills_out_of_the_root() {
        let (mut index, mut device, mut bitmap) =
            small_index(NtfsCollationRule::Binary, 64);

        let key = vec![b'k'; 600];
        index.insert(&mut device, &mut bitmap, &key, b"v").unwrap();
        assert!(index.has_allocation_stream());

        // The root must not carry the entry; it ends up below an End entry
        // in an Index Record, keeping the serialized root within budget.
        let root_data = index.serialize_root().unwrap();
        assert!(root_data.len() as u32 <= INDEX_NODE_HEADER_SIZE as u32 + 64);

        assert_eq!(index.get(&mut device, &key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(collect_keys(&index, &mut device), vec![key.clone()]);

        assert_eq!(
            index.remove(&mut device, &mut bitmap, &key).unwrap(),
            Some(b"v".to_vec())
        );
        assert!(collect_keys(&index, &mut device).is_empty());
    }

    #[test]
    fn test_churn_in_a_deep_tree_matches_btreemap() {
        let volume = Volume::new(512, 512).unwrap();
        let config = IndexConfig {
            index_record_size: 1024,
            resident_budget: 64,
            min_fill_percent: 25,
        };
        let mut index = NtfsIndex::new(volume, NtfsCollationRule::Binary, config).unwrap();
        let mut device = Cursor::new(Vec::new());
        let mut bitmap = ClusterBitmap::new(65536);
        let mut model = BTreeMap::new();

        // A tight root budget and a 600-key space drive the tree three and
        // more levels deep, where substitutions hit nodes mixing entries
        // with and without sub-nodes.
        let mut state = 0x853c_49e6_748f_ea9bu64;
        for step in 0..4000 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let key_number = (state >> 33) % 600;
            let key = format!("key{key_number:05}").into_bytes();
            let data = (key_number as u32).to_le_bytes().to_vec();

            if state & (1 << 32) == 0 {
                let previous = index.insert(&mut device, &mut bitmap, &key, &data).unwrap();
                assert_eq!(
                    previous,
                    model.insert(key, data),
                    "insert diverged at step {step}"
                );
            } else {
                let removed = index.remove(&mut device, &mut bitmap, &key).unwrap();
                assert_eq!(removed, model.remove(&key), "remove diverged at step {step}");
            }
        }
        assert!(!model.is_empty());

        let mut cursor = index.entries();
        let mut enumerated = Vec::new();
        while let Some(item) = cursor.next(&mut device) {
            enumerated.push(item.unwrap());
        }
        let expected: Vec<_> = model
            .iter()
            .map(|(key, data)| (key.clone(), data.clone()))
            .collect();
        assert_eq!(enumerated, expected);

        for (key, data) in &model {
            assert_eq!(index.get(&mut device, key).unwrap(), Some(data.clone()));
        }
    }

    #[test]
    fn test_reload_from_serialized_root() {
        let (volume, config) = small_config(120);
        let mut index =
            NtfsIndex::new(volume, NtfsCollationRule::UnicodeString, config).unwrap();
        let mut device = Cursor::new(Vec::new());
        let mut bitmap = ClusterBitmap::new(4096);

        let names = ["apple", "banana", "cherry", "date"];
        for name in names {
            index
                .insert(&mut device, &mut bitmap, &utf16le(name), name.as_bytes())
                .unwrap();
        }

        let root_data = index.serialize_root().unwrap();
        let stream = index.allocation_stream().unwrap().clone();
        let reloaded = NtfsIndex::load(
            volume,
            NtfsCollationRule::UnicodeString,
            config,
            &root_data,
            Some(stream),
            index.free_record_vcns(),
        )
        .unwrap();

        for name in names {
            assert_eq!(
                reloaded.get(&mut device, &utf16le(name)).unwrap(),
                Some(name.as_bytes().to_vec())
            );
        }
        assert_eq!(collect_keys(&reloaded, &mut device).len(), 4);
    }

    #[test]
    fn test_load_rejects_subnodes_without_allocation() {
        let (volume, config) = small_config(120);
        let mut index =
            NtfsIndex::new(volume, NtfsCollationRule::UnicodeString, config).unwrap();
        let mut device = Cursor::new(Vec::new());
        let mut bitmap = ClusterBitmap::new(4096);

        for name in ["apple", "banana", "cherry", "date"] {
            index
                .insert(&mut device, &mut bitmap, &utf16le(name), name.as_bytes())
                .unwrap();
        }
        let root_data = index.serialize_root().unwrap();

        let err = NtfsIndex::load(
            volume,
            NtfsCollationRule::UnicodeString,
            config,
            &root_data,
            None,
            Vec::new(),
        );
        assert!(matches!(
            err,
            Err(NtfsError::MissingIndexAllocation { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Under arbitrary interleaved inserts and removes, the index must
        /// behave exactly like an in-memory ordered map.
        #[test]
        fn test_churn_matches_btreemap(
            ops in proptest::collection::vec((any::<bool>(), 0u16..200), 1..120)
        ) {
            let (volume, config) = small_config(200);
            let mut index = NtfsIndex::new(volume, NtfsCollationRule::Binary, config).unwrap();
            let mut device = Cursor::new(Vec::new());
            let mut bitmap = ClusterBitmap::new(65536);
            let mut model = BTreeMap::new();

            for (is_insert, key_number) in ops {
                let key = format!("key{key_number:05}").into_bytes();
                let data = key_number.to_le_bytes().to_vec();

                if is_insert {
                    let previous = index.insert(&mut device, &mut bitmap, &key, &data).unwrap();
                    prop_assert_eq!(previous, model.insert(key, data));
                } else {
                    let removed = index.remove(&mut device, &mut bitmap, &key).unwrap();
                    prop_assert_eq!(removed, model.remove(&key));
                }
            }

            let mut cursor = index.entries();
            let mut enumerated = Vec::new();
            while let Some(item) = cursor.next(&mut device) {
                enumerated.push(item.unwrap());
            }
            let expected: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(enumerated, expected);
        }
    }
}
