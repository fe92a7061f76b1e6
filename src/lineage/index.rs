/// Lookup structures built in the first post-processing pass
///
/// Some operators can only be linked to their inputs by value: a hash join
/// probe knows which build payload it matched, an aggregate knows which
/// group a row fell into. `GlobalIndex` turns those values back into row
/// positions so the second pass can resolve them.
use fxhash::FxHashMap;
use std::mem::size_of;

use crate::error::{CaptureAnomaly, Diagnostics};
use crate::lineage::artifact::{BuildHandle, Lsn, RowId, ThreadId, INVALID_LSN};
use crate::lineage::log::{HashAggregateLog, HashJoinLog, LogData, OperatorLog, PerfectAggregateLog};

/// Hash bucket - build rows whose handle hashes here
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// (global build row, handle) pairs in insertion order
    pub entries: Vec<(RowId, BuildHandle)>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle-keyed index over hash join build rows
///
/// The table size is fixed at construction from the total build row count;
/// there is no resizing, so every insert and probe uses the same modulus.
#[derive(Debug, Clone, Default)]
pub struct AddressIndex {
    buckets: Vec<Bucket>,
    total_rows: usize,
}

impl AddressIndex {
    pub fn with_table_size(table_size: usize) -> Self {
        Self {
            buckets: vec![Bucket::default(); table_size],
            total_rows: 0,
        }
    }

    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_for(&self, handle: BuildHandle) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        Some((handle.0 % self.buckets.len() as u64) as usize)
    }

    /// Returns false if the index was sized for zero rows
    pub fn insert(&mut self, row: RowId, handle: BuildHandle) -> bool {
        match self.bucket_for(handle) {
            Some(bucket) => {
                self.buckets[bucket].entries.push((row, handle));
                self.total_rows += 1;
                true
            }
            None => false,
        }
    }

    /// Find the build row stored for `handle`.
    ///
    /// Bucket membership is not enough: the collision list is scanned and
    /// only an exactly equal handle matches.
    pub fn probe(&self, handle: BuildHandle) -> Option<RowId> {
        let bucket = self.bucket_for(handle)?;
        self.buckets[bucket]
            .entries
            .iter()
            .find(|(_, stored)| *stored == handle)
            .map(|(row, _)| *row)
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Get memory usage estimate (rough)
    pub fn memory_usage_bytes(&self) -> usize {
        self.buckets.len() * size_of::<Bucket>()
            + self.total_rows * size_of::<(RowId, BuildHandle)>()
    }
}

/// Query-scoped lookups for one operator's post-processing run
#[derive(Debug, Clone, Default)]
pub struct GlobalIndex {
    pub(crate) address_index: AddressIndex,
    build_cursor: RowId,
    pub(crate) finalize_map: FxHashMap<RowId, BuildHandle>,
    pub(crate) finalize_batches: usize,
    pub(crate) grouping_index: FxHashMap<u64, Vec<RowId>>,
    grouping_count: FxHashMap<usize, RowId>,
    pub(crate) distinct_index: FxHashMap<u64, Vec<RowId>>,
    distinct_count: FxHashMap<usize, RowId>,
    perfect_index: Vec<Vec<RowId>>,
    perfect_bound: usize,
    perfect_cursor: RowId,
    pub(crate) sort_permutation: Option<Vec<RowId>>,
    pub(crate) right_value_cache: FxHashMap<(ThreadId, Lsn), Vec<Option<RowId>>>,
    pub(crate) right_cache_hits: usize,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the hash join table size. Must happen before any build insert.
    pub(crate) fn prepare_address_index(&mut self, total_build_rows: usize) {
        self.address_index = AddressIndex::with_table_size(total_build_rows);
        self.build_cursor = 0;
    }

    /// Cap the dense perfect aggregate table. Dense keys are group ids, so
    /// none can reach the operator's total input row count.
    pub(crate) fn prepare_perfect_index(&mut self, total_rows: usize) {
        self.perfect_index = Vec::new();
        self.perfect_bound = total_rows;
        self.perfect_cursor = 0;
    }

    pub fn address_index(&self) -> &AddressIndex {
        &self.address_index
    }

    /// Global build row matched by a probe handle
    pub fn build_row(&self, handle: BuildHandle) -> Option<RowId> {
        self.address_index.probe(handle)
    }

    pub fn finalize_handle(&self, group: RowId) -> Option<BuildHandle> {
        self.finalize_map.get(&group).copied()
    }

    /// Input rows contributing to a group
    pub fn group_rows(&self, key: u64) -> Option<&[RowId]> {
        self.grouping_index.get(&key).map(Vec::as_slice)
    }

    pub fn distinct_rows(&self, key: u64) -> Option<&[RowId]> {
        self.distinct_index.get(&key).map(Vec::as_slice)
    }

    pub fn perfect_group_rows(&self, key: u32) -> Option<&[RowId]> {
        self.perfect_index.get(key as usize).map(Vec::as_slice)
    }

    pub fn sort_permutation(&self) -> Option<&[RowId]> {
        self.sort_permutation.as_deref()
    }

    pub fn cached_right_values(&self, thread: ThreadId, lsn: Lsn) -> Option<&[Option<RowId>]> {
        self.right_value_cache.get(&(thread, lsn)).map(Vec::as_slice)
    }

    /// Probe batches resolved from the cache instead of the address index
    pub fn right_cache_hits(&self) -> usize {
        self.right_cache_hits
    }
}

/// Map a 1-based LSN to a slot in a list of `len` artifacts, reporting
/// unset or dangling LSNs.
pub(crate) fn resolve_lsn(
    len: usize,
    lsn: Lsn,
    thread: ThreadId,
    log: &'static str,
    position: usize,
    diag: &mut Diagnostics,
) -> Option<usize> {
    if lsn == INVALID_LSN {
        diag.report(CaptureAnomaly::InvalidLsn { thread, log, position });
        return None;
    }
    if lsn as usize > len {
        diag.report(CaptureAnomaly::LsnOutOfRange { thread, log, lsn, len });
        return None;
    }
    Some(lsn as usize - 1)
}

impl OperatorLog {
    /// Pass 1: contribute this thread's build-side data to the index
    pub(crate) fn build_indexes(&self, index: &mut GlobalIndex, diag: &mut Diagnostics) {
        let thread = self.thread();
        match &self.data {
            LogData::HashJoin(log) => build_hash_join(log, index),
            LogData::MergeJoin(log) => {
                // later combine phases supersede earlier ones
                if let Some(permutation) = log.combine.last() {
                    index.sort_permutation = Some(permutation.clone());
                }
            }
            LogData::HashAggregate(log) => build_hash_aggregate(thread, log, index, diag),
            LogData::PerfectHashAggregate(log) => build_perfect_aggregate(thread, log, index, diag),
            _ => {}
        }
    }
}

fn build_hash_join(log: &HashJoinLog, index: &mut GlobalIndex) {
    for artifact in &log.build {
        let rows = artifact.added_count.min(artifact.scatter.len());
        for j in 0..rows {
            let local = match &artifact.sel {
                Some(sel) => match sel.get(j) {
                    Some(row) => *row,
                    None => continue,
                },
                None => j as RowId,
            };
            let row = local + index.build_cursor;
            if !index.address_index.insert(row, artifact.scatter[j]) {
                tracing::debug!("address index has no buckets, build row {} dropped", row);
            }
        }
        index.build_cursor += artifact.added_count as RowId;
    }

    for finalize in &log.finalize {
        index.finalize_batches += 1;
        for (group, handle) in finalize.groups.iter().zip(&finalize.scatter) {
            index.finalize_map.insert(*group, *handle);
        }
    }
}

fn build_hash_aggregate(
    thread: ThreadId,
    log: &HashAggregateLog,
    index: &mut GlobalIndex,
    diag: &mut Diagnostics,
) {
    let has_grouping = log.grouping_sets.values().any(|set| !set.is_empty());
    let has_distinct = log.distinct_sets.values().any(|set| !set.is_empty());
    if has_grouping && has_distinct {
        diag.report(CaptureAnomaly::MixedAggregation { thread });
    }

    for (&set, lsns) in &log.grouping_sets {
        let mut cursor = index.grouping_count.get(&set).copied().unwrap_or(0);
        for (position, &lsn) in lsns.iter().enumerate() {
            let Some(slot) = resolve_lsn(log.sink.len(), lsn, thread, "grouping set", position, diag)
            else {
                continue;
            };
            let chunk = &log.sink[slot];
            for (j, key) in chunk.keys.iter().enumerate() {
                index.grouping_index.entry(*key).or_default().push(cursor + j as RowId);
            }
            cursor += chunk.count() as RowId;
        }
        index.grouping_count.insert(set, cursor);
    }

    if has_grouping {
        return;
    }

    for (&set, lsns) in &log.distinct_sets {
        let mut cursor = index.distinct_count.get(&set).copied().unwrap_or(0);
        for (position, &lsn) in lsns.iter().enumerate() {
            let Some(slot) = resolve_lsn(log.sink.len(), lsn, thread, "distinct set", position, diag)
            else {
                continue;
            };
            let chunk = &log.sink[slot];
            for (j, key) in chunk.keys.iter().enumerate() {
                index.distinct_index.entry(*key).or_default().push(cursor + j as RowId);
            }
            cursor += chunk.count() as RowId;
        }
        index.distinct_count.insert(set, cursor);
    }
}

fn build_perfect_aggregate(
    thread: ThreadId,
    log: &PerfectAggregateLog,
    index: &mut GlobalIndex,
    diag: &mut Diagnostics,
) {
    for keys in &log.build {
        for (i, key) in keys.iter().enumerate() {
            let slot = *key as usize;
            if slot >= index.perfect_bound {
                diag.report(CaptureAnomaly::KeyOutOfRange {
                    thread,
                    key: u64::from(*key),
                    bound: index.perfect_bound,
                });
                continue;
            }
            if index.perfect_index.len() <= slot {
                index.perfect_index.resize_with(slot + 1, Vec::new);
            }
            index.perfect_index[slot].push(index.perfect_cursor + i as RowId);
        }
        index.perfect_cursor += keys.len() as RowId;
    }
}
