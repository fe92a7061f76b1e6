/// Second post-processing pass: rewrite captured indices into global numbering
///
/// Every index into a child's input space gets the offset that places it in
/// the child's globally numbered output. Operators linked by value (hash
/// join build handles, aggregate keys) are resolved through `GlobalIndex`.
use bitvec::prelude::*;

use crate::error::{CaptureAnomaly, Diagnostics};
use crate::lineage::artifact::{shift, Lsn, RowId, ThreadId, HASH_JOIN_PERFECT_BRANCH};
use crate::lineage::index::{resolve_lsn, GlobalIndex};
use crate::lineage::log::{
    BlockwiseLog, HashAggregateLog, HashJoinLog, LogData, MergeLog, NestedLoopLog, OperatorLog,
};

impl OperatorLog {
    /// Pass 2. Runs at most once per log.
    pub(crate) fn reconcile(&mut self, index: &mut GlobalIndex, diag: &mut Diagnostics) {
        if self.processed {
            return;
        }
        let thread = self.thread();

        match &mut self.data {
            LogData::Filter(log) => {
                for artifact in &mut log.lineage {
                    if let Some(sel) = &mut artifact.sel {
                        shift(sel, artifact.count, artifact.child_offset);
                    }
                }
            }
            LogData::TableScan(log) => {
                for artifact in &mut log.lineage {
                    if let Some(sel) = &mut artifact.sel {
                        shift(sel, artifact.count, artifact.start + artifact.vector_index);
                    }
                }
            }
            LogData::NestedLoopJoin(log) => reconcile_nested_loop(thread, log, diag),
            LogData::BlockwiseNestedLoopJoin(log) => reconcile_blockwise(thread, log, diag),
            LogData::MergeJoin(log) => reconcile_merge(thread, log, index, diag),
            LogData::HashJoin(log) => reconcile_hash_join(thread, log, index, diag),
            LogData::HashAggregate(log) => reconcile_hash_aggregate(thread, log, index, diag),
            // limit ranges, order-by permutations and cross products are
            // exposed as captured
            LogData::Limit(_)
            | LogData::OrderBy(_)
            | LogData::CrossProduct(_)
            | LogData::PerfectHashAggregate(_)
            | LogData::Passthrough(_) => {}
        }

        self.processed = true;
    }
}

/// One resolved output-index entry
struct OutputEntry {
    slot: usize,
    child_offset: RowId,
    /// The slot was already named by an earlier entry
    repeat: bool,
}

/// Resolve output-index entries to artifact slots, skipping unset and
/// dangling LSNs and flagging repeated ones.
fn scan_output_index(
    output_index: &[(Lsn, RowId)],
    len: usize,
    thread: ThreadId,
    log: &'static str,
    diag: &mut Diagnostics,
) -> Vec<OutputEntry> {
    let mut seen = bitvec![0; len];
    let mut entries = Vec::with_capacity(output_index.len());

    for (position, &(lsn, child_offset)) in output_index.iter().enumerate() {
        let Some(slot) = resolve_lsn(len, lsn, thread, log, position, diag) else {
            continue;
        };
        let repeat = seen[slot];
        seen.set(slot, true);
        entries.push(OutputEntry { slot, child_offset, repeat });
    }
    entries
}

/// Output-index entries with repeated LSNs reported and dropped, so each
/// artifact is shifted at most once
fn output_entries(
    output_index: &[(Lsn, RowId)],
    len: usize,
    thread: ThreadId,
    log: &'static str,
    diag: &mut Diagnostics,
) -> Vec<(usize, RowId)> {
    let mut entries = Vec::with_capacity(output_index.len());
    for entry in scan_output_index(output_index, len, thread, log, diag) {
        if entry.repeat {
            diag.report(CaptureAnomaly::DuplicateOutputIndex {
                thread,
                lsn: (entry.slot + 1) as Lsn,
            });
            continue;
        }
        entries.push((entry.slot, entry.child_offset));
    }
    entries
}

fn reconcile_nested_loop(thread: ThreadId, log: &mut NestedLoopLog, diag: &mut Diagnostics) {
    let entries = output_entries(&log.output_index, log.lineage.len(), thread, "nested loop join", diag);
    for (slot, child_offset) in entries {
        let artifact = &mut log.lineage[slot];
        if let Some(left) = &mut artifact.left {
            shift(left, artifact.count, child_offset);
        }
        if artifact.current_row_index != 0 {
            if let Some(right) = &mut artifact.right {
                shift(right, artifact.count, artifact.current_row_index);
            }
        }
    }
}

fn reconcile_blockwise(thread: ThreadId, log: &mut BlockwiseLog, diag: &mut Diagnostics) {
    let entries = output_entries(
        &log.output_index,
        log.lineage.len(),
        thread,
        "blockwise nested loop join",
        diag,
    );
    for (slot, child_offset) in entries {
        let artifact = &mut log.lineage[slot];
        if artifact.scan_lhs || artifact.branch >= 2 {
            continue;
        }
        if let Some(sel) = &mut artifact.sel {
            shift(sel, artifact.count, child_offset);
        }
    }
}

fn reconcile_merge(
    thread: ThreadId,
    log: &mut MergeLog,
    index: &GlobalIndex,
    diag: &mut Diagnostics,
) {
    let entries = output_entries(&log.output_index, log.lineage.len(), thread, "merge join", diag);
    for (slot, child_offset) in entries {
        let artifact = &mut log.lineage[slot];
        if let Some(left) = &mut artifact.left {
            shift(left, artifact.count, child_offset);
        }

        if !matches!(artifact.branch, 1 | 4) {
            continue;
        }
        let Some(right) = &mut artifact.right else {
            continue;
        };
        shift(right, artifact.count, artifact.right_chunk_index);

        // right positions index the sorted side; map them back through the
        // cached permutation
        if let Some(permutation) = index.sort_permutation() {
            let mut misses = 0;
            for value in right.iter_mut().take(artifact.count) {
                match permutation.get(*value as usize) {
                    Some(row) => *value = *row,
                    None => misses += 1,
                }
            }
            if misses > 0 {
                diag.report(CaptureAnomaly::IndexMiss {
                    thread,
                    lookup: "sort permutation",
                    lsn: (slot + 1) as Lsn,
                    misses,
                });
            }
        }
    }
}

fn reconcile_hash_join(
    thread: ThreadId,
    log: &mut HashJoinLog,
    index: &mut GlobalIndex,
    diag: &mut Diagnostics,
) {
    // a probe batch spanning several output chunks is named once per chunk;
    // later entries re-read the right side from the cache and leave `left`
    // alone
    let entries = scan_output_index(&log.output_index, log.probe.len(), thread, "hash join", diag);
    for OutputEntry { slot, child_offset, repeat } in entries {
        let lsn = (slot + 1) as Lsn;
        let probe = &mut log.probe[slot];
        let count = probe.count;

        if repeat {
            if probe.branch != HASH_JOIN_PERFECT_BRANCH {
                if let Some(cached) = index.cached_right_values(thread, lsn) {
                    probe.resolved_right = Some(cached.to_vec());
                    index.right_cache_hits += 1;
                }
            }
            continue;
        }

        if let Some(left) = &mut probe.left {
            shift(left, count, child_offset);
        }

        let (resolved, lookup) = if probe.branch == HASH_JOIN_PERFECT_BRANCH {
            let Some(groups) = &probe.perfect_right else {
                continue;
            };
            let resolved: Vec<Option<RowId>> = groups
                .iter()
                .take(count)
                .map(|group| index.finalize_handle(*group).and_then(|h| index.build_row(h)))
                .collect();
            (resolved, "finalize map")
        } else {
            let Some(handles) = &probe.right else {
                continue;
            };
            let resolved: Vec<Option<RowId>> = handles
                .iter()
                .take(count)
                .map(|handle| index.build_row(*handle))
                .collect();
            index.right_value_cache.insert((thread, lsn), resolved.clone());
            (resolved, "address index")
        };

        let misses = resolved.iter().filter(|row| row.is_none()).count();
        if misses > 0 {
            diag.report(CaptureAnomaly::IndexMiss { thread, lookup, lsn, misses });
        }
        probe.resolved_right = Some(resolved);
    }
}

fn reconcile_hash_aggregate(
    thread: ThreadId,
    log: &HashAggregateLog,
    index: &mut GlobalIndex,
    diag: &mut Diagnostics,
) {
    if log.grouping_sets.values().any(|set| !set.is_empty()) {
        return;
    }

    // each distinct value re-sunk into the group table carries the input
    // rows that produced it
    for (set, scans) in &log.distinct_scan {
        let Some(sinks) = log.distinct_sink.get(set) else {
            continue;
        };
        for (position, (&scan_lsn, &sink_lsn)) in scans.iter().zip(sinks).enumerate() {
            let Some(scan_slot) =
                resolve_lsn(log.scan.len(), scan_lsn, thread, "distinct scan", position, diag)
            else {
                continue;
            };
            let Some(sink_slot) =
                resolve_lsn(log.sink.len(), sink_lsn, thread, "distinct sink", position, diag)
            else {
                continue;
            };

            let distinct_keys = &log.scan[scan_slot].keys;
            let group_keys = &log.sink[sink_slot].keys;
            let mut misses = 0;
            for (distinct, group) in distinct_keys.iter().zip(group_keys) {
                match index.distinct_index.get(distinct) {
                    Some(rows) => index
                        .grouping_index
                        .entry(*group)
                        .or_default()
                        .extend_from_slice(rows),
                    None => misses += 1,
                }
            }
            if misses > 0 {
                diag.report(CaptureAnomaly::IndexMiss {
                    thread,
                    lookup: "distinct index",
                    lsn: scan_lsn,
                    misses,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::artifact::*;
    use crate::lineage::log::*;

    fn run(log: &mut OperatorLog) -> (GlobalIndex, Diagnostics) {
        let mut index = GlobalIndex::new();
        let mut diag = Diagnostics::new(0);
        index.prepare_address_index(log.build_row_count());
        index.prepare_perfect_index(log.perfect_row_count());
        log.build_indexes(&mut index, &mut diag);
        log.reconcile(&mut index, &mut diag);
        (index, diag)
    }

    #[test]
    fn test_filter_shift_and_idempotence() {
        let mut log = OperatorLog::new(0, LogData::Filter(FilterLog::default()));
        log.push(Artifact::Filter(FilterArtifact {
            sel: Some(vec![0, 2, 5]),
            count: 3,
            child_offset: 1024,
        }));
        run(&mut log);
        run(&mut log);

        match log.data() {
            LogData::Filter(filter) => {
                assert_eq!(filter.artifacts()[0].sel, Some(vec![1024, 1026, 1029]));
            }
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_scan_offset() {
        let mut log = OperatorLog::new(1, LogData::TableScan(TableScanLog::default()));
        log.push(Artifact::Scan(ScanArtifact {
            sel: Some(vec![0, 3]),
            count: 2,
            start: 2048,
            vector_index: 7,
        }));
        run(&mut log);

        match log.data() {
            LogData::TableScan(scan) => assert_eq!(scan.artifacts()[0].sel, Some(vec![2055, 2058])),
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_nested_loop_right_offset_only_when_nonzero() {
        let mut log = OperatorLog::new(0, LogData::NestedLoopJoin(NestedLoopLog::default()));
        let first = log
            .push(Artifact::NestedLoop(NestedLoopArtifact {
                left: Some(vec![0, 1]),
                right: Some(vec![0, 0]),
                count: 2,
                current_row_index: 0,
            }))
            .unwrap();
        let second = log
            .push(Artifact::NestedLoop(NestedLoopArtifact {
                left: Some(vec![1]),
                right: Some(vec![2]),
                count: 1,
                current_row_index: 5,
            }))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn: first, child_offset: 10 });
        log.push(Artifact::OutputIndex { lsn: second, child_offset: 20 });
        run(&mut log);

        match log.data() {
            LogData::NestedLoopJoin(nlj) => {
                assert_eq!(nlj.artifacts()[0].left, Some(vec![10, 11]));
                assert_eq!(nlj.artifacts()[0].right, Some(vec![0, 0]));
                assert_eq!(nlj.artifacts()[1].left, Some(vec![21]));
                assert_eq!(nlj.artifacts()[1].right, Some(vec![7]));
            }
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_invalid_lsn_skipped_rest_processed() {
        let mut log = OperatorLog::new(4, LogData::NestedLoopJoin(NestedLoopLog::default()));
        let lsn = log
            .push(Artifact::NestedLoop(NestedLoopArtifact {
                left: Some(vec![0]),
                right: None,
                count: 1,
                current_row_index: 0,
            }))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn: INVALID_LSN, child_offset: 99 });
        log.push(Artifact::OutputIndex { lsn: 42, child_offset: 99 });
        log.push(Artifact::OutputIndex { lsn, child_offset: 3 });
        log.push(Artifact::OutputIndex { lsn, child_offset: 3 });
        let (_, diag) = run(&mut log);

        match log.data() {
            LogData::NestedLoopJoin(nlj) => assert_eq!(nlj.artifacts()[0].left, Some(vec![3])),
            other => panic!("unexpected log {}", other.name()),
        }
        assert_eq!(
            diag.anomalies(),
            &[
                CaptureAnomaly::InvalidLsn { thread: 4, log: "nested loop join", position: 0 },
                CaptureAnomaly::LsnOutOfRange { thread: 4, log: "nested loop join", lsn: 42, len: 1 },
                CaptureAnomaly::DuplicateOutputIndex { thread: 4, lsn: 1 },
            ]
        );
        assert!(log.is_processed());
    }

    #[test]
    fn test_blockwise_branch_gating() {
        let mut log = OperatorLog::new(0, LogData::BlockwiseNestedLoopJoin(BlockwiseLog::default()));
        let artifacts = [(false, 0), (false, 1), (false, 2), (true, 0)];
        for (scan_lhs, branch) in artifacts {
            let lsn = log
                .push(Artifact::Blockwise(BlockwiseArtifact {
                    sel: Some(vec![1]),
                    scan_lhs,
                    branch,
                    position_in_chunk: 0,
                    scan_position: 0,
                    count: 1,
                }))
                .unwrap();
            log.push(Artifact::OutputIndex { lsn, child_offset: 100 });
        }
        run(&mut log);

        match log.data() {
            LogData::BlockwiseNestedLoopJoin(bnlj) => {
                let sels: Vec<_> = bnlj.artifacts().iter().map(|a| a.sel.clone()).collect();
                assert_eq!(
                    sels,
                    vec![Some(vec![101]), Some(vec![101]), Some(vec![1]), Some(vec![1])]
                );
            }
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_merge_right_through_permutation() {
        let mut log = OperatorLog::new(0, LogData::MergeJoin(MergeLog::default()));
        log.push(Artifact::MergeCombine(vec![3, 2, 1, 0]));
        let shifted = log
            .push(Artifact::Merge(MergeArtifact {
                left: Some(vec![0, 1]),
                right: Some(vec![0, 1]),
                count: 2,
                right_chunk_index: 2,
                branch: 1,
            }))
            .unwrap();
        let untouched = log
            .push(Artifact::Merge(MergeArtifact {
                left: None,
                right: Some(vec![0]),
                count: 1,
                right_chunk_index: 2,
                branch: 2,
            }))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn: shifted, child_offset: 8 });
        log.push(Artifact::OutputIndex { lsn: untouched, child_offset: 8 });
        run(&mut log);

        match log.data() {
            LogData::MergeJoin(merge) => {
                assert_eq!(merge.artifacts()[0].left, Some(vec![8, 9]));
                // sorted positions 2,3 map back to rows 1,0
                assert_eq!(merge.artifacts()[0].right, Some(vec![1, 0]));
                assert_eq!(merge.artifacts()[1].right, Some(vec![0]));
            }
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_hash_join_resolves_duplicate_matches() {
        let mut log = OperatorLog::new(0, LogData::HashJoin(HashJoinLog::default()));
        log.push(Artifact::HashJoinBuild(HashJoinBuildArtifact {
            sel: None,
            scatter: vec![BuildHandle(11), BuildHandle(12), BuildHandle(13)],
            added_count: 3,
        }));
        let lsn = log
            .push(Artifact::HashJoinProbe(HashJoinProbeArtifact::new(
                Some(vec![0, 1, 2]),
                Some(vec![BuildHandle(12), BuildHandle(12), BuildHandle(99)]),
                3,
            )))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn, child_offset: 5 });
        let (index, diag) = run(&mut log);

        match log.data() {
            LogData::HashJoin(hj) => {
                let probe = &hj.probe_artifacts()[0];
                assert_eq!(probe.left, Some(vec![5, 6, 7]));
                assert_eq!(probe.resolved_right(), Some(&[Some(1), Some(1), None][..]));
            }
            other => panic!("unexpected log {}", other.name()),
        }
        assert_eq!(index.cached_right_values(0, lsn), Some(&[Some(1), Some(1), None][..]));
        assert_eq!(
            diag.anomalies(),
            &[CaptureAnomaly::IndexMiss { thread: 0, lookup: "address index", lsn, misses: 1 }]
        );
    }

    #[test]
    fn test_hash_join_repeated_output_reads_cache() {
        let mut log = OperatorLog::new(0, LogData::HashJoin(HashJoinLog::default()));
        log.push(Artifact::HashJoinBuild(HashJoinBuildArtifact {
            sel: None,
            scatter: vec![BuildHandle(5), BuildHandle(6)],
            added_count: 2,
        }));
        let lsn = log
            .push(Artifact::HashJoinProbe(HashJoinProbeArtifact::new(
                Some(vec![0, 1]),
                Some(vec![BuildHandle(6), BuildHandle(5)]),
                2,
            )))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn, child_offset: 4 });
        log.push(Artifact::OutputIndex { lsn, child_offset: 4 });
        let (index, diag) = run(&mut log);

        assert!(diag.is_empty());
        assert_eq!(index.right_cache_hits(), 1);
        match log.data() {
            LogData::HashJoin(hj) => {
                let probe = &hj.probe_artifacts()[0];
                // shifted once, not twice
                assert_eq!(probe.left, Some(vec![4, 5]));
                assert_eq!(probe.resolved_right(), Some(&[Some(1), Some(0)][..]));
            }
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_order_by_and_cross_product_unchanged() {
        let mut order_by = OperatorLog::new(0, LogData::OrderBy(OrderByLog::default()));
        order_by.push(Artifact::OrderBy(vec![2, 0, 1]));
        let mut cross = OperatorLog::new(0, LogData::CrossProduct(CrossLog::default()));
        let artifact = CrossArtifact {
            branch_scan_lhs: false,
            position_in_chunk: 4,
            scan_position: 1024,
            count: 7,
        };
        cross.push(Artifact::Cross(artifact));

        let (_, order_diag) = run(&mut order_by);
        let (_, cross_diag) = run(&mut cross);

        assert!(order_diag.is_empty() && cross_diag.is_empty());
        assert!(order_by.is_processed() && cross.is_processed());
        match order_by.data() {
            LogData::OrderBy(log) => assert_eq!(log.permutations(), &[vec![2, 0, 1]]),
            other => panic!("unexpected log {}", other.name()),
        }
        match cross.data() {
            LogData::CrossProduct(log) => assert_eq!(log.artifacts(), &[artifact]),
            other => panic!("unexpected log {}", other.name()),
        }
    }

    #[test]
    fn test_hash_join_perfect_branch() {
        let mut log = OperatorLog::new(0, LogData::HashJoin(HashJoinLog::default()));
        log.push(Artifact::HashJoinBuild(HashJoinBuildArtifact {
            sel: None,
            scatter: vec![BuildHandle(40), BuildHandle(41)],
            added_count: 2,
        }));
        log.push(Artifact::HashJoinFinalize(HashJoinFinalizeArtifact {
            groups: vec![0, 1],
            scatter: vec![BuildHandle(41), BuildHandle(40)],
        }));
        let lsn = log
            .push(Artifact::HashJoinProbe(HashJoinProbeArtifact::perfect(None, vec![0, 1, 0], 3)))
            .unwrap();
        log.push(Artifact::OutputIndex { lsn, child_offset: 0 });
        let (_, diag) = run(&mut log);

        match log.data() {
            LogData::HashJoin(hj) => {
                assert_eq!(
                    hj.probe_artifacts()[0].resolved_right(),
                    Some(&[Some(1), Some(0), Some(1)][..])
                );
            }
            other => panic!("unexpected log {}", other.name()),
        }
        assert!(diag.is_empty());
    }

    #[test]
    fn test_distinct_merge_into_groups() {
        let mut log = OperatorLog::new(0, LogData::HashAggregate(HashAggregateLog::default()));
        // distinct table sink: input rows 0..4 carry distinct keys
        let distinct_sink = log
            .push(Artifact::AggregateSink(AggregateChunkArtifact { keys: vec![100, 200, 100, 300] }))
            .unwrap();
        log.push(Artifact::DistinctSet { set: 0, sink_lsn: distinct_sink });

        // distinct values scanned back out and re-sunk into groups
        let scan = log
            .push(Artifact::AggregateDistinctScan(AggregateChunkArtifact { keys: vec![100, 300, 200] }))
            .unwrap();
        let group_sink = log
            .push(Artifact::AggregateSink(AggregateChunkArtifact { keys: vec![1, 1, 2] }))
            .unwrap();
        log.push(Artifact::DistinctPair { set: 0, scan_lsn: scan, sink_lsn: group_sink });
        let (index, diag) = run(&mut log);

        assert_eq!(index.distinct_rows(100), Some(&[0, 2][..]));
        assert_eq!(index.group_rows(1), Some(&[0, 2, 3][..]));
        assert_eq!(index.group_rows(2), Some(&[1][..]));
        assert!(diag.is_empty());
    }
}
