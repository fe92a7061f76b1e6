/// Per-thread operator logs
///
/// One `OperatorLog` exists per (operator instance, worker thread). It is an
/// append-only sequence of artifacts whose shape depends on the operator
/// kind. Only the owning thread appends to it.
use std::collections::BTreeMap;
use std::mem::size_of;

use crate::error::CaptureAnomaly;
use crate::lineage::artifact::*;

#[derive(Debug, Clone, Default)]
pub struct FilterLog {
    pub(crate) lineage: Vec<FilterArtifact>,
}

#[derive(Debug, Clone, Default)]
pub struct TableScanLog {
    pub(crate) lineage: Vec<ScanArtifact>,
}

#[derive(Debug, Clone, Default)]
pub struct LimitLog {
    pub(crate) lineage: Vec<LimitArtifact>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderByLog {
    pub(crate) lineage: Vec<Vec<RowId>>,
}

#[derive(Debug, Clone, Default)]
pub struct CrossLog {
    pub(crate) lineage: Vec<CrossArtifact>,
}

#[derive(Debug, Clone, Default)]
pub struct NestedLoopLog {
    pub(crate) lineage: Vec<NestedLoopArtifact>,
    pub(crate) output_index: Vec<(Lsn, RowId)>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockwiseLog {
    pub(crate) lineage: Vec<BlockwiseArtifact>,
    pub(crate) output_index: Vec<(Lsn, RowId)>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeLog {
    pub(crate) lineage: Vec<MergeArtifact>,
    pub(crate) combine: Vec<Vec<RowId>>,
    pub(crate) output_index: Vec<(Lsn, RowId)>,
}

#[derive(Debug, Clone, Default)]
pub struct HashJoinLog {
    pub(crate) build: Vec<HashJoinBuildArtifact>,
    pub(crate) finalize: Vec<HashJoinFinalizeArtifact>,
    pub(crate) probe: Vec<HashJoinProbeArtifact>,
    pub(crate) output_index: Vec<(Lsn, RowId)>,
}

#[derive(Debug, Clone, Default)]
pub struct HashAggregateLog {
    pub(crate) sink: Vec<AggregateChunkArtifact>,
    pub(crate) scan: Vec<AggregateChunkArtifact>,
    /// Per grouping set, the sink LSNs that belong to it
    pub(crate) grouping_sets: BTreeMap<usize, Vec<Lsn>>,
    /// Per distinct table, the sink LSNs holding distinct keys
    pub(crate) distinct_sets: BTreeMap<usize, Vec<Lsn>>,
    pub(crate) distinct_scan: BTreeMap<usize, Vec<Lsn>>,
    pub(crate) distinct_sink: BTreeMap<usize, Vec<Lsn>>,
}

#[derive(Debug, Clone, Default)]
pub struct PerfectAggregateLog {
    pub(crate) build: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct PassthroughLog {
    pub(crate) counts: Vec<usize>,
}

/// Closed set of log shapes, one per operator kind
#[derive(Debug, Clone)]
pub enum LogData {
    Filter(FilterLog),
    TableScan(TableScanLog),
    Limit(LimitLog),
    OrderBy(OrderByLog),
    CrossProduct(CrossLog),
    NestedLoopJoin(NestedLoopLog),
    BlockwiseNestedLoopJoin(BlockwiseLog),
    MergeJoin(MergeLog),
    HashJoin(HashJoinLog),
    HashAggregate(HashAggregateLog),
    PerfectHashAggregate(PerfectAggregateLog),
    Passthrough(PassthroughLog),
}

fn append<T>(items: &mut Vec<T>, item: T) -> Lsn {
    items.push(item);
    items.len() as Lsn
}

/// Sets are keyed by id, so a sparse set id costs one entry
fn append_member(sets: &mut BTreeMap<usize, Vec<Lsn>>, set: usize, lsn: Lsn) -> Lsn {
    append(sets.entry(set).or_default(), lsn)
}

fn index_bytes(values: &Option<Vec<RowId>>) -> usize {
    values.as_ref().map_or(0, |v| v.len() * size_of::<RowId>())
}

fn membership_bytes(sets: &BTreeMap<usize, Vec<Lsn>>) -> usize {
    sets.values().map(|s| s.len() * size_of::<Lsn>()).sum()
}

impl LogData {
    pub fn name(&self) -> &'static str {
        match self {
            LogData::Filter(_) => "filter",
            LogData::TableScan(_) => "table scan",
            LogData::Limit(_) => "limit",
            LogData::OrderBy(_) => "order by",
            LogData::CrossProduct(_) => "cross product",
            LogData::NestedLoopJoin(_) => "nested loop join",
            LogData::BlockwiseNestedLoopJoin(_) => "blockwise nested loop join",
            LogData::MergeJoin(_) => "merge join",
            LogData::HashJoin(_) => "hash join",
            LogData::HashAggregate(_) => "hash aggregate",
            LogData::PerfectHashAggregate(_) => "perfect hash aggregate",
            LogData::Passthrough(_) => "passthrough",
        }
    }

    /// Append an artifact, returning its LSN within the list it joined.
    /// Artifacts that do not belong to this kind are handed back.
    fn append(&mut self, artifact: Artifact) -> Result<Lsn, Artifact> {
        let lsn = match (self, artifact) {
            (LogData::Filter(log), Artifact::Filter(a)) => append(&mut log.lineage, a),
            (LogData::TableScan(log), Artifact::Scan(a)) => append(&mut log.lineage, a),
            (LogData::Limit(log), Artifact::Limit(a)) => append(&mut log.lineage, a),
            (LogData::OrderBy(log), Artifact::OrderBy(a)) => append(&mut log.lineage, a),
            (LogData::CrossProduct(log), Artifact::Cross(a)) => append(&mut log.lineage, a),

            (LogData::NestedLoopJoin(log), Artifact::NestedLoop(a)) => append(&mut log.lineage, a),
            (LogData::NestedLoopJoin(log), Artifact::OutputIndex { lsn, child_offset }) => {
                append(&mut log.output_index, (lsn, child_offset))
            }

            (LogData::BlockwiseNestedLoopJoin(log), Artifact::Blockwise(a)) => {
                append(&mut log.lineage, a)
            }
            (LogData::BlockwiseNestedLoopJoin(log), Artifact::OutputIndex { lsn, child_offset }) => {
                append(&mut log.output_index, (lsn, child_offset))
            }

            (LogData::MergeJoin(log), Artifact::Merge(a)) => append(&mut log.lineage, a),
            (LogData::MergeJoin(log), Artifact::MergeCombine(p)) => append(&mut log.combine, p),
            (LogData::MergeJoin(log), Artifact::OutputIndex { lsn, child_offset }) => {
                append(&mut log.output_index, (lsn, child_offset))
            }

            (LogData::HashJoin(log), Artifact::HashJoinBuild(a)) => append(&mut log.build, a),
            (LogData::HashJoin(log), Artifact::HashJoinFinalize(a)) => append(&mut log.finalize, a),
            (LogData::HashJoin(log), Artifact::HashJoinProbe(a)) => append(&mut log.probe, a),
            (LogData::HashJoin(log), Artifact::OutputIndex { lsn, child_offset }) => {
                append(&mut log.output_index, (lsn, child_offset))
            }

            (LogData::HashAggregate(log), Artifact::AggregateSink(a)) => append(&mut log.sink, a),
            (LogData::HashAggregate(log), Artifact::AggregateDistinctScan(a)) => {
                append(&mut log.scan, a)
            }
            (LogData::HashAggregate(log), Artifact::GroupingSet { set, sink_lsn }) => {
                append_member(&mut log.grouping_sets, set, sink_lsn)
            }
            (LogData::HashAggregate(log), Artifact::DistinctSet { set, sink_lsn }) => {
                append_member(&mut log.distinct_sets, set, sink_lsn)
            }
            (LogData::HashAggregate(log), Artifact::DistinctPair { set, scan_lsn, sink_lsn }) => {
                append_member(&mut log.distinct_sink, set, sink_lsn);
                append_member(&mut log.distinct_scan, set, scan_lsn)
            }

            (LogData::PerfectHashAggregate(log), Artifact::PerfectAggregateBuild(keys)) => {
                append(&mut log.build, keys)
            }

            (LogData::Passthrough(log), Artifact::Passthrough { count }) => {
                append(&mut log.counts, count)
            }

            (_, other) => return Err(other),
        };
        Ok(lsn)
    }
}

/// Append-only artifact log owned by one worker thread
#[derive(Debug, Clone)]
pub struct OperatorLog {
    thread: ThreadId,
    pub(crate) processed: bool,
    rejected_after_process: usize,
    mismatched: Vec<&'static str>,
    pub(crate) data: LogData,
}

impl OperatorLog {
    pub fn new(thread: ThreadId, data: LogData) -> Self {
        Self {
            thread,
            processed: false,
            rejected_after_process: 0,
            mismatched: Vec::new(),
            data,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn data(&self) -> &LogData {
        &self.data
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Record one artifact. Returns its LSN, or `None` if the artifact was
    /// dropped (wrong kind for this log, or the log is already reconciled).
    pub fn push(&mut self, artifact: Artifact) -> Option<Lsn> {
        if self.processed {
            self.rejected_after_process += 1;
            tracing::warn!(
                thread = self.thread,
                "dropping {} artifact: log already post-processed",
                artifact.name()
            );
            return None;
        }

        match self.data.append(artifact) {
            Ok(lsn) => Some(lsn),
            Err(artifact) => {
                tracing::warn!(
                    thread = self.thread,
                    "{} log cannot hold {} artifact",
                    self.data.name(),
                    artifact.name()
                );
                self.mismatched.push(artifact.name());
                None
            }
        }
    }

    /// Anomalies observed while capturing into this log
    pub fn capture_anomalies(&self) -> Vec<CaptureAnomaly> {
        let mut anomalies: Vec<CaptureAnomaly> = self
            .mismatched
            .iter()
            .map(|artifact| CaptureAnomaly::ArtifactMismatch {
                thread: self.thread,
                artifact: *artifact,
                log: self.data.name(),
            })
            .collect();
        if self.rejected_after_process > 0 {
            anomalies.push(CaptureAnomaly::CaptureAfterProcess {
                thread: self.thread,
                rejected: self.rejected_after_process,
            });
        }
        anomalies
    }

    /// Rows covered by this log. Joins and aggregates have no uniform row
    /// count and report 0.
    pub fn count(&self) -> usize {
        match &self.data {
            LogData::Filter(log) => log.lineage.iter().map(|a| a.count).sum(),
            LogData::TableScan(log) => log.lineage.iter().map(|a| a.count).sum(),
            LogData::Limit(log) => log
                .lineage
                .iter()
                .map(|a| a.end.saturating_sub(a.start) as usize)
                .sum(),
            LogData::OrderBy(log) => log.lineage.iter().map(Vec::len).sum(),
            LogData::Passthrough(log) => log.counts.iter().sum(),
            LogData::CrossProduct(_)
            | LogData::NestedLoopJoin(_)
            | LogData::BlockwiseNestedLoopJoin(_)
            | LogData::MergeJoin(_)
            | LogData::HashJoin(_)
            | LogData::HashAggregate(_)
            | LogData::PerfectHashAggregate(_) => 0,
        }
    }

    /// Estimated bytes held by this log's index arrays and artifact headers
    pub fn size(&self) -> usize {
        let pair = size_of::<(Lsn, RowId)>();
        match &self.data {
            LogData::Filter(log) => {
                self.count() * size_of::<RowId>() + log.lineage.len() * size_of::<FilterArtifact>()
            }
            LogData::TableScan(log) => {
                self.count() * size_of::<RowId>() + log.lineage.len() * size_of::<ScanArtifact>()
            }
            LogData::Limit(log) => log.lineage.len() * size_of::<LimitArtifact>(),
            LogData::OrderBy(_) => self.count() * size_of::<RowId>(),
            LogData::CrossProduct(log) => log.lineage.len() * size_of::<CrossArtifact>(),
            LogData::NestedLoopJoin(log) => {
                log.lineage
                    .iter()
                    .map(|a| index_bytes(&a.left) + index_bytes(&a.right))
                    .sum::<usize>()
                    + log.lineage.len() * size_of::<NestedLoopArtifact>()
                    + log.output_index.len() * pair
            }
            LogData::BlockwiseNestedLoopJoin(log) => {
                log.lineage.iter().map(|a| index_bytes(&a.sel)).sum::<usize>()
                    + log.lineage.len() * size_of::<BlockwiseArtifact>()
                    + log.output_index.len() * pair
            }
            LogData::MergeJoin(log) => {
                log.lineage
                    .iter()
                    .map(|a| index_bytes(&a.left) + index_bytes(&a.right))
                    .sum::<usize>()
                    + log.lineage.len() * size_of::<MergeArtifact>()
                    + log.combine.iter().map(|p| p.len() * size_of::<RowId>()).sum::<usize>()
                    + log.output_index.len() * pair
            }
            LogData::HashJoin(log) => {
                let handle = size_of::<BuildHandle>();
                let build: usize = log
                    .build
                    .iter()
                    .map(|a| index_bytes(&a.sel) + a.scatter.len() * handle)
                    .sum();
                let finalize: usize = log
                    .finalize
                    .iter()
                    .map(|a| a.groups.len() * size_of::<RowId>() + a.scatter.len() * handle)
                    .sum();
                let probe: usize = log
                    .probe
                    .iter()
                    .map(|a| {
                        index_bytes(&a.left)
                            + index_bytes(&a.perfect_right)
                            + a.right.as_ref().map_or(0, |r| r.len() * handle)
                    })
                    .sum();
                build + finalize + probe + log.probe.len() * size_of::<HashJoinProbeArtifact>()
                    + log.output_index.len() * pair
            }
            LogData::HashAggregate(log) => {
                let keys: usize = log
                    .sink
                    .iter()
                    .chain(log.scan.iter())
                    .map(|a| a.keys.len() * size_of::<u64>())
                    .sum();
                keys + membership_bytes(&log.grouping_sets)
                    + membership_bytes(&log.distinct_sets)
                    + membership_bytes(&log.distinct_scan)
                    + membership_bytes(&log.distinct_sink)
            }
            LogData::PerfectHashAggregate(log) => {
                log.build.iter().map(|k| k.len() * size_of::<u32>()).sum()
            }
            LogData::Passthrough(log) => log.counts.len() * size_of::<usize>(),
        }
    }

    /// Number of output batches recorded
    pub fn chunks_count(&self) -> usize {
        match &self.data {
            LogData::Filter(log) => log.lineage.len(),
            LogData::TableScan(log) => log.lineage.len(),
            LogData::Limit(log) => log.lineage.len(),
            LogData::OrderBy(log) => log.lineage.len(),
            LogData::CrossProduct(log) => log.lineage.len(),
            LogData::NestedLoopJoin(log) => log.lineage.len(),
            LogData::BlockwiseNestedLoopJoin(log) => log.lineage.len(),
            LogData::MergeJoin(log) => log.lineage.len(),
            LogData::HashJoin(log) => log.probe.len(),
            LogData::HashAggregate(log) => log.sink.len(),
            LogData::PerfectHashAggregate(log) => log.build.len(),
            LogData::Passthrough(log) => log.counts.len(),
        }
    }

    /// Rows this thread inserted into a hash join table
    pub(crate) fn build_row_count(&self) -> usize {
        match &self.data {
            LogData::HashJoin(log) => log.build.iter().map(|a| a.added_count).sum(),
            _ => 0,
        }
    }

    /// Input rows this thread sank into a perfect hash aggregate
    pub(crate) fn perfect_row_count(&self) -> usize {
        match &self.data {
            LogData::PerfectHashAggregate(log) => log.build.iter().map(Vec::len).sum(),
            _ => 0,
        }
    }
}

impl FilterLog {
    pub fn artifacts(&self) -> &[FilterArtifact] {
        &self.lineage
    }
}

impl TableScanLog {
    pub fn artifacts(&self) -> &[ScanArtifact] {
        &self.lineage
    }
}

impl LimitLog {
    pub fn artifacts(&self) -> &[LimitArtifact] {
        &self.lineage
    }
}

impl OrderByLog {
    pub fn permutations(&self) -> &[Vec<RowId>] {
        &self.lineage
    }
}

impl CrossLog {
    pub fn artifacts(&self) -> &[CrossArtifact] {
        &self.lineage
    }
}

impl NestedLoopLog {
    pub fn artifacts(&self) -> &[NestedLoopArtifact] {
        &self.lineage
    }
}

impl BlockwiseLog {
    pub fn artifacts(&self) -> &[BlockwiseArtifact] {
        &self.lineage
    }
}

impl MergeLog {
    pub fn artifacts(&self) -> &[MergeArtifact] {
        &self.lineage
    }
}

impl HashJoinLog {
    pub fn build_artifacts(&self) -> &[HashJoinBuildArtifact] {
        &self.build
    }

    pub fn probe_artifacts(&self) -> &[HashJoinProbeArtifact] {
        &self.probe
    }
}

impl HashAggregateLog {
    pub fn sink_artifacts(&self) -> &[AggregateChunkArtifact] {
        &self.sink
    }
}

impl PerfectAggregateLog {
    pub fn build_keys(&self) -> &[Vec<u32>] {
        &self.build
    }
}
