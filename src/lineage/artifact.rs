/// Lineage artifacts: what an operator records per output batch
///
/// Index arrays are batch-local when captured. Reconciliation rewrites
/// them in place into the child's global numbering.

/// Global or batch-local row position
pub type RowId = u64;

/// Logical sequence number: 1-based position of an artifact in its log
pub type Lsn = u64;

/// Stable worker index of an executing thread
pub type ThreadId = usize;

/// Reserved "unset" LSN; never dereferenced
pub const INVALID_LSN: Lsn = 0;

/// Opaque id issued by a hash join build for one stored payload row.
///
/// Probe artifacts carry the same handle for every match against that
/// row, so build and probe are linked by handle equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct FilterArtifact {
    pub sel: Option<Vec<RowId>>,
    pub count: usize,
    pub child_offset: RowId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanArtifact {
    pub sel: Option<Vec<RowId>>,
    pub count: usize,
    /// First base-table row of the scanned range
    pub start: RowId,
    pub vector_index: RowId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitArtifact {
    pub start: RowId,
    pub end: RowId,
    pub child_offset: RowId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossArtifact {
    pub branch_scan_lhs: bool,
    pub position_in_chunk: RowId,
    pub scan_position: RowId,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedLoopArtifact {
    pub left: Option<Vec<RowId>>,
    pub right: Option<Vec<RowId>>,
    pub count: usize,
    pub current_row_index: RowId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockwiseArtifact {
    pub sel: Option<Vec<RowId>>,
    pub scan_lhs: bool,
    /// Probe phase; only branches 0 and 1 index the child input
    pub branch: u8,
    pub position_in_chunk: RowId,
    pub scan_position: RowId,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeArtifact {
    pub left: Option<Vec<RowId>>,
    pub right: Option<Vec<RowId>>,
    pub count: usize,
    pub right_chunk_index: RowId,
    pub branch: u8,
}

/// Rows inserted into a hash join table during one build sink call
#[derive(Debug, Clone, PartialEq)]
pub struct HashJoinBuildArtifact {
    pub sel: Option<Vec<RowId>>,
    pub scatter: Vec<BuildHandle>,
    pub added_count: usize,
}

/// Perfect hash join finalize: dense group id -> build payload
#[derive(Debug, Clone, PartialEq)]
pub struct HashJoinFinalizeArtifact {
    pub groups: Vec<RowId>,
    pub scatter: Vec<BuildHandle>,
}

pub const HASH_JOIN_PERFECT_BRANCH: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct HashJoinProbeArtifact {
    pub left: Option<Vec<RowId>>,
    pub right: Option<Vec<BuildHandle>>,
    pub perfect_right: Option<Vec<RowId>>,
    pub count: usize,
    pub branch: u8,
    pub(crate) resolved_right: Option<Vec<Option<RowId>>>,
}

impl HashJoinProbeArtifact {
    pub fn new(
        left: Option<Vec<RowId>>,
        right: Option<Vec<BuildHandle>>,
        count: usize,
    ) -> Self {
        Self {
            left,
            right,
            perfect_right: None,
            count,
            branch: 0,
            resolved_right: None,
        }
    }

    pub fn perfect(left: Option<Vec<RowId>>, perfect_right: Vec<RowId>, count: usize) -> Self {
        Self {
            left,
            right: None,
            perfect_right: Some(perfect_right),
            count,
            branch: HASH_JOIN_PERFECT_BRANCH,
            resolved_right: None,
        }
    }

    /// Build-side global row ids for each output row, once reconciled.
    /// `None` entries mean provenance is unavailable for that row.
    pub fn resolved_right(&self) -> Option<&[Option<RowId>]> {
        self.resolved_right.as_deref()
    }
}

/// Group or distinct keys for each input row of one aggregate chunk
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateChunkArtifact {
    pub keys: Vec<u64>,
}

impl AggregateChunkArtifact {
    pub fn count(&self) -> usize {
        self.keys.len()
    }
}

/// One recorded unit of provenance, pushed by the executing thread
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Filter(FilterArtifact),
    Scan(ScanArtifact),
    Limit(LimitArtifact),
    /// Per-chunk permutation of an order-by
    OrderBy(Vec<RowId>),
    Cross(CrossArtifact),
    NestedLoop(NestedLoopArtifact),
    Blockwise(BlockwiseArtifact),
    Merge(MergeArtifact),
    /// Sort permutation produced by a merge join combine phase
    MergeCombine(Vec<RowId>),
    HashJoinBuild(HashJoinBuildArtifact),
    HashJoinFinalize(HashJoinFinalizeArtifact),
    HashJoinProbe(HashJoinProbeArtifact),
    AggregateSink(AggregateChunkArtifact),
    AggregateDistinctScan(AggregateChunkArtifact),
    /// Sink chunk `sink_lsn` belongs to grouping set `set`
    GroupingSet { set: usize, sink_lsn: Lsn },
    /// Sink chunk `sink_lsn` feeds distinct table `set`
    DistinctSet { set: usize, sink_lsn: Lsn },
    /// Distinct table `set`: scan chunk `scan_lsn` was re-sunk as `sink_lsn`
    DistinctPair { set: usize, scan_lsn: Lsn, sink_lsn: Lsn },
    /// Dense key per input row of a perfect hash aggregate build chunk
    PerfectAggregateBuild(Vec<u32>),
    /// Output batch `lsn` of a join consumed child rows starting at `child_offset`
    OutputIndex { lsn: Lsn, child_offset: RowId },
    Passthrough { count: usize },
}

impl Artifact {
    pub fn name(&self) -> &'static str {
        match self {
            Artifact::Filter(_) => "filter",
            Artifact::Scan(_) => "scan",
            Artifact::Limit(_) => "limit",
            Artifact::OrderBy(_) => "order by",
            Artifact::Cross(_) => "cross product",
            Artifact::NestedLoop(_) => "nested loop",
            Artifact::Blockwise(_) => "blockwise nested loop",
            Artifact::Merge(_) => "merge",
            Artifact::MergeCombine(_) => "merge combine",
            Artifact::HashJoinBuild(_) => "hash join build",
            Artifact::HashJoinFinalize(_) => "hash join finalize",
            Artifact::HashJoinProbe(_) => "hash join probe",
            Artifact::AggregateSink(_) => "aggregate sink",
            Artifact::AggregateDistinctScan(_) => "aggregate distinct scan",
            Artifact::GroupingSet { .. } => "grouping set",
            Artifact::DistinctSet { .. } => "distinct set",
            Artifact::DistinctPair { .. } => "distinct pair",
            Artifact::PerfectAggregateBuild(_) => "perfect aggregate build",
            Artifact::OutputIndex { .. } => "output index",
            Artifact::Passthrough { .. } => "passthrough",
        }
    }
}

/// Add `offset` to the first `count` entries of an index array
pub(crate) fn shift(values: &mut [RowId], count: usize, offset: RowId) {
    let n = count.min(values.len());
    for value in &mut values[..n] {
        *value += offset;
    }
}
