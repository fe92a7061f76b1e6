/// Per-operator lineage: thread registry, post-processing and tree wiring
///
/// One `OperatorLineage` exists per physical operator of a query. Worker
/// threads register once through `init_log` and then append through their
/// own `LogWriter`; the registry lock is only taken on first touch.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureAnomaly, Diagnostics};
use crate::lineage::artifact::{Artifact, Lsn, ThreadId};
use crate::lineage::index::GlobalIndex;
use crate::lineage::log::*;
use crate::lineage::stats::{LineageStats, PostProcessReport};

/// Physical operator kinds that carry lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    TableScan,
    Filter,
    Limit,
    StreamingLimit,
    OrderBy,
    CrossProduct,
    PiecewiseMergeJoin,
    NestedLoopJoin,
    BlockwiseNlJoin,
    HashJoin,
    HashGroupBy,
    PerfectHashGroupBy,
    /// Delimiter join; logs through its nested distinct operator
    DelimJoin,
    Projection,
    Other,
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::TableScan => "TABLE_SCAN",
            OperatorKind::Filter => "FILTER",
            OperatorKind::Limit => "LIMIT",
            OperatorKind::StreamingLimit => "STREAMING_LIMIT",
            OperatorKind::OrderBy => "ORDER_BY",
            OperatorKind::CrossProduct => "CROSS_PRODUCT",
            OperatorKind::PiecewiseMergeJoin => "PIECEWISE_MERGE_JOIN",
            OperatorKind::NestedLoopJoin => "NESTED_LOOP_JOIN",
            OperatorKind::BlockwiseNlJoin => "BLOCKWISE_NL_JOIN",
            OperatorKind::HashJoin => "HASH_JOIN",
            OperatorKind::HashGroupBy => "HASH_GROUP_BY",
            OperatorKind::PerfectHashGroupBy => "PERFECT_HASH_GROUP_BY",
            OperatorKind::DelimJoin => "DELIM_JOIN",
            OperatorKind::Projection => "PROJECTION",
            OperatorKind::Other => "OTHER",
        }
    }

    /// Fresh log of the variant this kind captures into
    pub(crate) fn empty_log(&self) -> LogData {
        match self {
            OperatorKind::TableScan => LogData::TableScan(TableScanLog::default()),
            OperatorKind::Filter => LogData::Filter(FilterLog::default()),
            OperatorKind::Limit | OperatorKind::StreamingLimit => LogData::Limit(LimitLog::default()),
            OperatorKind::OrderBy => LogData::OrderBy(OrderByLog::default()),
            OperatorKind::CrossProduct => LogData::CrossProduct(CrossLog::default()),
            OperatorKind::PiecewiseMergeJoin => LogData::MergeJoin(MergeLog::default()),
            OperatorKind::NestedLoopJoin => LogData::NestedLoopJoin(NestedLoopLog::default()),
            OperatorKind::BlockwiseNlJoin => {
                LogData::BlockwiseNestedLoopJoin(BlockwiseLog::default())
            }
            OperatorKind::HashJoin => LogData::HashJoin(HashJoinLog::default()),
            OperatorKind::HashGroupBy => LogData::HashAggregate(HashAggregateLog::default()),
            OperatorKind::PerfectHashGroupBy => {
                LogData::PerfectHashAggregate(PerfectAggregateLog::default())
            }
            OperatorKind::DelimJoin | OperatorKind::Projection | OperatorKind::Other => {
                LogData::Passthrough(PassthroughLog::default())
            }
        }
    }
}

/// Capture gate shared by every operator of one lineage tree.
///
/// `enabled` is the process-wide flag owned by the coordinator; `valid` is
/// cleared when the tree is released.
#[derive(Debug, Clone)]
pub struct CaptureSwitch {
    enabled: Arc<AtomicBool>,
    valid: Arc<AtomicBool>,
}

impl CaptureSwitch {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self {
            enabled,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Switch with its own enable flag, for trees built outside a coordinator
    pub fn standalone(enabled: bool) -> Self {
        Self::new(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.valid.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// Physical plan description used to build a lineage tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub kind: OperatorKind,
    pub table_name: Option<String>,
    pub extra: String,
    pub children: Vec<PlanNode>,
    /// Nested distinct operator of a delimiter join
    pub distinct: Option<Box<PlanNode>>,
}

impl PlanNode {
    pub fn new(kind: OperatorKind) -> Self {
        Self {
            kind,
            table_name: None,
            extra: String::new(),
            children: Vec::new(),
            distinct: None,
        }
    }

    pub fn scan(table_name: impl Into<String>) -> Self {
        Self::new(OperatorKind::TableScan).with_table(table_name)
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    pub fn with_child(mut self, child: PlanNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_distinct(mut self, distinct: PlanNode) -> Self {
        self.distinct = Some(Box::new(distinct));
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append handle owned by one worker thread
///
/// Each append takes the log's own mutex. Only post-processing ever
/// competes for it, so during capture the lock is uncontended rather than
/// absent.
#[derive(Debug, Clone)]
pub struct LogWriter {
    thread: ThreadId,
    log: Arc<Mutex<OperatorLog>>,
    switch: CaptureSwitch,
}

impl LogWriter {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Record one artifact; a no-op while capture is off or after the tree
    /// was cleared.
    pub fn push(&self, artifact: Artifact) -> Option<Lsn> {
        if !self.switch.is_active() {
            return None;
        }
        lock(&self.log).push(artifact)
    }
}

#[derive(Debug, Default)]
struct ThreadRegistry {
    /// Registration order; fixes global row numbering across threads
    order: Vec<ThreadId>,
    logs: FxHashMap<ThreadId, Arc<Mutex<OperatorLog>>>,
    diag: Diagnostics,
}

#[derive(Debug, Default)]
struct PostProcessState {
    processed: bool,
    index: Option<GlobalIndex>,
    diag: Diagnostics,
    elapsed: Duration,
}

/// Lineage of one physical operator instance
#[derive(Debug)]
pub struct OperatorLineage {
    operator_id: usize,
    kind: OperatorKind,
    table_name: Option<String>,
    extra: String,
    children: Vec<Arc<OperatorLineage>>,
    distinct: Option<Arc<OperatorLineage>>,
    switch: CaptureSwitch,
    registry: Mutex<ThreadRegistry>,
    state: Mutex<PostProcessState>,
}

impl OperatorLineage {
    /// Build a lineage tree mirroring `plan`, numbering operators in pre-order
    pub fn from_plan(plan: &PlanNode, switch: CaptureSwitch) -> Arc<Self> {
        let mut next_id = 0;
        Self::annotate(plan, &switch, &mut next_id)
    }

    fn annotate(plan: &PlanNode, switch: &CaptureSwitch, next_id: &mut usize) -> Arc<Self> {
        let operator_id = *next_id;
        *next_id += 1;

        let children = plan
            .children
            .iter()
            .map(|child| Self::annotate(child, switch, next_id))
            .collect();
        let distinct = plan
            .distinct
            .as_deref()
            .map(|node| Self::annotate(node, switch, next_id));

        Arc::new(Self {
            operator_id,
            kind: plan.kind,
            table_name: plan.table_name.clone(),
            extra: plan.extra.clone(),
            children,
            distinct,
            switch: switch.clone(),
            registry: Mutex::new(ThreadRegistry {
                diag: Diagnostics::new(operator_id),
                ..Default::default()
            }),
            state: Mutex::new(PostProcessState {
                diag: Diagnostics::new(operator_id),
                ..Default::default()
            }),
        })
    }

    pub fn operator_id(&self) -> usize {
        self.operator_id
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn extra(&self) -> &str {
        &self.extra
    }

    pub fn children(&self) -> &[Arc<OperatorLineage>] {
        &self.children
    }

    pub fn distinct(&self) -> Option<&Arc<OperatorLineage>> {
        self.distinct.as_ref()
    }

    pub fn switch(&self) -> &CaptureSwitch {
        &self.switch
    }

    /// Register `thread` and return its writer.
    ///
    /// Registering a thread twice keeps the existing log and reports the
    /// duplicate. Delimiter joins register with their distinct operator.
    pub fn init_log(&self, thread: ThreadId) -> Option<LogWriter> {
        if !self.switch.is_active() {
            return None;
        }
        if self.kind == OperatorKind::DelimJoin {
            return match &self.distinct {
                Some(distinct) => distinct.init_log(thread),
                None => {
                    lock(&self.registry).diag.report(CaptureAnomaly::MissingDelegate);
                    None
                }
            };
        }

        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.logs.get(&thread).cloned() {
            registry.diag.report(CaptureAnomaly::DuplicateThread { thread });
            return Some(self.writer(thread, existing));
        }

        let log = Arc::new(Mutex::new(OperatorLog::new(thread, self.kind.empty_log())));
        registry.order.push(thread);
        registry.logs.insert(thread, Arc::clone(&log));
        tracing::debug!(
            operator_id = self.operator_id,
            thread,
            "registered {} log",
            self.kind.name()
        );
        Some(self.writer(thread, log))
    }

    /// Writer of an already registered thread
    pub fn log_writer(&self, thread: ThreadId) -> Option<LogWriter> {
        if self.kind == OperatorKind::DelimJoin {
            return self.distinct.as_ref().and_then(|d| d.log_writer(thread));
        }
        let log = lock(&self.registry).logs.get(&thread).cloned()?;
        Some(self.writer(thread, log))
    }

    fn writer(&self, thread: ThreadId, log: Arc<Mutex<OperatorLog>>) -> LogWriter {
        LogWriter {
            thread,
            log,
            switch: self.switch.clone(),
        }
    }

    /// Registered threads in registration order
    pub fn threads(&self) -> Vec<ThreadId> {
        lock(&self.registry).order.clone()
    }

    fn thread_logs(&self) -> Vec<Arc<Mutex<OperatorLog>>> {
        let registry = lock(&self.registry);
        registry
            .order
            .iter()
            .filter_map(|thread| registry.logs.get(thread).cloned())
            .collect()
    }

    /// Build this operator's global index and reconcile every thread log.
    /// Runs once; later calls return a skipped report.
    pub fn post_process(&self) -> PostProcessReport {
        let mut state = lock(&self.state);
        if state.processed {
            tracing::debug!(operator_id = self.operator_id, "already post-processed");
            return PostProcessReport::skipped(self.operator_id);
        }

        let started = Instant::now();
        let logs = self.thread_logs();
        let mut guards: Vec<MutexGuard<'_, OperatorLog>> = logs.iter().map(|log| lock(log)).collect();
        let mut index = GlobalIndex::new();
        let mut diag = Diagnostics::new(self.operator_id);

        let build_rows = guards.iter().map(|log| log.build_row_count()).sum();
        index.prepare_address_index(build_rows);
        index.prepare_perfect_index(guards.iter().map(|log| log.perfect_row_count()).sum());

        for log in &guards {
            log.build_indexes(&mut index, &mut diag);
        }
        if index.finalize_batches > 1 {
            diag.report(CaptureAnomaly::RepeatedFinalize {
                batches: index.finalize_batches,
            });
        }
        tracing::debug!(
            operator_id = self.operator_id,
            build_rows,
            address_bytes = index.address_index().memory_usage_bytes(),
            "index built for {}",
            self.kind.name()
        );

        for log in guards.iter_mut() {
            log.reconcile(&mut index, &mut diag);
        }
        drop(guards);

        let elapsed = started.elapsed();
        tracing::info!(
            operator_id = self.operator_id,
            threads = logs.len(),
            "post-processed {} in {:?}",
            self.kind.name(),
            elapsed
        );

        let report = PostProcessReport {
            operator_id: self.operator_id,
            threads: logs.len(),
            elapsed,
            anomalies: diag.anomalies().to_vec(),
            ran: true,
        };
        state.processed = true;
        state.index = Some(index);
        state.diag = diag;
        state.elapsed = elapsed;
        report
    }

    /// Post-process this operator, its children and its delegate
    pub fn post_process_tree(&self) -> Vec<PostProcessReport> {
        let mut reports = Vec::new();
        self.visit(&mut |node, _| reports.push(node.post_process()));
        reports
    }

    /// Every operator of the subtree in pre-order, delegates included
    pub fn nodes(self: &Arc<Self>) -> Vec<Arc<OperatorLineage>> {
        let mut nodes = Vec::new();
        self.collect_nodes(&mut nodes);
        nodes
    }

    fn collect_nodes(self: &Arc<Self>, out: &mut Vec<Arc<OperatorLineage>>) {
        out.push(Arc::clone(self));
        for child in &self.children {
            child.collect_nodes(out);
        }
        if let Some(distinct) = &self.distinct {
            distinct.collect_nodes(out);
        }
    }

    pub fn is_processed(&self) -> bool {
        lock(&self.state).processed
    }

    /// Wall time of the completed post-process run
    pub fn postprocess_elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Run `f` against the index of the last post-process run
    pub fn with_index<R>(&self, f: impl FnOnce(Option<&GlobalIndex>) -> R) -> R {
        let state = lock(&self.state);
        f(state.index.as_ref())
    }

    /// Capture, registration and post-processing anomalies of this operator
    pub fn anomalies(&self) -> Vec<CaptureAnomaly> {
        let mut anomalies = lock(&self.registry).diag.anomalies().to_vec();
        for log in self.thread_logs() {
            anomalies.extend(lock(&log).capture_anomalies());
        }
        anomalies.extend_from_slice(lock(&self.state).diag.anomalies());
        anomalies
    }

    /// Read-only pass over this operator's logs in registration order
    pub fn for_each_log(&self, mut f: impl FnMut(&OperatorLog)) {
        for log in self.thread_logs() {
            f(&*lock(&log));
        }
    }

    /// Pre-order traversal with depth; delegates are visited after children
    pub fn visit(&self, f: &mut dyn FnMut(&OperatorLineage, usize)) {
        self.visit_at(0, f);
    }

    fn visit_at(&self, depth: usize, f: &mut dyn FnMut(&OperatorLineage, usize)) {
        f(self, depth);
        for child in &self.children {
            child.visit_at(depth + 1, f);
        }
        if let Some(distinct) = &self.distinct {
            distinct.visit_at(depth + 1, f);
        }
    }

    pub fn count(&self) -> usize {
        let mut total = 0;
        self.for_each_log(|log| total += log.count());
        total
    }

    pub fn size(&self) -> usize {
        let mut total = 0;
        self.for_each_log(|log| total += log.size());
        total
    }

    pub fn chunks_count(&self) -> usize {
        let mut total = 0;
        self.for_each_log(|log| total += log.chunks_count());
        total
    }

    /// Totals over this operator's subtree
    pub fn stats(&self) -> LineageStats {
        let mut stats = LineageStats::default();
        self.visit(&mut |node, _| {
            stats.merge(LineageStats::new(node.size(), node.count(), node.chunks_count()))
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::artifact::{FilterArtifact, LimitArtifact};

    fn filter_over_scan() -> PlanNode {
        PlanNode::new(OperatorKind::Filter)
            .with_extra("x > 3")
            .with_child(PlanNode::scan("t"))
    }

    #[test]
    fn test_preorder_ids() {
        let plan = PlanNode::new(OperatorKind::HashJoin)
            .with_child(filter_over_scan())
            .with_child(PlanNode::scan("s"));
        let root = OperatorLineage::from_plan(&plan, CaptureSwitch::standalone(true));

        let mut seen = Vec::new();
        root.visit(&mut |node, depth| seen.push((node.operator_id(), node.name(), depth)));
        assert_eq!(
            seen,
            vec![
                (0, "HASH_JOIN", 0),
                (1, "FILTER", 1),
                (2, "TABLE_SCAN", 2),
                (3, "TABLE_SCAN", 1),
            ]
        );
        assert_eq!(root.children()[1].table_name(), Some("s"));
    }

    #[test]
    fn test_duplicate_thread_keeps_log() {
        let root = OperatorLineage::from_plan(&filter_over_scan(), CaptureSwitch::standalone(true));
        let writer = root.init_log(0).unwrap();
        writer.push(Artifact::Filter(FilterArtifact { sel: None, count: 4, child_offset: 0 }));

        let again = root.init_log(0).unwrap();
        again.push(Artifact::Filter(FilterArtifact { sel: None, count: 2, child_offset: 4 }));

        assert_eq!(root.threads(), vec![0]);
        assert_eq!(root.count(), 6);
        assert_eq!(root.anomalies(), vec![CaptureAnomaly::DuplicateThread { thread: 0 }]);
    }

    #[test]
    fn test_capture_disabled_is_noop() {
        let switch = CaptureSwitch::standalone(false);
        let root = OperatorLineage::from_plan(&filter_over_scan(), switch.clone());
        assert!(root.init_log(0).is_none());

        switch.set_enabled(true);
        let writer = root.init_log(0).unwrap();
        switch.set_enabled(false);
        assert_eq!(
            writer.push(Artifact::Filter(FilterArtifact { sel: None, count: 1, child_offset: 0 })),
            None
        );
        assert_eq!(root.chunks_count(), 0);
    }

    #[test]
    fn test_invalidated_tree_rejects_capture() {
        let switch = CaptureSwitch::standalone(true);
        let root = OperatorLineage::from_plan(&PlanNode::new(OperatorKind::Limit), switch.clone());
        let writer = root.init_log(1).unwrap();
        switch.invalidate();

        let limit = Artifact::Limit(LimitArtifact { start: 0, end: 5, child_offset: 0 });
        assert_eq!(writer.push(limit), None);
        assert!(root.init_log(2).is_none());
    }

    #[test]
    fn test_delim_join_delegates() {
        let plan = PlanNode::new(OperatorKind::DelimJoin)
            .with_child(PlanNode::scan("t"))
            .with_distinct(PlanNode::new(OperatorKind::HashGroupBy));
        let root = OperatorLineage::from_plan(&plan, CaptureSwitch::standalone(true));

        let writer = root.init_log(3).unwrap();
        assert!(root.threads().is_empty());
        let distinct = root.distinct().unwrap();
        assert_eq!(distinct.threads(), vec![3]);
        assert_eq!(distinct.operator_id(), 2);
        assert!(root.log_writer(3).is_some());
        assert_eq!(writer.thread(), 3);
    }

    #[test]
    fn test_delim_join_without_delegate() {
        let root = OperatorLineage::from_plan(
            &PlanNode::new(OperatorKind::DelimJoin),
            CaptureSwitch::standalone(true),
        );
        assert!(root.init_log(0).is_none());
        assert_eq!(root.anomalies(), vec![CaptureAnomaly::MissingDelegate]);
    }

    #[test]
    fn test_delim_join_silent_while_capture_off() {
        let switch = CaptureSwitch::standalone(false);
        let root = OperatorLineage::from_plan(&PlanNode::new(OperatorKind::DelimJoin), switch.clone());
        assert!(root.init_log(0).is_none());
        assert!(root.anomalies().is_empty());

        switch.set_enabled(true);
        assert!(root.init_log(0).is_none());
        assert_eq!(root.anomalies(), vec![CaptureAnomaly::MissingDelegate]);
    }

    #[test]
    fn test_perfect_group_by_post_process() {
        let root = OperatorLineage::from_plan(
            &PlanNode::new(OperatorKind::PerfectHashGroupBy),
            CaptureSwitch::standalone(true),
        );
        root.init_log(0).unwrap().push(Artifact::PerfectAggregateBuild(vec![1, 0]));
        root.init_log(1).unwrap().push(Artifact::PerfectAggregateBuild(vec![1, 1]));

        let report = root.post_process();
        assert!(report.is_clean());
        root.with_index(|index| {
            let index = index.unwrap();
            assert_eq!(index.perfect_group_rows(0), Some(&[1][..]));
            assert_eq!(index.perfect_group_rows(1), Some(&[0, 2, 3][..]));
        });
        assert_eq!(root.chunks_count(), 2);
    }

    #[test]
    fn test_post_process_runs_once() {
        let root = OperatorLineage::from_plan(&filter_over_scan(), CaptureSwitch::standalone(true));
        let writer = root.init_log(0).unwrap();
        writer.push(Artifact::Filter(FilterArtifact {
            sel: Some(vec![1, 2]),
            count: 2,
            child_offset: 10,
        }));

        let first = root.post_process_tree();
        assert!(first.iter().all(|report| report.ran));
        let second = root.post_process_tree();
        assert!(second.iter().all(|report| !report.ran));

        root.for_each_log(|log| match log.data() {
            LogData::Filter(filter) => assert_eq!(filter.artifacts()[0].sel, Some(vec![11, 12])),
            other => panic!("unexpected log {}", other.name()),
        });
        assert!(root.is_processed());
        assert!(root.with_index(|index| index.is_some()));
    }

    #[test]
    fn test_capture_after_process_reported() {
        let root = OperatorLineage::from_plan(&filter_over_scan(), CaptureSwitch::standalone(true));
        let writer = root.init_log(0).unwrap();
        root.post_process();

        let late = Artifact::Filter(FilterArtifact { sel: None, count: 1, child_offset: 0 });
        assert_eq!(writer.push(late), None);
        assert_eq!(
            root.anomalies(),
            vec![CaptureAnomaly::CaptureAfterProcess { thread: 0, rejected: 1 }]
        );
    }

    #[test]
    fn test_streaming_limit_uses_limit_log() {
        assert!(matches!(OperatorKind::StreamingLimit.empty_log(), LogData::Limit(_)));
        assert!(matches!(OperatorKind::Projection.empty_log(), LogData::Passthrough(_)));
    }
}
