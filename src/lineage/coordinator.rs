/// Process-wide lineage registry
///
/// Owns the capture flag, maps query ids to lineage trees and triggers
/// post-processing on demand. Trees built here share the coordinator's
/// capture flag, so `set_capture(false)` silences every writer at once.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rayon::prelude::*;

use crate::config::LineageConfig;
use crate::error::{LineageError, LineageResult};
use crate::lineage::operator::{CaptureSwitch, OperatorLineage, PlanNode};
use crate::lineage::stats::{LineageStats, PostProcessReport, QueryLineageSummary};

pub type QueryId = usize;

struct RegisteredQuery {
    query: String,
    root: Arc<OperatorLineage>,
}

pub struct LineageCoordinator {
    config: LineageConfig,
    capture: Arc<AtomicBool>,
    queries: DashMap<QueryId, RegisteredQuery>,
    next_query_id: AtomicUsize,
    /// Present when post-processing fans out across operators
    pool: Option<rayon::ThreadPool>,
}

impl LineageCoordinator {
    pub fn new(config: LineageConfig) -> LineageResult<Self> {
        config.validate()?;

        let pool = if config.parallel_post_process {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.post_process_threads)
                .thread_name(|i| format!("lineage-post-{}", i))
                .build()
                .map_err(|e| {
                    LineageError::internal(format!("failed to build post-process pool: {}", e))
                })?;
            Some(pool)
        } else {
            None
        };

        tracing::info!(
            capture = config.capture_enabled,
            parallel = config.parallel_post_process,
            threads = config.post_process_threads,
            "lineage coordinator ready"
        );

        Ok(Self {
            capture: Arc::new(AtomicBool::new(config.capture_enabled)),
            config,
            queries: DashMap::new(),
            next_query_id: AtomicUsize::new(0),
            pool,
        })
    }

    pub fn config(&self) -> &LineageConfig {
        &self.config
    }

    pub fn set_capture(&self, enabled: bool) {
        self.capture.store(enabled, Ordering::Release);
        tracing::debug!(enabled, "lineage capture toggled");
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.load(Ordering::Acquire)
    }

    /// Build a lineage tree for `plan` gated by this coordinator's capture flag
    pub fn init_operator_plan(&self, plan: &PlanNode) -> Arc<OperatorLineage> {
        OperatorLineage::from_plan(plan, CaptureSwitch::new(Arc::clone(&self.capture)))
    }

    pub fn register_query(&self, query: impl Into<String>, root: Arc<OperatorLineage>) -> QueryId {
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let query = query.into();
        tracing::debug!(query_id, "registered lineage for {}", query);
        self.queries.insert(query_id, RegisteredQuery { query, root });
        query_id
    }

    /// `init_operator_plan` followed by `register_query`
    pub fn start_query(
        &self,
        query: impl Into<String>,
        plan: &PlanNode,
    ) -> (QueryId, Arc<OperatorLineage>) {
        let root = self.init_operator_plan(plan);
        let query_id = self.register_query(query, Arc::clone(&root));
        (query_id, root)
    }

    pub fn query_root(&self, query_id: QueryId) -> LineageResult<Arc<OperatorLineage>> {
        self.queries
            .get(&query_id)
            .map(|entry| Arc::clone(&entry.root))
            .ok_or_else(|| LineageError::unknown_query(query_id))
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Reconcile every operator of the query's tree. Operators already
    /// processed are skipped.
    pub fn post_process(&self, query_id: QueryId) -> LineageResult<Vec<PostProcessReport>> {
        let root = self.query_root(query_id)?;
        let nodes = root.nodes();

        let reports: Vec<PostProcessReport> = match &self.pool {
            Some(pool) => pool.install(|| nodes.par_iter().map(|node| node.post_process()).collect()),
            None => nodes.iter().map(|node| node.post_process()).collect(),
        };

        let anomalies: usize = reports.iter().map(|r| r.anomalies.len()).sum();
        if anomalies > 0 {
            tracing::warn!(query_id, anomalies, "post-processing finished with anomalies");
        }
        Ok(reports)
    }

    /// Size, tuple and chunk totals over the query's tree
    pub fn stats(&self, query_id: QueryId) -> LineageResult<LineageStats> {
        Ok(self.query_root(query_id)?.stats())
    }

    /// Post-process every registered query and summarize it, ordered by id
    pub fn queries_list(&self) -> LineageResult<Vec<QueryLineageSummary>> {
        let mut entries: Vec<(QueryId, String)> = self
            .queries
            .iter()
            .map(|entry| (*entry.key(), entry.query.clone()))
            .collect();
        entries.sort_by_key(|(query_id, _)| *query_id);

        let mut summaries = Vec::with_capacity(entries.len());
        for (query_id, query) in entries {
            self.post_process(query_id)?;
            let root = self.query_root(query_id)?;
            let elapsed: Duration = root.nodes().iter().map(|node| node.postprocess_elapsed()).sum();
            summaries.push(QueryLineageSummary::new(query_id, query, root.stats(), elapsed));
        }
        Ok(summaries)
    }

    /// Invalidate and release every registered tree. Writers still held by
    /// worker threads become no-ops.
    pub fn clear(&self) {
        for entry in self.queries.iter() {
            entry.root.switch().invalidate();
        }
        let released = self.queries.len();
        self.queries.clear();
        tracing::info!(released, "lineage cleared");
    }
}
