/// Lineage reporting types
///
/// Plain serializable summaries handed to rendering collaborators. Nothing
/// here holds a reference into the lineage tree.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CaptureAnomaly;

/// Totals over an operator subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageStats {
    /// Estimated bytes held by captured provenance
    pub size_bytes: usize,
    pub tuple_count: usize,
    pub chunk_count: usize,
}

impl LineageStats {
    pub fn new(size_bytes: usize, tuple_count: usize, chunk_count: usize) -> Self {
        Self {
            size_bytes,
            tuple_count,
            chunk_count,
        }
    }

    pub fn merge(&mut self, other: LineageStats) {
        self.size_bytes += other.size_bytes;
        self.tuple_count += other.tuple_count;
        self.chunk_count += other.chunk_count;
    }
}

/// One row of the queries list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLineageSummary {
    pub query_id: usize,
    pub query: String,
    pub size_bytes: usize,
    pub tuple_count: usize,
    pub chunk_count: usize,
    /// Wall time of the post-process run that produced these numbers
    pub postprocess_secs: f64,
}

impl QueryLineageSummary {
    pub fn new(query_id: usize, query: impl Into<String>, stats: LineageStats, elapsed: Duration) -> Self {
        Self {
            query_id,
            query: query.into(),
            size_bytes: stats.size_bytes,
            tuple_count: stats.tuple_count,
            chunk_count: stats.chunk_count,
            postprocess_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Outcome of post-processing one operator
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessReport {
    pub operator_id: usize,
    pub threads: usize,
    pub elapsed: Duration,
    pub anomalies: Vec<CaptureAnomaly>,
    /// False when the operator had already been processed and the run was skipped
    pub ran: bool,
}

impl PostProcessReport {
    pub fn skipped(operator_id: usize) -> Self {
        Self {
            operator_id,
            threads: 0,
            elapsed: Duration::ZERO,
            anomalies: Vec::new(),
            ran: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_merge() {
        let mut total = LineageStats::default();
        total.merge(LineageStats::new(64, 3, 1));
        total.merge(LineageStats::new(36, 2, 2));
        assert_eq!(total, LineageStats::new(100, 5, 3));
    }

    #[test]
    fn test_summary_serializes() {
        let summary = QueryLineageSummary::new(
            7,
            "SELECT * FROM t",
            LineageStats::new(10, 2, 1),
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["query_id"], 7);
        assert_eq!(json["tuple_count"], 2);
        assert_eq!(json["postprocess_secs"], 1.5);
    }

    #[test]
    fn test_skipped_report() {
        let report = PostProcessReport::skipped(3);
        assert!(!report.ran);
        assert!(report.is_clean());
    }
}
