/// Error and anomaly types for lineage capture and post-processing
///
/// Two families live here:
/// - `LineageError`: failures at the coordinator boundary (unknown query,
///   bad configuration). These are returned as `Result`s.
/// - `CaptureAnomaly`: data-consistency problems found in captured logs.
///   These are never returned across the capture path; they are reported
///   through `Diagnostics` and processing continues.
use thiserror::Error;

use crate::lineage::artifact::{Lsn, ThreadId};

#[derive(Error, Debug)]
pub enum LineageError {
    /// No lineage tree registered under this query id
    #[error("Unknown query: {query_id}")]
    UnknownQuery { query_id: usize },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        source_message: Option<String>,
    },

    /// IO errors while loading configuration
    #[error("IO error: {message}")]
    IO {
        message: String,
        path: Option<String>,
    },

    /// Internal errors: should never happen, indicates bug
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: Option<String>,
    },
}

impl LineageError {
    pub fn unknown_query(query_id: usize) -> Self {
        Self::UnknownQuery { query_id }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source_message: None,
        }
    }

    pub fn io_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// Add context to an error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        match &mut self {
            Self::Internal { context: ctx, .. } => *ctx = Some(context.into()),
            Self::Config { source_message, .. } => *source_message = Some(context.into()),
            _ => {}
        }
        self
    }
}

impl From<anyhow::Error> for LineageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            context: None,
        }
    }
}

impl From<std::io::Error> for LineageError {
    fn from(err: std::io::Error) -> Self {
        Self::IO {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for LineageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: "malformed configuration".to_string(),
            source_message: Some(err.to_string()),
        }
    }
}

/// Result type alias for coordinator operations
pub type LineageResult<T> = Result<T, LineageError>;

/// A capture-time defect detected while recording or reconciling lineage.
///
/// The affected entry is skipped; the rest of the log is still processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureAnomaly {
    #[error("thread {thread} registered twice")]
    DuplicateThread { thread: ThreadId },

    #[error("thread {thread}: LSN 0 in {log} at position {position}")]
    InvalidLsn {
        thread: ThreadId,
        log: &'static str,
        position: usize,
    },

    #[error("thread {thread}: LSN {lsn} in {log} exceeds {len} artifacts")]
    LsnOutOfRange {
        thread: ThreadId,
        log: &'static str,
        lsn: Lsn,
        len: usize,
    },

    #[error("thread {thread}: LSN {lsn} referenced by more than one output index entry")]
    DuplicateOutputIndex { thread: ThreadId, lsn: Lsn },

    #[error("thread {thread}: {misses} unresolved {lookup} lookups (LSN {lsn})")]
    IndexMiss {
        thread: ThreadId,
        lookup: &'static str,
        lsn: Lsn,
        misses: usize,
    },

    #[error("thread {thread}: grouping sets and distinct sets both populated")]
    MixedAggregation { thread: ThreadId },

    #[error("thread {thread}: perfect aggregate key {key} outside dense range 0..{bound}")]
    KeyOutOfRange {
        thread: ThreadId,
        key: u64,
        bound: usize,
    },

    #[error("perfect hash join finalized {batches} times")]
    RepeatedFinalize { batches: usize },

    #[error("thread {thread}: {artifact} artifact rejected by {log} log")]
    ArtifactMismatch {
        thread: ThreadId,
        artifact: &'static str,
        log: &'static str,
    },

    #[error("thread {thread}: {rejected} artifacts pushed after post-processing")]
    CaptureAfterProcess { thread: ThreadId, rejected: usize },

    #[error("delimiter join has no distinct operator to delegate to")]
    MissingDelegate,
}

/// Anomalies collected for one operator instance.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    operator_id: usize,
    anomalies: Vec<CaptureAnomaly>,
}

impl Diagnostics {
    pub fn new(operator_id: usize) -> Self {
        Self {
            operator_id,
            anomalies: Vec::new(),
        }
    }

    /// Record an anomaly and emit it as a warning
    pub fn report(&mut self, anomaly: CaptureAnomaly) {
        tracing::warn!(operator_id = self.operator_id, "lineage anomaly: {}", anomaly);
        self.anomalies.push(anomaly);
    }

    pub fn anomalies(&self) -> &[CaptureAnomaly] {
        &self.anomalies
    }

    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty()
    }
}
