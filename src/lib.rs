//! # Hypergraph Lineage
//!
//! Fine-grained lineage capture and reconciliation for a parallel query
//! executor.
//!
//! ## Quick Start
//!
//! ```rust
//! use hypergraph_lineage::{Artifact, FilterArtifact, LineageConfig, LineageCoordinator, OperatorKind, PlanNode};
//!
//! let coordinator = LineageCoordinator::new(LineageConfig {
//!     capture_enabled: true,
//!     parallel_post_process: false,
//!     ..Default::default()
//! }).unwrap();
//!
//! let plan = PlanNode::new(OperatorKind::Filter).with_child(PlanNode::scan("t"));
//! let (query_id, root) = coordinator.start_query("SELECT * FROM t WHERE x > 3", &plan);
//!
//! // each worker thread registers once, then appends one artifact per batch
//! let writer = root.init_log(0).unwrap();
//! writer.push(Artifact::Filter(FilterArtifact { sel: Some(vec![1, 3]), count: 2, child_offset: 1024 }));
//!
//! coordinator.post_process(query_id).unwrap();
//! println!("{:?}", coordinator.stats(query_id).unwrap());
//! ```
//!
//! ## Features
//!
//! - **Per-thread capture**: one append-only log per worker thread and operator
//! - **Two-pass post-processing**: index construction, then global reconciliation
//! - **Handle-based join lineage**: build and probe linked by stable build handles
//! - **Anomaly reporting**: capture defects are reported, never fatal

pub mod config;
pub mod error;
pub mod lineage;

pub use config::LineageConfig;
pub use error::{CaptureAnomaly, Diagnostics, LineageError, LineageResult};
pub use lineage::*;
