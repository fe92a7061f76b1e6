/// Fine-grained lineage capture and reconciliation
///
/// Capture appends artifacts to per-thread logs during execution.
/// Post-processing then runs two passes per operator: `index` builds the
/// lookup structures, `reconcile` rewrites captured indices into global
/// row numbering.
pub mod artifact;
pub mod coordinator;
pub mod index;
pub mod log;
pub mod operator;
mod reconcile;
pub mod stats;

pub use artifact::*;
pub use coordinator::{LineageCoordinator, QueryId};
pub use index::{AddressIndex, GlobalIndex};
pub use log::*;
pub use operator::{CaptureSwitch, LogWriter, OperatorKind, OperatorLineage, PlanNode};
pub use stats::{LineageStats, PostProcessReport, QueryLineageSummary};
