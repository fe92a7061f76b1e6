/// Configuration management
pub mod lineage;

pub use lineage::*;
