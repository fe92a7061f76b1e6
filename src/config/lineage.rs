/// Lineage capture configuration
///
/// Controls whether operators record provenance, and how the
/// post-processing passes are scheduled once a query has finished.
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LineageError, LineageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    /// Start with capture enabled
    pub capture_enabled: bool,

    /// Post-process operators of one tree on a rayon pool
    pub parallel_post_process: bool,

    /// Worker threads for parallel post-processing
    pub post_process_threads: usize,

    /// tracing filter directive used by binaries
    pub log_filter: String,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            capture_enabled: false,
            parallel_post_process: true,
            post_process_threads: num_cpus::get(),
            log_filter: "info".to_string(),
        }
    }
}

impl LineageConfig {
    pub fn from_json_str(json: &str) -> LineageResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> LineageResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LineageError::io_with_path(e.to_string(), path.display().to_string()))?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by `LINEAGE_CAPTURE`, `LINEAGE_PARALLEL`,
    /// `LINEAGE_THREADS` and `LINEAGE_LOG`
    pub fn from_env() -> LineageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LineageResult<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("LINEAGE_CAPTURE") {
            config.capture_enabled = parse_flag(&value)
                .ok_or_else(|| LineageError::config(format!("invalid LINEAGE_CAPTURE '{}'", value)))?;
        }
        if let Some(value) = lookup("LINEAGE_PARALLEL") {
            config.parallel_post_process = parse_flag(&value)
                .ok_or_else(|| LineageError::config(format!("invalid LINEAGE_PARALLEL '{}'", value)))?;
        }
        if let Some(value) = lookup("LINEAGE_THREADS") {
            config.post_process_threads = value.trim().parse().map_err(|_| {
                LineageError::config(format!("invalid LINEAGE_THREADS '{}'", value))
            })?;
        }
        if let Some(value) = lookup("LINEAGE_LOG") {
            config.log_filter = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LineageResult<()> {
        if self.post_process_threads == 0 {
            return Err(LineageError::config("post_process_threads must be at least 1"));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
