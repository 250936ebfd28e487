//! Diagnostic summaries for a completed dump or restore run, serialised
//! alongside the primary output for downstream tooling (modeled on the
//! archive format's own recovery-report JSON).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpReport {
    pub clusters_written: u64,
    pub items_written: u64,
    pub metadata_bytes: u64,
    pub data_bytes: u64,
    pub stream_bytes: u64,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub clusters_read: u64,
    pub items_written: u64,
    pub backup_supers_written: u32,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl DumpReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl RestoreReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
