//! Compaction plan document
//!
//! A persisted, versioned listing of the merge operations a compaction will
//! run. The plan is stored as the content of the REQUESTED compaction
//! instant, which makes compaction crash-recoverable and lets other
//! schedulers see which file groups are already spoken for.

use crate::view::FileGroupId;
use crate::{InstantTime, Result, SiltError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plan document version
pub const PLAN_VERSION: u32 = 1;

/// Metric keys recorded per operation
pub mod metric {
    pub const TOTAL_LOG_FILES: &str = "total_log_files";
    pub const TOTAL_LOG_SIZE_BYTES: &str = "total_log_size_bytes";
}

/// One merge operation: a file group's base file (if any) and the ordered
/// log files to fold into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionOperation {
    /// Partition owning the file group
    pub partition: String,
    /// File group id
    pub file_id: String,
    /// Current base file, absent for log-only file groups
    pub base_file_path: Option<String>,
    /// Log files in replay order
    pub log_file_paths: Vec<String>,
    /// Scheduling-time metrics
    pub metrics: BTreeMap<String, f64>,
}

impl CompactionOperation {
    /// Id of the file group this operation targets
    pub fn file_group_id(&self) -> FileGroupId {
        FileGroupId {
            partition: self.partition.clone(),
            file_id: self.file_id.clone(),
        }
    }
}

/// A persisted compaction plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPlan {
    /// Document version
    pub version: u32,
    /// Target instant the new base files will be written at
    pub instant_time: InstantTime,
    /// Operations, one per file group
    pub operations: Vec<CompactionOperation>,
    /// Free-form annotations
    pub extra_metadata: BTreeMap<String, String>,
}

impl CompactionPlan {
    /// Create a plan for the target instant
    pub fn new(instant_time: InstantTime, operations: Vec<CompactionOperation>) -> Self {
        Self {
            version: PLAN_VERSION,
            instant_time,
            operations,
            extra_metadata: BTreeMap::new(),
        }
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| SiltError::Compaction(e.to_string()))
    }

    /// Parse from JSON bytes
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        let plan: CompactionPlan =
            serde_json::from_slice(data).map_err(|e| SiltError::Compaction(e.to_string()))?;
        if plan.version != PLAN_VERSION {
            return Err(SiltError::Compaction(format!(
                "unsupported compaction plan version: {}",
                plan.version
            )));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_round_trip() {
        let mut metrics = BTreeMap::new();
        metrics.insert(metric::TOTAL_LOG_FILES.to_string(), 2.0);
        let plan = CompactionPlan::new(
            "20260101000000".to_string(),
            vec![CompactionOperation {
                partition: "p1".to_string(),
                file_id: "fg1".to_string(),
                base_file_path: Some("p1/fg1_20251231000000.base".to_string()),
                log_file_paths: vec![
                    "p1/fg1_20251231000000.log.1".to_string(),
                    "p1/fg1_20251231000000.log.2".to_string(),
                ],
                metrics,
            }],
        );
        let parsed = CompactionPlan::from_json_bytes(&plan.to_json_bytes().unwrap()).unwrap();
        assert_eq!(parsed, plan);
        assert_eq!(parsed.operations[0].file_group_id().file_id, "fg1");
    }

    #[test]
    fn test_plan_rejects_future_version() {
        let mut plan = CompactionPlan::new("20260101000000".to_string(), vec![]);
        plan.version = 99;
        let bytes = serde_json::to_vec(&plan).unwrap();
        assert!(CompactionPlan::from_json_bytes(&bytes).is_err());
    }
}
