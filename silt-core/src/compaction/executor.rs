//! Compaction executor

use super::plan::{CompactionOperation, CompactionPlan};
use crate::base::{base_file_name, BaseFileConfig, BaseFileMeta, BaseFileReader, BaseFileWriter};
use crate::log::LogReader;
use crate::record::{MergeEngine, ReadMode, RecordMerger};
use crate::timeline::{CommitMetadata, State, Timeline};
use crate::view::FileGroupId;
use crate::{Result, Schema, SiltError};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of executing a plan: per-file-group failures are isolated so the
/// caller can retry just the failed subset.
pub struct CompactionResult {
    /// New base files, one per successful operation
    pub written: Vec<BaseFileMeta>,
    /// Operations that failed, with their errors
    pub failures: Vec<(FileGroupId, SiltError)>,
}

impl CompactionResult {
    /// Check if every operation succeeded
    pub fn is_fully_successful(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Executes a persisted compaction plan
pub struct CompactionExecutor {
    merger: Arc<dyn RecordMerger>,
    reader_schema: Schema,
    base_config: BaseFileConfig,
}

impl CompactionExecutor {
    /// Create an executor
    pub fn new(
        merger: Arc<dyn RecordMerger>,
        reader_schema: &Schema,
        base_config: BaseFileConfig,
    ) -> Self {
        Self {
            merger,
            reader_schema: reader_schema.normalize(),
            base_config,
        }
    }

    /// Run every operation of the plan. The compaction instant moves to
    /// INFLIGHT first and to COMPLETED only when all operations succeed;
    /// otherwise it stays inflight and the result reports the failed subset.
    pub async fn execute(
        &self,
        table_path: &Path,
        plan: &CompactionPlan,
        timeline: &mut Timeline,
    ) -> Result<CompactionResult> {
        let instant = timeline.find(&plan.instant_time).cloned().ok_or_else(|| {
            SiltError::Compaction(format!("no compaction instant at {}", plan.instant_time))
        })?;
        if instant.state == State::Completed {
            return Err(SiltError::Compaction(format!(
                "compaction {} already completed",
                plan.instant_time
            )));
        }
        let inflight = if instant.state == State::Requested {
            timeline.transition_to_inflight(&instant)?
        } else {
            instant
        };

        info!(
            "executing compaction {} over {} file groups",
            plan.instant_time,
            plan.operations.len()
        );
        let valid_instants = timeline.completed_instant_times();
        let mut written = Vec::new();
        let mut metadata = CommitMetadata::default();
        let mut failures = Vec::new();
        for op in &plan.operations {
            match self.compact_operation(table_path, op, &plan.instant_time, &valid_instants) {
                Ok(meta) => {
                    metadata
                        .added_base_files
                        .entry(op.partition.clone())
                        .or_default()
                        .push(base_file_name(&op.file_id, &plan.instant_time));
                    metadata.total_records_written += meta.record_count;
                    written.push(meta);
                }
                Err(e) => {
                    warn!(
                        "compaction of file group {}/{} failed: {}",
                        op.partition, op.file_id, e
                    );
                    failures.push((op.file_group_id(), e));
                }
            }
        }

        if failures.is_empty() {
            timeline.transition_to_completed(&inflight, Some(&metadata.to_json_bytes()?))?;
        } else {
            warn!(
                "compaction {} left inflight: {} of {} operations failed",
                plan.instant_time,
                failures.len(),
                plan.operations.len()
            );
        }
        Ok(CompactionResult { written, failures })
    }

    fn compact_operation(
        &self,
        table_path: &Path,
        op: &CompactionOperation,
        target_instant: &str,
        valid_instants: &BTreeSet<String>,
    ) -> Result<BaseFileMeta> {
        let base_reader = match &op.base_file_path {
            Some(path) => Some(BaseFileReader::open(path)?),
            None => None,
        };

        let mut lazies = Vec::new();
        for path in &op.log_file_paths {
            let reader = LogReader::open(path)?;
            for lazy in reader.blocks()? {
                let lazy = lazy?;
                // blocks of instants that never completed are invisible
                match lazy.instant_time() {
                    Some(ts) if valid_instants.contains(ts) => lazies.push(lazy),
                    _ => continue,
                }
            }
        }

        let engine = MergeEngine::new(self.merger.clone(), &self.reader_schema);
        let schema = &self.reader_schema;
        let scan = engine.scan(
            base_reader.as_ref(),
            lazies.into_iter().map(|lazy| lazy.decode(Some(schema))),
            ReadMode::Merged,
        )?;

        let path = table_path
            .join(&op.partition)
            .join(base_file_name(&op.file_id, target_instant));
        let mut writer = BaseFileWriter::create(
            path,
            &op.file_id,
            target_instant,
            &self.reader_schema,
            self.base_config.clone(),
        );
        for record in scan {
            writer.add(record?)?;
        }
        writer.finish()
    }
}
