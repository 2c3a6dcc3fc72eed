//! Write-path orchestrator
//!
//! Routes incoming record batches to their file groups under a claimed
//! instant: batches are deduplicated by key with `pre_combine`, tagged
//! against the bloom index, and either appended to the owning file group's
//! log (updates, deletes) or written into new base files (inserts). The
//! instant is marked completed only after every append has been fsynced.

use crate::base::{base_file_name, parse_base_file_name, BaseFileConfig, BaseFileWriter};
use crate::index::{BloomIndexProbe, IndexScope};
use crate::log::{
    parse_log_file_name, CommandBlock, DeleteBlock, LogBlock, LogReader, LogWriter, RowDataBlock,
};
use crate::record::RecordMerger;
use crate::timeline::{Action, CommitMetadata, State, Timeline};
use crate::view::{walk, FileGroupId, FileSystemView};
use crate::{InstantTime, OrderingVal, Record, RecordKey, Result, Schema, SiltError};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one committed write
pub struct WriteResult {
    /// Instant the write committed at
    pub instant_time: InstantTime,
    /// What the commit produced
    pub metadata: CommitMetadata,
}

/// Writer over one table
pub struct TableWriter {
    table_path: PathBuf,
    schema: Schema,
    merger: Arc<dyn RecordMerger>,
    scope: IndexScope,
    base_config: BaseFileConfig,
    log_max_size: u64,
}

impl TableWriter {
    /// Create a writer
    pub fn new(
        table_path: impl Into<PathBuf>,
        schema: &Schema,
        merger: Arc<dyn RecordMerger>,
        scope: IndexScope,
        base_config: BaseFileConfig,
        log_max_size: u64,
    ) -> Self {
        Self {
            table_path: table_path.into(),
            schema: schema.normalize(),
            merger,
            scope,
            base_config,
            log_max_size,
        }
    }

    /// Deduplicate a batch by key (key alone under the global scope),
    /// reducing same-key records pairwise with `pre_combine`. Key and
    /// partition are invariant under the reduction.
    pub fn deduplicate(&self, records: Vec<Record>) -> Vec<Record> {
        let mut reduced: BTreeMap<(String, String), Record> = BTreeMap::new();
        for record in records {
            let key = match self.scope {
                IndexScope::Global => (record.key.key.clone(), String::new()),
                IndexScope::Partition => {
                    (record.key.key.clone(), record.key.partition.clone())
                }
            };
            let merged = match reduced.remove(&key) {
                None => record,
                Some(existing) => self.merger.pre_combine(existing, record),
            };
            reduced.insert(key, merged);
        }
        reduced.into_values().collect()
    }

    /// Upsert a batch: dedup, tag against the bloom index, append updates
    /// and deletes to the owning file groups' logs, write inserts into new
    /// base files, then complete the instant.
    pub fn upsert(&self, timeline: &mut Timeline, records: Vec<Record>) -> Result<WriteResult> {
        let instant_time = timeline.new_instant_time();
        let requested = timeline.create_requested(Action::DeltaCommit, &instant_time, None)?;
        let inflight = timeline.transition_to_inflight(&requested)?;

        let records = self.deduplicate(records);
        let view = FileSystemView::load(&self.table_path, timeline)?;
        let mut probe = BloomIndexProbe::new(&view, self.scope);

        let mut updates: BTreeMap<FileGroupId, Vec<Record>> = BTreeMap::new();
        let mut inserts: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            match probe.locate(&record.key)? {
                Some(fg) => updates.entry(fg).or_default().push(record),
                None if record.is_delete() => {
                    // deleting an absent key is a normal no-op
                }
                None => inserts
                    .entry(record.key.partition.clone())
                    .or_default()
                    .push(record),
            }
        }

        let mut metadata = CommitMetadata::default();
        for (fg, group_records) in updates {
            let slice = view.latest_file_slice(&fg).ok_or_else(|| {
                SiltError::Internal(format!("tagged file group {:?} has no slice", fg))
            })?;
            let mut data = Vec::new();
            let mut deletes = Vec::new();
            for record in group_records {
                metadata.total_records_written += 1;
                if record.is_delete() {
                    deletes.push((record.key, record.ordering));
                } else {
                    data.push(record);
                }
            }
            let mut writer = LogWriter::open(
                self.table_path.join(&fg.partition),
                &fg.file_id,
                &slice.base_instant,
                self.log_max_size,
            )?;
            if !data.is_empty() {
                let block = RowDataBlock::new(data, &self.schema, &instant_time)?;
                writer.append_block(&LogBlock::RowData(block))?;
            }
            if !deletes.is_empty() {
                writer.append_block(&LogBlock::Delete(DeleteBlock::new(deletes, &instant_time)))?;
            }
            let log_name = writer
                .current_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            metadata
                .appended_log_files
                .entry(fg.partition.clone())
                .or_default()
                .push(log_name);
        }

        for (partition, partition_records) in inserts {
            let file_id = Uuid::new_v4().simple().to_string();
            let path = self
                .table_path
                .join(&partition)
                .join(base_file_name(&file_id, &instant_time));
            let mut writer = BaseFileWriter::create(
                path,
                &file_id,
                &instant_time,
                &self.schema,
                self.base_config.clone(),
            );
            for record in partition_records {
                metadata.total_records_written += 1;
                writer.add(record)?;
            }
            writer.finish()?;
            metadata
                .added_base_files
                .entry(partition)
                .or_default()
                .push(base_file_name(&file_id, &instant_time));
        }

        timeline.transition_to_completed(&inflight, Some(&metadata.to_json_bytes()?))?;
        info!(
            "committed {} with {} records",
            instant_time, metadata.total_records_written
        );
        Ok(WriteResult {
            instant_time,
            metadata,
        })
    }

    /// Delete records by key. Keys without an owning file group are dropped
    /// silently (absence is not an error).
    pub fn delete(
        &self,
        timeline: &mut Timeline,
        keys: Vec<(RecordKey, OrderingVal)>,
    ) -> Result<WriteResult> {
        let records = keys
            .into_iter()
            .map(|(key, ordering)| Record::delete(key, ordering))
            .collect();
        self.upsert(timeline, records)
    }

    /// Roll an uncompleted instant back: delete the base files it created,
    /// truncate torn trailing log blocks, mark affected logs with a rollback
    /// command block, drop the instant's timeline files, and record the
    /// rollback as its own instant.
    pub fn rollback(&self, timeline: &mut Timeline, instant_time: &str) -> Result<()> {
        let Some(instant) = timeline.find(instant_time).cloned() else {
            return Err(SiltError::Rollback(format!(
                "no instant at {}",
                instant_time
            )));
        };
        if instant.state == State::Completed {
            return Err(SiltError::Rollback(format!(
                "instant {} is completed and cannot be rolled back",
                instant_time
            )));
        }
        let rollback_ts = timeline.new_instant_time();

        let mut files = Vec::new();
        walk(&self.table_path, "", &mut files)?;

        let mut deleted_base_files = Vec::new();
        let mut truncated_log_files = Vec::new();
        let mut marked_slices: std::collections::BTreeSet<(String, String, String)> =
            std::collections::BTreeSet::new();
        for (partition, path, name, _) in files {
            if let Some((_, base_instant)) = parse_base_file_name(&name) {
                if base_instant == instant_time {
                    std::fs::remove_file(&path)?;
                    warn!("rollback {} deleted base file {:?}", instant_time, path);
                    deleted_base_files.push(name);
                }
            } else if let Some((file_id, slice_instant, _)) = parse_log_file_name(&name) {
                let reader = LogReader::open(&path)?;
                let mut touches_instant = false;
                for lazy in reader.blocks()? {
                    if lazy?.instant_time() == Some(instant_time) {
                        touches_instant = true;
                    }
                }
                let file_len = path.metadata()?.len();
                let valid = reader.valid_prefix_len()?;
                if valid < file_len {
                    OpenOptions::new().write(true).open(&path)?.set_len(valid)?;
                    warn!(
                        "rollback {} truncated {:?} from {} to {} bytes",
                        instant_time, path, file_len, valid
                    );
                    truncated_log_files.push(name);
                }
                // one marker per file group slice, appended to its latest log
                if touches_instant
                    && marked_slices.insert((
                        partition.clone(),
                        file_id.clone(),
                        slice_instant.clone(),
                    ))
                {
                    let mut writer = LogWriter::open(
                        self.table_path.join(&partition),
                        &file_id,
                        &slice_instant,
                        self.log_max_size,
                    )?;
                    writer.append_block(&LogBlock::Command(CommandBlock::rollback(
                        instant_time,
                        &rollback_ts,
                    )))?;
                }
            }
        }

        timeline.remove_instant(instant_time)?;

        let mut metadata = CommitMetadata::default();
        metadata
            .extra_metadata
            .insert("rolled_back_instant".to_string(), instant_time.to_string());
        metadata.extra_metadata.insert(
            "deleted_base_files".to_string(),
            deleted_base_files.join(","),
        );
        metadata.extra_metadata.insert(
            "truncated_log_files".to_string(),
            truncated_log_files.join(","),
        );
        let requested = timeline.create_requested(Action::Rollback, &rollback_ts, None)?;
        let inflight = timeline.transition_to_inflight(&requested)?;
        timeline.transition_to_completed(&inflight, Some(&metadata.to_json_bytes()?))?;
        info!("rolled back {} as {}", instant_time, rollback_ts);
        Ok(())
    }
}
