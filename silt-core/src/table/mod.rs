//! Merge-on-read table facade
//!
//! `MorTable` wires the pieces together: table configuration persisted next
//! to the timeline, registries resolving the configured merger and key
//! generator at open time, the writer, the timeline-filtered view, snapshot
//! reads, and compaction scheduling/execution.

use crate::base::{BaseFileConfig, BaseFileReader};
use crate::compaction::{
    CompactionConfig, CompactionExecutor, CompactionPlan, CompactionResult, CompactionScheduler,
};
use crate::index::IndexScope;
use crate::log::LogReader;
use crate::record::{
    KeyGenerator, KeyGeneratorRegistry, MergeEngine, MergerRegistry, ReadMode, RecordMerger,
};
use crate::timeline::{Instant, Timeline, TIMELINE_DIR};
use crate::view::FileSystemView;
use crate::write::{TableWriter, WriteResult};
use crate::{OrderingVal, Record, Result, RowData, Schema, SiltError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Name of the persisted table configuration, inside the timeline directory
const CONFIG_FILE: &str = "config.json";

/// Table configuration, persisted as JSON when the table is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name
    pub name: String,
    /// Table schema
    pub schema: Schema,
    /// Registered merger resolving record versions
    pub merger: String,
    /// Registered key generator
    pub key_generator: String,
    /// Field carrying the precombine/ordering value, if any
    pub ordering_field: Option<String>,
    /// Key uniqueness scope
    pub index_scope: IndexScope,
    /// Bloom filter target false-positive probability
    pub bloom_fpp: f64,
    /// Records per base file chunk
    pub base_chunk_records: usize,
    /// Log file size cap before rolling to the next version
    pub log_file_max_size: u64,
    /// Compaction trigger configuration
    pub compaction: CompactionConfig,
    /// Properties consumed by pluggable components
    pub props: BTreeMap<String, String>,
}

impl TableConfig {
    /// Configuration with defaults for a named table
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            merger: "overwrite-latest".to_string(),
            key_generator: "simple".to_string(),
            ordering_field: None,
            index_scope: IndexScope::Partition,
            bloom_fpp: crate::config::BLOOM_FPP,
            base_chunk_records: crate::config::BASE_CHUNK_RECORDS,
            log_file_max_size: crate::config::LOG_FILE_MAX_SIZE,
            compaction: CompactionConfig::default(),
            props: BTreeMap::new(),
        }
    }

    /// Set a property, builder style
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}

/// A merge-on-read table
pub struct MorTable {
    path: PathBuf,
    config: TableConfig,
    merger: Arc<dyn RecordMerger>,
    key_generator: Arc<dyn KeyGenerator>,
    timeline: RwLock<Timeline>,
}

impl MorTable {
    /// Create a new table at `path`, persisting its configuration
    pub fn create(path: impl Into<PathBuf>, config: TableConfig) -> Result<Self> {
        Self::create_with_registries(
            path,
            config,
            &MergerRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
    }

    /// Create with custom registries
    pub fn create_with_registries(
        path: impl Into<PathBuf>,
        config: TableConfig,
        mergers: &MergerRegistry,
        key_generators: &KeyGeneratorRegistry,
    ) -> Result<Self> {
        let path = path.into();
        let config_path = path.join(TIMELINE_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Err(SiltError::Config(format!(
                "table already exists at {:?}",
                path
            )));
        }
        std::fs::create_dir_all(path.join(TIMELINE_DIR))?;
        let json = serde_json::to_vec_pretty(&config)
            .map_err(|e| SiltError::Config(e.to_string()))?;
        std::fs::write(&config_path, json)?;
        info!("created table '{}' at {:?}", config.name, path);
        Self::init(path, config, mergers, key_generators)
    }

    /// Open an existing table
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_registries(
            path,
            &MergerRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
    }

    /// Open with custom registries
    pub fn open_with_registries(
        path: impl Into<PathBuf>,
        mergers: &MergerRegistry,
        key_generators: &KeyGeneratorRegistry,
    ) -> Result<Self> {
        let path = path.into();
        let config_path = path.join(TIMELINE_DIR).join(CONFIG_FILE);
        let bytes = std::fs::read(&config_path).map_err(|_| {
            SiltError::Config(format!("no table configuration at {:?}", config_path))
        })?;
        let config: TableConfig =
            serde_json::from_slice(&bytes).map_err(|e| SiltError::Config(e.to_string()))?;
        Self::init(path, config, mergers, key_generators)
    }

    fn init(
        path: PathBuf,
        config: TableConfig,
        mergers: &MergerRegistry,
        key_generators: &KeyGeneratorRegistry,
    ) -> Result<Self> {
        let merger = mergers.resolve(&config.merger)?;
        let key_generator = key_generators.resolve(&config.key_generator, &config.props)?;
        let timeline = Timeline::load(&path)?;
        Ok(Self {
            path,
            config,
            merger,
            key_generator,
            timeline: RwLock::new(timeline),
        })
    }

    /// Table configuration
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Table schema
    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    /// Table base path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current timeline instants
    pub fn instants(&self) -> Vec<Instant> {
        self.timeline.read().instants().to_vec()
    }

    /// Timeline-filtered view of the table's file groups
    pub fn view(&self) -> Result<FileSystemView> {
        let timeline = self.timeline.read();
        FileSystemView::load(&self.path, &timeline)
    }

    /// Build a record from a raw row using the configured key generator and
    /// ordering field.
    pub fn record_from_row(&self, row: RowData) -> Result<Record> {
        let key = self.key_generator.key(&row)?;
        let ordering = match self.config.ordering_field.as_deref().and_then(|f| row.get(f)) {
            Some(crate::FieldValue::Integer(v)) => OrderingVal::Int(*v),
            Some(crate::FieldValue::Float(v)) => OrderingVal::Float(*v),
            Some(crate::FieldValue::String(v)) => OrderingVal::Str(v.clone()),
            _ => OrderingVal::Int(0),
        };
        Ok(Record::insert(key, ordering, row))
    }

    /// Upsert a batch of records
    pub fn upsert(&self, records: Vec<Record>) -> Result<WriteResult> {
        let mut timeline = self.timeline.write();
        self.table_writer().upsert(&mut timeline, records)
    }

    /// Delete records by key
    pub fn delete(&self, keys: Vec<(crate::RecordKey, OrderingVal)>) -> Result<WriteResult> {
        let mut timeline = self.timeline.write();
        self.table_writer().delete(&mut timeline, keys)
    }

    /// Roll back an uncompleted instant
    pub fn rollback(&self, instant_time: &str) -> Result<()> {
        let mut timeline = self.timeline.write();
        self.table_writer().rollback(&mut timeline, instant_time)
    }

    /// Read a partition at the latest snapshot
    pub fn read_partition(&self, partition: &str, mode: ReadMode) -> Result<Vec<Record>> {
        self.scan_partition(partition, mode, None)
    }

    /// Read a partition as of an instant
    pub fn read_partition_as_of(
        &self,
        partition: &str,
        mode: ReadMode,
        as_of: &str,
    ) -> Result<Vec<Record>> {
        self.scan_partition(partition, mode, Some(as_of))
    }

    /// Evaluate the compaction trigger and persist a plan when it fires
    pub fn schedule_compaction(&self) -> Result<Option<CompactionPlan>> {
        let mut timeline = self.timeline.write();
        let instant_time = timeline.new_instant_time();
        let view = FileSystemView::load(&self.path, &timeline)?;
        let scheduler = CompactionScheduler::new(self.config.compaction.clone());
        scheduler.schedule(&mut timeline, &view, &instant_time)
    }

    /// Execute a scheduled compaction plan
    pub async fn run_compaction(&self, plan: &CompactionPlan) -> Result<CompactionResult> {
        let executor = CompactionExecutor::new(
            self.merger.clone(),
            &self.config.schema,
            self.base_config(),
        );
        let mut timeline = self.timeline.write();
        executor.execute(&self.path, plan, &mut timeline).await
    }

    fn table_writer(&self) -> TableWriter {
        TableWriter::new(
            &self.path,
            &self.config.schema,
            self.merger.clone(),
            self.config.index_scope,
            self.base_config(),
            self.config.log_file_max_size,
        )
    }

    fn base_config(&self) -> BaseFileConfig {
        BaseFileConfig {
            chunk_records: self.config.base_chunk_records,
            bloom_fpp: self.config.bloom_fpp,
        }
    }

    fn scan_partition(
        &self,
        partition: &str,
        mode: ReadMode,
        as_of: Option<&str>,
    ) -> Result<Vec<Record>> {
        let timeline = self.timeline.read();
        let view = FileSystemView::load_as_of(&self.path, &timeline, as_of)?;
        let mut valid = timeline.completed_instant_times();
        if let Some(ts) = as_of {
            valid.retain(|t| t.as_str() <= ts);
        }
        let engine = MergeEngine::new(self.merger.clone(), &self.config.schema);
        let schema = &self.config.schema;

        let mut out = Vec::new();
        for slice in view.latest_file_slices(partition) {
            let base = slice
                .base_file
                .as_ref()
                .map(|b| BaseFileReader::open(&b.path))
                .transpose()?;
            let mut lazies = Vec::new();
            for log in &slice.log_files {
                for lazy in LogReader::open(&log.path)?.blocks()? {
                    let lazy = lazy?;
                    match lazy.instant_time() {
                        Some(ts) if valid.contains(ts) => lazies.push(lazy),
                        _ => {}
                    }
                }
            }
            let scan = engine.scan(
                base.as_ref(),
                lazies.into_iter().map(|l| l.decode(Some(schema))),
                mode,
            )?;
            for record in scan {
                out.push(record?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KEY_FIELD_PROP;
    use crate::{DataType, FieldValue, RecordKey};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new("riders")
            .with_field("id", DataType::String, false)
            .with_field("value", DataType::Integer, true)
            .with_field("ts", DataType::Integer, true)
    }

    fn table_config() -> TableConfig {
        let mut config = TableConfig::new("riders", schema()).with_prop(KEY_FIELD_PROP, "id");
        config.ordering_field = Some("ts".to_string());
        config.compaction.max_delta_commits = 1;
        config
    }

    fn rec(table: &MorTable, key: &str, value: i64, ts: i64) -> Record {
        let mut record = table
            .record_from_row(
                RowData::new()
                    .with("id", key)
                    .with("value", value)
                    .with("ts", ts),
            )
            .unwrap();
        record.key = RecordKey::new(record.key.key.clone(), "p1");
        record
    }

    fn values(records: &[Record]) -> HashMap<String, i64> {
        records
            .iter()
            .map(|r| {
                (
                    r.key.key.clone(),
                    r.row.as_ref().unwrap().get("value").unwrap().as_i64().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("riders");
        {
            let table = MorTable::create(&path, table_config()).unwrap();
            assert_eq!(table.config().name, "riders");
        }
        let table = MorTable::open(&path).unwrap();
        assert_eq!(table.config().merger, "overwrite-latest");
        assert!(MorTable::create(&path, table_config()).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_merger() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("riders");
        let mut config = table_config();
        config.merger = "does-not-exist".to_string();
        assert!(matches!(
            MorTable::create(&path, config),
            Err(SiltError::Config(_))
        ));
    }

    #[test]
    fn test_record_from_row_uses_key_and_ordering() {
        let dir = TempDir::new().unwrap();
        let table = MorTable::create(dir.path().join("riders"), table_config()).unwrap();
        let record = table
            .record_from_row(RowData::new().with("id", "r1").with("ts", 42i64))
            .unwrap();
        assert_eq!(record.key.key, "r1");
        assert_eq!(record.ordering, OrderingVal::Int(42));
    }

    #[test]
    fn test_snapshot_and_read_optimized_reads() {
        let dir = TempDir::new().unwrap();
        let table = MorTable::create(dir.path().join("riders"), table_config()).unwrap();

        let inserts: Vec<Record> = (1..=100).map(|i| rec(&table, &format!("k{}", i), i, 1)).collect();
        table.upsert(inserts).unwrap();
        let updates: Vec<Record> = (1..=50)
            .map(|i| rec(&table, &format!("k{}", i), 1000 + i, 2))
            .collect();
        table.upsert(updates).unwrap();

        let merged = table.read_partition("p1", ReadMode::Merged).unwrap();
        assert_eq!(merged.len(), 100);
        let merged = values(&merged);
        assert_eq!(merged["k1"], 1001);
        assert_eq!(merged["k50"], 1050);
        assert_eq!(merged["k51"], 51);

        // read-optimized ignores the log chain entirely
        let optimized = values(&table.read_partition("p1", ReadMode::ReadOptimized).unwrap());
        assert_eq!(optimized["k1"], 1);

        // skip-merge exposes the raw duplicates
        let raw = table.read_partition("p1", ReadMode::SkipMerge).unwrap();
        assert_eq!(raw.len(), 150);
    }

    #[test]
    fn test_as_of_snapshot_read() {
        let dir = TempDir::new().unwrap();
        let table = MorTable::create(dir.path().join("riders"), table_config()).unwrap();
        let first = table.upsert(vec![rec(&table, "k1", 1, 1)]).unwrap();
        table.upsert(vec![rec(&table, "k1", 2, 2)]).unwrap();

        let now = values(&table.read_partition("p1", ReadMode::Merged).unwrap());
        assert_eq!(now["k1"], 2);
        let then = values(
            &table
                .read_partition_as_of("p1", ReadMode::Merged, &first.instant_time)
                .unwrap(),
        );
        assert_eq!(then["k1"], 1);
    }

    #[tokio::test]
    async fn test_compaction_round_trip() {
        let dir = TempDir::new().unwrap();
        let table = MorTable::create(dir.path().join("riders"), table_config()).unwrap();

        let inserts: Vec<Record> = (1..=20).map(|i| rec(&table, &format!("k{}", i), i, 1)).collect();
        table.upsert(inserts).unwrap();
        let updates: Vec<Record> = (1..=10)
            .map(|i| rec(&table, &format!("k{}", i), 100 + i, 2))
            .collect();
        table.upsert(updates).unwrap();

        let before = values(&table.read_partition("p1", ReadMode::Merged).unwrap());

        let plan = table.schedule_compaction().unwrap().expect("plan expected");
        let result = table.run_compaction(&plan).await.unwrap();
        assert!(result.is_fully_successful());

        let after = values(&table.read_partition("p1", ReadMode::Merged).unwrap());
        assert_eq!(before, after);
        // after compaction the read-optimized view reflects the updates too
        let optimized = values(&table.read_partition("p1", ReadMode::ReadOptimized).unwrap());
        assert_eq!(optimized["k1"], 101);
    }

    #[test]
    fn test_reader_schema_projection_on_read() {
        let dir = TempDir::new().unwrap();
        let table = MorTable::create(dir.path().join("riders"), table_config()).unwrap();
        // rows missing the nullable fields still read back projected
        let record = table
            .record_from_row(RowData::new().with("id", "k1"))
            .unwrap();
        let mut record = record;
        record.key = RecordKey::new("k1", "p1");
        table.upsert(vec![record]).unwrap();
        let read = table.read_partition("p1", ReadMode::Merged).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(
            read[0].row.as_ref().unwrap().get("value"),
            Some(&FieldValue::Null)
        );
    }
}
