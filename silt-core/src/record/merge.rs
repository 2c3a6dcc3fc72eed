//! Record merge engine
//!
//! Merges a base file with the ordered log blocks of the same file group
//! into the logically live record set. Log blocks are replayed in
//! non-decreasing instant order into an overlay map; the base file is then
//! streamed once, with overlay hits combined (base row as the older side)
//! and consumed, and surviving overlay entries emitted as pure inserts. The
//! result for a fixed (base, log chain, reader schema) is deterministic.

use super::RecordMerger;
use crate::base::BaseFileReader;
use crate::log::{meta_key, LogBlock};
use crate::{Record, Result, Schema};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a scan treats the log chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Merge base and logs (the normal read)
    Merged,
    /// Base records then raw log records, unmerged, duplicates visible
    SkipMerge,
    /// Base file only, logs ignored
    ReadOptimized,
}

/// Merge engine over one file group
pub struct MergeEngine {
    merger: Arc<dyn RecordMerger>,
    reader_schema: Schema,
}

impl MergeEngine {
    /// Create an engine for a reader schema
    pub fn new(merger: Arc<dyn RecordMerger>, reader_schema: &Schema) -> Self {
        Self {
            merger,
            reader_schema: reader_schema.normalize(),
        }
    }

    /// Scan one file group: an optional base file plus its log blocks in
    /// replay order. The output is a lazy record sequence.
    pub fn scan<I>(
        &self,
        base: Option<&BaseFileReader>,
        blocks: I,
        mode: ReadMode,
    ) -> Result<RecordScan>
    where
        I: IntoIterator<Item = Result<LogBlock>>,
    {
        let base_records = match base {
            Some(reader) => Some(reader.records()?),
            None => None,
        };

        let mut overlay = BTreeMap::new();
        let mut log_tail = Vec::new();
        match mode {
            ReadMode::Merged => {
                for block in blocks {
                    self.replay(&mut overlay, block?)?;
                }
            }
            ReadMode::SkipMerge => {
                for block in blocks {
                    collect_raw(&mut log_tail, block?);
                }
            }
            ReadMode::ReadOptimized => {}
        }

        Ok(RecordScan {
            merger: self.merger.clone(),
            schema: self.reader_schema.clone(),
            base: base_records,
            overlay,
            drain: None,
            log_tail: log_tail.into_iter(),
            mode,
        })
    }

    fn replay(&self, overlay: &mut BTreeMap<String, Record>, block: LogBlock) -> Result<()> {
        match block {
            LogBlock::RowData(b) => {
                for record in b.records {
                    self.apply(overlay, record)?;
                }
            }
            LogBlock::Columnar(b) => {
                for record in b.records {
                    self.apply(overlay, record)?;
                }
            }
            LogBlock::Delete(b) => {
                let instant = b.header.get(&meta_key::INSTANT_TIME).cloned();
                for (key, ordering) in b.keys {
                    let mut tombstone = Record::delete(key, ordering);
                    tombstone.commit_time = instant.clone();
                    self.apply(overlay, tombstone)?;
                }
            }
            // control blocks carry no records
            LogBlock::Command(_) => {}
        }
        Ok(())
    }

    fn apply(&self, overlay: &mut BTreeMap<String, Record>, incoming: Record) -> Result<()> {
        let merged = match overlay.remove(&incoming.key.key) {
            None => incoming,
            Some(existing) => {
                let row = self
                    .merger
                    .combine(&existing, &incoming, &self.reader_schema)?;
                Record {
                    key: existing.key,
                    ordering: incoming.ordering,
                    row,
                    commit_time: incoming.commit_time,
                }
            }
        };
        overlay.insert(merged.key.key.clone(), merged);
        Ok(())
    }
}

fn collect_raw(out: &mut Vec<Record>, block: LogBlock) {
    match block {
        LogBlock::RowData(b) => out.extend(b.records),
        LogBlock::Columnar(b) => out.extend(b.records),
        LogBlock::Delete(b) => {
            let instant = b.header.get(&meta_key::INSTANT_TIME).cloned();
            out.extend(b.keys.into_iter().map(|(key, ordering)| {
                let mut tombstone = Record::delete(key, ordering);
                tombstone.commit_time = instant.clone();
                tombstone
            }));
        }
        LogBlock::Command(_) => {}
    }
}

/// Lazy record sequence produced by a scan
pub struct RecordScan {
    merger: Arc<dyn RecordMerger>,
    schema: Schema,
    base: Option<crate::base::RecordIter>,
    overlay: BTreeMap<String, Record>,
    drain: Option<std::collections::btree_map::IntoIter<String, Record>>,
    log_tail: std::vec::IntoIter<Record>,
    mode: ReadMode,
}

impl Iterator for RecordScan {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        // stream the base file first
        while self.base.is_some() {
            let item = self.base.as_mut().unwrap().next();
            match item {
                None => self.base = None,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(record)) => {
                    if self.mode != ReadMode::Merged {
                        return Some(Ok(record));
                    }
                    let Some(over) = self.overlay.remove(&record.key.key) else {
                        return Some(Ok(record));
                    };
                    // the base row is the older side
                    let row = match self.merger.combine(&record, &over, &self.schema) {
                        Ok(row) => row,
                        Err(e) => return Some(Err(e)),
                    };
                    match row {
                        // merged away by a delete
                        None => continue,
                        Some(row) => {
                            return Some(Ok(Record {
                                key: record.key,
                                ordering: over.ordering,
                                row: Some(row),
                                commit_time: over.commit_time,
                            }))
                        }
                    }
                }
            }
        }

        match self.mode {
            ReadMode::SkipMerge => self.log_tail.next().map(Ok),
            ReadMode::ReadOptimized => None,
            ReadMode::Merged => {
                // emit surviving overlay entries as pure inserts
                let drain = self
                    .drain
                    .get_or_insert_with(|| std::mem::take(&mut self.overlay).into_iter());
                for (_, record) in drain.by_ref() {
                    if !record.is_delete() {
                        return Some(Ok(record));
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{BaseFileConfig, BaseFileWriter};
    use crate::log::{DeleteBlock, RowDataBlock};
    use crate::record::OverwriteWithLatestMerger;
    use crate::{DataType, FieldValue, OrderingVal, RecordKey, RowData, SiltError};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new("t")
            .with_field("id", DataType::String, false)
            .with_field("value", DataType::Integer, true)
    }

    fn rec(key: &str, value: i64, ordering: i64) -> Record {
        Record::insert(
            RecordKey::new(key, "p1"),
            OrderingVal::Int(ordering),
            RowData::new().with("id", key).with("value", value),
        )
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(Arc::new(OverwriteWithLatestMerger), &schema())
    }

    fn data_block(records: Vec<Record>, instant: &str) -> Result<LogBlock> {
        Ok(LogBlock::RowData(RowDataBlock::new(
            records,
            &schema(),
            instant,
        )?))
    }

    fn write_base(dir: &std::path::Path, count: usize) -> BaseFileReader {
        let mut writer = BaseFileWriter::create(
            dir.join("fg1_20260101000000.base"),
            "fg1",
            "20260101000000",
            &schema(),
            BaseFileConfig {
                chunk_records: 16,
                ..Default::default()
            },
        );
        for i in 1..=count {
            writer.add(rec(&format!("k{}", i), i as i64, 1)).unwrap();
        }
        let meta = writer.finish().unwrap();
        BaseFileReader::open(&meta.path).unwrap()
    }

    fn values_by_key(scan: RecordScan) -> HashMap<String, i64> {
        scan.map(|r| {
            let r = r.unwrap();
            let value = r.row.as_ref().unwrap().get("value").unwrap().as_i64().unwrap();
            (r.key.key, value)
        })
        .collect()
    }

    #[test]
    fn test_base_with_updated_half() {
        let dir = TempDir::new().unwrap();
        let base = write_base(dir.path(), 100);
        let updates: Vec<Record> = (1..=50).map(|i| rec(&format!("k{}", i), 1000 + i as i64, 2)).collect();
        let blocks = vec![data_block(updates, "20260101000001")];

        let scan = engine()
            .scan(Some(&base), blocks, ReadMode::Merged)
            .unwrap();
        let merged = values_by_key(scan);
        assert_eq!(merged.len(), 100);
        assert_eq!(merged["k1"], 1001);
        assert_eq!(merged["k50"], 1050);
        assert_eq!(merged["k51"], 51);
        assert_eq!(merged["k100"], 100);
    }

    #[test]
    fn test_log_only_file_group() {
        let blocks = vec![
            data_block(vec![rec("k1", 1, 1), rec("k2", 2, 1)], "20260101000001"),
            data_block(vec![rec("k1", 10, 2)], "20260101000002"),
        ];
        let scan = engine().scan(None, blocks, ReadMode::Merged).unwrap();
        let merged = values_by_key(scan);
        assert_eq!(merged.len(), 2);
        // one fully-merged entry per log-only key
        assert_eq!(merged["k1"], 10);
        assert_eq!(merged["k2"], 2);
    }

    #[test]
    fn test_delete_propagation_and_reinsert() {
        let dir = TempDir::new().unwrap();
        let base = write_base(dir.path(), 3);

        let delete = LogBlock::Delete(DeleteBlock::new(
            vec![(RecordKey::new("k2", "p1"), OrderingVal::Int(2))],
            "20260101000001",
        ));
        let scan = engine()
            .scan(Some(&base), vec![Ok(delete.clone())], ReadMode::Merged)
            .unwrap();
        let merged = values_by_key(scan);
        assert_eq!(merged.len(), 2);
        assert!(!merged.contains_key("k2"));

        // a later insert makes the key reappear
        let reinsert = data_block(vec![rec("k2", 99, 3)], "20260101000002");
        let scan = engine()
            .scan(Some(&base), vec![Ok(delete), reinsert], ReadMode::Merged)
            .unwrap();
        let merged = values_by_key(scan);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["k2"], 99);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let base = write_base(dir.path(), 10);
        let blocks = || {
            vec![
                data_block(vec![rec("k3", 33, 2), rec("k11", 11, 2)], "20260101000001"),
                Ok(LogBlock::Delete(DeleteBlock::new(
                    vec![(RecordKey::new("k7", "p1"), OrderingVal::Int(2))],
                    "20260101000002",
                ))),
            ]
        };
        let first: Vec<Record> = engine()
            .scan(Some(&base), blocks(), ReadMode::Merged)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let second: Vec<Record> = engine()
            .scan(Some(&base), blocks(), ReadMode::Merged)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10); // 10 - deleted k7 + inserted k11
    }

    #[test]
    fn test_skip_merge_exposes_duplicates() {
        let dir = TempDir::new().unwrap();
        let base = write_base(dir.path(), 5);
        let blocks = vec![data_block(vec![rec("k1", 100, 2)], "20260101000001")];
        let scan = engine()
            .scan(Some(&base), blocks, ReadMode::SkipMerge)
            .unwrap();
        let records: Vec<Record> = scan.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 6);
        let k1_count = records.iter().filter(|r| r.key.key == "k1").count();
        assert_eq!(k1_count, 2);
    }

    #[test]
    fn test_read_optimized_ignores_logs() {
        let dir = TempDir::new().unwrap();
        let base = write_base(dir.path(), 5);
        let blocks = vec![data_block(vec![rec("k1", 100, 2)], "20260101000001")];
        let scan = engine()
            .scan(Some(&base), blocks, ReadMode::ReadOptimized)
            .unwrap();
        let merged = values_by_key(scan);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged["k1"], 1);
    }

    #[test]
    fn test_block_error_propagates() {
        let blocks = vec![Err(SiltError::SchemaCompatibility("boom".into()))];
        let result = engine().scan(None, blocks, ReadMode::Merged);
        assert!(matches!(result, Err(SiltError::SchemaCompatibility(_))));
    }

    #[test]
    fn test_merged_output_projects_into_reader_schema() {
        let wider = schema().with_field("note", DataType::String, true);
        let engine = MergeEngine::new(Arc::new(OverwriteWithLatestMerger), &wider);
        let blocks = vec![data_block(vec![rec("k1", 1, 1)], "20260101000001")];
        let scan = engine.scan(None, blocks, ReadMode::Merged).unwrap();
        let records: Vec<Record> = scan.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        // records decoded through the block carry their original fields; the
        // reader-side projection happens when blocks are decoded with a
        // reader schema, exercised in the table tests
        assert_eq!(
            records[0].row.as_ref().unwrap().get("value"),
            Some(&FieldValue::Integer(1))
        );
    }
}
