//! Base file writer

use super::{BaseFileConfig, BaseFileMeta, BASE_FORMAT_VERSION, BASE_MAGIC};
use crate::index::BloomFilter;
use crate::{InstantTime, Record, Result, Schema, SiltError};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Writes one base file: buffered records are sorted by key at finish,
/// chunked, compressed, and laid out with schema, bloom and meta sections.
pub struct BaseFileWriter {
    config: BaseFileConfig,
    path: PathBuf,
    file_id: String,
    instant_time: InstantTime,
    schema: Schema,
    records: Vec<Record>,
}

impl BaseFileWriter {
    /// Create a writer for a new base file
    pub fn create(
        path: impl Into<PathBuf>,
        file_id: &str,
        instant_time: &str,
        schema: &Schema,
        config: BaseFileConfig,
    ) -> Self {
        Self {
            config,
            path: path.into(),
            file_id: file_id.to_string(),
            instant_time: instant_time.to_string(),
            schema: schema.normalize(),
            records: Vec::new(),
        }
    }

    /// Buffer a record, projecting its row into the file schema. Tombstones
    /// never belong in a base file.
    pub fn add(&mut self, mut record: Record) -> Result<()> {
        let Some(row) = &record.row else {
            return Err(SiltError::InvalidFormat(format!(
                "tombstone for key '{}' cannot be written to a base file",
                record.key
            )));
        };
        record.row = Some(self.schema.project(row)?);
        record.commit_time = Some(self.instant_time.clone());
        self.records.push(record);
        Ok(())
    }

    /// Buffered record count
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if nothing was buffered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sort, chunk, compress and write everything to disk
    pub fn finish(mut self) -> Result<BaseFileMeta> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.records.sort_by(|a, b| a.key.key.cmp(&b.key.key));

        let mut bloom = BloomFilter::with_fpp(self.records.len(), self.config.bloom_fpp);
        for record in &self.records {
            bloom.add(&record.key.key);
        }

        let meta = BaseFileMeta {
            path: self.path.clone(),
            file_id: self.file_id.clone(),
            instant_time: self.instant_time.clone(),
            record_count: self.records.len() as u64,
            min_key: self.records.first().map(|r| r.key.key.clone()),
            max_key: self.records.last().map(|r| r.key.key.clone()),
        };

        let mut file = BufWriter::new(File::create(&self.path)?);
        let mut offset = 0u64;

        // header
        let mut head = BytesMut::new();
        head.put_slice(BASE_MAGIC);
        head.put_u32(BASE_FORMAT_VERSION);
        file.write_all(&head)?;
        offset += head.len() as u64;

        // record chunks
        let mut chunk_index: Vec<(u64, String)> = Vec::new();
        for chunk in self.records.chunks(self.config.chunk_records.max(1)) {
            let first_key = chunk[0].key.key.clone();
            let raw = bincode::serialize(&chunk.to_vec())
                .map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
            let compressed = lz4_flex::compress_prepend_size(&raw);

            let mut buf = BytesMut::new();
            buf.put_u32(compressed.len() as u32);
            buf.put_u32(crc32fast::hash(&compressed));
            buf.put_slice(&compressed);
            file.write_all(&buf)?;

            chunk_index.push((offset, first_key));
            offset += buf.len() as u64;
        }

        // schema section
        let schema_offset = offset;
        let schema_json = self.schema.to_json()?;
        offset += write_section(&mut file, schema_json.as_bytes())?;

        // bloom section
        let bloom_offset = offset;
        offset += write_section(&mut file, &bloom.to_bytes())?;

        // meta section
        let meta_offset = offset;
        let meta_json =
            serde_json::to_vec(&meta).map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
        offset += write_section(&mut file, &meta_json)?;

        // chunk index
        let chunk_index_offset = offset;
        let mut buf = BytesMut::new();
        buf.put_u32(chunk_index.len() as u32);
        for (chunk_offset, first_key) in &chunk_index {
            buf.put_u64(*chunk_offset);
            buf.put_u32(first_key.len() as u32);
            buf.put_slice(first_key.as_bytes());
        }
        file.write_all(&buf)?;

        // fixed footer
        let mut footer = BytesMut::with_capacity(36);
        footer.put_u64(chunk_index_offset);
        footer.put_u64(schema_offset);
        footer.put_u64(bloom_offset);
        footer.put_u64(meta_offset);
        footer.put_slice(BASE_MAGIC);
        file.write_all(&footer)?;

        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(meta)
    }
}

fn write_section(file: &mut BufWriter<File>, data: &[u8]) -> Result<u64> {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    file.write_all(&buf)?;
    Ok(buf.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataType, OrderingVal, RecordKey, RowData};
    use tempfile::TempDir;

    #[test]
    fn test_writer_rejects_tombstones() {
        let dir = TempDir::new().unwrap();
        let schema = Schema::new("t").with_field("id", DataType::String, false);
        let mut writer = BaseFileWriter::create(
            dir.path().join("fg1_20260101000000.base"),
            "fg1",
            "20260101000000",
            &schema,
            BaseFileConfig::default(),
        );
        let err = writer
            .add(Record::delete(RecordKey::new("k1", "p"), OrderingVal::Int(1)))
            .unwrap_err();
        assert!(matches!(err, SiltError::InvalidFormat(_)));
    }

    #[test]
    fn test_meta_reflects_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let schema = Schema::new("t").with_field("id", DataType::String, false);
        let mut writer = BaseFileWriter::create(
            dir.path().join("fg1_20260101000000.base"),
            "fg1",
            "20260101000000",
            &schema,
            BaseFileConfig::default(),
        );
        for key in ["kc", "ka", "kb"] {
            writer
                .add(Record::insert(
                    RecordKey::new(key, "p"),
                    OrderingVal::Int(1),
                    RowData::new().with("id", key),
                ))
                .unwrap();
        }
        let meta = writer.finish().unwrap();
        assert_eq!(meta.record_count, 3);
        assert_eq!(meta.min_key.as_deref(), Some("ka"));
        assert_eq!(meta.max_key.as_deref(), Some("kc"));
    }
}
