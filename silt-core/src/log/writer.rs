//! Log file writer

use super::block::{encode_metadata, meta_key, LogBlock, BLOCK_MAGIC, LOG_FORMAT_VERSION};
use super::log_file_name;
use crate::{InstantTime, Result};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Appends framed blocks to one log file of a file group slice.
///
/// Every `append_block` flushes and fsyncs before returning, so the caller
/// may mark the owning instant completed once the append has succeeded.
/// Rolls over to the next log version when the size cap is exceeded.
pub struct LogWriter {
    dir: PathBuf,
    file_id: String,
    base_instant: InstantTime,
    version: u32,
    file: File,
    size: u64,
    max_size: u64,
}

impl LogWriter {
    /// Open the latest log version of a file group slice for appending,
    /// starting at version 1 when the slice has no log files yet.
    pub fn open(
        dir: impl Into<PathBuf>,
        file_id: &str,
        base_instant: &str,
        max_size: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let version = Self::latest_version(&dir, file_id, base_instant)?.unwrap_or(1);
        let path = dir.join(log_file_name(file_id, base_instant, version));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            dir,
            file_id: file_id.to_string(),
            base_instant: base_instant.to_string(),
            version,
            file,
            size,
            max_size,
        })
    }

    /// Append one block and fsync. Returns the offset the frame starts at.
    pub fn append_block(&mut self, block: &LogBlock) -> Result<u64> {
        if self.size > 0 && self.size >= self.max_size {
            self.rollover()?;
        }

        let content = block.content_bytes()?;
        let header = encode_metadata(block.header());
        let mut footer_map = block.footer().clone();
        footer_map.insert(meta_key::CHECKSUM, crc32fast::hash(&content).to_string());
        let footer = encode_metadata(&footer_map);

        let mut buf = BytesMut::new();
        buf.put_slice(BLOCK_MAGIC);
        buf.put_i32(LOG_FORMAT_VERSION);
        buf.put_i32(block.block_type() as i32);
        buf.put_i32(header.len() as i32);
        buf.put_slice(&header);
        buf.put_i64(content.len() as i64);
        buf.put_slice(&content);
        buf.put_i32(footer.len() as i32);
        buf.put_slice(&footer);
        // total frame size, including this field, enables reverse traversal
        let total = buf.len() as i64 + 8;
        buf.put_i64(total);

        let offset = self.size;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.size += buf.len() as u64;
        Ok(offset)
    }

    /// Size of the current log file in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current log version
    pub fn current_version(&self) -> u32 {
        self.version
    }

    /// Path of the current log file
    pub fn current_path(&self) -> PathBuf {
        self.dir
            .join(log_file_name(&self.file_id, &self.base_instant, self.version))
    }

    fn rollover(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.version += 1;
        let path = self
            .dir
            .join(log_file_name(&self.file_id, &self.base_instant, self.version));
        debug!("rolling log over to {:?}", path);
        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.size = 0;
        Ok(())
    }

    fn latest_version(dir: &Path, file_id: &str, base_instant: &str) -> Result<Option<u32>> {
        let mut latest = None;
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) {
                    if let Some((id, instant, version)) = super::parse_log_file_name(name) {
                        if id == file_id && instant == base_instant {
                            latest = latest.max(Some(version));
                        }
                    }
                }
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RowDataBlock;
    use crate::{DataType, OrderingVal, Record, RecordKey, RowData, Schema};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new("t").with_field("id", DataType::String, false)
    }

    fn block(key: &str, instant: &str) -> LogBlock {
        let record = Record::insert(
            RecordKey::new(key, "p1"),
            OrderingVal::Int(1),
            RowData::new().with("id", key),
        );
        LogBlock::RowData(RowDataBlock::new(vec![record], &schema(), instant).unwrap())
    }

    #[test]
    fn test_append_returns_offsets() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogWriter::open(dir.path(), "fg1", "20260101000000", 1 << 20).unwrap();
        let first = writer.append_block(&block("k1", "20260101000001")).unwrap();
        let second = writer.append_block(&block("k2", "20260101000002")).unwrap();
        assert_eq!(first, 0);
        assert!(second > 0);
        assert_eq!(writer.size(), writer.current_path().metadata().unwrap().len());
    }

    #[test]
    fn test_rollover_bumps_version() {
        let dir = TempDir::new().unwrap();
        // tiny cap so the second append rolls over
        let mut writer = LogWriter::open(dir.path(), "fg1", "20260101000000", 1).unwrap();
        writer.append_block(&block("k1", "20260101000001")).unwrap();
        assert_eq!(writer.current_version(), 1);
        writer.append_block(&block("k2", "20260101000002")).unwrap();
        assert_eq!(writer.current_version(), 2);
        assert!(dir.path().join("fg1_20260101000000.log.2").exists());
    }

    #[test]
    fn test_reopen_appends_to_latest_version() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = LogWriter::open(dir.path(), "fg1", "20260101000000", 1).unwrap();
            writer.append_block(&block("k1", "20260101000001")).unwrap();
            writer.append_block(&block("k2", "20260101000002")).unwrap();
        }
        let writer = LogWriter::open(dir.path(), "fg1", "20260101000000", 1 << 20).unwrap();
        assert_eq!(writer.current_version(), 2);
        assert!(writer.size() > 0);
    }
}
