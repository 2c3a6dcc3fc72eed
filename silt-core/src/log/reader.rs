//! Log file reader
//!
//! Two traversal modes: eager (`read_all`) materializes every block, lazy
//! (`blocks`) yields frame descriptors whose content is only fetched on
//! `decode`. An unreadable trailing block is not fatal: iteration stops and
//! the effective end offset of the readable prefix is reported, which is what
//! lets a writer append safely after a predecessor crashed mid-block.

use super::block::{
    decode_metadata, BlockType, LogBlock, MetadataMap, BLOCK_MAGIC, LOG_FORMAT_VERSION,
};
use crate::{Result, Schema, SiltError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::warn;

/// magic + version + type + header length
const FRAME_PREFIX_LEN: u64 = 6 + 4 + 4 + 4;

/// Result of an eager scan: the readable blocks and the offset where the
/// readable prefix of the file ends.
pub struct LogScan {
    pub blocks: Vec<LogBlock>,
    pub valid_len: u64,
}

/// Reader over one log file
pub struct LogReader {
    path: PathBuf,
}

impl LogReader {
    /// Open a log file for reading
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(SiltError::InvalidFormat(format!(
                "log file does not exist: {:?}",
                path
            )));
        }
        Ok(Self { path })
    }

    /// Eagerly read every decodable block. Corruption (torn frame, checksum
    /// mismatch) ends the scan instead of failing it.
    pub fn read_all(&self, reader_schema: Option<&Schema>) -> Result<LogScan> {
        let mut blocks = Vec::new();
        let mut valid_len = 0;
        for lazy in self.blocks()? {
            let lazy = lazy?;
            match lazy.decode(reader_schema) {
                Ok(block) => {
                    valid_len = lazy.end_offset();
                    blocks.push(block);
                }
                Err(e) if e.is_corruption() || matches!(e, SiltError::InvalidFormat(_)) => {
                    warn!(
                        "unreadable block at offset {} in {:?}, truncating scan: {}",
                        lazy.start_offset(),
                        self.path,
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(LogScan { blocks, valid_len })
    }

    /// Lazy traversal over block frames
    pub fn blocks(&self) -> Result<LogBlockIter> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        Ok(LogBlockIter {
            file,
            path: self.path.clone(),
            file_len,
            offset: 0,
            done: false,
        })
    }

    /// Length of the readable prefix of the file
    pub fn valid_prefix_len(&self) -> Result<u64> {
        let mut iter = self.blocks()?;
        while let Some(block) = iter.next() {
            block?;
        }
        Ok(iter.valid_len())
    }

    /// Locate the start offset of the last complete block by stepping back
    /// over the trailing total-block-size field. Returns `None` when the tail
    /// is torn; callers then fall back to a forward scan.
    pub fn last_block_start(&self) -> Result<Option<u64>> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if file_len < FRAME_PREFIX_LEN + 8 {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-8))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        let total = i64::from_be_bytes(buf);
        if total < (FRAME_PREFIX_LEN + 8) as i64 || total > file_len as i64 {
            return Ok(None);
        }
        let start = file_len - total as u64;
        file.seek(SeekFrom::Start(start))?;
        let mut magic = [0u8; 6];
        file.read_exact(&mut magic)?;
        if &magic != BLOCK_MAGIC {
            return Ok(None);
        }
        Ok(Some(start))
    }
}

/// A block frame whose content has not been read yet
#[derive(Debug, Clone)]
pub struct LazyBlock {
    path: PathBuf,
    block_type: BlockType,
    header: MetadataMap,
    footer: MetadataMap,
    content_offset: u64,
    content_len: u64,
    start: u64,
    end: u64,
}

impl LazyBlock {
    /// Block type tag read from the frame
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    /// Header metadata read from the frame
    pub fn header(&self) -> &MetadataMap {
        &self.header
    }

    /// Instant that produced this block
    pub fn instant_time(&self) -> Option<&str> {
        self.header
            .get(&super::block::meta_key::INSTANT_TIME)
            .map(|s| s.as_str())
    }

    /// Offset the frame starts at
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Offset just past the frame
    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Fetch the content from disk and decode the full block. The content
    /// buffer is released once the block is built.
    pub fn decode(&self, reader_schema: Option<&Schema>) -> Result<LogBlock> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.content_offset))?;
        let mut content = vec![0u8; self.content_len as usize];
        file.read_exact(&mut content)?;
        LogBlock::decode(
            self.block_type,
            self.header.clone(),
            self.footer.clone(),
            &content,
            reader_schema,
        )
    }
}

/// Iterator over the frames of a log file. Stops at the first unreadable
/// frame; `valid_len` then reports where the readable prefix ends.
pub struct LogBlockIter {
    file: File,
    path: PathBuf,
    file_len: u64,
    offset: u64,
    done: bool,
}

impl LogBlockIter {
    /// Offset where the readable prefix ends so far
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    fn read_frame(&mut self) -> Result<Option<LazyBlock>> {
        let start = self.offset;
        if start >= self.file_len {
            return Ok(None);
        }
        let remaining = self.file_len - start;
        if remaining < FRAME_PREFIX_LEN {
            return Ok(self.corrupt(start, "torn frame prefix"));
        }

        self.file.seek(SeekFrom::Start(start))?;
        let mut prefix = [0u8; FRAME_PREFIX_LEN as usize];
        self.file.read_exact(&mut prefix)?;
        if &prefix[..6] != BLOCK_MAGIC {
            return Ok(self.corrupt(start, "bad block magic"));
        }
        let version = i32::from_be_bytes([prefix[6], prefix[7], prefix[8], prefix[9]]);
        if version != LOG_FORMAT_VERSION {
            return Ok(self.corrupt(start, "unsupported block version"));
        }
        let type_code = i32::from_be_bytes([prefix[10], prefix[11], prefix[12], prefix[13]]);
        let block_type = match BlockType::try_from(type_code) {
            Ok(t) => t,
            Err(_) => return Ok(self.corrupt(start, "unknown block type")),
        };
        let header_len = i32::from_be_bytes([prefix[14], prefix[15], prefix[16], prefix[17]]);
        if header_len < 0 || start + FRAME_PREFIX_LEN + header_len as u64 + 8 > self.file_len {
            return Ok(self.corrupt(start, "header overruns file"));
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        self.file.read_exact(&mut header_bytes)?;
        let header = match decode_metadata(&header_bytes) {
            Ok(h) => h,
            Err(_) => return Ok(self.corrupt(start, "undecodable header")),
        };

        let mut len_buf = [0u8; 8];
        self.file.read_exact(&mut len_buf)?;
        let content_len = i64::from_be_bytes(len_buf);
        let content_offset = start + FRAME_PREFIX_LEN + header_len as u64 + 8;
        if content_len < 0 || content_offset + content_len as u64 + 4 > self.file_len {
            return Ok(self.corrupt(start, "content overruns file"));
        }
        self.file
            .seek(SeekFrom::Start(content_offset + content_len as u64))?;

        let mut footer_len_buf = [0u8; 4];
        self.file.read_exact(&mut footer_len_buf)?;
        let footer_len = i32::from_be_bytes(footer_len_buf);
        let footer_offset = content_offset + content_len as u64 + 4;
        if footer_len < 0 || footer_offset + footer_len as u64 + 8 > self.file_len {
            return Ok(self.corrupt(start, "footer overruns file"));
        }
        let mut footer_bytes = vec![0u8; footer_len as usize];
        self.file.read_exact(&mut footer_bytes)?;
        let footer = match decode_metadata(&footer_bytes) {
            Ok(f) => f,
            Err(_) => return Ok(self.corrupt(start, "undecodable footer")),
        };

        let mut total_buf = [0u8; 8];
        self.file.read_exact(&mut total_buf)?;
        let total = i64::from_be_bytes(total_buf);
        let end = footer_offset + footer_len as u64 + 8;
        if total as u64 != end - start {
            return Ok(self.corrupt(start, "inconsistent total block size"));
        }

        self.offset = end;
        Ok(Some(LazyBlock {
            path: self.path.clone(),
            block_type,
            header,
            footer,
            content_offset,
            content_len: content_len as u64,
            start,
            end,
        }))
    }

    fn corrupt(&mut self, offset: u64, reason: &str) -> Option<LazyBlock> {
        warn!(
            "treating {:?} as ended at offset {}: {}",
            self.path, offset, reason
        );
        self.done = true;
        None
    }
}

impl Iterator for LogBlockIter {
    type Item = Result<LazyBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{DeleteBlock, LogWriter, RowDataBlock};
    use crate::{DataType, OrderingVal, Record, RecordKey, RowData};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new("t")
            .with_field("id", DataType::String, false)
            .with_field("value", DataType::Integer, true)
    }

    fn data_block(keys: &[&str], instant: &str) -> LogBlock {
        let records = keys
            .iter()
            .map(|k| {
                Record::insert(
                    RecordKey::new(*k, "p1"),
                    OrderingVal::Int(1),
                    RowData::new().with("id", *k).with("value", 1i64),
                )
            })
            .collect();
        LogBlock::RowData(RowDataBlock::new(records, &schema(), instant).unwrap())
    }

    fn write_blocks(dir: &Path) -> PathBuf {
        let mut writer = LogWriter::open(dir, "fg1", "20260101000000", 1 << 20).unwrap();
        writer
            .append_block(&data_block(&["k1", "k2"], "20260101000001"))
            .unwrap();
        writer
            .append_block(&LogBlock::Delete(DeleteBlock::new(
                vec![(RecordKey::new("k1", "p1"), OrderingVal::Int(2))],
                "20260101000002",
            )))
            .unwrap();
        writer
            .append_block(&data_block(&["k3"], "20260101000003"))
            .unwrap();
        writer.current_path()
    }

    #[test]
    fn test_eager_round_trip_in_write_order() {
        let dir = TempDir::new().unwrap();
        let path = write_blocks(dir.path());
        let scan = LogReader::open(&path).unwrap().read_all(None).unwrap();
        assert_eq!(scan.blocks.len(), 3);
        assert_eq!(scan.valid_len, path.metadata().unwrap().len());
        assert_eq!(scan.blocks[0].instant_time(), Some("20260101000001"));
        assert_eq!(scan.blocks[1].instant_time(), Some("20260101000002"));
        assert_eq!(scan.blocks[2].instant_time(), Some("20260101000003"));
        match &scan.blocks[1] {
            LogBlock::Delete(b) => assert_eq!(b.keys.len(), 1),
            other => panic!("expected delete block, got {:?}", other.block_type()),
        }
    }

    #[test]
    fn test_lazy_matches_eager() {
        let dir = TempDir::new().unwrap();
        let path = write_blocks(dir.path());
        let reader = LogReader::open(&path).unwrap();
        let eager = reader.read_all(None).unwrap();
        let lazy: Vec<LogBlock> = reader
            .blocks()
            .unwrap()
            .map(|b| b.unwrap().decode(None).unwrap())
            .collect();
        assert_eq!(lazy.len(), eager.blocks.len());
        for (l, e) in lazy.iter().zip(eager.blocks.iter()) {
            assert_eq!(l.header(), e.header());
            assert_eq!(
                l.content_bytes().unwrap(),
                e.content_bytes().unwrap()
            );
        }
    }

    #[test]
    fn test_torn_tail_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_blocks(dir.path());
        let full_len = path.metadata().unwrap().len();
        // tear the last frame
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 7).unwrap();

        let reader = LogReader::open(&path).unwrap();
        let scan = reader.read_all(None).unwrap();
        assert_eq!(scan.blocks.len(), 2);
        assert!(scan.valid_len < full_len - 7);
        assert_eq!(scan.valid_len, reader.valid_prefix_len().unwrap());
        // reverse traversal cannot trust the torn tail
        assert_eq!(reader.last_block_start().unwrap(), None);
    }

    #[test]
    fn test_last_block_start() {
        let dir = TempDir::new().unwrap();
        let path = write_blocks(dir.path());
        let reader = LogReader::open(&path).unwrap();
        let scan = reader.read_all(None).unwrap();
        let start = reader.last_block_start().unwrap().unwrap();
        // the last block starts where the first two end
        let mut iter = reader.blocks().unwrap();
        iter.next().unwrap().unwrap();
        let second = iter.next().unwrap().unwrap();
        assert_eq!(start, second.end_offset());
        assert_eq!(scan.valid_len, path.metadata().unwrap().len());
    }

    #[test]
    fn test_append_after_truncated_predecessor() {
        let dir = TempDir::new().unwrap();
        let path = write_blocks(dir.path());
        let reader = LogReader::open(&path).unwrap();
        let full_len = path.metadata().unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();

        // recover the readable prefix and truncate to it, as rollback does
        let valid = reader.valid_prefix_len().unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(valid).unwrap();
        drop(file);

        let mut writer = LogWriter::open(dir.path(), "fg1", "20260101000000", 1 << 20).unwrap();
        writer
            .append_block(&data_block(&["k9"], "20260101000009"))
            .unwrap();
        let scan = LogReader::open(&path).unwrap().read_all(None).unwrap();
        assert_eq!(scan.blocks.len(), 3);
        assert_eq!(scan.blocks[2].instant_time(), Some("20260101000009"));
    }

    #[test]
    fn test_garbage_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fg1_20260101000000.log.1");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"not a log file at all").unwrap();
        let scan = LogReader::open(&path).unwrap().read_all(None).unwrap();
        assert!(scan.blocks.is_empty());
        assert_eq!(scan.valid_len, 0);
    }
}
