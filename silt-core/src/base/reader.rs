//! Base file reader

use super::{BaseFileMeta, BASE_FORMAT_VERSION, BASE_MAGIC};
use crate::index::BloomFilter;
use crate::{Record, Result, Schema, SiltError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Reader over one base file. Opening loads the footer sections (schema,
/// bloom filter, metadata, chunk index) without touching record data; records
/// stream chunk by chunk on demand.
pub struct BaseFileReader {
    path: PathBuf,
    meta: BaseFileMeta,
    schema: Schema,
    bloom: BloomFilter,
    chunks: Vec<ChunkEntry>,
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    offset: u64,
    first_key: String,
}

impl BaseFileReader {
    /// Open a base file, validating magic and version
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < 8 + 36 {
            return Err(SiltError::InvalidFormat("base file too short".into()));
        }

        let mut head = [0u8; 8];
        file.read_exact(&mut head)?;
        if &head[..4] != BASE_MAGIC {
            return Err(SiltError::InvalidFormat("invalid base file magic".into()));
        }
        let version = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        if version != BASE_FORMAT_VERSION {
            return Err(SiltError::InvalidFormat(format!(
                "unsupported base file version: {}",
                version
            )));
        }

        file.seek(SeekFrom::End(-36))?;
        let mut footer = [0u8; 36];
        file.read_exact(&mut footer)?;
        if &footer[32..] != BASE_MAGIC {
            return Err(SiltError::InvalidFormat("invalid base file footer".into()));
        }
        let chunk_index_offset = u64::from_be_bytes(footer[0..8].try_into().unwrap());
        let schema_offset = u64::from_be_bytes(footer[8..16].try_into().unwrap());
        let bloom_offset = u64::from_be_bytes(footer[16..24].try_into().unwrap());
        let meta_offset = u64::from_be_bytes(footer[24..32].try_into().unwrap());

        let schema_bytes = read_section(&mut file, schema_offset)?;
        let schema = Schema::from_json(
            std::str::from_utf8(&schema_bytes).map_err(|e| SiltError::Corruption(e.to_string()))?,
        )?;

        let bloom_bytes = read_section(&mut file, bloom_offset)?;
        let bloom = BloomFilter::from_bytes(&bloom_bytes)?;

        let meta_bytes = read_section(&mut file, meta_offset)?;
        let mut meta: BaseFileMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| SiltError::Corruption(e.to_string()))?;
        meta.path = path.clone();

        file.seek(SeekFrom::Start(chunk_index_offset))?;
        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        let mut chunks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut entry_buf = [0u8; 12];
            file.read_exact(&mut entry_buf)?;
            let offset = u64::from_be_bytes(entry_buf[0..8].try_into().unwrap());
            let key_len = u32::from_be_bytes(entry_buf[8..12].try_into().unwrap());
            let mut key_bytes = vec![0u8; key_len as usize];
            file.read_exact(&mut key_bytes)?;
            let first_key =
                String::from_utf8(key_bytes).map_err(|e| SiltError::Corruption(e.to_string()))?;
            chunks.push(ChunkEntry { offset, first_key });
        }

        Ok(Self {
            path,
            meta,
            schema,
            bloom,
            chunks,
        })
    }

    /// Base file metadata
    pub fn meta(&self) -> &BaseFileMeta {
        &self.meta
    }

    /// Schema the file was written with
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Probabilistic membership check against the stored bloom filter; a
    /// positive answer still needs `contains_key` before it can be trusted.
    pub fn may_contain(&self, key: &str) -> bool {
        self.bloom.may_contain(&key)
    }

    /// Confirming read for a bloom-positive key: key-range check, then an
    /// actual scan of the owning chunk.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        if !self.may_contain(key) {
            return Ok(false);
        }
        if !self.meta.key_in_range(key) {
            return Ok(false);
        }
        // chunks are globally sorted; the candidate is the last chunk whose
        // first key is <= the probe
        let idx = self
            .chunks
            .partition_point(|c| c.first_key.as_str() <= key);
        if idx == 0 {
            return Ok(false);
        }
        let records = self.load_chunk(&self.chunks[idx - 1])?;
        Ok(records.binary_search_by(|r| r.key.key.as_str().cmp(key)).is_ok())
    }

    /// Stream all records in key order
    pub fn records(&self) -> Result<RecordIter> {
        Ok(RecordIter {
            file: File::open(&self.path)?,
            chunks: self.chunks.clone(),
            next_chunk: 0,
            current: Vec::new().into_iter(),
        })
    }

    fn load_chunk(&self, chunk: &ChunkEntry) -> Result<Vec<Record>> {
        let mut file = File::open(&self.path)?;
        read_chunk(&mut file, chunk.offset)
    }
}

fn read_section(file: &mut File, offset: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

fn read_chunk(file: &mut File, offset: u64) -> Result<Vec<Record>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)?;
    let comp_len = u32::from_be_bytes(prefix[0..4].try_into().unwrap());
    let expected_crc = u32::from_be_bytes(prefix[4..8].try_into().unwrap());
    let mut compressed = vec![0u8; comp_len as usize];
    file.read_exact(&mut compressed)?;
    let actual_crc = crc32fast::hash(&compressed);
    if actual_crc != expected_crc {
        return Err(SiltError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }
    let raw = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| SiltError::Corruption(e.to_string()))?;
    bincode::deserialize(&raw).map_err(|e| SiltError::Corruption(e.to_string()))
}

/// Streams records chunk by chunk, bounding memory to one chunk at a time
pub struct RecordIter {
    file: File,
    chunks: Vec<ChunkEntry>,
    next_chunk: usize,
    current: std::vec::IntoIter<Record>,
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            if self.next_chunk >= self.chunks.len() {
                return None;
            }
            let offset = self.chunks[self.next_chunk].offset;
            self.next_chunk += 1;
            match read_chunk(&mut self.file, offset) {
                Ok(records) => self.current = records.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
