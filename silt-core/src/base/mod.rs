//! Columnar base files
//!
//! A base file is the immutable snapshot of one file group at one instant,
//! produced by bulk insert or compaction. Records are stored sorted by key in
//! compressed chunks, with the schema, a bloom filter over all keys, and file
//! metadata in self-describing footer sections.

mod reader;
mod writer;

pub use reader::{BaseFileReader, RecordIter};
pub use writer::BaseFileWriter;

use crate::InstantTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Base file format version
pub const BASE_FORMAT_VERSION: u32 = 1;

/// Magic at the head and tail of every base file
pub const BASE_MAGIC: &[u8; 4] = b"SILT";

/// Base file metadata, stored in the file's meta section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseFileMeta {
    /// File path; filled in when the file is opened or written
    #[serde(skip)]
    pub path: PathBuf,
    /// Owning file group id
    pub file_id: String,
    /// Instant that produced this file
    pub instant_time: InstantTime,
    /// Number of records
    pub record_count: u64,
    /// Smallest record key
    pub min_key: Option<String>,
    /// Largest record key
    pub max_key: Option<String>,
}

impl BaseFileMeta {
    /// Check if `key` falls inside this file's key range
    pub fn key_in_range(&self, key: &str) -> bool {
        match (&self.min_key, &self.max_key) {
            (Some(min), Some(max)) => key >= min.as_str() && key <= max.as_str(),
            _ => false,
        }
    }
}

/// Base file writer configuration
#[derive(Debug, Clone)]
pub struct BaseFileConfig {
    /// Records per compressed chunk
    pub chunk_records: usize,
    /// Bloom filter target false-positive probability
    pub bloom_fpp: f64,
}

impl Default for BaseFileConfig {
    fn default() -> Self {
        Self {
            chunk_records: crate::config::BASE_CHUNK_RECORDS,
            bloom_fpp: crate::config::BLOOM_FPP,
        }
    }
}

/// File name for a base file written by an instant
pub fn base_file_name(file_id: &str, instant_time: &str) -> String {
    format!("{}_{}.base", file_id, instant_time)
}

/// Parse `(file_id, instant_time)` out of a base file name
pub fn parse_base_file_name(name: &str) -> Option<(String, InstantTime)> {
    let prefix = name.strip_suffix(".base")?;
    let (file_id, instant) = prefix.rsplit_once('_')?;
    if file_id.is_empty() || !instant.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((file_id.to_string(), instant.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_file_name_round_trip() {
        let name = base_file_name("fg42", "20260101000000");
        let (file_id, instant) = parse_base_file_name(&name).unwrap();
        assert_eq!(file_id, "fg42");
        assert_eq!(instant, "20260101000000");
    }

    #[test]
    fn test_parse_rejects_log_names() {
        assert!(parse_base_file_name("fg42_20260101000000.log.1").is_none());
    }
}
