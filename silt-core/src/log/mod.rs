//! Delta log files
//!
//! Updates and deletes against a file group are appended to log files as
//! framed, versioned blocks. The writer fsyncs every block before returning,
//! so the write path can safely mark an instant completed afterwards; the
//! reader treats an unreadable trailing block as the end of the log, which is
//! what allows appending after a writer crashed mid-block.

mod block;
mod reader;
mod writer;

pub use block::{
    decode_metadata, encode_metadata, meta_key, BlockType, ColumnarDataBlock, CommandBlock,
    CommandKind, DeleteBlock, LogBlock, MetadataMap, RowDataBlock, BLOCK_MAGIC,
    LOG_FORMAT_VERSION,
};
pub use reader::{LazyBlock, LogBlockIter, LogReader, LogScan};
pub use writer::LogWriter;

use crate::InstantTime;

/// File name for a log file of the given file group slice and version
pub fn log_file_name(file_id: &str, base_instant: &str, version: u32) -> String {
    format!("{}_{}.log.{}", file_id, base_instant, version)
}

/// Parse `(file_id, base_instant, version)` out of a log file name
pub fn parse_log_file_name(name: &str) -> Option<(String, InstantTime, u32)> {
    let (prefix, version) = name.split_once(".log.")?;
    let version = version.parse().ok()?;
    let (file_id, base_instant) = prefix.rsplit_once('_')?;
    if file_id.is_empty() || !base_instant.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((file_id.to_string(), base_instant.to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_round_trip() {
        let name = log_file_name("abc123", "20260101000000", 3);
        assert_eq!(name, "abc123_20260101000000.log.3");
        let (file_id, instant, version) = parse_log_file_name(&name).unwrap();
        assert_eq!(file_id, "abc123");
        assert_eq!(instant, "20260101000000");
        assert_eq!(version, 3);
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse_log_file_name("abc123_20260101000000.base").is_none());
        assert!(parse_log_file_name("config.json").is_none());
        assert!(parse_log_file_name("abc_xyz.log.1").is_none());
    }
}
