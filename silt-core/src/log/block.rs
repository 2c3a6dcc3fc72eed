//! Log block types and codecs
//!
//! A block is the atomic unit appended to a log file: a type tag, header and
//! footer metadata maps, and a typed byte payload. Block variants form a
//! small closed set dispatched by the type tag read from the frame.

use crate::{OrderingVal, Record, RecordKey, Result, RowData, Schema, SiltError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Version written into every block frame
pub const LOG_FORMAT_VERSION: i32 = 1;

/// Sentinel preceding every block frame
pub const BLOCK_MAGIC: &[u8; 6] = b"#SILT#";

const ROW_CODEC_VERSION: u32 = 1;
const COLUMNAR_CODEC_VERSION: u32 = 1;

/// Well-known metadata keys. Header/footer maps are keyed by `u32` so that
/// readers tolerate (and preserve) keys they do not know about.
pub mod meta_key {
    /// Writer schema, JSON
    pub const SCHEMA: u32 = 1;
    /// Instant that produced the block
    pub const INSTANT_TIME: u32 = 2;
    /// Record count carried in a data or delete block
    pub const RECORD_COUNT: u32 = 3;
    /// Instant targeted by a command block
    pub const TARGET_INSTANT: u32 = 4;
    /// Command discriminant of a command block
    pub const COMMAND_KIND: u32 = 5;
    /// CRC32 of the block content, written by the log writer
    pub const CHECKSUM: u32 = 6;
}

/// Header/footer metadata map
pub type MetadataMap = BTreeMap<u32, String>;

/// Serialize a metadata map: `[u32 count]` then per entry
/// `[u32 key][u32 len][utf8 bytes]`, big-endian.
pub fn encode_metadata(map: &MetadataMap) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(map.len() as u32);
    for (key, value) in map {
        buf.put_u32(*key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

/// Parse a metadata map, preserving unknown keys
pub fn decode_metadata(data: &[u8]) -> Result<MetadataMap> {
    let mut buf = data;
    let count = take_u32(&mut buf)?;
    let mut map = MetadataMap::new();
    for _ in 0..count {
        let key = take_u32(&mut buf)?;
        let len = take_u32(&mut buf)? as usize;
        let bytes = take(&mut buf, len)?;
        let value = String::from_utf8(bytes.to_vec())
            .map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(SiltError::Corruption(format!(
            "expected {} bytes, {} remain",
            n,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Block type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BlockType {
    /// Row-oriented data block
    RowData = 1,
    /// Self-describing columnar data block
    Columnar = 2,
    /// Delete markers
    Delete = 3,
    /// Control block
    Command = 4,
}

impl TryFrom<i32> for BlockType {
    type Error = SiltError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(BlockType::RowData),
            2 => Ok(BlockType::Columnar),
            3 => Ok(BlockType::Delete),
            4 => Ok(BlockType::Command),
            _ => Err(SiltError::Corruption(format!(
                "invalid block type: {}",
                value
            ))),
        }
    }
}

/// Command block discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Marks blocks of a target instant as rolled back
    Rollback,
}

impl CommandKind {
    fn code(self) -> u32 {
        match self {
            CommandKind::Rollback => 1,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(CommandKind::Rollback),
            _ => Err(SiltError::InvalidFormat(format!(
                "unknown command kind: {}",
                code
            ))),
        }
    }
}

/// The atomic unit appended to a log file
#[derive(Debug, Clone)]
pub enum LogBlock {
    RowData(RowDataBlock),
    Columnar(ColumnarDataBlock),
    Delete(DeleteBlock),
    Command(CommandBlock),
}

impl LogBlock {
    /// Type tag of this block
    pub fn block_type(&self) -> BlockType {
        match self {
            LogBlock::RowData(_) => BlockType::RowData,
            LogBlock::Columnar(_) => BlockType::Columnar,
            LogBlock::Delete(_) => BlockType::Delete,
            LogBlock::Command(_) => BlockType::Command,
        }
    }

    /// Header metadata
    pub fn header(&self) -> &MetadataMap {
        match self {
            LogBlock::RowData(b) => &b.header,
            LogBlock::Columnar(b) => &b.header,
            LogBlock::Delete(b) => &b.header,
            LogBlock::Command(b) => &b.header,
        }
    }

    /// Footer metadata
    pub fn footer(&self) -> &MetadataMap {
        match self {
            LogBlock::RowData(b) => &b.footer,
            LogBlock::Columnar(b) => &b.footer,
            LogBlock::Delete(b) => &b.footer,
            LogBlock::Command(b) => &b.footer,
        }
    }

    /// Instant that produced this block, from the header
    pub fn instant_time(&self) -> Option<&str> {
        self.header().get(&meta_key::INSTANT_TIME).map(|s| s.as_str())
    }

    /// Serialize the block content
    pub fn content_bytes(&self) -> Result<Bytes> {
        match self {
            LogBlock::RowData(b) => b.encode_content(),
            LogBlock::Columnar(b) => b.encode_content(),
            LogBlock::Delete(b) => b.encode_content(),
            LogBlock::Command(_) => Ok(Bytes::new()),
        }
    }

    /// Decode a block from its framed parts. Verifies the content checksum
    /// when the footer carries one; projects data rows into `reader_schema`
    /// when one is supplied.
    pub fn decode(
        block_type: BlockType,
        header: MetadataMap,
        footer: MetadataMap,
        content: &[u8],
        reader_schema: Option<&Schema>,
    ) -> Result<LogBlock> {
        if let Some(stored) = footer.get(&meta_key::CHECKSUM) {
            let expected: u32 = stored
                .parse()
                .map_err(|_| SiltError::Corruption("unparseable block checksum".into()))?;
            let actual = crc32fast::hash(content);
            if expected != actual {
                return Err(SiltError::ChecksumMismatch { expected, actual });
            }
        }
        match block_type {
            BlockType::RowData => {
                RowDataBlock::decode(header, footer, content, reader_schema).map(LogBlock::RowData)
            }
            BlockType::Columnar => ColumnarDataBlock::decode(header, footer, content, reader_schema)
                .map(LogBlock::Columnar),
            BlockType::Delete => DeleteBlock::decode(header, footer, content).map(LogBlock::Delete),
            BlockType::Command => CommandBlock::decode(header, footer).map(LogBlock::Command),
        }
    }
}

fn data_block_header(schema: &Schema, instant_time: &str, record_count: usize) -> Result<MetadataMap> {
    let mut header = MetadataMap::new();
    header.insert(meta_key::SCHEMA, schema.to_json()?);
    header.insert(meta_key::INSTANT_TIME, instant_time.to_string());
    header.insert(meta_key::RECORD_COUNT, record_count.to_string());
    Ok(header)
}

fn stamp_commit_time(records: &mut [Record], header: &MetadataMap) {
    if let Some(instant) = header.get(&meta_key::INSTANT_TIME) {
        for record in records.iter_mut() {
            record.commit_time = Some(instant.clone());
        }
    }
}

fn project_rows(records: &mut Vec<Record>, reader_schema: Option<&Schema>) -> Result<()> {
    if let Some(schema) = reader_schema {
        for record in records.iter_mut() {
            if let Some(row) = &record.row {
                record.row = Some(schema.project(row)?);
            }
        }
    }
    Ok(())
}

/// Row-oriented data block: records framed individually with a length prefix
/// so a torn tail record can be skipped instead of failing the whole block.
#[derive(Debug, Clone)]
pub struct RowDataBlock {
    pub header: MetadataMap,
    pub footer: MetadataMap,
    pub records: Vec<Record>,
}

impl RowDataBlock {
    /// Create a block for the given records under one instant
    pub fn new(records: Vec<Record>, schema: &Schema, instant_time: &str) -> Result<Self> {
        Ok(Self {
            header: data_block_header(schema, instant_time, records.len())?,
            footer: MetadataMap::new(),
            records,
        })
    }

    fn encode_content(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32(ROW_CODEC_VERSION);
        buf.put_u32(self.records.len() as u32);
        for record in &self.records {
            let bytes =
                bincode::serialize(record).map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(&bytes);
        }
        Ok(buf.freeze())
    }

    fn decode(
        header: MetadataMap,
        footer: MetadataMap,
        content: &[u8],
        reader_schema: Option<&Schema>,
    ) -> Result<Self> {
        // data blocks must be self-describing
        if !header.contains_key(&meta_key::SCHEMA) {
            return Err(SiltError::Corruption("data block without schema header".into()));
        }
        let mut buf = content;
        let version = take_u32(&mut buf)?;
        if version != ROW_CODEC_VERSION {
            return Err(SiltError::Corruption(format!(
                "unsupported row codec version: {}",
                version
            )));
        }
        let count = take_u32(&mut buf)? as usize;
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            if buf.len() < 4 {
                warn!("row block truncated after {} of {} records", i, count);
                break;
            }
            let len = take_u32(&mut buf)? as usize;
            if len > buf.len() {
                warn!("row block record {} overruns content, skipping tail", i);
                break;
            }
            let bytes = take(&mut buf, len)?;
            match bincode::deserialize::<Record>(bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("undecodable record {} in row block, skipping tail: {}", i, e);
                    break;
                }
            }
        }
        project_rows(&mut records, reader_schema)?;
        stamp_commit_time(&mut records, &header);
        Ok(Self {
            header,
            footer,
            records,
        })
    }
}

/// Columnar data block: the content is a self-describing columnar image with
/// an embedded schema and per-column compressed value vectors.
#[derive(Debug, Clone)]
pub struct ColumnarDataBlock {
    pub header: MetadataMap,
    pub footer: MetadataMap,
    pub schema: Schema,
    pub partition: String,
    pub records: Vec<Record>,
}

impl ColumnarDataBlock {
    /// Build a columnar block from raw rows. When `key_field` is absent from
    /// the schema, records get synthetic sequential keys "0", "1", ... padded
    /// to the decimal digit count of the row count, preserving input order.
    pub fn from_rows(
        rows: Vec<RowData>,
        schema: &Schema,
        partition: &str,
        key_field: Option<&str>,
        ordering_field: Option<&str>,
        instant_time: &str,
    ) -> Result<Self> {
        let key_field = key_field.filter(|f| schema.field(f).is_some());
        let key_width = rows.len().to_string().len();
        let mut records = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            let key = match key_field {
                Some(field) => field_as_key(&row, field)?,
                None => format!("{:>width$}", i, width = key_width),
            };
            let ordering = match ordering_field.and_then(|f| row.get(f)) {
                Some(crate::FieldValue::Integer(v)) => OrderingVal::Int(*v),
                Some(crate::FieldValue::Float(v)) => OrderingVal::Float(*v),
                Some(crate::FieldValue::String(v)) => OrderingVal::Str(v.clone()),
                _ => OrderingVal::Int(0),
            };
            records.push(Record::insert(
                RecordKey::new(key, partition),
                ordering,
                schema.project(&row)?,
            ));
        }
        Ok(Self {
            header: data_block_header(schema, instant_time, records.len())?,
            footer: MetadataMap::new(),
            schema: schema.clone(),
            partition: partition.to_string(),
            records,
        })
    }

    fn encode_content(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32(COLUMNAR_CODEC_VERSION);
        let schema_json = self.schema.to_json()?;
        buf.put_u32(schema_json.len() as u32);
        buf.put_slice(schema_json.as_bytes());
        buf.put_u32(self.partition.len() as u32);
        buf.put_slice(self.partition.as_bytes());
        buf.put_u32(self.records.len() as u32);

        let keys: Vec<&str> = self.records.iter().map(|r| r.key.key.as_str()).collect();
        put_column(&mut buf, &keys)?;
        let orderings: Vec<&OrderingVal> = self.records.iter().map(|r| &r.ordering).collect();
        put_column(&mut buf, &orderings)?;
        for field in &self.schema.fields {
            let column: Vec<crate::FieldValue> = self
                .records
                .iter()
                .map(|r| {
                    r.row
                        .as_ref()
                        .and_then(|row| row.get(&field.name))
                        .cloned()
                        .unwrap_or(crate::FieldValue::Null)
                })
                .collect();
            put_column(&mut buf, &column)?;
        }
        Ok(buf.freeze())
    }

    fn decode(
        header: MetadataMap,
        footer: MetadataMap,
        content: &[u8],
        reader_schema: Option<&Schema>,
    ) -> Result<Self> {
        let mut buf = content;
        let version = take_u32(&mut buf)?;
        if version != COLUMNAR_CODEC_VERSION {
            return Err(SiltError::Corruption(format!(
                "unsupported columnar codec version: {}",
                version
            )));
        }
        let schema_len = take_u32(&mut buf)? as usize;
        let schema_json = std::str::from_utf8(take(&mut buf, schema_len)?)
            .map_err(|e| SiltError::Corruption(e.to_string()))?;
        let schema = Schema::from_json(schema_json)?;
        let partition_len = take_u32(&mut buf)? as usize;
        let partition = String::from_utf8(take(&mut buf, partition_len)?.to_vec())
            .map_err(|e| SiltError::Corruption(e.to_string()))?;
        let count = take_u32(&mut buf)? as usize;

        let keys: Vec<String> = get_column(&mut buf, count)?;
        let orderings: Vec<OrderingVal> = get_column(&mut buf, count)?;
        let mut columns: Vec<Vec<crate::FieldValue>> = Vec::with_capacity(schema.fields.len());
        for _ in &schema.fields {
            columns.push(get_column(&mut buf, count)?);
        }

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let mut row = RowData::new();
            for (f, field) in schema.fields.iter().enumerate() {
                row.insert(field.name.clone(), columns[f][i].clone());
            }
            records.push(Record::insert(
                RecordKey::new(keys[i].clone(), partition.clone()),
                orderings[i].clone(),
                row,
            ));
        }
        project_rows(&mut records, reader_schema)?;
        stamp_commit_time(&mut records, &header);
        Ok(Self {
            header,
            footer,
            schema,
            partition,
            records,
        })
    }
}

fn field_as_key(row: &RowData, field: &str) -> Result<String> {
    match row.get(field) {
        Some(crate::FieldValue::String(s)) => Ok(s.clone()),
        Some(crate::FieldValue::Integer(v)) => Ok(v.to_string()),
        Some(other) => Err(SiltError::KeyGeneration(format!(
            "field '{}' has non-key value {:?}",
            field, other
        ))),
        None => Err(SiltError::KeyGeneration(format!(
            "row is missing key field '{}'",
            field
        ))),
    }
}

fn put_column<T: Serialize>(buf: &mut BytesMut, column: &[T]) -> Result<()> {
    let raw = bincode::serialize(&column).map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    buf.put_u32(compressed.len() as u32);
    buf.put_slice(&compressed);
    Ok(())
}

fn get_column<T: DeserializeOwned>(buf: &mut &[u8], expected: usize) -> Result<Vec<T>> {
    let len = take_u32(buf)? as usize;
    let compressed = take(buf, len)?;
    let raw = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| SiltError::Corruption(e.to_string()))?;
    let column: Vec<T> =
        bincode::deserialize(&raw).map_err(|e| SiltError::Corruption(e.to_string()))?;
    if column.len() != expected {
        return Err(SiltError::Corruption(format!(
            "column has {} values, expected {}",
            column.len(),
            expected
        )));
    }
    Ok(column)
}

/// Delete markers for a set of record keys
#[derive(Debug, Clone)]
pub struct DeleteBlock {
    pub header: MetadataMap,
    pub footer: MetadataMap,
    pub keys: Vec<(RecordKey, OrderingVal)>,
}

impl DeleteBlock {
    /// Create a delete block for the given keys under one instant
    pub fn new(keys: Vec<(RecordKey, OrderingVal)>, instant_time: &str) -> Self {
        let mut header = MetadataMap::new();
        header.insert(meta_key::INSTANT_TIME, instant_time.to_string());
        header.insert(meta_key::RECORD_COUNT, keys.len().to_string());
        Self {
            header,
            footer: MetadataMap::new(),
            keys,
        }
    }

    fn encode_content(&self) -> Result<Bytes> {
        let bytes =
            bincode::serialize(&self.keys).map_err(|e| SiltError::InvalidFormat(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    fn decode(header: MetadataMap, footer: MetadataMap, content: &[u8]) -> Result<Self> {
        let keys = bincode::deserialize(content).map_err(|e| SiltError::Corruption(e.to_string()))?;
        Ok(Self {
            header,
            footer,
            keys,
        })
    }
}

/// Control block; carries no content
#[derive(Debug, Clone)]
pub struct CommandBlock {
    pub header: MetadataMap,
    pub footer: MetadataMap,
    pub kind: CommandKind,
}

impl CommandBlock {
    /// Create a rollback command targeting an instant
    pub fn rollback(target_instant: &str, instant_time: &str) -> Self {
        let mut header = MetadataMap::new();
        header.insert(meta_key::COMMAND_KIND, CommandKind::Rollback.code().to_string());
        header.insert(meta_key::TARGET_INSTANT, target_instant.to_string());
        header.insert(meta_key::INSTANT_TIME, instant_time.to_string());
        Self {
            header,
            footer: MetadataMap::new(),
            kind: CommandKind::Rollback,
        }
    }

    /// Instant targeted by this command
    pub fn target_instant(&self) -> Option<&str> {
        self.header.get(&meta_key::TARGET_INSTANT).map(|s| s.as_str())
    }

    fn decode(header: MetadataMap, footer: MetadataMap) -> Result<Self> {
        let kind = header
            .get(&meta_key::COMMAND_KIND)
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| SiltError::Corruption("command block without kind".into()))
            .and_then(CommandKind::from_code)?;
        Ok(Self {
            header,
            footer,
            kind,
        })
    }
}
