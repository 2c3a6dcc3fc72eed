//! Core types for Silt

use crate::{Result, SiltError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp-named marker on the timeline, formatted as `yyyyMMddHHmmss`.
/// Instants order by plain string comparison.
pub type InstantTime = String;

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit null
    Null,
    /// Boolean
    Boolean(bool),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// String
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Check for explicit null
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as str if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// A single row of column values, keyed by field name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowData(pub BTreeMap<String, FieldValue>);

impl RowData {
    /// Create an empty row
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a field, builder style
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Set a field
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Get a field value
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the row has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Field data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    String,
    Bytes,
}

/// A single field definition in a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub data_type: DataType,
    /// Whether nulls are allowed
    pub nullable: bool,
    /// Default value used when a writer row lacks this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
}

/// A named record schema, serialized as JSON when carried in block headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name
    pub name: String,
    /// Ordered field definitions
    pub fields: Vec<FieldDef>,
}

impl Schema {
    /// Create an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field, builder style
    pub fn with_field(mut self, name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            data_type,
            nullable,
            default: None,
        });
        self
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Serialize to the JSON form carried in block headers
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SiltError::InvalidFormat(e.to_string()))
    }

    /// Parse from the JSON form carried in block headers
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SiltError::InvalidFormat(e.to_string()))
    }

    /// Normalization pass: give every nullable field without a default an
    /// explicit null default, so projection behaves identically no matter
    /// which writer produced the row.
    pub fn normalize(&self) -> Schema {
        let mut out = self.clone();
        for field in &mut out.fields {
            if field.nullable && field.default.is_none() {
                field.default = Some(FieldValue::Null);
            }
        }
        out
    }

    /// Project a writer row into this schema. Fields absent from the row fall
    /// back to the field default (null for nullable fields); a missing
    /// non-nullable field or a type mismatch is a schema-compatibility error.
    /// Writer fields unknown to this schema are dropped.
    pub fn project(&self, row: &RowData) -> Result<RowData> {
        let mut out = RowData::new();
        for field in &self.fields {
            let value = match row.get(&field.name) {
                Some(v) => self.check_type(field, v.clone())?,
                None => match &field.default {
                    Some(d) => d.clone(),
                    None if field.nullable => FieldValue::Null,
                    None => {
                        return Err(SiltError::SchemaCompatibility(format!(
                            "missing non-nullable field '{}' in schema '{}'",
                            field.name, self.name
                        )))
                    }
                },
            };
            out.insert(field.name.clone(), value);
        }
        Ok(out)
    }

    fn check_type(&self, field: &FieldDef, value: FieldValue) -> Result<FieldValue> {
        let ok = match (&value, field.data_type) {
            (FieldValue::Null, _) => field.nullable,
            (FieldValue::Boolean(_), DataType::Boolean) => true,
            (FieldValue::Integer(_), DataType::Integer) => true,
            (FieldValue::Float(_), DataType::Float) => true,
            // widening integer -> float is allowed
            (FieldValue::Integer(v), DataType::Float) => {
                return Ok(FieldValue::Float(*v as f64));
            }
            (FieldValue::String(_), DataType::String) => true,
            (FieldValue::Bytes(_), DataType::Bytes) => true,
            _ => false,
        };
        if ok {
            Ok(value)
        } else {
            Err(SiltError::SchemaCompatibility(format!(
                "value {:?} does not fit field '{}' of type {:?}",
                value, field.name, field.data_type
            )))
        }
    }
}

/// Record identity: record key plus partition path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Record key, unique within its uniqueness scope
    pub key: String,
    /// Partition path; empty for non-partitioned tables
    pub partition: String,
}

impl RecordKey {
    /// Create a new record key
    pub fn new(key: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.key)
    }
}

/// Ordering/precombine value resolving conflicting versions of one key.
/// Values of different kinds order by kind (Int < Float < Str).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderingVal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl OrderingVal {
    fn rank(&self) -> u8 {
        match self {
            OrderingVal::Int(_) => 0,
            OrderingVal::Float(_) => 1,
            OrderingVal::Str(_) => 2,
        }
    }
}

impl PartialEq for OrderingVal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderingVal {}

impl PartialOrd for OrderingVal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderingVal {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OrderingVal::Int(a), OrderingVal::Int(b)) => a.cmp(b),
            (OrderingVal::Float(a), OrderingVal::Float(b)) => a.total_cmp(b),
            (OrderingVal::Str(a), OrderingVal::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// One logical record: identity, precombine value, and an optional row.
/// `row: None` is a delete tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity
    pub key: RecordKey,
    /// Precombine/ordering value
    pub ordering: OrderingVal,
    /// Column values; `None` signals deletion
    pub row: Option<RowData>,
    /// Instant that produced this version, filled in when read back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<InstantTime>,
}

impl Record {
    /// Create an insert/update record
    pub fn insert(key: RecordKey, ordering: OrderingVal, row: RowData) -> Self {
        Self {
            key,
            ordering,
            row: Some(row),
            commit_time: None,
        }
    }

    /// Create a delete tombstone
    pub fn delete(key: RecordKey, ordering: OrderingVal) -> Self {
        Self {
            key,
            ordering,
            row: None,
            commit_time: None,
        }
    }

    /// Check if this record signals deletion
    pub fn is_delete(&self) -> bool {
        self.row.is_none()
    }
}
