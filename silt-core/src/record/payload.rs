//! Pluggable record payload behaviors
//!
//! Mergers resolve multiple versions of one key into one logical value, key
//! generators derive record identity from raw rows. Implementations are
//! resolved from configuration strings through explicit registries at table
//! open time; there is no runtime reflection.

use crate::{FieldValue, Record, RecordKey, Result, RowData, Schema, SiltError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Config property naming the record key field
pub const KEY_FIELD_PROP: &str = "silt.key.field";
/// Config property naming the partition field
pub const PARTITION_FIELD_PROP: &str = "silt.partition.field";

/// Merge/precombine policy for records sharing one key.
///
/// `combine` is not commutative: it must always be called as
/// `combine(older, newer)`, with "newer" determined by instant order and,
/// within one batch, by the records' ordering values (see `pre_combine`).
pub trait RecordMerger: Send + Sync {
    /// Registry name of this merger
    fn name(&self) -> &str;

    /// Resolve two same-key records of one incoming batch into one. The
    /// result must keep the key of `older`: key and partition are invariant
    /// under reduction.
    fn pre_combine(&self, older: Record, newer: Record) -> Record;

    /// Combine an older version with a newer one. `None` means the merged
    /// result is a deletion.
    fn combine(&self, older: &Record, newer: &Record, schema: &Schema) -> Result<Option<RowData>>;

    /// Value a record contributes when inserted fresh, projected into the
    /// target schema. `None` for tombstones.
    fn insert_value(&self, record: &Record, schema: &Schema) -> Result<Option<RowData>> {
        match &record.row {
            Some(row) => Ok(Some(schema.project(row)?)),
            None => Ok(None),
        }
    }
}

/// Default merger: the newer record replaces the older one entirely.
#[derive(Debug, Default)]
pub struct OverwriteWithLatestMerger;

impl RecordMerger for OverwriteWithLatestMerger {
    fn name(&self) -> &str {
        "overwrite-latest"
    }

    fn pre_combine(&self, older: Record, newer: Record) -> Record {
        // ties keep the later-arriving record
        if newer.ordering >= older.ordering {
            Record {
                key: older.key,
                ..newer
            }
        } else {
            older
        }
    }

    fn combine(&self, _older: &Record, newer: &Record, _schema: &Schema) -> Result<Option<RowData>> {
        Ok(newer.row.clone())
    }
}

/// Partial-update merger: non-null fields of the newer record overlay the
/// older row; a tombstone still deletes.
#[derive(Debug, Default)]
pub struct PartialUpdateMerger;

impl PartialUpdateMerger {
    fn overlay(older: Option<&RowData>, newer: &RowData) -> RowData {
        let mut merged = older.cloned().unwrap_or_default();
        for (name, value) in newer.iter() {
            if !value.is_null() {
                merged.insert(name.clone(), value.clone());
            } else if merged.get(name).is_none() {
                merged.insert(name.clone(), FieldValue::Null);
            }
        }
        merged
    }
}

impl RecordMerger for PartialUpdateMerger {
    fn name(&self) -> &str {
        "partial-update"
    }

    fn pre_combine(&self, older: Record, newer: Record) -> Record {
        let (low, high) = if newer.ordering >= older.ordering {
            (older, newer)
        } else {
            (newer, older)
        };
        let row = match (&low.row, &high.row) {
            (_, None) => None,
            (older_row, Some(newer_row)) => Some(Self::overlay(older_row.as_ref(), newer_row)),
        };
        Record {
            key: low.key.clone(),
            ordering: high.ordering,
            row,
            commit_time: high.commit_time,
        }
    }

    fn combine(&self, older: &Record, newer: &Record, _schema: &Schema) -> Result<Option<RowData>> {
        match &newer.row {
            None => Ok(None),
            Some(newer_row) => Ok(Some(Self::overlay(older.row.as_ref(), newer_row))),
        }
    }
}

/// Registry resolving merger names to implementations
pub struct MergerRegistry {
    mergers: HashMap<String, Arc<dyn RecordMerger>>,
}

impl MergerRegistry {
    /// Registry with the built-in mergers
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            mergers: HashMap::new(),
        };
        registry.register(Arc::new(OverwriteWithLatestMerger));
        registry.register(Arc::new(PartialUpdateMerger));
        registry
    }

    /// Register a merger under its own name
    pub fn register(&mut self, merger: Arc<dyn RecordMerger>) {
        self.mergers.insert(merger.name().to_string(), merger);
    }

    /// Resolve a merger by name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RecordMerger>> {
        self.mergers
            .get(name)
            .cloned()
            .ok_or_else(|| SiltError::Config(format!("unknown merger: '{}'", name)))
    }
}

impl Default for MergerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Derives record identity from a raw row
pub trait KeyGenerator: Send + Sync {
    /// Registry name of this key generator
    fn name(&self) -> &str;

    /// Extract `(record key, partition path)` from a row
    fn key(&self, row: &RowData) -> Result<RecordKey>;
}

/// Key generator reading the key from one field and the partition from an
/// optional second field.
#[derive(Debug, Clone)]
pub struct SimpleKeyGenerator {
    pub record_key_field: String,
    pub partition_field: Option<String>,
}

impl SimpleKeyGenerator {
    fn field_as_string(row: &RowData, field: &str) -> Result<String> {
        match row.get(field) {
            Some(FieldValue::String(s)) => Ok(s.clone()),
            Some(FieldValue::Integer(v)) => Ok(v.to_string()),
            Some(other) => Err(SiltError::KeyGeneration(format!(
                "field '{}' has unusable key value {:?}",
                field, other
            ))),
            None => Err(SiltError::KeyGeneration(format!(
                "row is missing field '{}'",
                field
            ))),
        }
    }
}

impl KeyGenerator for SimpleKeyGenerator {
    fn name(&self) -> &str {
        "simple"
    }

    fn key(&self, row: &RowData) -> Result<RecordKey> {
        let key = Self::field_as_string(row, &self.record_key_field)?;
        let partition = match &self.partition_field {
            Some(field) => Self::field_as_string(row, field)?,
            None => String::new(),
        };
        Ok(RecordKey::new(key, partition))
    }
}

type KeyGeneratorFactory =
    Arc<dyn Fn(&BTreeMap<String, String>) -> Result<Arc<dyn KeyGenerator>> + Send + Sync>;

/// Registry resolving key generator names to factories over table properties
pub struct KeyGeneratorRegistry {
    factories: HashMap<String, KeyGeneratorFactory>,
}

impl KeyGeneratorRegistry {
    /// Registry with the built-in generators
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            "simple",
            Arc::new(|props: &BTreeMap<String, String>| {
                let record_key_field = props.get(KEY_FIELD_PROP).cloned().ok_or_else(|| {
                    SiltError::Config(format!("'{}' is required by the simple key generator", KEY_FIELD_PROP))
                })?;
                Ok(Arc::new(SimpleKeyGenerator {
                    record_key_field,
                    partition_field: props.get(PARTITION_FIELD_PROP).cloned(),
                }) as Arc<dyn KeyGenerator>)
            }),
        );
        registry
    }

    /// Register a factory under a name
    pub fn register(&mut self, name: &str, factory: KeyGeneratorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Resolve and construct a key generator from table properties
    pub fn resolve(
        &self,
        name: &str,
        props: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn KeyGenerator>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SiltError::Config(format!("unknown key generator: '{}'", name)))?;
        factory(props)
    }
}

impl Default for KeyGeneratorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderingVal;

    fn rec(key: &str, ordering: i64, value: i64) -> Record {
        Record::insert(
            RecordKey::new(key, "p1"),
            OrderingVal::Int(ordering),
            RowData::new().with("id", key).with("value", value),
        )
    }

    #[test]
    fn test_pre_combine_keeps_higher_ordering() {
        let merger = OverwriteWithLatestMerger;
        let winner = merger.pre_combine(rec("k1", 1, 10), rec("k1", 2, 20));
        assert_eq!(
            winner.row.unwrap().get("value"),
            Some(&FieldValue::Integer(20))
        );

        let winner = merger.pre_combine(rec("k1", 3, 10), rec("k1", 2, 20));
        assert_eq!(
            winner.row.unwrap().get("value"),
            Some(&FieldValue::Integer(10))
        );
    }

    #[test]
    fn test_pre_combine_tie_keeps_later_record() {
        let merger = OverwriteWithLatestMerger;
        let winner = merger.pre_combine(rec("k1", 2, 10), rec("k1", 2, 20));
        assert_eq!(
            winner.row.unwrap().get("value"),
            Some(&FieldValue::Integer(20))
        );
    }

    #[test]
    fn test_pre_combine_key_is_invariant() {
        let merger = OverwriteWithLatestMerger;
        let older = rec("k1", 1, 10);
        let key = older.key.clone();
        let winner = merger.pre_combine(older, rec("k1", 2, 20));
        assert_eq!(winner.key, key);
    }

    #[test]
    fn test_partial_update_overlays_non_null() {
        let merger = PartialUpdateMerger;
        let older = rec("k1", 1, 10);
        let newer = Record::insert(
            RecordKey::new("k1", "p1"),
            OrderingVal::Int(2),
            RowData::new().with("extra", "x").with("value", FieldValue::Null),
        );
        let schema = Schema::new("t");
        let merged = merger.combine(&older, &newer, &schema).unwrap().unwrap();
        // null field did not clobber the older value
        assert_eq!(merged.get("value"), Some(&FieldValue::Integer(10)));
        assert_eq!(merged.get("extra"), Some(&FieldValue::String("x".into())));
    }

    #[test]
    fn test_partial_update_delete_wins() {
        let merger = PartialUpdateMerger;
        let older = rec("k1", 1, 10);
        let newer = Record::delete(RecordKey::new("k1", "p1"), OrderingVal::Int(2));
        let schema = Schema::new("t");
        assert!(merger.combine(&older, &newer, &schema).unwrap().is_none());
    }

    #[test]
    fn test_merger_registry() {
        let registry = MergerRegistry::with_defaults();
        assert!(registry.resolve("overwrite-latest").is_ok());
        assert!(registry.resolve("partial-update").is_ok());
        assert!(matches!(
            registry.resolve("made-up"),
            Err(SiltError::Config(_))
        ));
    }

    #[test]
    fn test_simple_key_generator() {
        let generator = SimpleKeyGenerator {
            record_key_field: "id".to_string(),
            partition_field: Some("region".to_string()),
        };
        let row = RowData::new().with("id", "r-7").with("region", "emea");
        let key = generator.key(&row).unwrap();
        assert_eq!(key, RecordKey::new("r-7", "emea"));

        let missing = RowData::new().with("region", "emea");
        assert!(matches!(
            generator.key(&missing),
            Err(SiltError::KeyGeneration(_))
        ));
    }

    #[test]
    fn test_key_generator_registry_requires_key_field() {
        let registry = KeyGeneratorRegistry::with_defaults();
        let mut props = BTreeMap::new();
        assert!(registry.resolve("simple", &props).is_err());
        props.insert(KEY_FIELD_PROP.to_string(), "id".to_string());
        let generator = registry.resolve("simple", &props).unwrap();
        let row = RowData::new().with("id", 9i64);
        assert_eq!(generator.key(&row).unwrap(), RecordKey::new("9", ""));
    }
}
