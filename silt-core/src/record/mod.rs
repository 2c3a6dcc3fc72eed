//! Record-level behaviors: pluggable merge/precombine policies, key
//! generation, and the base+log merge engine.

mod merge;
mod payload;

pub use merge::{MergeEngine, ReadMode, RecordScan};
pub use payload::{
    KeyGenerator, KeyGeneratorRegistry, MergerRegistry, OverwriteWithLatestMerger,
    PartialUpdateMerger, RecordMerger, SimpleKeyGenerator, KEY_FIELD_PROP, PARTITION_FIELD_PROP,
};
