//! Record key index
//!
//! Locates the file group owning a record key using the base files' bloom
//! filters as a fast negative test, with a confirming read before a positive
//! is trusted. The uniqueness scope is configurable: per partition, or global
//! across the table.

mod bloom;

pub use bloom::{BloomFilter, BloomFilterTypeCode};

use crate::base::BaseFileReader;
use crate::view::{FileGroupId, FileSystemView};
use crate::{RecordKey, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Key uniqueness scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexScope {
    /// Exactly one file group owns a (partition, key) pair
    Partition,
    /// A key is unique across the whole table regardless of partition
    Global,
}

/// Bloom-filter backed key lookup over the latest file slices of a view.
/// Keeps opened base file readers for the lifetime of one lookup batch.
pub struct BloomIndexProbe<'a> {
    view: &'a FileSystemView,
    scope: IndexScope,
    readers: HashMap<PathBuf, BaseFileReader>,
}

impl<'a> BloomIndexProbe<'a> {
    /// Create a probe over a view
    pub fn new(view: &'a FileSystemView, scope: IndexScope) -> Self {
        Self {
            view,
            scope,
            readers: HashMap::new(),
        }
    }

    /// Locate the file group owning `key`, if any. Absence is a normal
    /// result, not an error.
    pub fn locate(&mut self, key: &RecordKey) -> Result<Option<FileGroupId>> {
        let partitions: Vec<String> = match self.scope {
            IndexScope::Partition => vec![key.partition.clone()],
            IndexScope::Global => self
                .view
                .partitions()
                .into_iter()
                .map(|p| p.to_string())
                .collect(),
        };
        for partition in partitions {
            for slice in self.view.latest_file_slices(&partition) {
                let Some(base) = &slice.base_file else {
                    continue;
                };
                let path = base.path.clone();
                if !self.readers.contains_key(&path) {
                    self.readers
                        .insert(path.clone(), BaseFileReader::open(&path)?);
                }
                let reader = &self.readers[&path];
                if reader.may_contain(&key.key) && reader.contains_key(&key.key)? {
                    return Ok(Some(slice.id.clone()));
                }
            }
        }
        Ok(None)
    }
}
