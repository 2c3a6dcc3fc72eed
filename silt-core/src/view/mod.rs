//! File group / file slice view
//!
//! Maps the raw directory listing of a table into file groups and slices,
//! filtered through the timeline so that only output of completed instants
//! (as of an optional snapshot instant) is visible. The view also surfaces
//! which file groups are claimed by pending compaction or clustering plans.

use crate::base::parse_base_file_name;
use crate::compaction::CompactionPlan;
use crate::log::parse_log_file_name;
use crate::timeline::{State, Timeline, TIMELINE_DIR};
use crate::{InstantTime, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Identity of a file group: partition plus file id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileGroupId {
    pub partition: String,
    pub file_id: String,
}

/// A base file as seen in the directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct BaseFileHandle {
    pub path: PathBuf,
    pub file_id: String,
    pub instant_time: InstantTime,
    pub file_size: u64,
}

/// A log file as seen in the directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct LogFileHandle {
    pub path: PathBuf,
    pub file_id: String,
    pub base_instant: InstantTime,
    pub version: u32,
    pub file_size: u64,
}

/// One version of a file group: an optional base file plus the ordered log
/// files that accumulated against it.
#[derive(Debug, Clone)]
pub struct FileSlice {
    pub id: FileGroupId,
    pub base_instant: InstantTime,
    pub base_file: Option<BaseFileHandle>,
    pub log_files: Vec<LogFileHandle>,
}

impl FileSlice {
    /// Check if the slice has log files to merge
    pub fn has_log_files(&self) -> bool {
        !self.log_files.is_empty()
    }
}

/// The slice chain of one file group, newest slice first
#[derive(Debug, Clone)]
pub struct FileGroup {
    pub id: FileGroupId,
    pub slices: Vec<FileSlice>,
}

impl FileGroup {
    /// The latest visible slice
    pub fn latest_slice(&self) -> &FileSlice {
        &self.slices[0]
    }
}

/// Timeline-filtered view over a table's file groups
pub struct FileSystemView {
    partitions: BTreeMap<String, Vec<FileGroup>>,
    pending: BTreeSet<FileGroupId>,
}

impl FileSystemView {
    /// Build the view of everything visible on the latest timeline
    pub fn load(table_path: &Path, timeline: &Timeline) -> Result<Self> {
        Self::load_as_of(table_path, timeline, None)
    }

    /// Build the view as of a snapshot instant: files created by instants
    /// later than `as_of`, or not completed at all, are invisible.
    pub fn load_as_of(
        table_path: &Path,
        timeline: &Timeline,
        as_of: Option<&str>,
    ) -> Result<Self> {
        let mut files = Vec::new();
        walk(table_path, "", &mut files)?;

        let visible = |instant: &str| -> bool {
            timeline.is_completed(instant) && as_of.map_or(true, |ts| instant <= ts)
        };

        struct GroupAcc {
            bases: BTreeMap<InstantTime, BaseFileHandle>,
            logs: BTreeMap<InstantTime, Vec<LogFileHandle>>,
        }
        let mut groups: BTreeMap<(String, String), GroupAcc> = BTreeMap::new();

        for (partition, path, name, file_size) in files {
            if let Some((file_id, instant_time)) = parse_base_file_name(&name) {
                if !visible(&instant_time) {
                    continue;
                }
                groups
                    .entry((partition.clone(), file_id.clone()))
                    .or_insert_with(|| GroupAcc {
                        bases: BTreeMap::new(),
                        logs: BTreeMap::new(),
                    })
                    .bases
                    .insert(
                        instant_time.clone(),
                        BaseFileHandle {
                            path,
                            file_id,
                            instant_time,
                            file_size,
                        },
                    );
            } else if let Some((file_id, base_instant, version)) = parse_log_file_name(&name) {
                if !visible(&base_instant) {
                    continue;
                }
                groups
                    .entry((partition.clone(), file_id.clone()))
                    .or_insert_with(|| GroupAcc {
                        bases: BTreeMap::new(),
                        logs: BTreeMap::new(),
                    })
                    .logs
                    .entry(base_instant.clone())
                    .or_default()
                    .push(LogFileHandle {
                        path,
                        file_id,
                        base_instant,
                        version,
                        file_size,
                    });
            }
        }

        let mut partitions: BTreeMap<String, Vec<FileGroup>> = BTreeMap::new();
        for ((partition, file_id), mut acc) in groups {
            let id = FileGroupId {
                partition: partition.clone(),
                file_id,
            };
            let mut slice_instants: BTreeSet<InstantTime> = acc.bases.keys().cloned().collect();
            slice_instants.extend(acc.logs.keys().cloned());

            let mut slices: Vec<FileSlice> = slice_instants
                .into_iter()
                .map(|base_instant| {
                    let mut log_files = acc.logs.remove(&base_instant).unwrap_or_default();
                    log_files.sort_by_key(|l| l.version);
                    FileSlice {
                        id: id.clone(),
                        base_file: acc.bases.remove(&base_instant),
                        base_instant,
                        log_files,
                    }
                })
                .collect();
            slices.reverse();

            partitions
                .entry(partition)
                .or_default()
                .push(FileGroup { id, slices });
        }

        let pending = pending_file_groups(timeline)?;
        Ok(Self {
            partitions,
            pending,
        })
    }

    /// Partitions with visible file groups
    pub fn partitions(&self) -> Vec<&str> {
        self.partitions.keys().map(|p| p.as_str()).collect()
    }

    /// File groups of a partition
    pub fn file_groups(&self, partition: &str) -> &[FileGroup] {
        self.partitions
            .get(partition)
            .map(|g| g.as_slice())
            .unwrap_or(&[])
    }

    /// Latest base files of a partition
    pub fn latest_base_files(&self, partition: &str) -> Vec<&BaseFileHandle> {
        self.file_groups(partition)
            .iter()
            .filter_map(|g| g.latest_slice().base_file.as_ref())
            .collect()
    }

    /// Latest file slices of a partition
    pub fn latest_file_slices(&self, partition: &str) -> Vec<&FileSlice> {
        self.file_groups(partition)
            .iter()
            .map(|g| g.latest_slice())
            .collect()
    }

    /// Latest file slice of one file group
    pub fn latest_file_slice(&self, id: &FileGroupId) -> Option<&FileSlice> {
        self.file_groups(&id.partition)
            .iter()
            .find(|g| &g.id == id)
            .map(|g| g.latest_slice())
    }

    /// File groups claimed by a pending compaction or clustering plan; these
    /// must not be selected into a new plan.
    pub fn pending_compaction_operations(&self) -> &BTreeSet<FileGroupId> {
        &self.pending
    }
}

fn pending_file_groups(timeline: &Timeline) -> Result<BTreeSet<FileGroupId>> {
    let mut pending = BTreeSet::new();
    let instants = timeline
        .pending_compactions()
        .into_iter()
        .chain(timeline.pending_clustering())
        .cloned()
        .collect::<Vec<_>>();
    for instant in instants {
        let content = timeline.read_content(&instant, State::Requested)?;
        let plan = CompactionPlan::from_json_bytes(&content)?;
        for op in &plan.operations {
            pending.insert(op.file_group_id());
        }
    }
    Ok(pending)
}

/// Recursively list data files as `(partition, path, file name, size)`,
/// skipping the timeline and other dot-directories.
pub(crate) fn walk(
    root: &Path,
    partition: &str,
    out: &mut Vec<(String, PathBuf, String, u64)>,
) -> Result<()> {
    let dir = if partition.is_empty() {
        root.to_path_buf()
    } else {
        root.join(partition)
    };
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        if name.starts_with('.') || name == TIMELINE_DIR {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let child = if partition.is_empty() {
                name
            } else {
                format!("{}/{}", partition, name)
            };
            walk(root, &child, out)?;
        } else {
            let size = entry.metadata()?.len();
            out.push((partition.to_string(), entry.path(), name, size));
        }
    }
    Ok(())
}
