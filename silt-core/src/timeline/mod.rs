//! Commit timeline
//!
//! The timeline is an append-only sequence of instants recorded as files
//! under `<table>/.timeline/`, one file per (instant, state). State
//! transitions only ever create new files — `{ts}.{action}.requested`,
//! `{ts}.{action}.inflight`, then `{ts}.{action}` written via an atomic
//! rename — so the filesystem's atomic create/rename is the only mutex
//! between distributed writers. A base or log file is visible to readers iff
//! its creating instant has a completed file here.

use crate::{InstantTime, Result, SiltError};
use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory holding instant files, under the table base path
pub const TIMELINE_DIR: &str = ".timeline";

/// Instant timestamp format
pub const INSTANT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Parse an instant timestamp into unix seconds
pub fn parse_instant_seconds(ts: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(ts, INSTANT_TIME_FORMAT)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| SiltError::Timeline(format!("unparseable instant time '{}': {}", ts, e)))
}

/// Instant state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Requested,
    Inflight,
    Completed,
}

/// Instant action type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Bulk write or compaction result commit
    Commit,
    /// Incremental write commit
    DeltaCommit,
    /// Log-into-base compaction
    Compaction,
    /// File group clustering, scheduled by an external collaborator
    Clustering,
    /// Retention cleanup, executed by an external collaborator
    Clean,
    /// Rollback of another instant
    Rollback,
}

impl Action {
    /// Action name as used in instant file names
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Commit => "commit",
            Action::DeltaCommit => "deltacommit",
            Action::Compaction => "compaction",
            Action::Clustering => "clustering",
            Action::Clean => "clean",
            Action::Rollback => "rollback",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(Action::Commit),
            "deltacommit" => Some(Action::DeltaCommit),
            "compaction" => Some(Action::Compaction),
            "clustering" => Some(Action::Clustering),
            "clean" => Some(Action::Clean),
            "rollback" => Some(Action::Rollback),
            _ => None,
        }
    }
}

/// One timeline instant: a timestamp-named marker with an action and its
/// current (highest) state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instant {
    pub timestamp: InstantTime,
    pub action: Action,
    pub state: State,
}

impl Instant {
    /// File name of this instant at a given state
    pub fn file_name(&self, state: State) -> String {
        match state {
            State::Completed => format!("{}.{}", self.timestamp, self.action.as_str()),
            State::Inflight => format!("{}.{}.inflight", self.timestamp, self.action.as_str()),
            State::Requested => format!("{}.{}.requested", self.timestamp, self.action.as_str()),
        }
    }

    fn parse_file_name(name: &str) -> Option<(InstantTime, Action, State)> {
        let mut parts = name.split('.');
        let ts = parts.next()?;
        if ts.len() != 14 || !ts.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let action = Action::from_str(parts.next()?)?;
        let state = match parts.next() {
            None => State::Completed,
            Some("inflight") => State::Inflight,
            Some("requested") => State::Requested,
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some((ts.to_string(), action, state))
    }
}

/// Metadata document stored as the content of a completed commit,
/// deltacommit or compaction instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Base files added, per partition
    pub added_base_files: BTreeMap<String, Vec<String>>,
    /// Log files appended to, per partition
    pub appended_log_files: BTreeMap<String, Vec<String>>,
    /// Records written by the instant
    pub total_records_written: u64,
    /// Free-form annotations
    pub extra_metadata: BTreeMap<String, String>,
}

impl CommitMetadata {
    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| SiltError::Timeline(e.to_string()))
    }

    /// Parse from JSON bytes
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| SiltError::Timeline(e.to_string()))
    }
}

/// In-memory snapshot of the instant files of one table
pub struct Timeline {
    dir: PathBuf,
    instants: Vec<Instant>,
}

impl Timeline {
    /// Load the timeline of a table, creating the timeline directory on
    /// first use.
    pub fn load(table_path: &Path) -> Result<Self> {
        let dir = table_path.join(TIMELINE_DIR);
        fs::create_dir_all(&dir)?;

        let mut by_instant: BTreeMap<(InstantTime, &'static str), Instant> = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let Some((ts, action, state)) = Instant::parse_file_name(&name) else {
                continue;
            };
            by_instant
                .entry((ts.clone(), action.as_str()))
                .and_modify(|i| i.state = i.state.max(state))
                .or_insert(Instant {
                    timestamp: ts,
                    action,
                    state,
                });
        }
        let instants = by_instant.into_values().collect();
        Ok(Self { dir, instants })
    }

    /// Timeline directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All instants, ordered by timestamp
    pub fn instants(&self) -> &[Instant] {
        &self.instants
    }

    /// Completed instants
    pub fn completed(&self) -> impl Iterator<Item = &Instant> {
        self.instants.iter().filter(|i| i.state == State::Completed)
    }

    /// Check if the instant with this timestamp is completed
    pub fn is_completed(&self, ts: &str) -> bool {
        self.completed().any(|i| i.timestamp == ts)
    }

    /// Timestamps of all completed instants
    pub fn completed_instant_times(&self) -> BTreeSet<InstantTime> {
        self.completed().map(|i| i.timestamp.clone()).collect()
    }

    /// Completed delta commits, oldest first
    pub fn completed_delta_commits(&self) -> Vec<&Instant> {
        self.completed()
            .filter(|i| i.action == Action::DeltaCommit)
            .collect()
    }

    /// Completed commits and compactions, oldest first: the baseline
    /// timeline the compaction scheduler measures against.
    pub fn completed_commits(&self) -> Vec<&Instant> {
        self.completed()
            .filter(|i| matches!(i.action, Action::Commit | Action::Compaction))
            .collect()
    }

    /// Compaction instants not yet completed
    pub fn pending_compactions(&self) -> Vec<&Instant> {
        self.instants
            .iter()
            .filter(|i| i.action == Action::Compaction && i.state != State::Completed)
            .collect()
    }

    /// Clustering instants not yet completed
    pub fn pending_clustering(&self) -> Vec<&Instant> {
        self.instants
            .iter()
            .filter(|i| i.action == Action::Clustering && i.state != State::Completed)
            .collect()
    }

    /// Find an instant by timestamp
    pub fn find(&self, ts: &str) -> Option<&Instant> {
        self.instants.iter().find(|i| i.timestamp == ts)
    }

    /// Record a new requested instant. Atomic create-new makes the first
    /// writer win when two race for the same timestamp.
    pub fn create_requested(
        &mut self,
        action: Action,
        ts: &str,
        content: Option<&[u8]>,
    ) -> Result<Instant> {
        let instant = Instant {
            timestamp: ts.to_string(),
            action,
            state: State::Requested,
        };
        let path = self.dir.join(instant.file_name(State::Requested));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    SiltError::Timeline(format!("instant {} already requested", ts))
                } else {
                    SiltError::Io(e)
                }
            })?;
        if let Some(content) = content {
            file.write_all(content)?;
        }
        file.sync_all()?;
        debug!("requested {} at {}", action.as_str(), ts);
        self.instants.push(instant.clone());
        self.instants.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(instant)
    }

    /// Move a requested instant to inflight
    pub fn transition_to_inflight(&mut self, instant: &Instant) -> Result<Instant> {
        let next = Instant {
            state: State::Inflight,
            ..instant.clone()
        };
        let path = self.dir.join(next.file_name(State::Inflight));
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.sync_all()?;
        self.update_state(&next);
        Ok(next)
    }

    /// Complete an instant: its content is written to a temporary file and
    /// atomically renamed into place, which is the moment the instant's
    /// output becomes visible.
    pub fn transition_to_completed(
        &mut self,
        instant: &Instant,
        content: Option<&[u8]>,
    ) -> Result<Instant> {
        let next = Instant {
            state: State::Completed,
            ..instant.clone()
        };
        let final_path = self.dir.join(next.file_name(State::Completed));
        let tmp_path = self
            .dir
            .join(format!("{}.tmp", next.file_name(State::Completed)));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        if let Some(content) = content {
            file.write_all(content)?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &final_path)?;
        info!("completed {} at {}", next.action.as_str(), next.timestamp);
        self.update_state(&next);
        Ok(next)
    }

    /// Read the content written at a given state of an instant. The plan of
    /// a pending compaction lives in its requested file.
    pub fn read_content(&self, instant: &Instant, state: State) -> Result<Vec<u8>> {
        let path = self.dir.join(instant.file_name(state));
        Ok(fs::read(path)?)
    }

    /// Remove every state file of the instant with this timestamp, as
    /// rollback does after undoing its data files.
    pub fn remove_instant(&mut self, ts: &str) -> Result<()> {
        let Some(instant) = self.find(ts).cloned() else {
            return Err(SiltError::Timeline(format!("no instant at {}", ts)));
        };
        for state in [State::Requested, State::Inflight, State::Completed] {
            let path = self.dir.join(instant.file_name(state));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.instants.retain(|i| i.timestamp != ts);
        Ok(())
    }

    /// Generate a new instant timestamp, strictly greater than every instant
    /// already on the timeline.
    pub fn new_instant_time(&self) -> InstantTime {
        let now = Utc::now().format(INSTANT_TIME_FORMAT).to_string();
        match self.instants.last() {
            Some(last) if now <= last.timestamp => bump_instant(&last.timestamp),
            _ => now,
        }
    }

    fn update_state(&mut self, updated: &Instant) {
        for instant in &mut self.instants {
            if instant.timestamp == updated.timestamp && instant.action == updated.action {
                instant.state = updated.state;
            }
        }
    }
}

fn bump_instant(ts: &str) -> InstantTime {
    match NaiveDateTime::parse_from_str(ts, INSTANT_TIME_FORMAT) {
        Ok(dt) => (dt + Duration::seconds(1))
            .format(INSTANT_TIME_FORMAT)
            .to_string(),
        Err(_) => Utc::now().format(INSTANT_TIME_FORMAT).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_instant_file_names() {
        let instant = Instant {
            timestamp: "20260101000000".to_string(),
            action: Action::DeltaCommit,
            state: State::Requested,
        };
        assert_eq!(
            instant.file_name(State::Requested),
            "20260101000000.deltacommit.requested"
        );
        assert_eq!(
            instant.file_name(State::Completed),
            "20260101000000.deltacommit"
        );
        assert_eq!(
            Instant::parse_file_name("20260101000000.compaction.inflight"),
            Some((
                "20260101000000".to_string(),
                Action::Compaction,
                State::Inflight
            ))
        );
        assert_eq!(Instant::parse_file_name("config.json"), None);
        assert_eq!(Instant::parse_file_name("20260101000000.commit.tmp"), None);
    }

    #[test]
    fn test_transitions_append_files() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        let requested = timeline
            .create_requested(Action::DeltaCommit, "20260101000000", None)
            .unwrap();
        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        timeline
            .transition_to_completed(&inflight, Some(b"{}"))
            .unwrap();

        let tl_dir = dir.path().join(TIMELINE_DIR);
        assert!(tl_dir.join("20260101000000.deltacommit.requested").exists());
        assert!(tl_dir.join("20260101000000.deltacommit.inflight").exists());
        assert!(tl_dir.join("20260101000000.deltacommit").exists());

        let reloaded = Timeline::load(dir.path()).unwrap();
        assert!(reloaded.is_completed("20260101000000"));
    }

    #[test]
    fn test_inflight_is_not_completed() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        let requested = timeline
            .create_requested(Action::DeltaCommit, "20260101000000", None)
            .unwrap();
        timeline.transition_to_inflight(&requested).unwrap();
        assert!(!timeline.is_completed("20260101000000"));
        assert_eq!(timeline.completed_delta_commits().len(), 0);
    }

    #[test]
    fn test_duplicate_request_loses() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        timeline
            .create_requested(Action::Commit, "20260101000000", None)
            .unwrap();
        let err = timeline
            .create_requested(Action::Commit, "20260101000000", None)
            .unwrap_err();
        assert!(matches!(err, SiltError::Timeline(_)));
    }

    #[test]
    fn test_new_instant_time_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        let first = timeline.new_instant_time();
        timeline
            .create_requested(Action::DeltaCommit, &first, None)
            .unwrap();
        let second = timeline.new_instant_time();
        assert!(second > first);
    }

    #[test]
    fn test_remove_instant() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        let requested = timeline
            .create_requested(Action::DeltaCommit, "20260101000000", None)
            .unwrap();
        timeline.transition_to_inflight(&requested).unwrap();
        timeline.remove_instant("20260101000000").unwrap();
        assert!(timeline.find("20260101000000").is_none());
        let reloaded = Timeline::load(dir.path()).unwrap();
        assert!(reloaded.find("20260101000000").is_none());
    }

    #[test]
    fn test_commit_metadata_round_trip() {
        let mut metadata = CommitMetadata::default();
        metadata
            .added_base_files
            .entry("p1".to_string())
            .or_default()
            .push("fg1_20260101000000.base".to_string());
        metadata.total_records_written = 42;
        let parsed = CommitMetadata::from_json_bytes(&metadata.to_json_bytes().unwrap()).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_parse_instant_seconds() {
        let a = parse_instant_seconds("20260101000000").unwrap();
        let b = parse_instant_seconds("20260101001000").unwrap();
        assert_eq!(b - a, 600);
    }
}
