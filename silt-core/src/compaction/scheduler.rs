//! Compaction scheduler

use super::plan::{metric, CompactionOperation, CompactionPlan};
use super::{CompactionConfig, TriggerStrategy};
use crate::timeline::{parse_instant_seconds, Action, Timeline};
use crate::view::FileSystemView;
use crate::{InstantTime, Result, SiltError};
use std::collections::BTreeMap;
use tracing::info;

/// Decides when a table needs compaction and generates the plan.
pub struct CompactionScheduler {
    config: CompactionConfig,
}

impl CompactionScheduler {
    /// Create a scheduler with the given trigger configuration
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Evaluate the trigger policy at `instant_time`
    pub fn needs_compaction(&self, timeline: &Timeline, instant_time: &str) -> Result<bool> {
        let Some((delta_commits, last_compaction_ts)) =
            self.last_delta_commit_info(timeline, self.config.trigger)
        else {
            return Ok(false);
        };
        let max_commits = self.config.max_delta_commits;
        let max_seconds = self.config.max_delta_seconds;
        let elapsed = || -> Result<i64> {
            Ok(parse_instant_seconds(instant_time)? - parse_instant_seconds(&last_compaction_ts)?)
        };
        let compactable = match self.config.trigger {
            TriggerStrategy::Num => max_commits <= delta_commits,
            TriggerStrategy::TimeElapsed => max_seconds <= elapsed()?,
            TriggerStrategy::NumOrTime => {
                max_commits <= delta_commits || max_seconds <= elapsed()?
            }
            TriggerStrategy::NumAndTime => {
                max_commits <= delta_commits && max_seconds <= elapsed()?
            }
        };
        if compactable {
            info!(
                "compaction triggered: {} delta commits since {}, strategy {:?}",
                delta_commits, last_compaction_ts, self.config.trigger
            );
        } else {
            info!(
                "not scheduling compaction: {} delta commits since {}, strategy {:?}",
                delta_commits, last_compaction_ts, self.config.trigger
            );
        }
        Ok(compactable)
    }

    /// Delta commits since the last completed compaction and the baseline
    /// timestamp. With no completed compaction, the baseline is the first
    /// delta commit and that commit counts too.
    fn last_delta_commit_info(
        &self,
        timeline: &Timeline,
        strategy: TriggerStrategy,
    ) -> Option<(usize, InstantTime)> {
        let last_compaction = timeline.completed_commits().last().map(|i| i.timestamp.clone());
        let delta_commits = timeline.completed_delta_commits();

        let baseline = match &last_compaction {
            Some(ts) => ts.clone(),
            None => delta_commits.first()?.timestamp.clone(),
        };
        let count = if strategy == TriggerStrategy::TimeElapsed {
            0
        } else if last_compaction.is_some() {
            delta_commits
                .iter()
                .filter(|i| i.timestamp > baseline)
                .count()
        } else {
            delta_commits
                .iter()
                .filter(|i| i.timestamp >= baseline)
                .count()
        };
        Some((count, baseline))
    }

    /// Generate and persist a compaction plan at `instant_time`. Returns
    /// `None` when the trigger does not fire or no file group qualifies. Any
    /// failure while producing the plan aborts the whole call; nothing
    /// partial is persisted.
    pub fn schedule(
        &self,
        timeline: &mut Timeline,
        view: &FileSystemView,
        instant_time: &str,
    ) -> Result<Option<CompactionPlan>> {
        if !self.needs_compaction(timeline, instant_time)? {
            return Ok(None);
        }

        let pending = view.pending_compaction_operations();
        let mut operations = Vec::new();
        for partition in view.partitions() {
            for slice in view.latest_file_slices(partition) {
                if !slice.has_log_files() {
                    continue;
                }
                if pending.contains(&slice.id) {
                    info!(
                        "skipping file group {:?}: already targeted by a pending operation",
                        slice.id
                    );
                    continue;
                }
                let mut metrics = BTreeMap::new();
                metrics.insert(
                    metric::TOTAL_LOG_FILES.to_string(),
                    slice.log_files.len() as f64,
                );
                metrics.insert(
                    metric::TOTAL_LOG_SIZE_BYTES.to_string(),
                    slice.log_files.iter().map(|l| l.file_size).sum::<u64>() as f64,
                );
                operations.push(CompactionOperation {
                    partition: partition.to_string(),
                    file_id: slice.id.file_id.clone(),
                    base_file_path: slice
                        .base_file
                        .as_ref()
                        .map(|b| b.path.to_string_lossy().into_owned()),
                    log_file_paths: slice
                        .log_files
                        .iter()
                        .map(|l| l.path.to_string_lossy().into_owned())
                        .collect(),
                    metrics,
                });
            }
        }
        if operations.is_empty() {
            info!("compaction triggered but no file group has log files to fold");
            return Ok(None);
        }

        let plan = CompactionPlan::new(instant_time.to_string(), operations);
        let content = plan.to_json_bytes()?;
        timeline
            .create_requested(Action::Compaction, instant_time, Some(&content))
            .map_err(|e| SiltError::Compaction(format!("could not persist plan: {}", e)))?;
        info!(
            "scheduled compaction {} over {} file groups",
            instant_time,
            plan.operations.len()
        );
        Ok(Some(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn complete(timeline: &mut Timeline, action: Action, ts: &str) {
        let requested = timeline.create_requested(action, ts, None).unwrap();
        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        timeline.transition_to_completed(&inflight, None).unwrap();
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn num_scheduler(threshold: usize) -> CompactionScheduler {
        CompactionScheduler::new(CompactionConfig {
            trigger: TriggerStrategy::Num,
            max_delta_commits: threshold,
            max_delta_seconds: 3600,
        })
    }

    #[test]
    fn test_num_trigger_threshold() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        for i in 0..4 {
            complete(
                &mut timeline,
                Action::DeltaCommit,
                &format!("2026010100000{}", i),
            );
        }
        let scheduler = num_scheduler(5);
        assert!(!scheduler
            .needs_compaction(&timeline, "20260101000010")
            .unwrap());

        complete(&mut timeline, Action::DeltaCommit, "20260101000004");
        assert!(scheduler
            .needs_compaction(&timeline, "20260101000010")
            .unwrap());
    }

    #[test]
    fn test_num_counts_only_after_last_compaction() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        for i in 0..5 {
            complete(
                &mut timeline,
                Action::DeltaCommit,
                &format!("2026010100000{}", i),
            );
        }
        complete(&mut timeline, Action::Compaction, "20260101000005");
        complete(&mut timeline, Action::DeltaCommit, "20260101000006");

        // only one delta commit after the compaction baseline
        assert!(!num_scheduler(5)
            .needs_compaction(&timeline, "20260101000010")
            .unwrap());
        assert!(num_scheduler(1)
            .needs_compaction(&timeline, "20260101000010")
            .unwrap());
    }

    #[test]
    fn test_time_elapsed_trigger() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        complete(&mut timeline, Action::DeltaCommit, "20260101000000");

        let scheduler = CompactionScheduler::new(CompactionConfig {
            trigger: TriggerStrategy::TimeElapsed,
            max_delta_commits: 1,
            max_delta_seconds: 600,
        });
        assert!(!scheduler
            .needs_compaction(&timeline, "20260101000500")
            .unwrap());
        assert!(scheduler
            .needs_compaction(&timeline, "20260101001000")
            .unwrap());
    }

    #[test]
    fn test_num_or_time_and_num_and_time() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        complete(&mut timeline, Action::DeltaCommit, "20260101000000");
        complete(&mut timeline, Action::DeltaCommit, "20260101000001");

        let config = |trigger| CompactionConfig {
            trigger,
            max_delta_commits: 2,
            max_delta_seconds: 3600,
        };
        // commit threshold met, time threshold not met
        assert!(CompactionScheduler::new(config(TriggerStrategy::NumOrTime))
            .needs_compaction(&timeline, "20260101000100")
            .unwrap());
        assert!(!CompactionScheduler::new(config(TriggerStrategy::NumAndTime))
            .needs_compaction(&timeline, "20260101000100")
            .unwrap());
        assert!(CompactionScheduler::new(config(TriggerStrategy::NumAndTime))
            .needs_compaction(&timeline, "20260101010000")
            .unwrap());
    }

    #[test]
    fn test_empty_timeline_never_compacts() {
        let dir = TempDir::new().unwrap();
        let timeline = Timeline::load(dir.path()).unwrap();
        assert!(!num_scheduler(1)
            .needs_compaction(&timeline, "20260101000010")
            .unwrap());
    }

    #[test]
    fn test_schedule_persists_plan_and_excludes_pending() {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::load(dir.path()).unwrap();
        complete(&mut timeline, Action::Commit, "20260101000000");
        for i in 1..=5 {
            complete(
                &mut timeline,
                Action::DeltaCommit,
                &format!("2026010100000{}", i),
            );
        }
        touch(&dir.path().join("p1/fg1_20260101000000.base"));
        touch(&dir.path().join("p1/fg1_20260101000000.log.1"));

        let scheduler = num_scheduler(5);
        let view = FileSystemView::load(dir.path(), &timeline).unwrap();
        let plan = scheduler
            .schedule(&mut timeline, &view, "20260101000010")
            .unwrap()
            .expect("plan expected");
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].file_id, "fg1");
        assert!(dir
            .path()
            .join(".timeline/20260101000010.compaction.requested")
            .exists());

        // a second scheduling call sees the file group as pending and
        // produces no plan
        let view = FileSystemView::load(dir.path(), &timeline).unwrap();
        let second = scheduler
            .schedule(&mut timeline, &view, "20260101000011")
            .unwrap();
        assert!(second.is_none());
    }
}
