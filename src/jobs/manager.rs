//! The job table and retention janitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{JobRecord, JobSnapshot, JobState};
use crate::types::Capability;

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<JobState>,
    pub capability: Option<Capability>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Process-local table of all live jobs.
///
/// Records are `Arc`s and snapshots are owned clones, so a `Get` racing
/// the janitor always sees either a full snapshot or `None`, never a
/// half-freed job.
pub struct JobManager {
    jobs: DashMap<String, Arc<JobRecord>>,
    retention_window: Duration,
}

impl JobManager {
    pub fn new(retention_window: Duration) -> Self {
        Self { jobs: DashMap::new(), retention_window }
    }

    /// Create a job in `Queued` and register it.
    pub fn create(
        &self,
        capability: Capability,
        fp: u128,
        deadline: Duration,
    ) -> Arc<JobRecord> {
        let record = JobRecord::new(capability, fp, deadline, self.retention_window);
        self.jobs.insert(record.id.clone(), Arc::clone(&record));
        record
    }

    pub fn record(&self, id: &str) -> Option<Arc<JobRecord>> {
        self.jobs.get(id).map(|r| Arc::clone(&r))
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|r| r.snapshot())
    }

    /// List snapshots matching `filter`, newest first, with the total
    /// match count before pagination.
    pub fn list(&self, filter: &ListFilter) -> (Vec<JobSnapshot>, usize) {
        let mut matches: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|r| r.snapshot())
            .filter(|s| filter.status.map_or(true, |want| s.status == want))
            .filter(|s| filter.capability.map_or(true, |want| s.capability == want))
            .filter(|s| filter.submitted_after.map_or(true, |t| s.submitted_at >= t))
            .filter(|s| filter.submitted_before.map_or(true, |t| s.submitted_at <= t))
            .collect();
        matches.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        let total = matches.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        let page = matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        (page, total)
    }

    /// Current (queued, running) counts, for the health surface.
    pub fn depth(&self) -> (usize, usize) {
        let mut queued = 0;
        let mut running = 0;
        for record in self.jobs.iter() {
            match record.state() {
                JobState::Queued | JobState::Admitted => queued += 1,
                JobState::Running => running += 1,
                _ => {}
            }
        }
        (queued, running)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All records not yet terminal. Used by the shutdown drain.
    pub fn live_records(&self) -> Vec<Arc<JobRecord>> {
        self.jobs
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| Arc::clone(&r))
            .collect()
    }

    /// Remove terminal jobs whose retention window has passed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|r| {
                let snapshot = r.snapshot();
                snapshot.status.is_terminal()
                    && snapshot.retention_until.map_or(false, |until| now > until)
            })
            .map(|r| r.id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.jobs.remove(&id);
        }
        if count > 0 {
            debug!(swept = count, "janitor removed expired jobs");
        }
        count
    }

    /// Periodic sweep until shutdown. Intended to be spawned.
    pub async fn run_janitor(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> JobManager {
        JobManager::new(Duration::from_secs(60))
    }

    #[test]
    fn test_create_and_get() {
        let manager = manager();
        let job = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        let snapshot = manager.get(&job.id).unwrap();
        assert_eq!(snapshot.status, JobState::Queued);
        assert!(manager.get("no-such-id").is_none());
    }

    #[test]
    fn test_list_filters() {
        let manager = manager();
        let a = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        let _b = manager.create(Capability::LlmChat, 2, Duration::from_secs(5));
        a.mark_admitted();
        a.mark_running();
        a.succeed(Arc::new(json!("ok")));

        let (all, total) = manager.list(&ListFilter::default());
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);

        let (done, _) = manager.list(&ListFilter {
            status: Some(JobState::Succeeded),
            ..Default::default()
        });
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].job_id, a.id);

        let (nlp, _) = manager.list(&ListFilter {
            capability: Some(Capability::NlpAnalyze),
            ..Default::default()
        });
        assert_eq!(nlp.len(), 1);
    }

    #[test]
    fn test_list_pagination() {
        let manager = manager();
        for i in 0..5 {
            manager.create(Capability::NlpAnalyze, i, Duration::from_secs(5));
        }
        let (page, total) = manager.list(&ListFilter { limit: 2, offset: 2, ..Default::default() });
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_sweep_respects_retention() {
        let manager = JobManager::new(Duration::ZERO);
        let job = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        job.mark_admitted();
        job.mark_running();
        job.succeed(Arc::new(json!("ok")));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.sweep(), 1);
        assert!(manager.get(&job.id).is_none());
    }

    #[test]
    fn test_sweep_keeps_live_and_retained() {
        let manager = JobManager::new(Duration::from_secs(300));
        let live = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        let done = manager.create(Capability::NlpAnalyze, 2, Duration::from_secs(5));
        done.mark_admitted();
        done.mark_running();
        done.succeed(Arc::new(json!("ok")));
        assert_eq!(manager.sweep(), 0);
        assert!(manager.get(&live.id).is_some());
        assert!(manager.get(&done.id).is_some(), "terminal job stays queryable");
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let manager = JobManager::new(Duration::ZERO);
        let job = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        job.mark_admitted();
        job.mark_running();
        job.succeed(Arc::new(json!("ok")));
        let held = manager.record(&job.id).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        manager.sweep();
        // The held Arc keeps the record fully readable.
        assert_eq!(held.snapshot().status, JobState::Succeeded);
    }

    #[test]
    fn test_depth_counts() {
        let manager = manager();
        let q = manager.create(Capability::NlpAnalyze, 1, Duration::from_secs(5));
        let r = manager.create(Capability::NlpAnalyze, 2, Duration::from_secs(5));
        r.mark_admitted();
        r.mark_running();
        let (queued, running) = manager.depth();
        assert_eq!(queued, 1);
        assert_eq!(running, 1);
        drop(q);
    }
}
