//! The job state machine.
//!
//! States move along one DAG:
//!
//! ```text
//! Queued -> Admitted -> Running -> {Succeeded, Failed, Cancelled, TimedOut}
//!    |          |
//!    |          +-> Cancelled | TimedOut | Failed
//!    +-> Cancelled | TimedOut | Failed
//!    +-> Succeeded (cache hit or coalesced result, no backend call)
//! ```
//!
//! Terminal states are absorbing. Every transition is validated and
//! applied through a `watch` channel with `send_if_modified`, so readers
//! always observe one consistent snapshot and a monotonic state sequence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::fingerprint;
use crate::metrics;
use crate::types::Capability;

/// Lifecycle state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Admitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::TimedOut
        )
    }

    /// Whether `self -> to` is a legal edge of the lifecycle DAG.
    pub fn can_transition(&self, to: JobState) -> bool {
        match self {
            JobState::Queued => matches!(
                to,
                JobState::Admitted
                    | JobState::Succeeded
                    | JobState::Cancelled
                    | JobState::TimedOut
                    | JobState::Failed
            ),
            JobState::Admitted => matches!(
                to,
                JobState::Running | JobState::Cancelled | JobState::TimedOut | JobState::Failed
            ),
            JobState::Running => matches!(
                to,
                JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::TimedOut
            ),
            _ => false,
        }
    }

    /// Status word used in the submission envelope and metrics labels.
    pub fn status_label(&self) -> &'static str {
        match self {
            JobState::Queued | JobState::Admitted => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
        }
    }
}

/// A consistent, owned view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub capability: Capability,
    pub fingerprint: String,
    pub status: JobState,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    pub deadline_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_until: Option<DateTime<Utc>>,
}

/// One tracked unit of submitted work.
#[derive(Debug)]
pub struct JobRecord {
    pub id: String,
    pub capability: Capability,
    pub fingerprint: u128,
    /// Absolute deadline every suspension point honors.
    pub deadline: Instant,
    /// Fires on caller cancellation; checked cooperatively.
    pub cancel: CancellationToken,
    retention_window: Duration,
    tx: watch::Sender<JobSnapshot>,
}

impl JobRecord {
    pub fn new(
        capability: Capability,
        fp: u128,
        deadline: Duration,
        retention_window: Duration,
    ) -> Arc<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let snapshot = JobSnapshot {
            job_id: id.clone(),
            capability,
            fingerprint: fingerprint::to_hex(fp),
            status: JobState::Queued,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            progress: Some(0.0),
            result: None,
            error: None,
            deadline_at: now
                + chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::zero()),
            retention_until: None,
        };
        let (tx, _) = watch::channel(snapshot);
        metrics::JOBS_QUEUED.inc();
        Arc::new(Self {
            id,
            capability,
            fingerprint: fp,
            deadline: Instant::now() + deadline,
            cancel: CancellationToken::new(),
            retention_window,
            tx,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> JobState {
        self.tx.borrow().status
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Time left until the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.checked_duration_since(Instant::now())
    }

    pub fn handle(self: &Arc<Self>) -> JobHandle {
        JobHandle { record: Arc::clone(self), rx: self.tx.subscribe() }
    }

    /// Apply one validated transition. Returns false (and changes
    /// nothing) when the edge is illegal, e.g. the job already reached a
    /// terminal state through another path.
    fn transition(&self, to: JobState, mutate: impl FnOnce(&mut JobSnapshot)) -> bool {
        let mut applied_from = None;
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.status.can_transition(to) {
                return false;
            }
            applied_from = Some(snapshot.status);
            snapshot.status = to;
            if to.is_terminal() {
                let now = Utc::now();
                snapshot.finished_at = Some(now);
                snapshot.retention_until = Some(
                    now + chrono::Duration::from_std(self.retention_window)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                );
            }
            mutate(snapshot);
            true
        });

        if let Some(from) = applied_from {
            if from == JobState::Queued {
                metrics::JOBS_QUEUED.dec();
            }
            if from == JobState::Running {
                metrics::JOBS_RUNNING.dec();
            }
            if to == JobState::Running {
                metrics::JOBS_RUNNING.inc();
            }
            true
        } else {
            false
        }
    }

    pub fn mark_admitted(&self) -> bool {
        self.transition(JobState::Admitted, |s| s.progress = Some(0.25))
    }

    pub fn mark_running(&self) -> bool {
        self.transition(JobState::Running, |s| {
            s.started_at = Some(Utc::now());
            s.progress = Some(0.5);
        })
    }

    pub fn succeed(&self, result: Arc<Value>) -> bool {
        self.transition(JobState::Succeeded, |s| {
            s.result = Some(result);
            s.progress = Some(1.0);
        })
    }

    pub fn fail(&self, error: GatewayError) -> bool {
        self.transition(JobState::Failed, |s| s.error = Some(error))
    }

    pub fn mark_cancelled(&self) -> bool {
        self.transition(JobState::Cancelled, |s| s.error = Some(GatewayError::cancelled()))
    }

    pub fn mark_timed_out(&self) -> bool {
        self.transition(JobState::TimedOut, |s| {
            s.error = Some(GatewayError::timeout("job deadline"))
        })
    }

    /// Processing time for the envelope, once terminal.
    pub fn processing_time(&self) -> Option<Duration> {
        let snapshot = self.tx.borrow();
        match (snapshot.started_at, snapshot.finished_at) {
            (Some(start), Some(finish)) => (finish - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Caller-facing handle for one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    record: Arc<JobRecord>,
    rx: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &Arc<JobRecord> {
        &self.record
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.rx.borrow().clone()
    }

    /// Block until the job reaches a terminal state.
    pub async fn wait(&mut self) -> JobSnapshot {
        loop {
            {
                let snapshot = self.rx.borrow_and_update();
                if snapshot.status.is_terminal() {
                    return snapshot.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped; the last observed snapshot is final.
                return self.rx.borrow().clone();
            }
        }
    }

    /// Request cancellation. Idempotent: the token latches and terminal
    /// states absorb the transition attempt.
    pub fn cancel(&self) {
        self.record.cancel.cancel();
        if self.record.state() == JobState::Queued {
            self.record.mark_cancelled();
        }
    }
}
