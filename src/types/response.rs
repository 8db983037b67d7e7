//! Northbound response envelopes.

use serde::Serialize;

use crate::error::GatewayError;
use crate::jobs::{JobSnapshot, JobState};

/// Envelope returned by the submission endpoints.
///
/// When a job settles within the wait-for-result window the envelope
/// carries the result (or error) inline; otherwise the caller polls
/// `/jobs/{id}` with the returned id.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<std::sync::Arc<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}

impl SubmitResponse {
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Self {
        let processing_time = match (snapshot.started_at, snapshot.finished_at) {
            (Some(start), Some(finish)) => (finish - start).to_std().ok().map(|d| d.as_secs_f64()),
            (None, Some(finish)) => {
                // Cache hits settle without a backend call.
                (finish - snapshot.submitted_at).to_std().ok().map(|d| d.as_secs_f64())
            }
            _ => None,
        };
        Self {
            job_id: snapshot.job_id.clone(),
            status: snapshot.status.status_label(),
            result: snapshot.result.clone(),
            error: snapshot.error.clone(),
            processing_time,
        }
    }

    /// Whether the underlying job ended in a failure state.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, "failed" | "timed_out" | "cancelled")
    }
}

/// Paginated job listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse {
    pub jobs: Vec<JobSnapshot>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Parse a northbound status filter word into a job state.
pub fn parse_status(s: &str) -> Option<JobState> {
    match s {
        "queued" => Some(JobState::Queued),
        "admitted" => Some(JobState::Admitted),
        "running" => Some(JobState::Running),
        "completed" | "succeeded" => Some(JobState::Succeeded),
        "failed" => Some(JobState::Failed),
        "cancelled" => Some(JobState::Cancelled),
        "timed_out" => Some(JobState::TimedOut),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("completed"), Some(JobState::Succeeded));
        assert_eq!(parse_status("running"), Some(JobState::Running));
        assert_eq!(parse_status("bogus"), None);
    }
}
