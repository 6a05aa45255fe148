//! Queue statistics for test harnesses

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;

use super::AppState;
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub worker_status: &'static str,
}

/// GET /api/v1/test/jobs/status
///
/// Counts are summed over the payment, refund and webhook queues. Needs no
/// credentials.
pub async fn job_status(State(state): State<AppState>) -> AppResult<Json<JobStatus>> {
    let counts = state.queues.aggregate_counts().await?;
    let worker_status = if state.workers_running.load(Ordering::SeqCst) {
        "running"
    } else {
        "stopped"
    };

    Ok(Json(JobStatus {
        pending: counts.waiting,
        processing: counts.active,
        completed: counts.completed,
        failed: counts.failed,
        worker_status,
    }))
}
