//! Durable workflow jobs and the worker loop that drains them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{
    BindingStore, DatasetId, JobId, State, binding::BindingMode, workflow::run_job,
};
use crate::CancellationToken;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    CreateOpen,
    DeleteOpen,
    CreateRestricted,
    DeleteRestricted,
    MigrateToOpen,
    MigrateToRestricted,
}

impl JobKind {
    /// Mode whose status this job reports on. Migrations report on their target.
    #[must_use]
    pub fn mode(self) -> BindingMode {
        match self {
            JobKind::CreateOpen | JobKind::DeleteOpen | JobKind::MigrateToOpen => BindingMode::Open,
            JobKind::CreateRestricted | JobKind::DeleteRestricted | JobKind::MigrateToRestricted => {
                BindingMode::Restricted
            }
        }
    }

    #[must_use]
    pub fn is_delete(self) -> bool {
        matches!(self, JobKind::DeleteOpen | JobKind::DeleteRestricted)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Administratively removed from the queue. External resources are left untouched.
    Cleared,
}

impl JobStatus {
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowJob {
    pub job_id: JobId,
    pub dataset_id: DatasetId,
    pub kind: JobKind,
    pub requested_by: String,
    pub status: JobStatus,
    /// Number of deliveries to a worker.
    pub attempts: i32,
    pub enqueued_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub dataset_id: DatasetId,
    pub kind: JobKind,
    pub requested_by: String,
}

/// Result of an enqueue. At most one job per dataset is pending or running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(WorkflowJob),
    /// Another job for the dataset was already in flight and is returned instead.
    InFlight(WorkflowJob),
}

impl EnqueueOutcome {
    #[must_use]
    pub fn job(&self) -> &WorkflowJob {
        match self {
            EnqueueOutcome::Enqueued(job) | EnqueueOutcome::InFlight(job) => job,
        }
    }

    #[must_use]
    pub fn into_job(self) -> WorkflowJob {
        match self {
            EnqueueOutcome::Enqueued(job) | EnqueueOutcome::InFlight(job) => job,
        }
    }

    #[must_use]
    pub fn was_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

pub const WORKER_LOST_ERROR: &str = "worker lost: job exceeded the maximum number of deliveries";

/// Polls the queue until a job is available or the token is cancelled.
async fn poll_for_new_job<B: BindingStore>(
    state: &State<B>,
    poll_interval: Duration,
    cancellation_token: &CancellationToken,
) -> Option<WorkflowJob> {
    loop {
        if cancellation_token.is_cancelled() {
            return None;
        }

        match B::pick_job(
            state.settings.max_time_since_pickup,
            state.settings.max_job_attempts,
            state.store.clone(),
        )
        .await
        {
            Ok(Some(job)) => return Some(job),
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to pick new workflow job: {e}");
            }
        }

        tokio::select! {
            () = cancellation_token.cancelled() => return None,
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

pub async fn workflow_worker<B: BindingStore>(
    state: State<B>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        let Some(job) = poll_for_new_job::<B>(&state, poll_interval, &cancellation_token).await
        else {
            tracing::info!("Graceful shutdown: exiting workflow worker");
            return;
        };

        let span = tracing::debug_span!(
            "workflow_job",
            job_id = %job.job_id,
            dataset_id = %job.dataset_id,
            kind = %job.kind,
            attempt = %job.attempts,
            requested_by = %job.requested_by,
        );

        instrumented_run::<B>(&state, &job)
            .instrument(span.or_current())
            .await;
    }
}

/// Run a single job and record its outcome on the job and on the binding.
pub async fn instrumented_run<B: BindingStore>(state: &State<B>, job: &WorkflowJob) {
    match run_job::<B>(job, state).await {
        Ok(()) => {
            tracing::info!("Workflow job `{}` for {} completed", job.kind, job.dataset_id);
            if let Err(e) = B::record_job_success(job.job_id, state.store.clone()).await {
                tracing::error!("Failed to record success of job {}: {e}", job.job_id);
            }
        }
        Err(err) => {
            let message = err.to_string();
            tracing::error!(
                "Workflow job `{}` for {} failed. Error: {message}",
                job.kind,
                job.dataset_id
            );
            if let Err(e) =
                B::record_binding_error(job.dataset_id, &message, state.store.clone()).await
            {
                tracing::error!("Failed to record error on binding {}: {e}", job.dataset_id);
            }
            if let Err(e) = B::record_job_failure(job.job_id, &message, state.store.clone()).await
            {
                tracing::error!("Failed to record failure of job {}: {e}", job.job_id);
            }
        }
    }
}

/// Spawn `worker_count` workers on the current runtime. Resolves once all of them exited.
pub async fn run_workers<B: BindingStore>(
    state: State<B>,
    worker_count: usize,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..worker_count.max(1) {
        workers.spawn(workflow_worker::<B>(
            state.clone(),
            poll_interval,
            cancellation_token.clone(),
        ));
    }
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            tracing::error!("Workflow worker panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_every_kind_has_a_mode() {
        let open = JobKind::iter()
            .filter(|k| k.mode() == BindingMode::Open)
            .count();
        assert_eq!(open, 3);
        assert!(JobKind::DeleteOpen.is_delete());
        assert!(!JobKind::MigrateToOpen.is_delete());
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(JobStatus::Pending.is_in_flight());
        assert!(JobStatus::Running.is_in_flight());
        assert!(!JobStatus::Cleared.is_in_flight());
        assert_eq!(JobStatus::Cleared.to_string(), "cleared");
    }
}
