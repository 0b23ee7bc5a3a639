use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;

use super::lock;
use crate::service::{
    BackendError, BeginBindingSyncError, BiDatabaseId, BindingMode, BindingModeConflict,
    BindingNotFound, BindingStore, CollectionId, DatasetBinding, DatasetId, JobId,
    PermissionGroupId, UpdateBindingError,
    jobs::{EnqueueOutcome, JobStatus, NewJob, WORKER_LOST_ERROR, WorkflowJob},
};

#[derive(Debug, Default)]
struct Inner {
    bindings: HashMap<DatasetId, DatasetBinding>,
    jobs: Vec<WorkflowJob>,
}

impl Inner {
    fn binding_in_mode(
        &mut self,
        dataset_id: DatasetId,
        mode: BindingMode,
    ) -> Result<&mut DatasetBinding, UpdateBindingError> {
        self.bindings
            .get_mut(&dataset_id)
            .filter(|b| b.mode == mode)
            .ok_or_else(|| BindingNotFound::new(dataset_id, Some(mode)).into())
    }

    fn running_job(&mut self, job_id: JobId) -> Option<&mut WorkflowJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.job_id == job_id && j.status == JobStatus::Running)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    inner: Arc<Mutex<Inner>>,
}

/// Store keeping everything in process memory. Enqueue and pick are atomic under a
/// single lock, which gives the same guarantees as the Postgres queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore;

#[async_trait::async_trait]
impl BindingStore for MemoryStore {
    type State = MemoryState;

    async fn get_binding(
        dataset_id: DatasetId,
        state: MemoryState,
    ) -> Result<Option<DatasetBinding>, BackendError> {
        Ok(lock(&state.inner).bindings.get(&dataset_id).cloned())
    }

    async fn list_bindings(
        mode: Option<BindingMode>,
        state: MemoryState,
    ) -> Result<Vec<DatasetBinding>, BackendError> {
        let mut bindings = lock(&state.inner)
            .bindings
            .values()
            .filter(|b| mode.is_none_or(|mode| b.mode == mode))
            .cloned()
            .collect::<Vec<_>>();
        bindings.sort_by_key(|b| b.dataset_id);
        Ok(bindings)
    }

    async fn begin_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        service_account_email: &str,
        state: MemoryState,
    ) -> Result<DatasetBinding, BeginBindingSyncError> {
        let mut inner = lock(&state.inner);
        let binding = inner
            .bindings
            .entry(dataset_id)
            .or_insert_with(|| DatasetBinding {
                dataset_id,
                mode,
                service_account_email: service_account_email.to_string(),
                bi_database_id: None,
                permission_group_id: None,
                collection_id: None,
                sync_started: None,
                sync_completed: None,
                last_error: None,
            });
        if binding.mode != mode {
            return Err(BindingModeConflict::new(dataset_id, binding.mode, mode).into());
        }
        binding.service_account_email = service_account_email.to_string();
        binding.sync_started = Some(Utc::now());
        binding.sync_completed = None;
        binding.last_error = None;
        Ok(binding.clone())
    }

    async fn set_bi_database_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        bi_database_id: Option<BiDatabaseId>,
        state: MemoryState,
    ) -> Result<(), UpdateBindingError> {
        lock(&state.inner)
            .binding_in_mode(dataset_id, mode)?
            .bi_database_id = bi_database_id;
        Ok(())
    }

    async fn set_permission_group_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        permission_group_id: Option<PermissionGroupId>,
        state: MemoryState,
    ) -> Result<(), UpdateBindingError> {
        lock(&state.inner)
            .binding_in_mode(dataset_id, mode)?
            .permission_group_id = permission_group_id;
        Ok(())
    }

    async fn set_collection_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        collection_id: Option<CollectionId>,
        state: MemoryState,
    ) -> Result<(), UpdateBindingError> {
        lock(&state.inner)
            .binding_in_mode(dataset_id, mode)?
            .collection_id = collection_id;
        Ok(())
    }

    async fn complete_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: MemoryState,
    ) -> Result<(), UpdateBindingError> {
        let mut inner = lock(&state.inner);
        let binding = inner.binding_in_mode(dataset_id, mode)?;
        binding.sync_completed = Some(Utc::now());
        binding.last_error = None;
        Ok(())
    }

    async fn begin_binding_teardown(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: MemoryState,
    ) -> Result<(), UpdateBindingError> {
        let mut inner = lock(&state.inner);
        let binding = inner.binding_in_mode(dataset_id, mode)?;
        binding.sync_started = Some(Utc::now());
        binding.sync_completed = None;
        binding.last_error = None;
        Ok(())
    }

    async fn record_binding_error(
        dataset_id: DatasetId,
        error: &str,
        state: MemoryState,
    ) -> Result<(), BackendError> {
        if let Some(binding) = lock(&state.inner).bindings.get_mut(&dataset_id) {
            binding.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn delete_binding(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: MemoryState,
    ) -> Result<bool, BackendError> {
        let mut inner = lock(&state.inner);
        if inner
            .bindings
            .get(&dataset_id)
            .is_some_and(|b| b.mode == mode)
        {
            inner.bindings.remove(&dataset_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn enqueue_job(job: NewJob, state: MemoryState) -> Result<EnqueueOutcome, BackendError> {
        let mut inner = lock(&state.inner);
        if let Some(in_flight) = inner
            .jobs
            .iter()
            .find(|j| j.dataset_id == job.dataset_id && j.status.is_in_flight())
        {
            return Ok(EnqueueOutcome::InFlight(in_flight.clone()));
        }
        let job = WorkflowJob {
            job_id: JobId::new_random(),
            dataset_id: job.dataset_id,
            kind: job.kind,
            requested_by: job.requested_by,
            status: JobStatus::Pending,
            attempts: 0,
            enqueued_at: Utc::now(),
            picked_up_at: None,
            finished_at: None,
            last_error: None,
        };
        inner.jobs.push(job.clone());
        Ok(EnqueueOutcome::Enqueued(job))
    }

    async fn pick_job(
        max_time_since_pickup: chrono::Duration,
        max_attempts: i32,
        state: MemoryState,
    ) -> Result<Option<WorkflowJob>, BackendError> {
        let now = Utc::now();
        let stale_before = now - max_time_since_pickup;
        let is_stale = |job: &WorkflowJob| {
            job.status == JobStatus::Running
                && job.picked_up_at.is_some_and(|t| t <= stale_before)
        };

        let mut inner = lock(&state.inner);
        for job in inner.jobs.iter_mut() {
            if is_stale(job) && job.attempts >= max_attempts {
                tracing::warn!(job_id = %job.job_id, "Failing job after {} deliveries", job.attempts);
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(WORKER_LOST_ERROR.to_string());
            }
        }

        let Some(job) = inner
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending || is_stale(j))
            .min_by_key(|j| j.enqueued_at)
        else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.picked_up_at = Some(now);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn record_job_success(job_id: JobId, state: MemoryState) -> Result<(), BackendError> {
        if let Some(job) = lock(&state.inner).running_job(job_id) {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
            job.last_error = None;
        }
        Ok(())
    }

    async fn record_job_failure(
        job_id: JobId,
        error: &str,
        state: MemoryState,
    ) -> Result<(), BackendError> {
        if let Some(job) = lock(&state.inner).running_job(job_id) {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_job(
        job_id: JobId,
        state: MemoryState,
    ) -> Result<Option<WorkflowJob>, BackendError> {
        Ok(lock(&state.inner)
            .jobs
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned())
    }

    async fn list_jobs(
        dataset_id: DatasetId,
        state: MemoryState,
    ) -> Result<Vec<WorkflowJob>, BackendError> {
        // Jobs are appended in enqueue order.
        Ok(lock(&state.inner)
            .jobs
            .iter()
            .rev()
            .filter(|j| j.dataset_id == dataset_id)
            .cloned()
            .collect())
    }

    async fn clear_jobs(
        dataset_id: DatasetId,
        cleared_by: &str,
        state: MemoryState,
    ) -> Result<Vec<JobId>, BackendError> {
        let now = Utc::now();
        Ok(lock(&state.inner)
            .jobs
            .iter_mut()
            .filter(|j| j.dataset_id == dataset_id && j.status.is_in_flight())
            .map(|job| {
                job.status = JobStatus::Cleared;
                job.finished_at = Some(now);
                job.last_error = Some(format!("Cleared by {cleared_by}"));
                job.job_id
            })
            .collect())
    }
}
