use super::{
    BackendError, BeginBindingSyncError, BiDatabaseId, CollectionId, DatasetId, JobId,
    PermissionGroupId, UpdateBindingError,
    binding::{BindingMode, DatasetBinding},
    jobs::{EnqueueOutcome, NewJob, WorkflowJob},
};

/// Persistence of bindings and of the workflow job queue.
///
/// Implementations are stateless; all state lives in `Self::State`, which is cloned
/// into every call the same way for request handlers and workers.
#[async_trait::async_trait]
pub trait BindingStore
where
    Self: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    type State: Clone + std::fmt::Debug + Send + Sync + 'static;

    // ---------------- Bindings ----------------
    async fn get_binding(
        dataset_id: DatasetId,
        state: Self::State,
    ) -> Result<Option<DatasetBinding>, BackendError>;

    /// If `mode` is `None`, return bindings of both modes.
    async fn list_bindings(
        mode: Option<BindingMode>,
        state: Self::State,
    ) -> Result<Vec<DatasetBinding>, BackendError>;

    /// Create the binding row if absent and mark a new sync as started.
    ///
    /// Resource ids recorded by an earlier, possibly failed, sync are kept so the
    /// workflow can resume. Fails if the dataset is bound in another mode.
    async fn begin_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        service_account_email: &str,
        state: Self::State,
    ) -> Result<DatasetBinding, BeginBindingSyncError>;

    async fn set_bi_database_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        bi_database_id: Option<BiDatabaseId>,
        state: Self::State,
    ) -> Result<(), UpdateBindingError>;

    async fn set_permission_group_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        permission_group_id: Option<PermissionGroupId>,
        state: Self::State,
    ) -> Result<(), UpdateBindingError>;

    async fn set_collection_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        collection_id: Option<CollectionId>,
        state: Self::State,
    ) -> Result<(), UpdateBindingError>;

    /// Set `sync_completed` and clear `last_error`.
    async fn complete_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: Self::State,
    ) -> Result<(), UpdateBindingError>;

    /// Mark the binding as being torn down: `sync_completed` and `last_error` are
    /// cleared, so a teardown that fails half way is not reported as a synced binding.
    async fn begin_binding_teardown(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: Self::State,
    ) -> Result<(), UpdateBindingError>;

    /// Record the error on the binding of the dataset, whatever its mode.
    /// No-op if the dataset is not bound.
    async fn record_binding_error(
        dataset_id: DatasetId,
        error: &str,
        state: Self::State,
    ) -> Result<(), BackendError>;

    /// Delete the binding if it exists in `mode`. Returns whether a row was deleted.
    async fn delete_binding(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: Self::State,
    ) -> Result<bool, BackendError>;

    // ---------------- Jobs ----------------
    /// Insert a pending job unless another job for the dataset is pending or running,
    /// atomically with that check.
    async fn enqueue_job(job: NewJob, state: Self::State) -> Result<EnqueueOutcome, BackendError>;

    /// Deliver the oldest pending job to a worker and mark it running.
    ///
    /// Running jobs picked up longer than `max_time_since_pickup` ago belong to a lost
    /// worker and are delivered again. A job already delivered `max_attempts` times is
    /// failed with [`WORKER_LOST_ERROR`](super::jobs::WORKER_LOST_ERROR) instead.
    async fn pick_job(
        max_time_since_pickup: chrono::Duration,
        max_attempts: i32,
        state: Self::State,
    ) -> Result<Option<WorkflowJob>, BackendError>;

    /// Only affects running jobs, so a cleared job stays cleared.
    async fn record_job_success(job_id: JobId, state: Self::State) -> Result<(), BackendError>;

    /// Only affects running jobs, so a cleared job stays cleared.
    async fn record_job_failure(
        job_id: JobId,
        error: &str,
        state: Self::State,
    ) -> Result<(), BackendError>;

    async fn get_job(job_id: JobId, state: Self::State)
    -> Result<Option<WorkflowJob>, BackendError>;

    /// Jobs of a dataset, newest first.
    async fn list_jobs(
        dataset_id: DatasetId,
        state: Self::State,
    ) -> Result<Vec<WorkflowJob>, BackendError>;

    /// Mark pending and running jobs of the dataset as cleared. Returns the affected ids.
    async fn clear_jobs(
        dataset_id: DatasetId,
        cleared_by: &str,
        state: Self::State,
    ) -> Result<Vec<JobId>, BackendError>;
}
