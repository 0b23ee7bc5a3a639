//! Entry points used by the HTTP surface. Validation happens synchronously here; all
//! external work is deferred to a workflow job.

use serde::{Deserialize, Serialize};

use super::{
    BackendError, BindingModeConflict, BindingNotFound, BindingStore, DatasetId, DatasetNotFound,
    JobId, NoWarehouseSource, State,
    binding::BindingMode,
    error::define_transparent_error,
    jobs::{EnqueueOutcome, JobKind, JobStatus, NewJob, WorkflowJob},
};

define_transparent_error! {
    pub enum RequestBindingError,
    stack_message: "Error requesting binding",
    variants: [
        DatasetNotFound,
        NoWarehouseSource,
        BindingModeConflict,
        BackendError,
    ]
}

define_transparent_error! {
    pub enum RequestMigrationError,
    stack_message: "Error requesting binding migration",
    variants: [
        BindingNotFound,
        DatasetNotFound,
        NoWarehouseSource,
        BackendError,
    ]
}

define_transparent_error! {
    pub enum RemoveBindingError,
    stack_message: "Error requesting binding removal",
    variants: [
        BindingModeConflict,
        BackendError,
    ]
}

define_transparent_error! {
    pub enum GetStatusError,
    stack_message: "Error reading binding status",
    variants: [
        BindingNotFound,
        BackendError,
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    pub is_completed: bool,
    pub has_failed: bool,
    pub error: Option<String>,
}

async fn validate_source<B, E>(dataset_id: DatasetId, state: &State<B>) -> Result<(), E>
where
    B: BindingStore,
    E: From<DatasetNotFound> + From<NoWarehouseSource> + From<BackendError>,
{
    let dataset = state
        .gateways
        .catalog
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| DatasetNotFound::new(dataset_id))?;
    if dataset.warehouse_source.is_none() {
        return Err(NoWarehouseSource::new(dataset_id).into());
    }
    Ok(())
}

async fn enqueue<B: BindingStore>(
    dataset_id: DatasetId,
    kind: JobKind,
    requested_by: &str,
    state: &State<B>,
) -> Result<EnqueueOutcome, BackendError> {
    let outcome = B::enqueue_job(
        NewJob {
            dataset_id,
            kind,
            requested_by: requested_by.to_string(),
        },
        state.store.clone(),
    )
    .await?;
    match &outcome {
        EnqueueOutcome::Enqueued(job) => {
            tracing::info!(job_id = %job.job_id, "Enqueued `{kind}` for {dataset_id}");
        }
        EnqueueOutcome::InFlight(job) => tracing::info!(
            job_id = %job.job_id,
            "Not enqueuing `{kind}` for {dataset_id}: `{}` is already {}",
            job.kind,
            job.status
        ),
    }
    Ok(outcome)
}

/// Bind a dataset in `mode`. Returns the in-flight job if one exists for the dataset.
#[tracing::instrument(skip(state))]
pub async fn request_binding<B: BindingStore>(
    dataset_id: DatasetId,
    mode: BindingMode,
    requested_by: &str,
    state: &State<B>,
) -> Result<EnqueueOutcome, RequestBindingError> {
    validate_source::<B, RequestBindingError>(dataset_id, state).await?;

    if let Some(binding) = B::get_binding(dataset_id, state.store.clone()).await? {
        if binding.mode != mode {
            return Err(BindingModeConflict::new(dataset_id, binding.mode, mode).into());
        }
    }

    Ok(enqueue::<B>(dataset_id, mode.create_kind(), requested_by, state).await?)
}

/// Switch an existing binding to `target`. Re-requesting a migration whose target is
/// already the current mode resumes it.
#[tracing::instrument(skip(state))]
pub async fn request_migration<B: BindingStore>(
    dataset_id: DatasetId,
    target: BindingMode,
    requested_by: &str,
    state: &State<B>,
) -> Result<EnqueueOutcome, RequestMigrationError> {
    if B::get_binding(dataset_id, state.store.clone())
        .await?
        .is_none()
    {
        return Err(BindingNotFound::new(dataset_id, None).into());
    }

    validate_source::<B, RequestMigrationError>(dataset_id, state).await?;

    Ok(enqueue::<B>(dataset_id, target.migrate_kind(), requested_by, state).await?)
}

/// Enqueue the teardown of a binding. A missing row is not an error, since a failed
/// create may still have produced external resources.
#[tracing::instrument(skip(state))]
pub async fn remove_binding<B: BindingStore>(
    dataset_id: DatasetId,
    mode: BindingMode,
    requested_by: &str,
    state: &State<B>,
) -> Result<EnqueueOutcome, RemoveBindingError> {
    if let Some(binding) = B::get_binding(dataset_id, state.store.clone()).await? {
        if binding.mode != mode {
            return Err(BindingModeConflict::new(dataset_id, binding.mode, mode).into());
        }
    }
    Ok(enqueue::<B>(dataset_id, mode.delete_kind(), requested_by, state).await?)
}

/// Projection of the binding and the latest job for the mode. Never calls out.
///
/// Once a delete of the mode has completed, the status stays completed until the next
/// request for that mode.
pub async fn get_status<B: BindingStore>(
    dataset_id: DatasetId,
    mode: BindingMode,
    state: &State<B>,
) -> Result<BindingStatus, GetStatusError> {
    let binding = B::get_binding(dataset_id, state.store.clone())
        .await?
        .filter(|b| b.mode == mode);
    let jobs = B::list_jobs(dataset_id, state.store.clone()).await?;
    let latest = jobs.iter().find(|job| job.kind.mode() == mode);

    if binding.is_none() && latest.is_none() {
        return Err(BindingNotFound::new(dataset_id, Some(mode)).into());
    }

    let in_flight = latest.is_some_and(|job| job.status.is_in_flight());
    let job_failed = latest.filter(|job| job.status == JobStatus::Failed);
    let binding_failed = binding
        .as_ref()
        .filter(|b| !b.is_synced() && b.last_error.is_some());

    // A completed delete is terminal as well, there is no binding left to report on.
    let deleted = binding.is_none()
        && latest.is_some_and(|job| job.kind.is_delete() && job.status == JobStatus::Completed);
    let is_completed =
        !in_flight && (deleted || binding.as_ref().is_some_and(|b| b.is_synced()));
    let has_failed = !in_flight && (job_failed.is_some() || binding_failed.is_some());
    let error = if has_failed {
        job_failed
            .and_then(|job| job.last_error.clone())
            .or_else(|| binding_failed.and_then(|b| b.last_error.clone()))
    } else {
        None
    };

    Ok(BindingStatus {
        is_completed,
        has_failed,
        error,
    })
}

/// Mark every pending or running job of the dataset as cleared. External resources
/// created by a cleared job are left in place and reused by the next create.
#[tracing::instrument(skip(state))]
pub async fn clear_stuck_jobs<B: BindingStore>(
    dataset_id: DatasetId,
    requested_by: &str,
    state: &State<B>,
) -> Result<Vec<JobId>, BackendError> {
    let cleared = B::clear_jobs(dataset_id, requested_by, state.store.clone()).await?;
    if !cleared.is_empty() {
        tracing::info!("Cleared {} jobs of {dataset_id}", cleared.len());
    }
    Ok(cleared)
}

pub async fn list_jobs<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<Vec<WorkflowJob>, BackendError> {
    B::list_jobs(dataset_id, state.store.clone()).await
}
