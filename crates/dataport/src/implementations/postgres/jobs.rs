use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::types::PgInterval};
use uuid::Uuid;

use super::dbutils::DBErrorHandler;
use crate::service::{
    BackendError, BackendErrorType, DatasetId, InternalErrorMessage, JobId,
    jobs::{EnqueueOutcome, JobKind, JobStatus, NewJob, WORKER_LOST_ERROR, WorkflowJob},
};

const JOB_COLUMNS: &str = "job_id, dataset_id, kind, requested_by, status, attempts, \
     enqueued_at, picked_up_at, finished_at, last_error";

/// An enqueue races against the completion of the in-flight job it collided with.
const ENQUEUE_RETRIES: usize = 3;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
enum JobKindDB {
    CreateOpen,
    DeleteOpen,
    CreateRestricted,
    DeleteRestricted,
    MigrateToOpen,
    MigrateToRestricted,
}

impl From<JobKind> for JobKindDB {
    fn from(value: JobKind) -> Self {
        match value {
            JobKind::CreateOpen => JobKindDB::CreateOpen,
            JobKind::DeleteOpen => JobKindDB::DeleteOpen,
            JobKind::CreateRestricted => JobKindDB::CreateRestricted,
            JobKind::DeleteRestricted => JobKindDB::DeleteRestricted,
            JobKind::MigrateToOpen => JobKindDB::MigrateToOpen,
            JobKind::MigrateToRestricted => JobKindDB::MigrateToRestricted,
        }
    }
}

impl From<JobKindDB> for JobKind {
    fn from(value: JobKindDB) -> Self {
        match value {
            JobKindDB::CreateOpen => JobKind::CreateOpen,
            JobKindDB::DeleteOpen => JobKind::DeleteOpen,
            JobKindDB::CreateRestricted => JobKind::CreateRestricted,
            JobKindDB::DeleteRestricted => JobKind::DeleteRestricted,
            JobKindDB::MigrateToOpen => JobKind::MigrateToOpen,
            JobKindDB::MigrateToRestricted => JobKind::MigrateToRestricted,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
enum JobStatusDB {
    Pending,
    Running,
    Completed,
    Failed,
    Cleared,
}

impl From<JobStatusDB> for JobStatus {
    fn from(value: JobStatusDB) -> Self {
        match value {
            JobStatusDB::Pending => JobStatus::Pending,
            JobStatusDB::Running => JobStatus::Running,
            JobStatusDB::Completed => JobStatus::Completed,
            JobStatusDB::Failed => JobStatus::Failed,
            JobStatusDB::Cleared => JobStatus::Cleared,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct JobRow {
    job_id: Uuid,
    dataset_id: Uuid,
    kind: JobKindDB,
    requested_by: String,
    status: JobStatusDB,
    attempts: i32,
    enqueued_at: DateTime<Utc>,
    picked_up_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<JobRow> for WorkflowJob {
    fn from(row: JobRow) -> Self {
        WorkflowJob {
            job_id: row.job_id.into(),
            dataset_id: row.dataset_id.into(),
            kind: row.kind.into(),
            requested_by: row.requested_by,
            status: row.status.into(),
            attempts: row.attempts,
            enqueued_at: row.enqueued_at,
            picked_up_at: row.picked_up_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
        }
    }
}

fn to_interval(duration: chrono::Duration) -> Result<PgInterval, BackendError> {
    let microseconds = duration.num_microseconds().ok_or_else(|| {
        BackendError::new_unexpected(InternalErrorMessage(format!(
            "Invalid max time since pickup: {duration}"
        )))
    })?;
    Ok(PgInterval {
        months: 0,
        days: 0,
        microseconds,
    })
}

/// Insert a pending job. The partial unique index on in-flight jobs makes the
/// "at most one in flight per dataset" check atomic with the insert.
pub(super) async fn enqueue_job(
    job: NewJob,
    pool: &PgPool,
) -> Result<EnqueueOutcome, BackendError> {
    for _ in 0..ENQUEUE_RETRIES {
        let inserted = sqlx::query_as::<_, JobRow>(&format!(
            r"INSERT INTO workflow_job (job_id, dataset_id, kind, requested_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id) WHERE status IN ('pending', 'running') DO NOTHING
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(*JobId::new_random())
        .bind(*job.dataset_id)
        .bind(JobKindDB::from(job.kind))
        .bind(&job.requested_by)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            e.into_backend_error().append_detail(format!(
                "Failed to enqueue `{}` job for dataset {}",
                job.kind, job.dataset_id
            ))
        })?;

        if let Some(row) = inserted {
            return Ok(EnqueueOutcome::Enqueued(row.into()));
        }

        let in_flight = sqlx::query_as::<_, JobRow>(&format!(
            r"SELECT {JOB_COLUMNS} FROM workflow_job
            WHERE dataset_id = $1 AND status IN ('pending', 'running')"
        ))
        .bind(*job.dataset_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            e.into_backend_error().append_detail(format!(
                "Failed to load in-flight job of dataset {}",
                job.dataset_id
            ))
        })?;

        if let Some(row) = in_flight {
            return Ok(EnqueueOutcome::InFlight(row.into()));
        }
        tracing::debug!(
            dataset_id = %job.dataset_id,
            "In-flight job finished while enqueueing, retrying"
        );
    }

    Err(BackendError::new(
        InternalErrorMessage(format!(
            "Could not enqueue job for dataset {} after {ENQUEUE_RETRIES} attempts",
            job.dataset_id
        )),
        BackendErrorType::ConcurrentModification,
    ))
}

#[tracing::instrument(skip(pool))]
pub(super) async fn pick_job(
    max_time_since_pickup: chrono::Duration,
    max_attempts: i32,
    pool: &PgPool,
) -> Result<Option<WorkflowJob>, BackendError> {
    let max_age = to_interval(max_time_since_pickup)?;
    let mut transaction = pool.begin().await.map_err(|e| {
        e.into_backend_error()
            .append_detail("Failed to start transaction to pick a job")
    })?;

    let failed = sqlx::query_scalar::<_, Uuid>(
        r"UPDATE workflow_job
        SET status = 'failed', finished_at = now(), last_error = $3
        WHERE status = 'running'
            AND (now() - picked_up_at) > $1
            AND attempts >= $2
        RETURNING job_id",
    )
    .bind(&max_age)
    .bind(max_attempts)
    .bind(WORKER_LOST_ERROR)
    .fetch_all(&mut *transaction)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail("Failed to fail jobs of lost workers")
    })?;
    for job_id in failed {
        tracing::warn!(%job_id, "Failing job after {max_attempts} deliveries");
    }

    let picked = sqlx::query_as::<_, JobRow>(&format!(
        r"WITH next_job AS (
            SELECT job_id
            FROM workflow_job
            WHERE status = 'pending'
                OR (status = 'running' AND (now() - picked_up_at) > $1)
            ORDER BY enqueued_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE workflow_job j
        SET status = 'running', picked_up_at = now(), attempts = j.attempts + 1
        FROM next_job
        WHERE j.job_id = next_job.job_id
        RETURNING {}",
        qualified_job_columns("j")
    ))
    .bind(&max_age)
    .fetch_optional(&mut *transaction)
    .await
    .map_err(|e| e.into_backend_error().append_detail("Failed to pick a job"))?;

    transaction.commit().await.map_err(|e| {
        e.into_backend_error()
            .append_detail("Failed to commit transaction picking a job")
    })?;

    Ok(picked.map(Into::into))
}

fn qualified_job_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(super) async fn record_job_success(job_id: JobId, pool: &PgPool) -> Result<(), BackendError> {
    sqlx::query(
        r"UPDATE workflow_job
        SET status = 'completed', finished_at = now(), last_error = NULL
        WHERE job_id = $1 AND status = 'running'",
    )
    .bind(*job_id)
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to record success of job {job_id}"))
    })?;
    Ok(())
}

pub(super) async fn record_job_failure(
    job_id: JobId,
    error: &str,
    pool: &PgPool,
) -> Result<(), BackendError> {
    sqlx::query(
        r"UPDATE workflow_job
        SET status = 'failed', finished_at = now(), last_error = $2
        WHERE job_id = $1 AND status = 'running'",
    )
    .bind(*job_id)
    .bind(error)
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to record failure of job {job_id}"))
    })?;
    Ok(())
}

pub(super) async fn get_job(
    job_id: JobId,
    pool: &PgPool,
) -> Result<Option<WorkflowJob>, BackendError> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM workflow_job WHERE job_id = $1"
    ))
    .bind(*job_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to load job {job_id}"))
    })?;
    Ok(row.map(Into::into))
}

pub(super) async fn list_jobs(
    dataset_id: DatasetId,
    pool: &PgPool,
) -> Result<Vec<WorkflowJob>, BackendError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM workflow_job WHERE dataset_id = $1
        ORDER BY enqueued_at DESC, job_id DESC"
    ))
    .bind(*dataset_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to list jobs of dataset {dataset_id}"))
    })?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub(super) async fn clear_jobs(
    dataset_id: DatasetId,
    cleared_by: &str,
    pool: &PgPool,
) -> Result<Vec<JobId>, BackendError> {
    let cleared = sqlx::query_scalar::<_, Uuid>(
        r"UPDATE workflow_job
        SET status = 'cleared', finished_at = now(), last_error = 'Cleared by ' || $2
        WHERE dataset_id = $1 AND status IN ('pending', 'running')
        RETURNING job_id",
    )
    .bind(*dataset_id)
    .bind(cleared_by)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to clear jobs of dataset {dataset_id}"))
    })?;
    Ok(cleared.into_iter().map(JobId::from).collect())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn max_age() -> chrono::Duration {
        chrono::Duration::minutes(30)
    }

    fn new_job(dataset_id: DatasetId, kind: JobKind) -> NewJob {
        NewJob {
            dataset_id,
            kind,
            requested_by: "alice@example.com".to_string(),
        }
    }

    /// Backdate the pickup of a running job, as if its worker vanished an hour ago.
    async fn age_pickup(job_id: JobId, pool: &PgPool) {
        sqlx::query(
            "UPDATE workflow_job SET picked_up_at = now() - interval '1 hour' WHERE job_id = $1",
        )
        .bind(*job_id)
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn test_pick_returns_qualified_columns() {
        let columns = qualified_job_columns("j");
        assert!(columns.starts_with("j.job_id, j.dataset_id"));
        assert!(columns.ends_with("j.last_error"));
    }

    #[test]
    fn test_interval_conversion() {
        let interval = to_interval(chrono::Duration::minutes(30)).unwrap();
        assert_eq!(interval.microseconds, 30 * 60 * 1_000_000);
        assert_eq!(interval.days, 0);
    }

    #[sqlx::test]
    async fn test_enqueue_returns_in_flight_job(pool: PgPool) {
        let dataset_id = DatasetId::new_random();
        let EnqueueOutcome::Enqueued(first) =
            enqueue_job(new_job(dataset_id, JobKind::CreateOpen), &pool)
                .await
                .unwrap()
        else {
            panic!("First job of a dataset must be enqueued");
        };
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.attempts, 0);

        let EnqueueOutcome::InFlight(in_flight) =
            enqueue_job(new_job(dataset_id, JobKind::DeleteOpen), &pool)
                .await
                .unwrap()
        else {
            panic!("Second job must return the pending one");
        };
        assert_eq!(in_flight.job_id, first.job_id);
        assert_eq!(in_flight.kind, JobKind::CreateOpen);

        // Other datasets are independent
        assert!(
            enqueue_job(new_job(DatasetId::new_random(), JobKind::CreateOpen), &pool)
                .await
                .unwrap()
                .was_enqueued()
        );
    }

    #[sqlx::test]
    async fn test_concurrent_enqueue_inserts_one_job(pool: PgPool) {
        let dataset_id = DatasetId::new_random();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.spawn(async move {
                enqueue_job(new_job(dataset_id, JobKind::CreateRestricted), &pool)
                    .await
                    .unwrap()
            });
        }
        let mut outcomes = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            outcomes.push(outcome.unwrap());
        }

        let enqueued = outcomes
            .iter()
            .filter(|outcome| outcome.was_enqueued())
            .collect::<Vec<_>>();
        assert_eq!(enqueued.len(), 1);
        let job_id = enqueued[0].job().job_id;
        assert!(outcomes.iter().all(|outcome| outcome.job().job_id == job_id));
        assert_eq!(list_jobs(dataset_id, &pool).await.unwrap().len(), 1);
    }

    #[sqlx::test]
    async fn test_stale_job_is_redelivered_then_failed(pool: PgPool) {
        let dataset_id = DatasetId::new_random();
        let job = enqueue_job(new_job(dataset_id, JobKind::CreateOpen), &pool)
            .await
            .unwrap()
            .into_job();

        let first = pick_job(max_age(), 2, &pool).await.unwrap().unwrap();
        assert_eq!(first.job_id, job.job_id);
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.attempts, 1);
        assert!(first.picked_up_at.is_some());
        // A job whose worker is still alive is not handed out twice
        assert!(pick_job(max_age(), 2, &pool).await.unwrap().is_none());

        age_pickup(job.job_id, &pool).await;
        let second = pick_job(max_age(), 2, &pool).await.unwrap().unwrap();
        assert_eq!(second.job_id, job.job_id);
        assert_eq!(second.attempts, 2);

        age_pickup(job.job_id, &pool).await;
        assert!(pick_job(max_age(), 2, &pool).await.unwrap().is_none());
        let lost = get_job(job.job_id, &pool).await.unwrap().unwrap();
        assert_eq!(lost.status, JobStatus::Failed);
        assert_eq!(lost.last_error.as_deref(), Some(WORKER_LOST_ERROR));
        assert!(lost.finished_at.is_some());

        // A failed job no longer blocks the dataset
        assert!(
            enqueue_job(new_job(dataset_id, JobKind::CreateOpen), &pool)
                .await
                .unwrap()
                .was_enqueued()
        );
    }

    #[sqlx::test]
    async fn test_pick_oldest_pending_first(pool: PgPool) {
        let older = enqueue_job(new_job(DatasetId::new_random(), JobKind::CreateOpen), &pool)
            .await
            .unwrap()
            .into_job();
        let newer = enqueue_job(new_job(DatasetId::new_random(), JobKind::CreateOpen), &pool)
            .await
            .unwrap()
            .into_job();

        let picked = pick_job(max_age(), 3, &pool).await.unwrap().unwrap();
        assert_eq!(picked.job_id, older.job_id);
        let picked = pick_job(max_age(), 3, &pool).await.unwrap().unwrap();
        assert_eq!(picked.job_id, newer.job_id);
        assert!(pick_job(max_age(), 3, &pool).await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_cleared_job_is_not_overwritten(pool: PgPool) {
        let dataset_id = DatasetId::new_random();
        let job = enqueue_job(new_job(dataset_id, JobKind::CreateRestricted), &pool)
            .await
            .unwrap()
            .into_job();
        let picked = pick_job(max_age(), 3, &pool).await.unwrap().unwrap();

        let cleared = clear_jobs(dataset_id, "admin@example.com", &pool)
            .await
            .unwrap();
        assert_eq!(cleared, vec![job.job_id]);

        // The worker reports back after the job was cleared
        record_job_success(picked.job_id, &pool).await.unwrap();
        record_job_failure(picked.job_id, "Late failure", &pool)
            .await
            .unwrap();

        let stored = get_job(job.job_id, &pool).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cleared);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("Cleared by admin@example.com")
        );
        age_pickup(job.job_id, &pool).await;
        assert!(pick_job(max_age(), 3, &pool).await.unwrap().is_none());
        assert!(
            clear_jobs(dataset_id, "admin@example.com", &pool)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[sqlx::test]
    async fn test_outcomes_are_listed_newest_first(pool: PgPool) {
        let dataset_id = DatasetId::new_random();
        enqueue_job(new_job(dataset_id, JobKind::CreateOpen), &pool)
            .await
            .unwrap();
        let create = pick_job(max_age(), 3, &pool).await.unwrap().unwrap();
        record_job_success(create.job_id, &pool).await.unwrap();

        enqueue_job(new_job(dataset_id, JobKind::DeleteOpen), &pool)
            .await
            .unwrap();
        let delete = pick_job(max_age(), 3, &pool).await.unwrap().unwrap();
        record_job_failure(delete.job_id, "Injected failure", &pool)
            .await
            .unwrap();

        let jobs = list_jobs(dataset_id, &pool).await.unwrap();
        let summary = jobs
            .iter()
            .map(|job| (job.kind, job.status, job.last_error.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (JobKind::DeleteOpen, JobStatus::Failed, Some("Injected failure")),
                (JobKind::CreateOpen, JobStatus::Completed, None),
            ]
        );
        assert!(jobs.iter().all(|job| job.finished_at.is_some()));
        assert!(
            list_jobs(DatasetId::new_random(), &pool)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
