//! Postgres implementation of the [`BindingStore`] and of the catalog read side.

mod bindings;
mod catalog;
pub(crate) mod dbutils;
mod jobs;

use std::str::FromStr;

use anyhow::Context;
pub use catalog::PostgresCatalog;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    CONFIG,
    service::{
        BackendError, BeginBindingSyncError, BiDatabaseId, BindingMode, BindingStore,
        CollectionId, DatasetBinding, DatasetId, JobId, PermissionGroupId, UpdateBindingError,
        jobs::{EnqueueOutcome, NewJob, WorkflowJob},
    },
};

/// Connection pools. Reads of status and listings go to `read_pool`, which may point
/// to a replica. Everything on the job queue goes to `write_pool`.
#[derive(Debug, Clone)]
pub struct ReadWrite {
    pub read_pool: PgPool,
    pub write_pool: PgPool,
}

impl ReadWrite {
    #[must_use]
    pub fn from_pools(read_pool: PgPool, write_pool: PgPool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    /// Connect both pools from [`CONFIG`].
    pub async fn from_config() -> anyhow::Result<Self> {
        let read_pool = get_reader_pool(pool_options(CONFIG.pg_read_pool_connections)).await?;
        let write_pool = get_writer_pool(pool_options(CONFIG.pg_write_pool_connections)).await?;
        Ok(Self::from_pools(read_pool, write_pool))
    }
}

#[must_use]
pub fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(CONFIG.pg_acquire_timeout))
}

/// Connect to the read replica, falling back to the write database.
pub async fn get_reader_pool(pool_opts: PgPoolOptions) -> anyhow::Result<PgPool> {
    let url = CONFIG
        .pg_database_url_read
        .as_deref()
        .or(CONFIG.pg_database_url_write.as_deref())
        .context("Neither pg_database_url_read nor pg_database_url_write is set")?;
    connect(url, pool_opts).await
}

pub async fn get_writer_pool(pool_opts: PgPoolOptions) -> anyhow::Result<PgPool> {
    let url = CONFIG
        .pg_database_url_write
        .as_deref()
        .context("pg_database_url_write is not set")?;
    connect(url, pool_opts).await
}

async fn connect(url: &str, pool_opts: PgPoolOptions) -> anyhow::Result<PgPool> {
    let connect_opts = PgConnectOptions::from_str(url)
        .context("Failed to parse Postgres connection URL")?
        .application_name("dataport");
    pool_opts
        .connect_with(connect_opts)
        .await
        .context("Failed to connect to Postgres")
}

/// Apply the embedded migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to apply database migrations")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostgresBackend;

#[async_trait::async_trait]
impl BindingStore for PostgresBackend {
    type State = ReadWrite;

    async fn get_binding(
        dataset_id: DatasetId,
        state: ReadWrite,
    ) -> Result<Option<DatasetBinding>, BackendError> {
        bindings::get_binding(dataset_id, &state.read_pool).await
    }

    async fn list_bindings(
        mode: Option<BindingMode>,
        state: ReadWrite,
    ) -> Result<Vec<DatasetBinding>, BackendError> {
        bindings::list_bindings(mode, &state.read_pool).await
    }

    async fn begin_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        service_account_email: &str,
        state: ReadWrite,
    ) -> Result<DatasetBinding, BeginBindingSyncError> {
        bindings::begin_binding_sync(dataset_id, mode, service_account_email, &state.write_pool)
            .await
    }

    async fn set_bi_database_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        bi_database_id: Option<BiDatabaseId>,
        state: ReadWrite,
    ) -> Result<(), UpdateBindingError> {
        bindings::set_resource_id(
            dataset_id,
            mode,
            bindings::ResourceColumn::BiDatabase,
            bi_database_id.map(BiDatabaseId::get),
            &state.write_pool,
        )
        .await
    }

    async fn set_permission_group_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        permission_group_id: Option<PermissionGroupId>,
        state: ReadWrite,
    ) -> Result<(), UpdateBindingError> {
        bindings::set_resource_id(
            dataset_id,
            mode,
            bindings::ResourceColumn::PermissionGroup,
            permission_group_id.map(PermissionGroupId::get),
            &state.write_pool,
        )
        .await
    }

    async fn set_collection_id(
        dataset_id: DatasetId,
        mode: BindingMode,
        collection_id: Option<CollectionId>,
        state: ReadWrite,
    ) -> Result<(), UpdateBindingError> {
        bindings::set_resource_id(
            dataset_id,
            mode,
            bindings::ResourceColumn::Collection,
            collection_id.map(CollectionId::get),
            &state.write_pool,
        )
        .await
    }

    async fn complete_binding_sync(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: ReadWrite,
    ) -> Result<(), UpdateBindingError> {
        bindings::complete_binding_sync(dataset_id, mode, &state.write_pool).await
    }

    async fn begin_binding_teardown(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: ReadWrite,
    ) -> Result<(), UpdateBindingError> {
        bindings::begin_binding_teardown(dataset_id, mode, &state.write_pool).await
    }

    async fn record_binding_error(
        dataset_id: DatasetId,
        error: &str,
        state: ReadWrite,
    ) -> Result<(), BackendError> {
        bindings::record_binding_error(dataset_id, error, &state.write_pool).await
    }

    async fn delete_binding(
        dataset_id: DatasetId,
        mode: BindingMode,
        state: ReadWrite,
    ) -> Result<bool, BackendError> {
        bindings::delete_binding(dataset_id, mode, &state.write_pool).await
    }

    async fn enqueue_job(job: NewJob, state: ReadWrite) -> Result<EnqueueOutcome, BackendError> {
        jobs::enqueue_job(job, &state.write_pool).await
    }

    async fn pick_job(
        max_time_since_pickup: chrono::Duration,
        max_attempts: i32,
        state: ReadWrite,
    ) -> Result<Option<WorkflowJob>, BackendError> {
        jobs::pick_job(max_time_since_pickup, max_attempts, &state.write_pool).await
    }

    async fn record_job_success(job_id: JobId, state: ReadWrite) -> Result<(), BackendError> {
        jobs::record_job_success(job_id, &state.write_pool).await
    }

    async fn record_job_failure(
        job_id: JobId,
        error: &str,
        state: ReadWrite,
    ) -> Result<(), BackendError> {
        jobs::record_job_failure(job_id, error, &state.write_pool).await
    }

    async fn get_job(job_id: JobId, state: ReadWrite) -> Result<Option<WorkflowJob>, BackendError> {
        jobs::get_job(job_id, &state.read_pool).await
    }

    async fn list_jobs(
        dataset_id: DatasetId,
        state: ReadWrite,
    ) -> Result<Vec<WorkflowJob>, BackendError> {
        jobs::list_jobs(dataset_id, &state.read_pool).await
    }

    async fn clear_jobs(
        dataset_id: DatasetId,
        cleared_by: &str,
        state: ReadWrite,
    ) -> Result<Vec<JobId>, BackendError> {
        jobs::clear_jobs(dataset_id, cleared_by, &state.write_pool).await
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "binding_mode", rename_all = "snake_case")]
enum BindingModeDB {
    Open,
    Restricted,
}

impl From<BindingMode> for BindingModeDB {
    fn from(value: BindingMode) -> Self {
        match value {
            BindingMode::Open => BindingModeDB::Open,
            BindingMode::Restricted => BindingModeDB::Restricted,
        }
    }
}

impl From<BindingModeDB> for BindingMode {
    fn from(value: BindingModeDB) -> Self {
        match value {
            BindingModeDB::Open => BindingMode::Open,
            BindingModeDB::Restricted => BindingMode::Restricted,
        }
    }
}
