use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{BindingModeDB, dbutils::DBErrorHandler};
use crate::service::{
    BackendError, BeginBindingSyncError, BiDatabaseId, BindingMode, BindingModeConflict,
    BindingNotFound, CollectionId, DatasetBinding, DatasetId, PermissionGroupId,
    UpdateBindingError,
};

const BINDING_COLUMNS: &str = "dataset_id, mode, service_account_email, bi_database_id, \
     permission_group_id, collection_id, sync_started, sync_completed, last_error";

#[derive(sqlx::FromRow, Debug)]
struct BindingRow {
    dataset_id: Uuid,
    mode: BindingModeDB,
    service_account_email: String,
    bi_database_id: Option<i64>,
    permission_group_id: Option<i64>,
    collection_id: Option<i64>,
    sync_started: Option<DateTime<Utc>>,
    sync_completed: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<BindingRow> for DatasetBinding {
    fn from(row: BindingRow) -> Self {
        DatasetBinding {
            dataset_id: row.dataset_id.into(),
            mode: row.mode.into(),
            service_account_email: row.service_account_email,
            bi_database_id: row.bi_database_id.map(BiDatabaseId::new),
            permission_group_id: row.permission_group_id.map(PermissionGroupId::new),
            collection_id: row.collection_id.map(CollectionId::new),
            sync_started: row.sync_started,
            sync_completed: row.sync_completed,
            last_error: row.last_error,
        }
    }
}

/// Nullable columns holding ids of BI objects owned by a binding.
#[derive(Debug, Clone, Copy)]
pub(super) enum ResourceColumn {
    BiDatabase,
    PermissionGroup,
    Collection,
}

impl ResourceColumn {
    fn column(self) -> &'static str {
        match self {
            ResourceColumn::BiDatabase => "bi_database_id",
            ResourceColumn::PermissionGroup => "permission_group_id",
            ResourceColumn::Collection => "collection_id",
        }
    }
}

pub(super) async fn get_binding(
    dataset_id: DatasetId,
    pool: &PgPool,
) -> Result<Option<DatasetBinding>, BackendError> {
    let row = sqlx::query_as::<_, BindingRow>(&format!(
        "SELECT {BINDING_COLUMNS} FROM dataset_binding WHERE dataset_id = $1"
    ))
    .bind(*dataset_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to load binding of dataset {dataset_id}"))
    })?;

    Ok(row.map(Into::into))
}

pub(super) async fn list_bindings(
    mode: Option<BindingMode>,
    pool: &PgPool,
) -> Result<Vec<DatasetBinding>, BackendError> {
    let rows = sqlx::query_as::<_, BindingRow>(&format!(
        "SELECT {BINDING_COLUMNS} FROM dataset_binding
        WHERE $1::binding_mode IS NULL OR mode = $1
        ORDER BY dataset_id"
    ))
    .bind(mode.map(BindingModeDB::from))
    .fetch_all(pool)
    .await
    .map_err(|e| e.into_backend_error().append_detail("Failed to list bindings"))?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub(super) async fn begin_binding_sync(
    dataset_id: DatasetId,
    mode: BindingMode,
    service_account_email: &str,
    pool: &PgPool,
) -> Result<DatasetBinding, BeginBindingSyncError> {
    // The conditional upsert leaves a binding of the other mode untouched and returns nothing.
    let row = sqlx::query_as::<_, BindingRow>(&format!(
        r"INSERT INTO dataset_binding (dataset_id, mode, service_account_email, sync_started)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (dataset_id) DO UPDATE SET
            service_account_email = EXCLUDED.service_account_email,
            sync_started = now(),
            sync_completed = NULL,
            last_error = NULL,
            updated_at = now()
        WHERE dataset_binding.mode = EXCLUDED.mode
        RETURNING {BINDING_COLUMNS}"
    ))
    .bind(*dataset_id)
    .bind(BindingModeDB::from(mode))
    .bind(service_account_email)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to start sync of {mode} binding for {dataset_id}"))
    })?;

    if let Some(row) = row {
        return Ok(row.into());
    }

    let existing = get_binding(dataset_id, pool).await?.ok_or_else(|| {
        BackendError::new_unexpected(crate::service::InternalErrorMessage(format!(
            "Binding of dataset {dataset_id} vanished while starting a sync"
        )))
    })?;
    Err(BindingModeConflict::new(dataset_id, existing.mode, mode).into())
}

pub(super) async fn set_resource_id(
    dataset_id: DatasetId,
    mode: BindingMode,
    column: ResourceColumn,
    value: Option<i64>,
    pool: &PgPool,
) -> Result<(), UpdateBindingError> {
    let column_name = column.column();
    let result = sqlx::query(&format!(
        "UPDATE dataset_binding SET {column_name} = $3, updated_at = now()
        WHERE dataset_id = $1 AND mode = $2"
    ))
    .bind(*dataset_id)
    .bind(BindingModeDB::from(mode))
    .bind(value)
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to set {column_name} of binding {dataset_id}"))
    })?;

    if result.rows_affected() == 0 {
        return Err(BindingNotFound::new(dataset_id, Some(mode)).into());
    }
    Ok(())
}

pub(super) async fn complete_binding_sync(
    dataset_id: DatasetId,
    mode: BindingMode,
    pool: &PgPool,
) -> Result<(), UpdateBindingError> {
    let result = sqlx::query(
        r"UPDATE dataset_binding
        SET sync_completed = now(), last_error = NULL, updated_at = now()
        WHERE dataset_id = $1 AND mode = $2",
    )
    .bind(*dataset_id)
    .bind(BindingModeDB::from(mode))
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to complete sync of binding {dataset_id}"))
    })?;

    if result.rows_affected() == 0 {
        return Err(BindingNotFound::new(dataset_id, Some(mode)).into());
    }
    Ok(())
}

pub(super) async fn begin_binding_teardown(
    dataset_id: DatasetId,
    mode: BindingMode,
    pool: &PgPool,
) -> Result<(), UpdateBindingError> {
    let result = sqlx::query(
        r"UPDATE dataset_binding
        SET sync_started = now(), sync_completed = NULL, last_error = NULL, updated_at = now()
        WHERE dataset_id = $1 AND mode = $2",
    )
    .bind(*dataset_id)
    .bind(BindingModeDB::from(mode))
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to start teardown of binding {dataset_id}"))
    })?;

    if result.rows_affected() == 0 {
        return Err(BindingNotFound::new(dataset_id, Some(mode)).into());
    }
    Ok(())
}

pub(super) async fn record_binding_error(
    dataset_id: DatasetId,
    error: &str,
    pool: &PgPool,
) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE dataset_binding SET last_error = $2, updated_at = now() WHERE dataset_id = $1",
    )
    .bind(*dataset_id)
    .bind(error)
    .execute(pool)
    .await
    .map_err(|e| {
        e.into_backend_error()
            .append_detail(format!("Failed to record error on binding {dataset_id}"))
    })?;
    Ok(())
}

pub(super) async fn delete_binding(
    dataset_id: DatasetId,
    mode: BindingMode,
    pool: &PgPool,
) -> Result<bool, BackendError> {
    let result = sqlx::query("DELETE FROM dataset_binding WHERE dataset_id = $1 AND mode = $2")
        .bind(*dataset_id)
        .bind(BindingModeDB::from(mode))
        .execute(pool)
        .await
        .map_err(|e| {
            e.into_backend_error()
                .append_detail(format!("Failed to delete {mode} binding of {dataset_id}"))
        })?;
    Ok(result.rows_affected() > 0)
}
