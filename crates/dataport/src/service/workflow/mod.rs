//! Step sequences executed by workflow jobs.
//!
//! Every step derives the identity of its target before calling out and checks for an
//! existing object first, so a job can be delivered again or re-requested after a
//! failure and resumes where the previous run stopped. Nothing is rolled back.

mod open;
mod restricted;

use super::{
    BackendError, BeginBindingSyncError, BiDatabaseId, BindingModeConflict, BindingNotFound,
    BindingStore, DatasetId, DatasetNotFound, GatewayError, NoWarehouseSource, State,
    UpdateBindingError,
    binding::{BindingMode, DatasetBinding, ResourceNames},
    catalog::{Dataset, WarehouseTable},
    error::define_transparent_error,
    gateways::{BiDatabase, BiToolGateway, GatewayResultExt, NewDatabase},
    jobs::{JobKind, WorkflowJob},
};

define_transparent_error! {
    pub enum WorkflowError,
    stack_message: "Error running workflow step",
    variants: [
        GatewayError,
        BackendError,
        DatasetNotFound,
        NoWarehouseSource,
        BindingModeConflict,
        BindingNotFound,
    ]
}

impl From<BeginBindingSyncError> for WorkflowError {
    fn from(err: BeginBindingSyncError) -> Self {
        match err {
            BeginBindingSyncError::BindingModeConflict(e) => e.into(),
            BeginBindingSyncError::BackendError(e) => e.into(),
        }
    }
}

impl From<UpdateBindingError> for WorkflowError {
    fn from(err: UpdateBindingError) -> Self {
        match err {
            UpdateBindingError::BindingNotFound(e) => e.into(),
            UpdateBindingError::BackendError(e) => e.into(),
        }
    }
}

pub(crate) async fn run_job<B: BindingStore>(
    job: &WorkflowJob,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let dataset_id = job.dataset_id;
    match job.kind {
        JobKind::CreateOpen => open::create::<B>(dataset_id, state).await,
        JobKind::CreateRestricted => restricted::create::<B>(dataset_id, state).await,
        JobKind::DeleteOpen => remove::<B>(dataset_id, BindingMode::Open, state).await,
        JobKind::DeleteRestricted => remove::<B>(dataset_id, BindingMode::Restricted, state).await,
        JobKind::MigrateToOpen => migrate::<B>(dataset_id, BindingMode::Open, state).await,
        JobKind::MigrateToRestricted => {
            migrate::<B>(dataset_id, BindingMode::Restricted, state).await
        }
    }
}

/// Tear down everything a create in `mode` may have produced, then delete the binding.
pub(crate) async fn remove<B: BindingStore>(
    dataset_id: DatasetId,
    mode: BindingMode,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let binding = B::get_binding(dataset_id, state.store.clone()).await?;
    if let Some(binding) = &binding {
        if binding.mode != mode {
            return Err(BindingModeConflict::new(dataset_id, binding.mode, mode).into());
        }
        B::begin_binding_teardown(dataset_id, mode, state.store.clone()).await?;
    }
    teardown::<B>(dataset_id, mode, binding.as_ref(), state).await?;
    if !B::delete_binding(dataset_id, mode, state.store.clone()).await? {
        tracing::debug!("No {mode} binding row to delete for {dataset_id}");
    }
    Ok(())
}

async fn teardown<B: BindingStore>(
    dataset_id: DatasetId,
    mode: BindingMode,
    binding: Option<&DatasetBinding>,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    match mode {
        BindingMode::Open => open::teardown::<B>(dataset_id, binding, state).await,
        BindingMode::Restricted => restricted::teardown::<B>(dataset_id, binding, state).await,
    }
}

async fn migrate<B: BindingStore>(
    dataset_id: DatasetId,
    target: BindingMode,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let binding = B::get_binding(dataset_id, state.store.clone()).await?;
    if let Some(current) = binding.filter(|b| b.mode != target) {
        tracing::info!(
            "Migrating {dataset_id} from {} to {target}: tearing down the current binding",
            current.mode
        );
        B::begin_binding_teardown(dataset_id, current.mode, state.store.clone()).await?;
        teardown::<B>(dataset_id, current.mode, Some(&current), state).await?;
        B::delete_binding(dataset_id, current.mode, state.store.clone()).await?;
    }

    match target {
        BindingMode::Open => open::create::<B>(dataset_id, state).await,
        BindingMode::Restricted => restricted::create::<B>(dataset_id, state).await,
    }
}

/// Dataset and table a create works on. Both must exist.
async fn load_source<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<(Dataset, WarehouseTable), WorkflowError> {
    let dataset = state
        .gateways
        .catalog
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| DatasetNotFound::new(dataset_id))?;
    let table = dataset
        .warehouse_source
        .clone()
        .ok_or_else(|| NoWarehouseSource::new(dataset_id))?;
    Ok((dataset, table))
}

/// Names and table for a teardown. The dataset or its source may already be gone, in
/// which case names that only depend on the id are still correct and the table is `None`.
async fn teardown_targets<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<(ResourceNames, Option<WarehouseTable>), WorkflowError> {
    let dataset = state.gateways.catalog.get_dataset(dataset_id).await?;
    let table = dataset.as_ref().and_then(|d| d.warehouse_source.clone());
    let dataset = dataset.unwrap_or_else(|| Dataset {
        id: dataset_id,
        name: String::new(),
        warehouse_source: None,
    });
    Ok((state.settings.resource_names(&dataset), table))
}

/// Database recorded on the binding, or else the one whose name carries the dataset id.
async fn find_database(
    bi: &dyn BiToolGateway,
    recorded: Option<BiDatabaseId>,
    names: &ResourceNames,
) -> Result<Option<BiDatabase>, GatewayError> {
    if let Some(id) = recorded {
        if let Some(database) = bi.get_database(id).await? {
            return Ok(Some(database));
        }
        tracing::info!("Recorded BI database {id} no longer exists, searching by name");
    }
    Ok(bi
        .list_databases()
        .await?
        .into_iter()
        .find(|database| database.name.ends_with(&names.database_suffix)))
}

async fn create_database(
    bi: &dyn BiToolGateway,
    names: &ResourceNames,
    table: &WarehouseTable,
    service_account_key: &str,
) -> Result<BiDatabase, GatewayError> {
    let request = NewDatabase {
        name: names.database_name.clone(),
        table: table.clone(),
        service_account_key: service_account_key.to_string(),
    };
    match bi.create_database(&request).await {
        Ok(database) => Ok(database),
        Err(e) if e.is_already_exists() => find_database(bi, None, names)
            .await?
            .ok_or_else(|| e.append_detail("BI database exists but was not found by name")),
        Err(e) => Err(e),
    }
}

async fn await_database_ready<B: BindingStore>(
    database: &BiDatabase,
    table: &WarehouseTable,
    state: &State<B>,
) -> Result<(), GatewayError> {
    let bi = &state.gateways.bi;
    bi.sync_database_schema(database.id).await?;
    bi.wait_for_table(database.id, &table.table, state.settings.database_sync_timeout)
        .await
        .map_err(|e| e.append_detail(format!("Waiting for table `{}`", table.table)))
}

async fn delete_database(
    bi: &dyn BiToolGateway,
    recorded: Option<BiDatabaseId>,
    names: &ResourceNames,
) -> Result<(), GatewayError> {
    if let Some(database) = find_database(bi, recorded, names).await? {
        bi.delete_database(database.id)
            .await
            .ok_if_not_found()
            .map_err(|e| e.append_detail(format!("Deleting BI database {}", database.id)))?;
    }
    Ok(())
}
