use serde::Serialize;

use super::SyncFailure;
use crate::service::{
    BindingStore, DatasetBinding, DatasetId, State, workflow::remove, workflow::WorkflowError,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingDatasourceReport {
    pub checked: usize,
    pub removed: Vec<DatasetId>,
    pub failed: Vec<SyncFailure>,
}

/// Remove bindings whose warehouse table no longer exists, as if the binding had been
/// removed through the API, and drop the dataset's warehouse-source row.
#[tracing::instrument(skip(state))]
pub async fn sync_missing_datasources<B: BindingStore>(
    state: &State<B>,
) -> Result<MissingDatasourceReport, crate::api::ErrorModel> {
    let bindings = B::list_bindings(None, state.store.clone()).await?;

    let mut report = MissingDatasourceReport::default();
    for binding in bindings {
        report.checked += 1;
        let dataset_id = binding.dataset_id;
        match collect_if_missing::<B>(&binding, state).await {
            Ok(true) => report.removed.push(dataset_id),
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to collect binding of {dataset_id}: {e}");
                report.failed.push(SyncFailure {
                    dataset_id,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

async fn collect_if_missing<B: BindingStore>(
    binding: &DatasetBinding,
    state: &State<B>,
) -> Result<bool, WorkflowError> {
    let dataset_id = binding.dataset_id;
    let dataset = state.gateways.catalog.get_dataset(dataset_id).await?;
    let table = dataset.and_then(|d| d.warehouse_source);
    let table_exists = match &table {
        Some(table) => state.gateways.warehouse.table_exists(table).await?,
        None => false,
    };
    if table_exists {
        return Ok(false);
    }

    match &table {
        Some(table) => tracing::info!("Warehouse table {table} of {dataset_id} is gone, removing binding"),
        None => tracing::info!("Dataset {dataset_id} has no warehouse source, removing binding"),
    }
    remove::<B>(dataset_id, binding.mode, state).await?;
    state
        .gateways
        .catalog
        .delete_warehouse_source(dataset_id)
        .await?;
    Ok(true)
}
