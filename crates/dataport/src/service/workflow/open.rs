use super::{
    WorkflowError, await_database_ready, create_database, delete_database, find_database,
    load_source, teardown_targets,
};
use crate::service::{
    BindingStore, DatasetId, State,
    binding::{BindingMode, DatasetBinding},
    catalog::WarehouseTable,
    gateways::{GatewayError, GatewayResultExt},
};

const MODE: BindingMode = BindingMode::Open;

#[tracing::instrument(skip(state))]
pub(super) async fn create<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let (dataset, table) = load_source::<B>(dataset_id, state).await?;
    let settings = &state.settings;
    let gateways = &state.gateways;
    let names = settings.resource_names(&dataset);
    let account = settings.shared_service_account_email.as_str();

    let binding =
        B::begin_binding_sync(dataset_id, MODE, account, state.store.clone()).await?;

    // 1. Warehouse ACLs for the shared account.
    gateways
        .warehouse
        .grant_dataset_metadata_viewer(&table, account)
        .await
        .ok_if_already_exists()
        .map_err(|e| e.append_detail(format!("Granting metadata viewer on {table}")))?;
    gateways
        .warehouse
        .grant_table_viewer(&table, account)
        .await
        .ok_if_already_exists()
        .map_err(|e| e.append_detail(format!("Granting table viewer on {table}")))?;

    // 2. BI database connected with the shared credentials.
    let database = match find_database(&*gateways.bi, binding.bi_database_id, &names).await? {
        Some(database) => database,
        None => {
            create_database(
                &*gateways.bi,
                &names,
                &table,
                &settings.shared_service_account_key,
            )
            .await?
        }
    };
    B::set_bi_database_id(dataset_id, MODE, Some(database.id), state.store.clone()).await?;
    await_database_ready::<B>(&database, &table, state).await?;

    // 3. The all-users group reaches the database without losing any other database.
    let group = settings.all_users_group_id;
    let before = gateways.bi.get_permission_graph().await?.databases_for(group);
    if !before.contains(&database.id) {
        gateways
            .bi
            .grant_database_access(group, database.id)
            .await
            .ok_if_already_exists()?;
    }
    let after = gateways.bi.get_permission_graph().await?.databases_for(group);
    if !after.contains(&database.id) || !after.is_superset(&before) {
        return Err(GatewayError::unexpected(format!(
            "All-users group {group} should reach {} databases including {}, but reaches {}",
            before.len() + usize::from(!before.contains(&database.id)),
            database.id,
            after.len()
        ))
        .into());
    }

    // 4.
    B::complete_binding_sync(dataset_id, MODE, state.store.clone()).await?;
    Ok(())
}

#[tracing::instrument(skip(binding, state))]
pub(super) async fn teardown<B: BindingStore>(
    dataset_id: DatasetId,
    binding: Option<&DatasetBinding>,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let (names, table) = teardown_targets::<B>(dataset_id, state).await?;
    let gateways = &state.gateways;
    let account = state.settings.shared_service_account_email.as_str();

    delete_database(&*gateways.bi, binding.and_then(|b| b.bi_database_id), &names).await?;

    let Some(table) = table else {
        tracing::warn!("Dataset {dataset_id} has no warehouse source, skipping ACL revocation");
        return Ok(());
    };

    gateways
        .warehouse
        .revoke_table_viewer(&table, account)
        .await
        .ok_if_not_found()
        .map_err(|e| e.append_detail(format!("Revoking table viewer on {table}")))?;

    if metadata_viewer_still_needed::<B>(dataset_id, &table, state).await? {
        tracing::debug!("Keeping metadata viewer on {table}, shared with another open binding");
    } else {
        gateways
            .warehouse
            .revoke_dataset_metadata_viewer(&table, account)
            .await
            .ok_if_not_found()
            .map_err(|e| e.append_detail(format!("Revoking metadata viewer on {table}")))?;
    }
    Ok(())
}

/// The shared account's metadata viewer role is per warehouse dataset, so it stays as
/// long as any other open binding reads from the same warehouse dataset.
async fn metadata_viewer_still_needed<B: BindingStore>(
    dataset_id: DatasetId,
    table: &WarehouseTable,
    state: &State<B>,
) -> Result<bool, WorkflowError> {
    let others = B::list_bindings(Some(MODE), state.store.clone()).await?;
    for other in others.iter().filter(|b| b.dataset_id != dataset_id) {
        let Some(dataset) = state.gateways.catalog.get_dataset(other.dataset_id).await? else {
            continue;
        };
        if dataset
            .warehouse_source
            .is_some_and(|source| source.same_dataset(table))
        {
            return Ok(true);
        }
    }
    Ok(false)
}
