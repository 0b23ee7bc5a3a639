use std::collections::BTreeSet;

use super::{
    WorkflowError, await_database_ready, create_database, delete_database, find_database,
    load_source, teardown_targets,
};
use crate::service::{
    BiDatabaseId, BindingStore, CollectionId, DatasetId, PermissionGroupId, State,
    binding::{BindingMode, DatasetBinding, ResourceNames, has_marker, with_marker},
    catalog::SubjectType,
    gateways::{
        BiToolGateway, Collection, CollectionAccess, GatewayError, GatewayResultExt,
        IdentityGateway,
    },
};

const MODE: BindingMode = BindingMode::Restricted;

#[tracing::instrument(skip(state))]
#[allow(clippy::too_many_lines)]
pub(super) async fn create<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<(), WorkflowError> {
    let (dataset, table) = load_source::<B>(dataset_id, state).await?;
    let settings = &state.settings;
    let gateways = &state.gateways;
    let names = settings.resource_names(&dataset);
    let account = names.service_account_email.as_str();

    let binding = B::begin_binding_sync(dataset_id, MODE, account, state.store.clone()).await?;

    // 1. Dedicated service account. Key material can only be read when a key is created,
    //    so a key is only issued while the BI database still has to be created.
    ensure_service_account(&*gateways.identity, &names, &settings.service_account_project)
        .await?;
    let existing_database = find_database(&*gateways.bi, binding.bi_database_id, &names).await?;
    let key = if existing_database.is_none() {
        Some(issue_key(&*gateways.identity, account).await?)
    } else {
        None
    };

    // 2. Project role and warehouse ACLs.
    gateways
        .identity
        .grant_project_role(
            &settings.service_account_project,
            &settings.restricted_project_role,
            account,
        )
        .await
        .ok_if_already_exists()
        .map_err(|e| e.append_detail("Granting restricted project role"))?;
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

    // 3. Permission group and the marked collection only that group can write to.
    let group = gateways
        .bi
        .create_or_get_permission_group(&names.group_name)
        .await?;
    B::set_permission_group_id(dataset_id, MODE, Some(group.id), state.store.clone()).await?;

    let collection = ensure_collection(
        &*gateways.bi,
        binding.collection_id,
        &names,
        &settings.collection_marker,
    )
    .await?;
    B::set_collection_id(dataset_id, MODE, Some(collection.id), state.store.clone()).await?;
    gateways
        .bi
        .set_collection_access(collection.id, group.id, CollectionAccess::Write)
        .await?;
    gateways
        .bi
        .set_collection_access(
            collection.id,
            settings.all_users_group_id,
            CollectionAccess::None,
        )
        .await?;

    let grants = gateways.grants.list_active_grants(dataset_id).await?;
    for grant in grants {
        if grant.subject_type != SubjectType::User {
            tracing::debug!(
                "Skipping group membership for {} subject `{}`",
                grant.subject_type,
                grant.subject
            );
            continue;
        }
        match gateways
            .bi
            .add_permission_group_member(group.id, &grant.subject)
            .await
            .ok_if_already_exists()
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "User `{}` is not known to the BI tool, not adding to group {}",
                    grant.subject,
                    group.id
                );
            }
            Err(e) => return Err(e.append_detail("Adding grantee to permission group").into()),
        }
    }

    // 4. BI database connected with the dedicated account, reachable by the group only.
    let database = match existing_database {
        Some(database) => database,
        None => {
            let key = key.ok_or_else(|| {
                GatewayError::unexpected("No service account key issued for the new BI database")
            })?;
            create_database(&*gateways.bi, &names, &table, &key).await?
        }
    };
    B::set_bi_database_id(dataset_id, MODE, Some(database.id), state.store.clone()).await?;
    await_database_ready::<B>(&database, &table, state).await?;

    gateways
        .bi
        .revoke_database_access(settings.all_users_group_id, database.id)
        .await
        .ok_if_not_found()?;
    gateways
        .bi
        .grant_database_access(group.id, database.id)
        .await
        .ok_if_already_exists()?;
    restrict_group_to_database(&*gateways.bi, group.id, database.id).await?;

    // 5.
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
    let settings = &state.settings;
    let gateways = &state.gateways;
    let account = names.service_account_email.as_str();

    delete_database(&*gateways.bi, binding.and_then(|b| b.bi_database_id), &names).await?;

    if let Some(collection) = find_collection(
        &*gateways.bi,
        binding.and_then(|b| b.collection_id),
        &names,
    )
    .await?
    {
        gateways
            .bi
            .archive_collection(collection.id)
            .await
            .ok_if_not_found()?;
    }

    let group_id = match binding.and_then(|b| b.permission_group_id) {
        Some(id) => Some(id),
        None => gateways
            .bi
            .find_permission_group(&names.group_name)
            .await?
            .map(|group| group.id),
    };
    if let Some(group_id) = group_id {
        gateways
            .bi
            .delete_permission_group(group_id)
            .await
            .ok_if_not_found()?;
    }

    if let Some(table) = &table {
        gateways
            .warehouse
            .revoke_table_viewer(table, account)
            .await
            .ok_if_not_found()
            .map_err(|e| e.append_detail(format!("Revoking table viewer on {table}")))?;
        gateways
            .warehouse
            .revoke_dataset_metadata_viewer(table, account)
            .await
            .ok_if_not_found()
            .map_err(|e| e.append_detail(format!("Revoking metadata viewer on {table}")))?;
    } else {
        tracing::warn!("Dataset {dataset_id} has no warehouse source, skipping ACL revocation");
    }

    gateways
        .identity
        .revoke_project_role(
            &settings.service_account_project,
            &settings.restricted_project_role,
            account,
        )
        .await
        .ok_if_not_found()
        .map_err(|e| e.append_detail("Revoking restricted project role"))?;
    gateways
        .identity
        .delete_service_account(account)
        .await
        .ok_if_not_found()
        .map_err(|e| e.append_detail(format!("Deleting service account {account}")))?;
    Ok(())
}

async fn ensure_service_account(
    identity: &dyn IdentityGateway,
    names: &ResourceNames,
    project_id: &str,
) -> Result<(), GatewayError> {
    if identity
        .get_service_account(&names.service_account_email)
        .await?
        .is_some()
    {
        return Ok(());
    }
    identity
        .create_service_account(project_id, &names.service_account_id, &names.group_name)
        .await
        .ok_if_already_exists()
        .map_err(|e| {
            e.append_detail(format!(
                "Creating service account {}",
                names.service_account_id
            ))
        })?;
    Ok(())
}

/// Replace all user-managed keys by a fresh one and return its credential file.
async fn issue_key(identity: &dyn IdentityGateway, account: &str) -> Result<String, GatewayError> {
    for stale in identity
        .list_keys(account)
        .await?
        .into_iter()
        .filter(|key| key.user_managed)
    {
        identity.delete_key(&stale.name).await.ok_if_not_found()?;
    }
    identity
        .create_key(account)
        .await?
        .private_key_data
        .ok_or_else(|| GatewayError::unexpected(format!("New key of {account} has no key data")))
}

/// Collection recorded on the binding, or else the one carrying the dataset's identity key.
async fn find_collection(
    bi: &dyn BiToolGateway,
    recorded: Option<CollectionId>,
    names: &ResourceNames,
) -> Result<Option<Collection>, GatewayError> {
    let collections = bi.list_collections().await?;
    let by_id = recorded.and_then(|id| collections.iter().find(|c| c.id == id).cloned());
    Ok(by_id.or_else(|| {
        collections
            .into_iter()
            .find(|c| c.description.as_deref() == Some(names.collection_description.as_str()))
    }))
}

async fn ensure_collection(
    bi: &dyn BiToolGateway,
    recorded: Option<CollectionId>,
    names: &ResourceNames,
    marker: &str,
) -> Result<Collection, GatewayError> {
    match find_collection(bi, recorded, names).await? {
        Some(collection) if has_marker(&collection.name, marker) => Ok(collection),
        Some(collection) => {
            bi.update_collection(collection.id, &with_marker(&collection.name, marker))
                .await
        }
        None => {
            bi.create_collection(&names.collection_name, &names.collection_description)
                .await
        }
    }
}

/// Revoke every other database from the group and check it reaches exactly `database`.
async fn restrict_group_to_database(
    bi: &dyn BiToolGateway,
    group: PermissionGroupId,
    database: BiDatabaseId,
) -> Result<(), GatewayError> {
    let reachable = bi.get_permission_graph().await?.databases_for(group);
    for other in reachable.iter().filter(|id| **id != database) {
        tracing::info!("Revoking stray database {other} from restricted group {group}");
        bi.revoke_database_access(group, *other)
            .await
            .ok_if_not_found()?;
    }

    let reachable = bi.get_permission_graph().await?.databases_for(group);
    if reachable != BTreeSet::from([database]) {
        return Err(GatewayError::unexpected(format!(
            "Restricted group {group} should reach only database {database}, but reaches {reachable:?}"
        )));
    }
    Ok(())
}
