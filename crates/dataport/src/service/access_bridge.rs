//! Keeps warehouse ACLs and BI group membership in line with access grants.
//!
//! Revocation is soft: the metadata viewer ACL and the BI database survive, so a later
//! grant only re-adds the table ACL.

use super::{
    AccessId, BackendError, BindingStore, DatasetId, DatasetNotFound, GatewayError, GrantNotFound,
    NoWarehouseSource, State,
    binding::BindingMode,
    catalog::{SubjectType, WarehouseTable},
    error::define_transparent_error,
    gateways::GatewayResultExt,
};

define_transparent_error! {
    pub enum AccessBridgeError,
    stack_message: "Error applying access change to binding",
    variants: [
        GrantNotFound,
        DatasetNotFound,
        NoWarehouseSource,
        GatewayError,
        BackendError,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The dataset has no binding, nothing to do.
    NotBound,
    TableAccessEnsured,
    /// Table access ensured and the subject is a member of the dataset's permission group.
    MemberAdded,
    /// Table access ensured. The subject could not be added to the group: it is not a
    /// user, it is unknown to the BI tool, or the group does not exist yet.
    MembershipSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    NotBound,
    /// Other active grants remain, table access is kept.
    GrantsRemain(usize),
    TableAccessRevoked,
}

async fn bound_table<B: BindingStore>(
    dataset_id: DatasetId,
    state: &State<B>,
) -> Result<WarehouseTable, AccessBridgeError> {
    let dataset = state
        .gateways
        .catalog
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| DatasetNotFound::new(dataset_id))?;
    Ok(dataset
        .warehouse_source
        .ok_or_else(|| NoWarehouseSource::new(dataset_id))?)
}

#[tracing::instrument(skip(state))]
pub async fn on_grant<B: BindingStore>(
    dataset_id: DatasetId,
    subject: &str,
    subject_type: SubjectType,
    state: &State<B>,
) -> Result<GrantOutcome, AccessBridgeError> {
    let Some(binding) = B::get_binding(dataset_id, state.store.clone()).await? else {
        return Ok(GrantOutcome::NotBound);
    };
    let table = bound_table::<B>(dataset_id, state).await?;
    let gateways = &state.gateways;

    gateways
        .warehouse
        .grant_table_viewer(&table, &binding.service_account_email)
        .await
        .ok_if_already_exists()
        .map_err(|e| e.append_detail(format!("Granting table viewer on {table}")))?;

    if binding.mode == BindingMode::Open {
        return Ok(GrantOutcome::TableAccessEnsured);
    }

    let Some(group) = binding.permission_group_id else {
        tracing::debug!("Permission group of {dataset_id} not created yet, the running sync adds members");
        return Ok(GrantOutcome::MembershipSkipped);
    };
    if subject_type != SubjectType::User {
        tracing::debug!("Subject `{subject}` is a {subject_type}, not adding to group {group}");
        return Ok(GrantOutcome::MembershipSkipped);
    }

    match gateways
        .bi
        .add_permission_group_member(group, subject)
        .await
        .ok_if_already_exists()
    {
        Ok(_) => Ok(GrantOutcome::MemberAdded),
        Err(e) if e.is_not_found() => {
            tracing::warn!("User `{subject}` is not known to the BI tool, not adding to group {group}");
            Ok(GrantOutcome::MembershipSkipped)
        }
        Err(e) => Err(e.append_detail("Adding grantee to permission group").into()),
    }
}

#[tracing::instrument(skip(state))]
pub async fn on_revoke<B: BindingStore>(
    dataset_id: DatasetId,
    access_id: AccessId,
    state: &State<B>,
) -> Result<RevokeOutcome, AccessBridgeError> {
    let gateways = &state.gateways;
    let grant = gateways
        .grants
        .get_grant(access_id)
        .await?
        .ok_or_else(|| GrantNotFound::new(access_id))?;

    let Some(binding) = B::get_binding(dataset_id, state.store.clone()).await? else {
        return Ok(RevokeOutcome::NotBound);
    };

    if let (BindingMode::Restricted, SubjectType::User, Some(group)) =
        (binding.mode, grant.subject_type, binding.permission_group_id)
    {
        gateways
            .bi
            .remove_permission_group_member(group, &grant.subject)
            .await
            .ok_if_not_found()
            .map_err(|e| e.append_detail("Removing grantee from permission group"))?;
    }

    let remaining = gateways
        .grants
        .list_active_grants(dataset_id)
        .await?
        .into_iter()
        .filter(|g| g.access_id != access_id)
        .count();
    if remaining > 0 {
        return Ok(RevokeOutcome::GrantsRemain(remaining));
    }

    let table = bound_table::<B>(dataset_id, state).await?;
    gateways
        .warehouse
        .revoke_table_viewer(&table, &binding.service_account_email)
        .await
        .ok_if_not_found()
        .map_err(|e| e.append_detail(format!("Revoking table viewer on {table}")))?;
    tracing::info!("Last grant of {dataset_id} revoked, table access removed");
    Ok(RevokeOutcome::TableAccessRevoked)
}
