use std::time::Duration;

use serde::{Deserialize, Serialize};
use tryhard::RetryPolicy;

use super::{
    GcpClient, encode,
    policy::{PolicyEdit, edit_policy, get_policy},
    service_account_member,
};
use crate::service::{
    GatewayError, GatewayErrorKind, WarehouseTable,
    gateways::{AclEntry, METADATA_VIEWER_ROLE, TABLE_VIEWER_ROLE, WarehouseGateway},
};

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// BigQuery. Table access is managed through the table IAM policy, metadata access
/// through the access list of the containing dataset.
#[derive(Debug, Clone)]
pub struct GcpWarehouse {
    client: GcpClient,
}

impl GcpWarehouse {
    #[must_use]
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct DatasetResource {
    etag: Option<String>,
    #[serde(default)]
    access: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct DatasetAccessPatch<'a> {
    access: &'a [serde_json::Map<String, serde_json::Value>],
}

fn dataset_url(table: &WarehouseTable) -> String {
    format!(
        "{BIGQUERY_API}/projects/{}/datasets/{}",
        encode(&table.project_id),
        encode(&table.dataset)
    )
}

fn table_url(table: &WarehouseTable) -> String {
    format!("{}/tables/{}", dataset_url(table), encode(&table.table))
}

fn access_entry_matches(
    entry: &serde_json::Map<String, serde_json::Value>,
    role: &str,
    member: &str,
) -> bool {
    entry.get("role").and_then(|v| v.as_str()) == Some(role)
        && entry.get("userByEmail").and_then(|v| v.as_str()) == Some(member)
}

fn access_entry(role: &str, member: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut entry = serde_json::Map::new();
    entry.insert("role".to_string(), role.into());
    entry.insert("userByEmail".to_string(), member.into());
    entry
}

impl GcpWarehouse {
    async fn edit_dataset_access(
        &self,
        table: &WarehouseTable,
        edit: PolicyEdit,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        tryhard::retry_fn(async || self.edit_dataset_access_once(table, edit, role, member).await)
            .retries(4)
            .custom_backoff(|attempt: u32, e: &GatewayError| {
                if e.kind == GatewayErrorKind::Unavailable {
                    RetryPolicy::Delay(Duration::from_millis(200) * 2u32.pow(attempt.min(5)))
                } else {
                    RetryPolicy::Break
                }
            })
            .await
    }

    async fn edit_dataset_access_once(
        &self,
        table: &WarehouseTable,
        edit: PolicyEdit,
        role: &str,
        member: &str,
    ) -> Result<(), GatewayError> {
        let url = dataset_url(table);
        let DatasetResource { etag, mut access } = self.client.get(&url).await?;
        let present = access
            .iter()
            .any(|entry| access_entry_matches(entry, role, member));

        match (edit, present) {
            (PolicyEdit::Add, true) => return Ok(()),
            (PolicyEdit::Remove, false) => {
                return Err(GatewayError::not_found(format!(
                    "{member} does not hold {role} on dataset {}.{}",
                    table.project_id, table.dataset
                )));
            }
            (PolicyEdit::Add, false) => access.push(access_entry(role, member)),
            (PolicyEdit::Remove, true) => {
                access.retain(|entry| !access_entry_matches(entry, role, member));
            }
        }

        self.client
            .patch(&url, &DatasetAccessPatch { access: &access }, etag.as_deref())
            .await
    }
}

#[async_trait::async_trait]
impl WarehouseGateway for GcpWarehouse {
    async fn grant_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        edit_policy(
            &self.client,
            &table_url(table),
            PolicyEdit::Add,
            TABLE_VIEWER_ROLE,
            &service_account_member(member),
        )
        .await
    }

    async fn revoke_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        edit_policy(
            &self.client,
            &table_url(table),
            PolicyEdit::Remove,
            TABLE_VIEWER_ROLE,
            &service_account_member(member),
        )
        .await
    }

    async fn grant_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.edit_dataset_access(table, PolicyEdit::Add, METADATA_VIEWER_ROLE, member)
            .await
    }

    async fn revoke_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError> {
        self.edit_dataset_access(table, PolicyEdit::Remove, METADATA_VIEWER_ROLE, member)
            .await
    }

    async fn get_dataset_acl(&self, table: &WarehouseTable) -> Result<Vec<AclEntry>, GatewayError> {
        let dataset: DatasetResource = self.client.get(&dataset_url(table)).await?;
        Ok(dataset
            .access
            .iter()
            .filter_map(|entry| {
                Some(AclEntry {
                    role: entry.get("role")?.as_str()?.to_string(),
                    member: entry.get("userByEmail")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn get_table_policy(
        &self,
        table: &WarehouseTable,
    ) -> Result<Vec<AclEntry>, GatewayError> {
        let policy = get_policy(&self.client, &table_url(table)).await?;
        Ok(policy
            .entries()
            .map(|(role, member)| AclEntry {
                role: role.to_string(),
                member: member
                    .strip_prefix("serviceAccount:")
                    .unwrap_or(member)
                    .to_string(),
            })
            .collect())
    }
}
