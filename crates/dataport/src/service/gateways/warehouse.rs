use serde::{Deserialize, Serialize};

use super::GatewayError;
use crate::service::catalog::WarehouseTable;

pub const TABLE_VIEWER_ROLE: &str = "roles/bigquery.dataViewer";
pub const METADATA_VIEWER_ROLE: &str = "roles/bigquery.metadataViewer";

/// A role bound to a service account, either on a warehouse dataset or on a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclEntry {
    pub role: String,
    pub member: String,
}

/// Warehouse-native access control. Members are service account emails.
#[async_trait::async_trait]
pub trait WarehouseGateway: std::fmt::Debug + Send + Sync + 'static {
    async fn grant_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError>;

    /// Returns `NotFound` if the member holds no viewer role on the table.
    async fn revoke_table_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError>;

    async fn grant_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError>;

    async fn revoke_dataset_metadata_viewer(
        &self,
        table: &WarehouseTable,
        member: &str,
    ) -> Result<(), GatewayError>;

    /// ACL of the warehouse dataset containing `table`.
    async fn get_dataset_acl(&self, table: &WarehouseTable) -> Result<Vec<AclEntry>, GatewayError>;

    /// IAM policy of the table. `NotFound` if the table does not exist.
    async fn get_table_policy(&self, table: &WarehouseTable)
    -> Result<Vec<AclEntry>, GatewayError>;

    async fn table_exists(&self, table: &WarehouseTable) -> Result<bool, GatewayError> {
        match self.get_table_policy(table).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
