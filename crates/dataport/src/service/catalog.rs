//! Read side of the dataset catalog and the access-request system.
//!
//! Both are owned by other services of the platform; dataport only consumes them.

use serde::{Deserialize, Serialize};

use super::{AccessId, BackendError, DatasetId};

/// Fully qualified warehouse table backing a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseTable {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
}

impl std::fmt::Display for WarehouseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset, self.table)
    }
}

impl WarehouseTable {
    /// Two tables share dataset-level ACLs if they live in the same warehouse dataset.
    #[must_use]
    pub fn same_dataset(&self, other: &WarehouseTable) -> bool {
        self.project_id == other.project_id && self.dataset == other.dataset
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub warehouse_source: Option<WarehouseTable>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SubjectType {
    User,
    Group,
    ServiceAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub access_id: AccessId,
    pub dataset_id: DatasetId,
    pub subject: String,
    pub subject_type: SubjectType,
    pub revoked: bool,
}

#[async_trait::async_trait]
pub trait DatasetCatalog: std::fmt::Debug + Send + Sync + 'static {
    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>, BackendError>;

    /// Remove the warehouse-source metadata row of a dataset. Missing rows are not an error.
    async fn delete_warehouse_source(&self, dataset_id: DatasetId) -> Result<(), BackendError>;
}

#[async_trait::async_trait]
pub trait AccessGrantSource: std::fmt::Debug + Send + Sync + 'static {
    async fn get_grant(&self, access_id: AccessId) -> Result<Option<AccessGrant>, BackendError>;

    async fn list_active_grants(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Vec<AccessGrant>, BackendError>;
}
