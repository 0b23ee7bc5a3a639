use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use veil::Redact;

use super::GatewayError;
use crate::service::{BiDatabaseId, CollectionId, PermissionGroupId, catalog::WarehouseTable};

/// Connection settings for a new BI database backed by a single warehouse dataset.
#[derive(Clone, Redact)]
pub struct NewDatabase {
    pub name: String,
    pub table: WarehouseTable,
    #[redact]
    pub service_account_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiDatabase {
    pub id: BiDatabaseId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub description: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGroup {
    pub id: PermissionGroupId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollectionAccess {
    Write,
    Read,
    None,
}

/// Databases each permission group can query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGraph {
    pub revision: i64,
    pub groups: BTreeMap<PermissionGroupId, BTreeSet<BiDatabaseId>>,
}

impl PermissionGraph {
    #[must_use]
    pub fn databases_for(&self, group: PermissionGroupId) -> BTreeSet<BiDatabaseId> {
        self.groups.get(&group).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
pub trait BiToolGateway: std::fmt::Debug + Send + Sync + 'static {
    // ---------------- Databases ----------------
    async fn create_database(&self, database: &NewDatabase) -> Result<BiDatabase, GatewayError>;

    async fn get_database(&self, id: BiDatabaseId) -> Result<Option<BiDatabase>, GatewayError>;

    async fn list_databases(&self) -> Result<Vec<BiDatabase>, GatewayError>;

    async fn delete_database(&self, id: BiDatabaseId) -> Result<(), GatewayError>;

    async fn sync_database_schema(&self, id: BiDatabaseId) -> Result<(), GatewayError>;

    /// Block until the BI tool has synced `table` into the database.
    /// Fails with `Unavailable` once `timeout` has passed.
    async fn wait_for_table(
        &self,
        id: BiDatabaseId,
        table: &str,
        timeout: Duration,
    ) -> Result<(), GatewayError>;

    // ---------------- Collections ----------------
    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Collection, GatewayError>;

    async fn update_collection(
        &self,
        id: CollectionId,
        name: &str,
    ) -> Result<Collection, GatewayError>;

    async fn archive_collection(&self, id: CollectionId) -> Result<(), GatewayError>;

    /// Non-archived collections.
    async fn list_collections(&self) -> Result<Vec<Collection>, GatewayError>;

    // ---------------- Permission groups ----------------
    async fn find_permission_group(
        &self,
        name: &str,
    ) -> Result<Option<PermissionGroup>, GatewayError>;

    async fn create_or_get_permission_group(
        &self,
        name: &str,
    ) -> Result<PermissionGroup, GatewayError>;

    async fn delete_permission_group(&self, id: PermissionGroupId) -> Result<(), GatewayError>;

    /// `user_email` must belong to an existing BI user, otherwise `NotFound`.
    async fn add_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError>;

    async fn remove_permission_group_member(
        &self,
        group: PermissionGroupId,
        user_email: &str,
    ) -> Result<(), GatewayError>;

    async fn set_collection_access(
        &self,
        collection: CollectionId,
        group: PermissionGroupId,
        access: CollectionAccess,
    ) -> Result<(), GatewayError>;

    // ---------------- Data permissions ----------------
    async fn get_permission_graph(&self) -> Result<PermissionGraph, GatewayError>;

    async fn grant_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError>;

    async fn revoke_database_access(
        &self,
        group: PermissionGroupId,
        database: BiDatabaseId,
    ) -> Result<(), GatewayError>;
}
