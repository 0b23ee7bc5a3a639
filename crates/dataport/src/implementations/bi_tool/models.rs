//! Wire format of the BI tool's REST API.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::service::{
    BiDatabaseId, CollectionId, PermissionGroupId,
    gateways::{BiDatabase, Collection, CollectionAccess, PermissionGroup},
};

pub(super) const BIGQUERY_ENGINE: &str = "bigquery-cloud-sdk";

#[derive(Debug, Serialize)]
pub(super) struct SessionRequest<'a> {
    pub(super) username: &'a str,
    pub(super) password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct SessionResponse {
    pub(super) id: String,
}

#[derive(Serialize)]
pub(super) struct CreateDatabaseRequest<'a> {
    pub(super) engine: &'static str,
    pub(super) name: &'a str,
    pub(super) details: BigQueryDetails<'a>,
    pub(super) is_full_sync: bool,
}

#[derive(Serialize)]
pub(super) struct BigQueryDetails<'a> {
    #[serde(rename = "project-id")]
    pub(super) project_id: &'a str,
    #[serde(rename = "service-account-json")]
    pub(super) service_account_json: &'a str,
    #[serde(rename = "dataset-filters-type")]
    pub(super) dataset_filters_type: &'static str,
    #[serde(rename = "dataset-filters-patterns")]
    pub(super) dataset_filters_patterns: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct DatabaseResource {
    pub(super) id: i64,
    pub(super) name: String,
}

impl From<DatabaseResource> for BiDatabase {
    fn from(value: DatabaseResource) -> Self {
        BiDatabase {
            id: BiDatabaseId::new(value.id),
            name: value.name,
        }
    }
}

/// `GET /api/database` wraps the list in `data` on recent versions.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum DatabaseList {
    Wrapped { data: Vec<DatabaseResource> },
    Plain(Vec<DatabaseResource>),
}

impl DatabaseList {
    pub(super) fn into_vec(self) -> Vec<DatabaseResource> {
        match self {
            DatabaseList::Wrapped { data } | DatabaseList::Plain(data) => data,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct DatabaseMetadata {
    #[serde(default)]
    pub(super) tables: Vec<TableResource>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TableResource {
    pub(super) name: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateCollectionRequest<'a> {
    pub(super) name: &'a str,
    pub(super) description: &'a str,
}

#[derive(Debug, Serialize)]
pub(super) struct UpdateCollectionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) archived: Option<bool>,
}

/// The root collection has the id `"root"`, every other one a number.
#[derive(Debug, Deserialize)]
pub(super) struct CollectionResource {
    pub(super) id: serde_json::Value,
    pub(super) name: String,
    #[serde(default)]
    pub(super) description: Option<String>,
    #[serde(default)]
    pub(super) archived: bool,
}

impl CollectionResource {
    pub(super) fn into_collection(self) -> Option<Collection> {
        Some(Collection {
            id: CollectionId::new(self.id.as_i64()?),
            name: self.name,
            description: self.description,
            archived: self.archived,
        })
    }
}

#[derive(Debug, Serialize)]
pub(super) struct CreateGroupRequest<'a> {
    pub(super) name: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct GroupResource {
    pub(super) id: i64,
    pub(super) name: String,
}

impl From<GroupResource> for PermissionGroup {
    fn from(value: GroupResource) -> Self {
        PermissionGroup {
            id: PermissionGroupId::new(value.id),
            name: value.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct UserList {
    #[serde(default)]
    pub(super) data: Vec<UserResource>,
}

#[derive(Debug, Deserialize)]
pub(super) struct UserResource {
    pub(super) id: i64,
    pub(super) email: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateMembershipRequest {
    pub(super) group_id: i64,
    pub(super) user_id: i64,
}

/// `GET /api/permissions/membership`: user id to its memberships.
pub(super) type MembershipMap = HashMap<String, Vec<MembershipResource>>;

#[derive(Debug, Deserialize)]
pub(super) struct MembershipResource {
    pub(super) membership_id: i64,
    pub(super) group_id: i64,
}

/// Collection permission graph. Keys are ids rendered as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct CollectionGraph {
    pub(super) revision: i64,
    pub(super) groups: BTreeMap<String, BTreeMap<String, CollectionAccess>>,
}

/// Data permission graph. Per-database permissions are kept opaque and only
/// interpreted by [`grants_query_access`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct DataGraph {
    pub(super) revision: i64,
    pub(super) groups: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Whether a per-database permission entry lets the group run queries.
pub(super) fn grants_query_access(permissions: &serde_json::Value) -> bool {
    if let Some(create) = permissions.get("create-queries").and_then(|v| v.as_str()) {
        return create != "no";
    }
    if let Some(view) = permissions.get("view-data").and_then(|v| v.as_str()) {
        return view == "unrestricted";
    }
    permissions
        .get("data")
        .and_then(|d| d.get("schemas"))
        .and_then(|s| s.as_str())
        == Some("all")
}

pub(super) fn granted_permissions() -> serde_json::Value {
    serde_json::json!({
        "view-data": "unrestricted",
        "create-queries": "query-builder-and-native",
    })
}

pub(super) fn revoked_permissions() -> serde_json::Value {
    serde_json::json!({
        "view-data": "blocked",
        "create-queries": "no",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_access_formats() {
        assert!(grants_query_access(&granted_permissions()));
        assert!(!grants_query_access(&revoked_permissions()));
        assert!(grants_query_access(
            &serde_json::json!({"data": {"schemas": "all", "native": "write"}})
        ));
        assert!(!grants_query_access(&serde_json::json!({"data": {"schemas": "none"}})));
    }

    #[test]
    fn test_root_collection_is_skipped() {
        let collections: Vec<CollectionResource> = serde_json::from_str(
            r#"[{"id": "root", "name": "Our analytics"},
                {"id": 12, "name": "Orders 🔐", "description": "dataport:abc", "archived": false}]"#,
        )
        .unwrap();
        let collections = collections
            .into_iter()
            .filter_map(CollectionResource::into_collection)
            .collect::<Vec<_>>();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].id, CollectionId::new(12));
    }

    #[test]
    fn test_database_list_formats() {
        let wrapped: DatabaseList =
            serde_json::from_str(r#"{"data": [{"id": 1, "name": "a"}], "total": 1}"#).unwrap();
        assert_eq!(wrapped.into_vec().len(), 1);
        let plain: DatabaseList = serde_json::from_str(r#"[{"id": 1, "name": "a"}]"#).unwrap();
        assert_eq!(plain.into_vec().len(), 1);
    }
}
