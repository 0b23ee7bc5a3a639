//! The binding record and the deterministic names of every external object a binding owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    BiDatabaseId, CollectionId, DatasetId, PermissionGroupId,
    catalog::Dataset,
    jobs::JobKind,
};

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BindingMode {
    Open,
    Restricted,
}

impl BindingMode {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            BindingMode::Open => BindingMode::Restricted,
            BindingMode::Restricted => BindingMode::Open,
        }
    }

    #[must_use]
    pub fn create_kind(self) -> JobKind {
        match self {
            BindingMode::Open => JobKind::CreateOpen,
            BindingMode::Restricted => JobKind::CreateRestricted,
        }
    }

    #[must_use]
    pub fn delete_kind(self) -> JobKind {
        match self {
            BindingMode::Open => JobKind::DeleteOpen,
            BindingMode::Restricted => JobKind::DeleteRestricted,
        }
    }

    /// Kind of the job that moves a binding into `self`.
    #[must_use]
    pub fn migrate_kind(self) -> JobKind {
        match self {
            BindingMode::Open => JobKind::MigrateToOpen,
            BindingMode::Restricted => JobKind::MigrateToRestricted,
        }
    }
}

/// One binding per dataset. Rows are only ever created through
/// [`BindingStore::begin_binding_sync`](super::BindingStore::begin_binding_sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetBinding {
    pub dataset_id: DatasetId,
    pub mode: BindingMode,
    pub service_account_email: String,
    pub bi_database_id: Option<BiDatabaseId>,
    pub permission_group_id: Option<PermissionGroupId>,
    pub collection_id: Option<CollectionId>,
    pub sync_started: Option<DateTime<Utc>>,
    pub sync_completed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DatasetBinding {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync_completed.is_some()
    }
}

/// Names of the external objects owned by a binding.
///
/// Everything here is a pure function of the dataset and the static settings, so a
/// step can compute its target before calling out and re-derive it after a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub service_account_id: String,
    pub service_account_email: String,
    pub database_name: String,
    pub database_suffix: String,
    pub group_name: String,
    pub collection_name: String,
    pub collection_description: String,
}

impl ResourceNames {
    #[must_use]
    pub fn derive(
        dataset: &Dataset,
        service_account_prefix: &str,
        service_account_project: &str,
        collection_marker: &str,
    ) -> Self {
        let service_account_id = restricted_service_account_id(service_account_prefix, dataset.id);
        Self {
            service_account_email: service_account_email(
                &service_account_id,
                service_account_project,
            ),
            service_account_id,
            database_name: format!("{} {}", dataset.name, database_suffix(dataset.id)),
            database_suffix: database_suffix(dataset.id),
            group_name: dataset.id.to_string(),
            collection_name: with_marker(&dataset.name, collection_marker),
            collection_description: collection_description(dataset.id),
        }
    }
}

/// Service account ids are limited to 30 characters, so the dataset uuid is hashed.
#[must_use]
pub fn restricted_service_account_id(prefix: &str, dataset_id: DatasetId) -> String {
    let hash = xxhash_rust::xxh3::xxh3_64(dataset_id.as_bytes());
    format!("{prefix}-{hash:016x}")
}

#[must_use]
pub fn service_account_email(account_id: &str, project_id: &str) -> String {
    format!("{account_id}@{project_id}.iam.gserviceaccount.com")
}

#[must_use]
pub fn database_suffix(dataset_id: DatasetId) -> String {
    format!("({dataset_id})")
}

#[must_use]
pub fn collection_description(dataset_id: DatasetId) -> String {
    format!("dataport:{dataset_id}")
}

#[must_use]
pub fn has_marker(name: &str, marker: &str) -> bool {
    name.trim_end().ends_with(marker)
}

#[must_use]
pub fn with_marker(name: &str, marker: &str) -> String {
    if has_marker(name, marker) {
        name.trim_end().to_string()
    } else {
        format!("{} {marker}", name.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dataset(name: &str) -> Dataset {
        Dataset {
            id: DatasetId::new(uuid::Uuid::parse_str("0190f4f0-5c1e-7c3a-9a53-2b8ec1b1f0aa").unwrap()),
            name: name.to_string(),
            warehouse_source: None,
        }
    }

    #[test]
    fn test_service_account_identity_is_deterministic() {
        let ds = dataset("Sales");
        let a = ResourceNames::derive(&ds, "dp", "restricted-prj", "🔐");
        let b = ResourceNames::derive(&dataset("Renamed sales"), "dp", "restricted-prj", "🔐");
        assert_eq!(a.service_account_email, b.service_account_email);
        assert!(a.service_account_id.starts_with("dp-"));
        assert_eq!(a.service_account_id.len(), 19);
        assert!(
            a.service_account_email
                .ends_with("@restricted-prj.iam.gserviceaccount.com")
        );
    }

    #[test]
    fn test_distinct_datasets_get_distinct_accounts() {
        let a = restricted_service_account_id("dp", DatasetId::new_random());
        let b = restricted_service_account_id("dp", DatasetId::new_random());
        assert_ne!(a, b);
    }

    #[test]
    fn test_resource_names() {
        let ds = dataset("Sales");
        let names = ResourceNames::derive(&ds, "dp", "prj", "🔐");
        assert_eq!(
            names.database_name,
            "Sales (0190f4f0-5c1e-7c3a-9a53-2b8ec1b1f0aa)"
        );
        assert_eq!(names.group_name, "0190f4f0-5c1e-7c3a-9a53-2b8ec1b1f0aa");
        assert_eq!(names.collection_name, "Sales 🔐");
        assert_eq!(
            names.collection_description,
            "dataport:0190f4f0-5c1e-7c3a-9a53-2b8ec1b1f0aa"
        );
    }

    #[test]
    fn test_with_marker_is_idempotent() {
        assert_eq!(with_marker("Sales", "🔐"), "Sales 🔐");
        assert_eq!(with_marker("Sales 🔐", "🔐"), "Sales 🔐");
        assert_eq!(with_marker("Sales 🔐 ", "🔐"), "Sales 🔐");
        assert!(!has_marker("Sales", "🔐"));
    }

    #[test]
    fn test_mode_kinds() {
        assert_eq!(BindingMode::Open.other(), BindingMode::Restricted);
        assert_eq!(BindingMode::Open.migrate_kind(), JobKind::MigrateToOpen);
        assert_eq!(
            BindingMode::Restricted.delete_kind(),
            JobKind::DeleteRestricted
        );
        assert_eq!(BindingMode::Open.to_string(), "open");
    }
}
