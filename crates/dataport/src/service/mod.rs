pub mod access_bridge;
pub mod binding;
mod binding_store;
pub mod catalog;
pub(crate) mod error;
pub mod gateways;
mod identifier;
pub mod jobs;
pub mod orchestrator;
pub mod syncers;
pub(crate) mod workflow;

use std::{sync::Arc, time::Duration};

pub use binding::{BindingMode, DatasetBinding, ResourceNames};
pub use binding_store::BindingStore;
pub use catalog::{AccessGrant, Dataset, SubjectType, WarehouseTable};
pub use error::{
    BackendError, BackendErrorType, BeginBindingSyncError, BindingModeConflict, BindingNotFound,
    DatabaseIntegrityError, DatasetNotFound, GrantNotFound, InternalErrorMessage,
    NoWarehouseSource, UpdateBindingError,
};
pub use gateways::{GatewayError, GatewayErrorKind, Gateways};
pub use identifier::{
    AccessId, BiDatabaseId, CollectionId, DatasetId, JobId, PermissionGroupId,
};
pub use jobs::{EnqueueOutcome, JobKind, JobStatus, NewJob, WorkflowJob};
use typed_builder::TypedBuilder;
use veil::Redact;

pub use crate::api::ErrorModel;
use crate::{DynAppConfig, api::ThreadSafe as ServiceState};

// ---------------- State ----------------
#[derive(Clone, Debug)]
pub struct State<B: BindingStore> {
    pub store: B::State,
    pub gateways: Gateways,
    pub settings: Arc<BindingSettings>,
}

impl<B: BindingStore> ServiceState for State<B> {}

/// Static inputs of the workflows: shared open-mode credentials, the all-users group
/// and queue limits. Injected at construction, never read from globals by the workflows.
#[derive(Clone, Redact, TypedBuilder)]
pub struct BindingSettings {
    #[builder(setter(into))]
    pub shared_service_account_email: String,
    #[redact]
    #[builder(setter(into))]
    pub shared_service_account_key: String,
    pub all_users_group_id: PermissionGroupId,
    /// Project hosting the per-dataset service accounts.
    #[builder(setter(into))]
    pub service_account_project: String,
    #[builder(setter(into), default = "dp".to_string())]
    pub service_account_prefix: String,
    /// Custom role granted on `service_account_project` to restricted accounts.
    #[builder(setter(into))]
    pub restricted_project_role: String,
    #[builder(setter(into), default = "🔐".to_string())]
    pub collection_marker: String,
    #[builder(default = Duration::from_secs(300))]
    pub database_sync_timeout: Duration,
    #[builder(default = chrono::Duration::minutes(30))]
    pub max_time_since_pickup: chrono::Duration,
    #[builder(default = 3)]
    pub max_job_attempts: i32,
}

impl BindingSettings {
    #[must_use]
    pub fn from_config(config: &DynAppConfig) -> Self {
        Self::builder()
            .shared_service_account_email(config.open.service_account_email.clone())
            .shared_service_account_key(config.open.service_account_key.clone())
            .all_users_group_id(PermissionGroupId::new(config.open.all_users_group_id))
            .service_account_project(config.gcp.project_id.clone())
            .service_account_prefix(config.gcp.service_account_prefix.clone())
            .restricted_project_role(config.gcp.restricted_project_role.clone())
            .collection_marker(config.bi.restricted_collection_marker.clone())
            .database_sync_timeout(config.bi.database_sync_timeout())
            .max_time_since_pickup(config.max_time_since_pickup())
            .max_job_attempts(config.max_job_attempts)
            .build()
    }

    #[must_use]
    pub fn resource_names(&self, dataset: &Dataset) -> ResourceNames {
        ResourceNames::derive(
            dataset,
            &self.service_account_prefix,
            &self.service_account_project,
            &self.collection_marker,
        )
    }
}
