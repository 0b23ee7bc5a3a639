use std::sync::Arc;

use crate::{
    api::ApiContext,
    implementations::memory::{MemoryGateways, MemoryState, MemoryStore},
    request_metadata::RequestMetadata,
    service::{
        BindingMode, BindingSettings, BindingStore, Dataset, DatasetBinding, DatasetId,
        PermissionGroupId, State, WarehouseTable,
        jobs::instrumented_run,
        orchestrator::{self, BindingStatus},
    },
};

#[cfg(test)]
mod open_binding;
#[cfg(test)]
mod restricted_binding;
#[cfg(all(test, feature = "router"))]
mod router;
#[cfg(test)]
mod syncers;

pub const SHARED_ACCOUNT: &str = "bi-shared@catalog-prod.iam.gserviceaccount.com";
pub const SHARED_KEY: &str = r#"{"type":"service_account","client_email":"bi-shared"}"#;
pub const ACCOUNT_PROJECT: &str = "catalog-prod";
pub const RESTRICTED_ROLE: &str = "projects/catalog-prod/roles/biQueryRunner";
pub const ALL_USERS_GROUP: PermissionGroupId = PermissionGroupId::new(1);

#[must_use]
pub fn test_settings() -> BindingSettings {
    BindingSettings::builder()
        .shared_service_account_email(SHARED_ACCOUNT)
        .shared_service_account_key(SHARED_KEY)
        .all_users_group_id(ALL_USERS_GROUP)
        .service_account_project(ACCOUNT_PROJECT)
        .restricted_project_role(RESTRICTED_ROLE)
        .build()
}

#[must_use]
pub fn random_request_metadata() -> RequestMetadata {
    RequestMetadata::new_random().with_actor("test-user@example.com")
}

/// In-memory store and fakes wired into a [`State`].
#[derive(Debug, Clone)]
pub struct TestContext {
    pub state: State<MemoryStore>,
    pub fakes: MemoryGateways,
}

#[must_use]
pub fn setup() -> TestContext {
    setup_with_settings(test_settings())
}

#[must_use]
pub fn setup_with_settings(settings: BindingSettings) -> TestContext {
    let fakes = MemoryGateways::new(settings.all_users_group_id);
    let state = State {
        store: MemoryState::default(),
        gateways: fakes.gateways(),
        settings: Arc::new(settings),
    };
    TestContext { state, fakes }
}

impl TestContext {
    #[must_use]
    pub fn api_context(&self) -> ApiContext<State<MemoryStore>> {
        ApiContext {
            v1_state: self.state.clone(),
        }
    }

    /// A dataset backed by a table that exists in the warehouse.
    pub fn add_dataset(&self, name: &str) -> (Dataset, WarehouseTable) {
        let table = WarehouseTable {
            project_id: "warehouse-prod".to_string(),
            dataset: "sales".to_string(),
            table: name.to_lowercase().replace(' ', "_"),
        };
        self.fakes.warehouse.add_table(&table);
        let dataset = self.fakes.catalog.add_dataset(name, Some(table.clone()));
        (dataset, table)
    }

    /// Run jobs the way a worker does until the queue is empty. Returns the number of
    /// jobs run.
    pub async fn run_pending_jobs(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = MemoryStore::pick_job(
            self.state.settings.max_time_since_pickup,
            self.state.settings.max_job_attempts,
            self.state.store.clone(),
        )
        .await
        .unwrap()
        {
            instrumented_run::<MemoryStore>(&self.state, &job).await;
            ran += 1;
        }
        ran
    }

    pub async fn binding(&self, dataset_id: DatasetId) -> Option<DatasetBinding> {
        MemoryStore::get_binding(dataset_id, self.state.store.clone())
            .await
            .unwrap()
    }

    pub async fn status(&self, dataset_id: DatasetId, mode: BindingMode) -> BindingStatus {
        orchestrator::get_status(dataset_id, mode, &self.state)
            .await
            .unwrap()
    }

    /// Request a binding and run it to completion.
    pub async fn bind(&self, dataset_id: DatasetId, mode: BindingMode) -> DatasetBinding {
        orchestrator::request_binding(dataset_id, mode, "test-user@example.com", &self.state)
            .await
            .unwrap();
        self.run_pending_jobs().await;
        let status = self.status(dataset_id, mode).await;
        assert!(status.is_completed, "{mode} binding did not complete: {status:?}");
        self.binding(dataset_id).await.unwrap()
    }
}
