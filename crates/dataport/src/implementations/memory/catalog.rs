use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::lock;
use crate::service::{
    AccessGrant, AccessId, BackendError, Dataset, DatasetId, SubjectType, WarehouseTable,
    catalog::{AccessGrantSource, DatasetCatalog},
};

#[derive(Debug, Default)]
struct Inner {
    datasets: HashMap<DatasetId, Dataset>,
    grants: HashMap<AccessId, AccessGrant>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCatalog {
    pub fn add_dataset(&self, name: &str, warehouse_source: Option<WarehouseTable>) -> Dataset {
        let dataset = Dataset {
            id: DatasetId::new_random(),
            name: name.to_string(),
            warehouse_source,
        };
        lock(&self.inner)
            .datasets
            .insert(dataset.id, dataset.clone());
        dataset
    }

    pub fn rename_dataset(&self, dataset_id: DatasetId, name: &str) {
        if let Some(dataset) = lock(&self.inner).datasets.get_mut(&dataset_id) {
            dataset.name = name.to_string();
        }
    }

    #[must_use]
    pub fn dataset(&self, dataset_id: DatasetId) -> Option<Dataset> {
        lock(&self.inner).datasets.get(&dataset_id).cloned()
    }

    pub fn add_grant(
        &self,
        dataset_id: DatasetId,
        subject: &str,
        subject_type: SubjectType,
    ) -> AccessId {
        let grant = AccessGrant {
            access_id: AccessId::new_random(),
            dataset_id,
            subject: subject.to_string(),
            subject_type,
            revoked: false,
        };
        let access_id = grant.access_id;
        lock(&self.inner).grants.insert(access_id, grant);
        access_id
    }

    pub fn revoke_grant(&self, access_id: AccessId) {
        if let Some(grant) = lock(&self.inner).grants.get_mut(&access_id) {
            grant.revoked = true;
        }
    }
}

#[async_trait::async_trait]
impl DatasetCatalog for MemoryCatalog {
    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>, BackendError> {
        Ok(self.dataset(dataset_id))
    }

    async fn delete_warehouse_source(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        if let Some(dataset) = lock(&self.inner).datasets.get_mut(&dataset_id) {
            dataset.warehouse_source = None;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccessGrantSource for MemoryCatalog {
    async fn get_grant(&self, access_id: AccessId) -> Result<Option<AccessGrant>, BackendError> {
        Ok(lock(&self.inner).grants.get(&access_id).cloned())
    }

    async fn list_active_grants(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Vec<AccessGrant>, BackendError> {
        Ok(lock(&self.inner)
            .grants
            .values()
            .filter(|g| g.dataset_id == dataset_id && !g.revoked)
            .cloned()
            .collect())
    }
}
