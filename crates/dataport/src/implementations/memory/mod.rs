//! In-memory implementations of the store and of every collaborator, for tests.

mod catalog;
mod faults;
mod gateways;
mod store;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use catalog::MemoryCatalog;
pub use faults::FaultInjector;
pub use gateways::{MemoryBiTool, MemoryIdentity, MemoryWarehouse};
pub use store::{MemoryState, MemoryStore};

use crate::service::{Gateways, PermissionGroupId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// All fakes, sharing one fault injector. Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct MemoryGateways {
    pub warehouse: MemoryWarehouse,
    pub identity: MemoryIdentity,
    pub bi: MemoryBiTool,
    pub catalog: MemoryCatalog,
    pub faults: FaultInjector,
}

impl MemoryGateways {
    /// `all_users_group` is created in the BI tool up front, as in a fresh installation.
    #[must_use]
    pub fn new(all_users_group: PermissionGroupId) -> Self {
        let faults = FaultInjector::default();
        Self {
            warehouse: MemoryWarehouse::new(faults.clone()),
            identity: MemoryIdentity::new(faults.clone()),
            bi: MemoryBiTool::new(all_users_group, faults.clone()),
            catalog: MemoryCatalog::default(),
            faults,
        }
    }

    #[must_use]
    pub fn gateways(&self) -> Gateways {
        Gateways {
            warehouse: Arc::new(self.warehouse.clone()),
            identity: Arc::new(self.identity.clone()),
            bi: Arc::new(self.bi.clone()),
            catalog: Arc::new(self.catalog.clone()),
            grants: Arc::new(self.catalog.clone()),
        }
    }
}
