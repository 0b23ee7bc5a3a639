pub mod bi;
pub mod generic;

pub use bi::{BiDatabaseId, CollectionId, PermissionGroupId};
pub use generic::{AccessId, DatasetId, JobId};
