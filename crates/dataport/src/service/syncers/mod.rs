//! Run-once reconciliation passes, triggered by an external scheduler.
//!
//! A pass holds no per-dataset lock. It may interleave with a running job; all calls are
//! idempotent. A failure on one binding is recorded in the report and the pass continues.

mod collection_marker;
mod missing_datasource;

pub use collection_marker::{CollectionMarkerReport, sync_collection_markers};
pub use missing_datasource::{MissingDatasourceReport, sync_missing_datasources};
use serde::Serialize;

use super::DatasetId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub dataset_id: DatasetId,
    pub error: String,
}
