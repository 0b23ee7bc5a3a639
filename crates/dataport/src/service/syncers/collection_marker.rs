use std::collections::HashMap;

use serde::Serialize;

use super::SyncFailure;
use crate::service::{
    BindingStore, DatasetId, GatewayError, State,
    binding::{BindingMode, has_marker, with_marker},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMarkerReport {
    pub checked: usize,
    pub repaired: Vec<DatasetId>,
    /// Restricted bindings whose collection is missing or not yet recorded.
    pub missing: Vec<DatasetId>,
    pub failed: Vec<SyncFailure>,
}

/// Re-apply the restricted marker to every restricted collection that lost it.
#[tracing::instrument(skip(state))]
pub async fn sync_collection_markers<B: BindingStore>(
    state: &State<B>,
) -> Result<CollectionMarkerReport, crate::api::ErrorModel> {
    let marker = state.settings.collection_marker.as_str();
    let bindings = B::list_bindings(Some(BindingMode::Restricted), state.store.clone()).await?;
    let collections = state
        .gateways
        .bi
        .list_collections()
        .await?
        .into_iter()
        .map(|c| (c.id, c))
        .collect::<HashMap<_, _>>();

    let mut report = CollectionMarkerReport::default();
    for binding in bindings {
        report.checked += 1;
        let Some(collection) = binding.collection_id.and_then(|id| collections.get(&id)) else {
            tracing::warn!(
                "Collection of restricted binding {} not found",
                binding.dataset_id
            );
            report.missing.push(binding.dataset_id);
            continue;
        };
        if has_marker(&collection.name, marker) {
            continue;
        }

        let new_name = with_marker(&collection.name, marker);
        match state
            .gateways
            .bi
            .update_collection(collection.id, &new_name)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    "Restored marker on collection {} of {}: `{new_name}`",
                    collection.id,
                    binding.dataset_id
                );
                report.repaired.push(binding.dataset_id);
            }
            Err(e) => {
                let e: GatewayError = e.append_detail(format!(
                    "Renaming collection {} to `{new_name}`",
                    collection.id
                ));
                tracing::error!("Failed to restore marker of {}: {e}", binding.dataset_id);
                report.failed.push(SyncFailure {
                    dataset_id: binding.dataset_id,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}
