use axum::{Json, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::{
    api::{ApiContext, Result, management::v1::ApiServer},
    request_metadata::RequestMetadata,
    service::{
        BindingMode, BindingStore, DatasetId, EnqueueOutcome, JobId, State, WorkflowJob,
        orchestrator::{self, BindingStatus},
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsResponse {
    pub jobs: Vec<WorkflowJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearJobsResponse {
    /// Jobs that were pending or running and are now cleared.
    pub cleared: Vec<JobId>,
}

impl IntoResponse for ListJobsResponse {
    fn into_response(self) -> axum::response::Response {
        (http::StatusCode::OK, Json(self)).into_response()
    }
}

impl IntoResponse for ClearJobsResponse {
    fn into_response(self) -> axum::response::Response {
        (http::StatusCode::OK, Json(self)).into_response()
    }
}

impl<B: BindingStore> Service<B> for ApiServer<B> {}

#[async_trait::async_trait]
pub trait Service<B: BindingStore> {
    async fn create_binding(
        dataset_id: DatasetId,
        mode: BindingMode,
        context: ApiContext<State<B>>,
        request_metadata: RequestMetadata,
    ) -> Result<EnqueueOutcome> {
        Ok(orchestrator::request_binding(
            dataset_id,
            mode,
            request_metadata.actor(),
            &context.v1_state,
        )
        .await?)
    }

    async fn migrate_binding(
        dataset_id: DatasetId,
        target: BindingMode,
        context: ApiContext<State<B>>,
        request_metadata: RequestMetadata,
    ) -> Result<EnqueueOutcome> {
        Ok(orchestrator::request_migration(
            dataset_id,
            target,
            request_metadata.actor(),
            &context.v1_state,
        )
        .await?)
    }

    async fn delete_binding(
        dataset_id: DatasetId,
        mode: BindingMode,
        context: ApiContext<State<B>>,
        request_metadata: RequestMetadata,
    ) -> Result<EnqueueOutcome> {
        Ok(orchestrator::remove_binding(
            dataset_id,
            mode,
            request_metadata.actor(),
            &context.v1_state,
        )
        .await?)
    }

    async fn get_binding_status(
        dataset_id: DatasetId,
        mode: BindingMode,
        context: ApiContext<State<B>>,
    ) -> Result<BindingStatus> {
        Ok(orchestrator::get_status(dataset_id, mode, &context.v1_state).await?)
    }

    async fn list_jobs(
        dataset_id: DatasetId,
        context: ApiContext<State<B>>,
    ) -> Result<ListJobsResponse> {
        let jobs = orchestrator::list_jobs(dataset_id, &context.v1_state).await?;
        Ok(ListJobsResponse { jobs })
    }

    async fn clear_jobs(
        dataset_id: DatasetId,
        context: ApiContext<State<B>>,
        request_metadata: RequestMetadata,
    ) -> Result<ClearJobsResponse> {
        let cleared = orchestrator::clear_stuck_jobs(
            dataset_id,
            request_metadata.actor(),
            &context.v1_state,
        )
        .await?;
        Ok(ClearJobsResponse { cleared })
    }
}
