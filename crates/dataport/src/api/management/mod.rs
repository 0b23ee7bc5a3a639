pub mod v1 {
    pub mod access;
    pub mod bindings;

    use std::marker::PhantomData;

    use access::{AccessChangeResponse, AccessService as _, GrantAccessRequest};
    use axum::{
        Extension, Json, Router,
        extract::{Path, State as AxumState},
        routing::{delete, post},
    };
    use bindings::{ClearJobsResponse, ListJobsResponse, Service as _};
    use http::StatusCode;

    use crate::{
        api::{ApiContext, Result},
        request_metadata::RequestMetadata,
        service::{
            AccessId, BindingMode, BindingStore, DatasetId, State, orchestrator::BindingStatus,
        },
    };

    #[derive(Clone, Debug)]
    pub struct ApiServer<B: BindingStore> {
        store: PhantomData<B>,
    }

    /// Expose a dataset in the BI tool through the shared identity
    async fn create_open_binding<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::create_binding(dataset_id, BindingMode::Open, api_context, metadata)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn get_open_binding_status<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
    ) -> Result<Json<BindingStatus>> {
        ApiServer::<B>::get_binding_status(dataset_id, BindingMode::Open, api_context)
            .await
            .map(Json)
    }

    async fn delete_open_binding<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::delete_binding(dataset_id, BindingMode::Open, api_context, metadata)
            .await
            .map(|_| StatusCode::NO_CONTENT)
    }

    /// Expose a dataset in the BI tool through a dedicated identity, permission group
    /// and collection
    async fn create_restricted_binding<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::create_binding(dataset_id, BindingMode::Restricted, api_context, metadata)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn get_restricted_binding_status<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
    ) -> Result<Json<BindingStatus>> {
        ApiServer::<B>::get_binding_status(dataset_id, BindingMode::Restricted, api_context)
            .await
            .map(Json)
    }

    async fn delete_restricted_binding<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::delete_binding(dataset_id, BindingMode::Restricted, api_context, metadata)
            .await
            .map(|_| StatusCode::NO_CONTENT)
    }

    /// Move a restricted binding to open mode
    async fn migrate_to_open<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::migrate_binding(dataset_id, BindingMode::Open, api_context, metadata)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// Move an open binding to restricted mode
    async fn migrate_to_restricted<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<StatusCode> {
        ApiServer::<B>::migrate_binding(dataset_id, BindingMode::Restricted, api_context, metadata)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// List workflow jobs of a dataset, most recent first
    async fn list_jobs<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
    ) -> Result<ListJobsResponse> {
        ApiServer::<B>::list_jobs(dataset_id, api_context).await
    }

    /// Clear pending and running jobs of a dataset
    ///
    /// External resources are not touched. A subsequent create request resumes from
    /// whatever the cleared job left behind.
    async fn clear_jobs<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Extension(metadata): Extension<RequestMetadata>,
    ) -> Result<ClearJobsResponse> {
        ApiServer::<B>::clear_jobs(dataset_id, api_context, metadata).await
    }

    async fn grant_access<B: BindingStore>(
        Path(dataset_id): Path<DatasetId>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
        Json(request): Json<GrantAccessRequest>,
    ) -> Result<AccessChangeResponse> {
        ApiServer::<B>::grant_access(dataset_id, request, api_context).await
    }

    async fn revoke_access<B: BindingStore>(
        Path((dataset_id, access_id)): Path<(DatasetId, AccessId)>,
        AxumState(api_context): AxumState<ApiContext<State<B>>>,
    ) -> Result<AccessChangeResponse> {
        ApiServer::<B>::revoke_access(dataset_id, access_id, api_context).await
    }

    impl<B: BindingStore> ApiServer<B> {
        pub fn new_v1_router() -> Router<ApiContext<State<B>>> {
            Router::new()
                // Open mode
                .route(
                    "/datasets/{dataset_id}/bigquery_open",
                    post(create_open_binding::<B>)
                        .get(get_open_binding_status::<B>)
                        .delete(delete_open_binding::<B>),
                )
                // Restricted mode
                .route(
                    "/datasets/{dataset_id}/bigquery_restricted",
                    post(create_restricted_binding::<B>)
                        .get(get_restricted_binding_status::<B>)
                        .delete(delete_restricted_binding::<B>),
                )
                // Migrations. `bigquery_open_restricted` switches a restricted binding to open.
                .route(
                    "/datasets/{dataset_id}/bigquery_open_restricted",
                    post(migrate_to_open::<B>),
                )
                .route(
                    "/datasets/{dataset_id}/bigquery_restricted_open",
                    post(migrate_to_restricted::<B>),
                )
                // Job queue
                .route(
                    "/datasets/{dataset_id}/bigquery_jobs",
                    delete(clear_jobs::<B>).get(list_jobs::<B>),
                )
                // Access-request hooks
                .route("/datasets/{dataset_id}/access", post(grant_access::<B>))
                .route(
                    "/datasets/{dataset_id}/access/{access_id}",
                    delete(revoke_access::<B>),
                )
        }
    }
}
