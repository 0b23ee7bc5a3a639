use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt as _;
use pretty_assertions::assert_eq;
use tower::ServiceExt as _;

use crate::{
    X_ACTOR_HEADER_NAME,
    api::router::{RouterArgs, new_full_router},
    implementations::memory::MemoryStore,
    service::{BindingMode, SubjectType, orchestrator},
    tests::{TestContext, setup},
};

fn router(ctx: &TestContext) -> Router {
    new_full_router::<MemoryStore>(RouterArgs {
        state: ctx.api_context(),
    })
}

async fn send(
    ctx: &TestContext,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(X_ACTOR_HEADER_NAME, "alice@example.com");
    let request = match body {
        Some(body) => request
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router(ctx).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    // Extractor rejections answer in plain text
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

#[tokio::test]
async fn test_health() {
    let ctx = setup();
    let (status, body) = send(&ctx, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "ok"}));
}

#[tokio::test]
async fn test_create_and_poll_open_binding() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let uri = format!("/management/v1/datasets/{}/bigquery_open", dataset.id);

    let (status, _) = send(&ctx, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // A second request while the job is pending is accepted as well
    let (status, _) = send(&ctx, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&ctx, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!({"isCompleted": false, "hasFailed": false, "error": null})
    );

    ctx.run_pending_jobs().await;
    let (_, body) = send(&ctx, Method::GET, &uri, None).await;
    assert_eq!(body["isCompleted"], true);

    let jobs = orchestrator::list_jobs(dataset.id, &ctx.state).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].requested_by, "alice@example.com");
}

#[tokio::test]
async fn test_invalid_dataset_id_is_bad_request() {
    let ctx = setup();
    let (status, body) = send(
        &ctx,
        Method::POST,
        "/management/v1/datasets/not-a-uuid/bigquery_restricted",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body.as_str().unwrap().contains("Provided DatasetId is not a valid UUID"),
        "{body}"
    );

    let (dataset, _) = ctx.add_dataset("Orders");
    let (status, _) = send(
        &ctx,
        Method::DELETE,
        &format!("/management/v1/datasets/{}/access/42", dataset.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_binding_status_is_not_found() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let (status, _) = send(
        &ctx,
        Method::GET,
        &format!("/management/v1/datasets/{}/bigquery_restricted", dataset.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_in_other_mode_conflicts() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    ctx.bind(dataset.id, BindingMode::Open).await;

    let (status, body) = send(
        &ctx,
        Method::POST,
        &format!("/management/v1/datasets/{}/bigquery_restricted", dataset.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"].as_str().unwrap().contains("migration"));

    let (status, _) = send(
        &ctx,
        Method::POST,
        &format!("/management/v1/datasets/{}/bigquery_restricted_open", dataset.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    ctx.run_pending_jobs().await;
    assert_eq!(
        ctx.binding(dataset.id).await.unwrap().mode,
        BindingMode::Restricted
    );
}

#[tokio::test]
async fn test_list_and_clear_jobs() {
    let ctx = setup();
    let (dataset, _) = ctx.add_dataset("Orders");
    let uri = format!("/management/v1/datasets/{}/bigquery_jobs", dataset.id);
    let job = orchestrator::request_binding(dataset.id, BindingMode::Open, "bob", &ctx.state)
        .await
        .unwrap()
        .into_job();

    let (status, body) = send(&ctx, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"][0]["jobId"], job.job_id.to_string());
    assert_eq!(body["jobs"][0]["kind"], "create_open");
    assert_eq!(body["jobs"][0]["status"], "pending");

    let (status, body) = send(&ctx, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"cleared": [job.job_id.to_string()]}));

    let (_, body) = send(&ctx, Method::GET, &uri, None).await;
    assert_eq!(body["jobs"][0]["status"], "cleared");
    assert_eq!(body["jobs"][0]["lastError"], "Cleared by alice@example.com");
}

#[tokio::test]
async fn test_access_hooks() {
    let ctx = setup();
    let (dataset, table) = ctx.add_dataset("Orders");
    let binding = ctx.bind(dataset.id, BindingMode::Open).await;
    let access_id = ctx
        .fakes
        .catalog
        .add_grant(dataset.id, "carol@example.com", SubjectType::User);

    let (status, body) = send(
        &ctx,
        Method::POST,
        &format!("/management/v1/datasets/{}/access", dataset.id),
        Some(serde_json::json!({"subject": "carol@example.com", "subjectType": "user"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"result": "table_access_ensured"}));
    assert!(
        ctx.fakes
            .warehouse
            .table_members(&table)
            .contains(&binding.service_account_email)
    );

    ctx.fakes.catalog.revoke_grant(access_id);
    let (status, body) = send(
        &ctx,
        Method::DELETE,
        &format!("/management/v1/datasets/{}/access/{access_id}", dataset.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"result": "table_access_revoked", "remainingGrants": 0}));
}
