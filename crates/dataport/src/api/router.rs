use axum::{Json, Router, extract::DefaultBodyLimit, response::IntoResponse, routing::get};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    sensitive_headers::SetSensitiveHeadersLayer,
    timeout::TimeoutLayer,
    trace::{self, TraceLayer},
};

use crate::{
    CONFIG, CancellationToken,
    api::{ApiContext, management::v1::ApiServer},
    request_metadata::{X_REQUEST_ID_HEADER_NAME, create_request_metadata_with_trace_id_fn},
    request_tracing::{MakeRequestUuid7, RestMakeSpan},
    service::{BindingStore, State},
};

#[derive(Debug)]
pub struct RouterArgs<B: BindingStore> {
    pub state: ApiContext<State<B>>,
}

/// Create a new router with the given `RouterArgs`
pub fn new_full_router<B: BindingStore>(RouterArgs { state }: RouterArgs<B>) -> Router {
    let management_routes = Router::new().merge(ApiServer::<B>::new_v1_router());

    let mut router = Router::new()
        .nest("/management/v1", management_routes)
        .layer(DefaultBodyLimit::max(CONFIG.max_request_body_size));

    // Body logging consumes the body, so it has to run before the handlers see it
    if CONFIG.debug.log_request_bodies {
        router = router.layer(axum::middleware::from_fn(print_request_body));
    }

    router
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({"status": "ok"})).into_response() }),
        )
        .layer(axum::middleware::from_fn(
            create_request_metadata_with_trace_id_fn,
        ))
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid7)
                .layer(SetSensitiveHeadersLayer::new([
                    axum::http::header::AUTHORIZATION,
                ]))
                .layer(CompressionLayer::new())
                .layer(
                    TraceLayer::new_for_http()
                        .on_failure(())
                        .make_span_with(RestMakeSpan::new(tracing::Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
                )
                .layer(TimeoutLayer::with_status_code(
                    http::StatusCode::REQUEST_TIMEOUT,
                    CONFIG.max_request_time(),
                ))
                .layer(CatchPanicLayer::new())
                .propagate_x_request_id(),
        )
        .with_state(state)
}

async fn print_request_body(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<impl IntoResponse, axum::response::Response> {
    let path = request.uri().path().to_string();
    let method = request.method().to_string();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("MISSING-REQUEST-ID")
        .to_string();

    let request = buffer_request_body(request, &method, &path, &request_id).await?;
    let response = next.run(request).await;
    buffer_response_body(response, &method, &path, &request_id).await
}

async fn buffer_response_body(
    response: axum::response::Response,
    method: &str,
    path: &str,
    request_id: &str,
) -> Result<axum::response::Response, axum::response::Response> {
    let (parts, body) = response.into_parts();

    let bytes = http_body_util::BodyExt::collect(body)
        .await
        .map_err(|err| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
                .into_response()
        })?
        .to_bytes();

    tracing::debug!(
        method = method,
        path = path,
        request_id = request_id,
        status = %parts.status,
        response_body = %String::from_utf8_lossy(&bytes),
    );

    Ok(axum::response::Response::from_parts(
        parts,
        axum::body::Body::from(bytes),
    ))
}

async fn buffer_request_body(
    request: axum::extract::Request,
    method: &str,
    path: &str,
    request_id: &str,
) -> Result<axum::extract::Request, axum::response::Response> {
    let (parts, body) = request.into_parts();

    let bytes = http_body_util::BodyExt::collect(body)
        .await
        .map_err(|err| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
                .into_response()
        })?
        .to_bytes();

    tracing::debug!(
        method = method,
        path = path,
        request_body = %String::from_utf8_lossy(&bytes),
        request_id = request_id,
    );

    Ok(axum::extract::Request::from_parts(
        parts,
        axum::body::Body::from(bytes),
    ))
}

/// Serve the given router on the given listener
///
/// # Errors
/// Fails if the webserver panics
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let cancellation_future = async move {
        cancellation_token.cancelled().await;
        tracing::info!("HTTP server shutdown requested (cancellation token)");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(cancellation_future)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("error running HTTP server"))
}
