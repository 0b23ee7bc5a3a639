use axum::extract::MatchedPath;
use http::{HeaderName, Method};
use uuid::Uuid;

pub const X_REQUEST_ID_HEADER_NAME: HeaderName = HeaderName::from_static("x-request-id");
/// Identity of the caller as asserted by the gateway in front of dataport.
pub const X_ACTOR_HEADER_NAME: HeaderName = HeaderName::from_static("x-actor");

const ANONYMOUS_ACTOR: &str = "anonymous";

/// A struct to hold metadata about a request.
///
/// The actor is recorded on every job the request enqueues and on cleared jobs.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub request_id: Uuid,
    pub request_method: Method,
    pub matched_path: Option<MatchedPath>,
    pub uri: String,
    actor: Option<String>,
}

impl RequestMetadata {
    #[must_use]
    pub fn new_random() -> Self {
        Self {
            request_id: Uuid::now_v7(),
            request_method: Method::GET,
            matched_path: None,
            uri: "/".to_string(),
            actor: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(ANONYMOUS_ACTOR)
    }
}

#[cfg(feature = "router")]
pub(crate) async fn create_request_metadata_with_trace_id_fn(
    headers: http::HeaderMap,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use std::str::FromStr as _;

    let request_id: Uuid = headers
        .get(X_REQUEST_ID_HEADER_NAME)
        .and_then(|hv| {
            hv.to_str()
                .map(Uuid::from_str)
                .ok()
                .transpose()
                .ok()
                .flatten()
        })
        .unwrap_or(Uuid::now_v7());

    let actor = headers
        .get(X_ACTOR_HEADER_NAME)
        .and_then(|hv| hv.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let matched_path = request.extensions().get::<MatchedPath>().cloned();
    let uri = request.uri().to_string();
    let method = request.method().clone();
    request.extensions_mut().insert(RequestMetadata {
        request_id,
        request_method: method,
        matched_path,
        uri,
        actor,
    });
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_defaults_to_anonymous() {
        let metadata = RequestMetadata::new_random();
        assert_eq!(metadata.actor(), "anonymous");
        assert_eq!(metadata.with_actor("alice@example.com").actor(), "alice@example.com");
    }
}
