use http::Request;
use tower_http::{
    request_id::{MakeRequestId, RequestId},
    trace::MakeSpan,
};
use tracing::{Level, Span};
use uuid::Uuid;

use crate::{X_ACTOR_HEADER_NAME, X_REQUEST_ID_HEADER_NAME};

/// A `MakeSpan` implementation that attaches the `request_id` and the actor to the span.
#[derive(Debug, Clone)]
pub struct RestMakeSpan {
    level: Level,
}

impl RestMakeSpan {
    /// Create a [tracing span] with a certain [`Level`].
    ///
    /// [tracing span]: https://docs.rs/tracing/latest/tracing/#spans
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl<B> MakeSpan<B> for RestMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        // `tracing::span!` requires a static level.
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                    actor = %request
                                .headers()
                                .get(X_ACTOR_HEADER_NAME)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("anonymous"),
                    request_id = %request
                                .headers()
                                .get(X_REQUEST_ID_HEADER_NAME)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("MISSING-REQUEST-ID"),
                )
            }
        }

        match self.level {
            Level::TRACE => make_span!(Level::TRACE),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::INFO => make_span!(Level::INFO),
            Level::WARN => make_span!(Level::WARN),
            Level::ERROR => make_span!(Level::ERROR),
        }
    }
}

/// A [`MakeRequestId`] that generates `UUIDv7`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid7;

impl MakeRequestId for MakeRequestUuid7 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let request_id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(request_id))
    }
}
