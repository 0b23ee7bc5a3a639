mod error;
pub mod management;
#[cfg(feature = "router")]
pub mod router;

pub use error::{ErrorModel, ErrorResponse};

pub use crate::request_metadata::{RequestMetadata, X_ACTOR_HEADER_NAME, X_REQUEST_ID_HEADER_NAME};

pub type Result<T, E = ErrorResponse> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct ApiContext<S: ThreadSafe> {
    pub v1_state: S,
}

/// Marker trait for state shared between request handlers.
pub trait ThreadSafe: Clone + Send + Sync + 'static {}
