#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::large_enum_variant,
    clippy::missing_errors_doc
)]
#![forbid(unsafe_code)]
mod config;
pub mod service;
pub use config::{BiConfig, CONFIG, DynAppConfig, GcpConfig, OpenModeConfig};
pub use service::{DatasetId, JobId};

#[cfg(feature = "router")]
#[cfg_attr(docsrs, doc(cfg(feature = "router")))]
pub mod serve;

pub mod implementations;

pub mod api;
mod request_metadata;

pub use async_trait;
pub use axum;
pub use request_metadata::{
    RequestMetadata, X_ACTOR_HEADER_NAME, X_REQUEST_ID_HEADER_NAME,
};
#[cfg(feature = "sqlx")]
pub use sqlx;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
#[cfg(feature = "router")]
#[cfg_attr(docsrs, doc(cfg(feature = "router")))]
pub use tower;
#[cfg(feature = "router")]
#[cfg_attr(docsrs, doc(cfg(feature = "router")))]
pub use tower_http;

#[cfg(feature = "router")]
#[cfg_attr(docsrs, doc(cfg(feature = "router")))]
pub mod request_tracing;

pub use tracing;
#[cfg(any(test, feature = "test-utils"))]
pub mod tests;
