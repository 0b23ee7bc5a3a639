//! Capability interfaces to the systems a binding spans: the warehouse, the cloud
//! identity provider and the BI tool.
//!
//! Every gateway reports failures as [`GatewayError`]. Workflow steps rely on the
//! kinds being accurate: `AlreadyExists` on create and `NotFound` on delete are
//! treated as success.

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
    sync::Arc,
};

use http::StatusCode;

pub mod bi_tool;
pub mod identity;
pub mod warehouse;

pub use bi_tool::{
    BiDatabase, BiToolGateway, Collection, CollectionAccess, NewDatabase, PermissionGraph,
    PermissionGroup,
};
pub use identity::{IdentityGateway, ServiceAccount, ServiceAccountKey};
pub use warehouse::{AclEntry, METADATA_VIEWER_ROLE, TABLE_VIEWER_ROLE, WarehouseGateway};

use super::{
    catalog::{AccessGrantSource, DatasetCatalog},
    error::impl_error_stack_methods,
};
use crate::api::ErrorModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum GatewayErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unavailable,
    Unexpected,
}

#[derive(Debug)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    pub stack: Vec<String>,
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl_error_stack_methods!(GatewayError);

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: Vec::new(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Unavailable, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Unexpected, message)
    }

    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == GatewayErrorKind::NotFound
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.kind == GatewayErrorKind::AlreadyExists
    }
}

impl StdError for GatewayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        for detail in &self.stack {
            write!(f, "; {detail}")?;
        }
        Ok(())
    }
}

impl From<GatewayError> for ErrorModel {
    fn from(err: GatewayError) -> Self {
        let GatewayError {
            kind,
            message,
            stack,
            source,
        } = err;
        ErrorModel {
            message,
            r#type: format!("Gateway{kind}"),
            code: StatusCode::FAILED_DEPENDENCY.as_u16(),
            source,
            stack,
            error_id: uuid::Uuid::now_v7(),
        }
    }
}

pub trait GatewayResultExt<T> {
    /// Deletes and revokes of absent targets are successful.
    fn ok_if_not_found(self) -> Result<Option<T>, GatewayError>;

    /// Creates of present targets are successful.
    fn ok_if_already_exists(self) -> Result<Option<T>, GatewayError>;
}

impl<T> GatewayResultExt<T> for Result<T, GatewayError> {
    fn ok_if_not_found(self) -> Result<Option<T>, GatewayError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn ok_if_already_exists(self) -> Result<Option<T>, GatewayError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_already_exists() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// All collaborators of the orchestrator, injected at construction.
#[derive(Debug, Clone)]
pub struct Gateways {
    pub warehouse: Arc<dyn WarehouseGateway>,
    pub identity: Arc<dyn IdentityGateway>,
    pub bi: Arc<dyn BiToolGateway>,
    pub catalog: Arc<dyn DatasetCatalog>,
    pub grants: Arc<dyn AccessGrantSource>,
}
