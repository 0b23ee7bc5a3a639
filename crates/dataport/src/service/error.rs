use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
};

use http::StatusCode;

use super::{AccessId, DatasetId, binding::BindingMode};
use crate::api::{ErrorModel, ErrorResponse};

macro_rules! impl_error_stack_methods {
    ($error_type:ty) => {
        impl $error_type {
            #[must_use]
            pub fn append_details(mut self, details: impl IntoIterator<Item = String>) -> Self {
                self.stack.extend(details);
                self
            }

            #[must_use]
            pub fn append_detail(mut self, detail: impl Into<String>) -> Self {
                self.stack.push(detail.into());
                self
            }

            pub fn append_details_mut(&mut self, details: impl IntoIterator<Item = String>) {
                self.stack.extend(details);
            }

            pub fn append_detail_mut(&mut self, detail: impl Into<String>) {
                self.stack.push(detail.into());
            }
        }
    };
}

macro_rules! impl_from_with_detail {
    ($from_type:ty => $to_type:ident::$variant:ident, $detail:expr) => {
        impl From<$from_type> for $to_type {
            fn from(err: $from_type) -> Self {
                $to_type::$variant(err.append_detail($detail))
            }
        }
    };
}

/// Defines a fully transparent error enum with automatic conversion implementations.
///
/// This macro generates:
/// - An enum with all variants marked as `#[error(transparent)]`
/// - `impl_from_with_detail!` for each variant to add stack context
/// - `From<ErrorType> for ErrorModel` that delegates to variant conversions
/// - `From<ErrorType> for ErrorResponse` via `ErrorModel`
macro_rules! define_transparent_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $error_name:ident,
        stack_message: $stack_msg:expr,
        variants: [
            $($variant:ident),* $(,)?
        ]
    ) => {
        $(#[$meta])*
        #[derive(thiserror::Error, Debug)]
        $vis enum $error_name {
            $(
                #[error(transparent)]
                $variant($variant),
            )*
        }

        pastey::paste! {
            const [<$error_name:snake:upper _STACK>]: &str = $stack_msg;

            $(
                $crate::service::error::impl_from_with_detail!($variant => $error_name::$variant, [<$error_name:snake:upper _STACK>]);
            )*

            impl $error_name {
                #[must_use]
                pub fn append_detail(mut self, detail: impl Into<String>) -> Self {
                    match &mut self {
                        $(
                            $error_name::$variant(e) => {
                                e.append_detail_mut(detail);
                            }
                        )*
                    }
                    self
                }

                pub fn append_detail_mut(&mut self, detail: impl Into<String>) -> &mut Self {
                    match self {
                        $(
                            $error_name::$variant(e) => {
                                e.append_detail_mut(detail);
                            }
                        )*
                    }
                    self
                }
            }

            impl From<$error_name> for $crate::api::ErrorModel {
                fn from(err: $error_name) -> Self {
                    match err {
                        $(
                            $error_name::$variant(e) => e.into(),
                        )*
                    }
                }
            }

            impl From<$error_name> for $crate::api::ErrorResponse {
                fn from(err: $error_name) -> Self {
                    $crate::api::ErrorModel::from(err).into()
                }
            }
        }
    };
}

pub(crate) use define_transparent_error;
pub(crate) use impl_error_stack_methods;
pub(crate) use impl_from_with_detail;


#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BackendErrorType {
    Unexpected,
    ConcurrentModification,
}

/// Failure of the persistence backend (binding store or job queue).
#[derive(Debug)]
pub struct BackendError {
    pub r#type: BackendErrorType,
    pub stack: Vec<String>,
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl_error_stack_methods!(BackendError);

impl BackendError {
    pub fn new<E>(source: E, r#type: impl Into<BackendErrorType>) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            r#type: r#type.into(),
            stack: Vec::new(),
            source: Box::new(source),
        }
    }

    pub fn new_unexpected<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::new(source, BackendErrorType::Unexpected)
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source as &(dyn StdError + 'static))
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "BackendError ({}): {}", self.r#type, self.source)?;

        if !self.stack.is_empty() {
            writeln!(f, "Stack:")?;
            for detail in &self.stack {
                writeln!(f, "  {detail}")?;
            }
        }
        Ok(())
    }
}

impl From<BackendError> for ErrorModel {
    fn from(err: BackendError) -> Self {
        let BackendError {
            r#type,
            stack,
            source,
        } = err;

        let code = match r#type {
            BackendErrorType::Unexpected => StatusCode::SERVICE_UNAVAILABLE,
            BackendErrorType::ConcurrentModification => StatusCode::CONFLICT,
        }
        .as_u16();

        ErrorModel {
            r#type: "BackendError".to_string(),
            code,
            message: format!("Backend error ({type}): {source}"),
            stack,
            source: None,
            error_id: uuid::Uuid::now_v7(),
        }
    }
}

impl From<BackendError> for ErrorResponse {
    fn from(err: BackendError) -> Self {
        ErrorModel::from(err).into()
    }
}

/// A row read from the backend violates an invariant of the data model.
#[derive(Debug)]
pub struct DatabaseIntegrityError {
    pub message: String,
    pub stack: Vec<String>,
}

impl_error_stack_methods!(DatabaseIntegrityError);

impl DatabaseIntegrityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
        }
    }
}

impl StdError for DatabaseIntegrityError {}

impl Display for DatabaseIntegrityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "DatabaseIntegrityError: {}", self.message)?;

        if !self.stack.is_empty() {
            writeln!(f, "Stack:")?;
            for detail in &self.stack {
                writeln!(f, "  {detail}")?;
            }
        }
        Ok(())
    }
}

impl From<DatabaseIntegrityError> for ErrorModel {
    fn from(err: DatabaseIntegrityError) -> Self {
        let DatabaseIntegrityError { message, stack } = err;

        ErrorModel {
            r#type: "DatabaseIntegrityError".to_string(),
            code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            message: format!("Database integrity error: {message}"),
            stack,
            source: None,
            error_id: uuid::Uuid::now_v7(),
        }
    }
}

/// Defines a domain error struct carrying a detail stack that maps onto a fixed status code.
macro_rules! define_simple_error {
    (
        $(#[$meta:meta])*
        $name:ident { $($field:ident : $ty:ty),* $(,)? },
        code: $code:expr,
        message: |$self_:ident| $message:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty,)*
            pub stack: Vec<String>,
        }

        impl_error_stack_methods!($name);

        impl $name {
            #[must_use]
            pub fn new($($field: $ty),*) -> Self {
                Self {
                    $($field,)*
                    stack: Vec::new(),
                }
            }
        }

        impl StdError for $name {}

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                let $self_ = self;
                write!(f, "{}", $message)
            }
        }

        impl From<$name> for ErrorModel {
            fn from(err: $name) -> Self {
                let message = err.to_string();
                ErrorModel {
                    message,
                    r#type: stringify!($name).to_string(),
                    code: $code.as_u16(),
                    source: None,
                    stack: err.stack,
                    error_id: uuid::Uuid::now_v7(),
                }
            }
        }
    };
}

define_simple_error!(
    DatasetNotFound { dataset_id: DatasetId },
    code: StatusCode::NOT_FOUND,
    message: |e| format!("Dataset {} does not exist", e.dataset_id)
);

define_simple_error!(
    /// The dataset exists but is not backed by a warehouse table.
    NoWarehouseSource { dataset_id: DatasetId },
    code: StatusCode::BAD_REQUEST,
    message: |e| format!("Dataset {} has no warehouse source", e.dataset_id)
);

define_simple_error!(
    BindingNotFound { dataset_id: DatasetId, mode: Option<BindingMode> },
    code: StatusCode::NOT_FOUND,
    message: |e| match e.mode {
        Some(mode) => format!("Dataset {} has no {mode} binding", e.dataset_id),
        None => format!("Dataset {} is not bound", e.dataset_id),
    }
);

define_simple_error!(
    /// A dataset is bound in at most one mode. Switching goes through a migration.
    BindingModeConflict { dataset_id: DatasetId, existing: BindingMode, requested: BindingMode },
    code: StatusCode::CONFLICT,
    message: |e| format!(
        "Dataset {} is bound in {} mode, but {} was requested. Use the migration endpoint to switch modes.",
        e.dataset_id, e.existing, e.requested
    )
);

define_simple_error!(
    GrantNotFound { access_id: AccessId },
    code: StatusCode::NOT_FOUND,
    message: |e| format!("Access grant {} does not exist", e.access_id)
);

define_transparent_error! {
    pub enum BeginBindingSyncError,
    stack_message: "Error starting binding sync",
    variants: [
        BindingModeConflict,
        BackendError,
    ]
}

define_transparent_error! {
    pub enum UpdateBindingError,
    stack_message: "Error updating binding",
    variants: [
        BindingNotFound,
        BackendError,
    ]
}

#[derive(thiserror::Error, PartialEq, Debug)]
#[error("{0}")]
pub struct InternalErrorMessage(pub String);
