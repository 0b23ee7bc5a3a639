use crate::service::{BackendError, BackendErrorType};

pub(crate) trait DBErrorHandler
where
    Self: ToString + Sized + Send + Sync + std::error::Error + 'static,
{
    fn into_backend_error(self) -> BackendError;
}

impl DBErrorHandler for sqlx::Error {
    fn into_backend_error(self) -> BackendError {
        match self {
            Self::Database(ref db) if is_transaction_failure(db.code().as_deref()) => {
                BackendError::new(self, BackendErrorType::ConcurrentModification)
                    .append_detail("Database Transaction failed.")
            }
            _ => BackendError::new_unexpected(self),
        }
    }
}

// https://www.postgresql.org/docs/current/errcodes-appendix.html
fn is_transaction_failure(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(
            "2D000" | "25000" | "25001" | "25P01" | "25P02" | "25P03" | "40000" | "40001" | "40002"
                | "40003" | "40004",
        )
    )
}
