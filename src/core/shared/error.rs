use axum::{http::StatusCode, response::IntoResponse, Json};
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Coarse error taxonomy shared by every service. Callers branch on the kind,
/// never on the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    ProviderError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid_state",
            Self::ProviderError => "provider_error",
            Self::Internal => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::InvalidState => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ProviderError => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderError | Self::Internal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Error body returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl<E> From<E> for ApiError
where
    E: Classify + std::fmt::Display,
{
    fn from(err: E) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.kind.status_code();
        (
            status,
            Json(serde_json::json!({
                "error": self.message,
                "kind": self.kind.as_str(),
            })),
        )
            .into_response()
    }
}

pub fn is_unique_violation(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

/// Generates the storage conversions every service error needs.
///
/// The target enum must have `NotFound(String)`, `Conflict(String)`,
/// `Database(String)` and `Internal(String)` variants.
#[macro_export]
macro_rules! storage_error_conversions {
    ($error:ident) => {
        impl From<diesel::result::Error> for $error {
            fn from(err: diesel::result::Error) -> Self {
                match err {
                    diesel::result::Error::NotFound => Self::NotFound("record not found".into()),
                    ref e if $crate::core::shared::error::is_unique_violation(e) => {
                        Self::Conflict(e.to_string())
                    }
                    e => Self::Database(e.to_string()),
                }
            }
        }

        impl From<diesel::r2d2::PoolError> for $error {
            fn from(err: diesel::r2d2::PoolError) -> Self {
                Self::Database(format!("connection pool: {}", err))
            }
        }

        impl From<tokio::task::JoinError> for $error {
            fn from(err: tokio::task::JoinError) -> Self {
                Self::Internal(format!("blocking task failed: {}", err))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum SampleError {
        #[error("Not found: {0}")]
        NotFound(String),
        #[error("Conflict: {0}")]
        Conflict(String),
        #[error("Database error: {0}")]
        Database(String),
        #[error("Internal error: {0}")]
        Internal(String),
    }

    crate::storage_error_conversions!(SampleError);

    impl Classify for SampleError {
        fn kind(&self) -> ErrorKind {
            match self {
                Self::NotFound(_) => ErrorKind::NotFound,
                Self::Conflict(_) => ErrorKind::Conflict,
                Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
            }
        }
    }

    #[test]
    fn test_diesel_not_found_maps_to_not_found() {
        let err: SampleError = DieselError::NotFound.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_unique_violation_maps_to_conflict() {
        let db_err = DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key value".to_string()),
        );
        assert!(is_unique_violation(&db_err));
        let err: SampleError = db_err.into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_other_database_errors_are_internal() {
        let err: SampleError = DieselError::RollbackTransaction.into();
        assert!(matches!(err, SampleError::Database(_)));
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn test_api_error_status_follows_kind() {
        let api: ApiError = SampleError::NotFound("invitation".into()).into();
        assert_eq!(api.kind.status_code(), StatusCode::NOT_FOUND);
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_kind_tokens() {
        assert_eq!(ErrorKind::InvalidState.as_str(), "invalid_state");
        assert_eq!(ErrorKind::ProviderError.to_string(), "provider_error");
        assert!(!ErrorKind::NotFound.is_retryable());
    }
}
