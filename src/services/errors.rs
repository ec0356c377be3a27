use axum::http::StatusCode;
use thiserror::Error;

use crate::domain::classify::ClassifyError;
use crate::infrastructure::backends::BackendError;
use crate::infrastructure::vault::VaultError;

/// Service-level failure taxonomy. Every variant maps to a machine-readable
/// `kind` carried in the HTTP error envelope, so callers can branch without
/// parsing messages.
#[derive(Debug, Error)]
pub enum ServiceError {
    // input errors
    #[error("{0}")]
    Syntax(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("multi-statement input is not allowed")]
    MultiStatementForbidden,
    #[error("{0}")]
    DryRunUnsupported(String),
    #[error("{0}")]
    InvalidArgument(String),

    // authorization errors
    #[error("permission denied")]
    PermissionDenied,
    #[error("reviewers cannot act on their own request")]
    SelfApprovalForbidden,

    // state errors
    #[error("request has already been reviewed")]
    AlreadyReviewed,
    #[error("transaction is busy with another operation")]
    TransactionBusy,
    #[error("transaction preview deadline has passed")]
    TransactionExpired,
    #[error("request is not in a state that permits this operation")]
    NotPending,

    // backend errors, message attached verbatim
    #[error("{0}")]
    Backend(String),

    // infrastructure errors
    #[error("data source unavailable: {0}")]
    DataSourceUnavailable(String),
    #[error("{0}")]
    CredentialUnavailable(String),
    #[error("statement exceeded its time budget")]
    TimeoutExceeded,

    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Syntax(_) => "SyntaxError",
            ServiceError::UnsupportedOperation(_) => "UnsupportedOperation",
            ServiceError::MultiStatementForbidden => "MultiStatementForbidden",
            ServiceError::DryRunUnsupported(_) => "DryRunUnsupported",
            ServiceError::InvalidArgument(_) => "InvalidArgument",
            ServiceError::PermissionDenied => "PermissionDenied",
            ServiceError::SelfApprovalForbidden => "SelfApprovalForbidden",
            ServiceError::AlreadyReviewed => "AlreadyReviewed",
            ServiceError::TransactionBusy => "TransactionBusy",
            ServiceError::TransactionExpired => "TransactionExpired",
            ServiceError::NotPending => "NotPending",
            ServiceError::Backend(_) => "BackendError",
            ServiceError::DataSourceUnavailable(_) => "DataSourceUnavailable",
            ServiceError::CredentialUnavailable(_) => "CredentialUnavailable",
            ServiceError::TimeoutExceeded => "TimeoutExceeded",
            ServiceError::NotFound => "NotFound",
            ServiceError::Conflict => "Conflict",
            ServiceError::RateLimited => "RateLimited",
            ServiceError::Internal(_) => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Syntax(_)
            | ServiceError::UnsupportedOperation(_)
            | ServiceError::MultiStatementForbidden
            | ServiceError::DryRunUnsupported(_)
            | ServiceError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::PermissionDenied | ServiceError::SelfApprovalForbidden => {
                StatusCode::FORBIDDEN
            }
            ServiceError::AlreadyReviewed
            | ServiceError::TransactionBusy
            | ServiceError::NotPending
            | ServiceError::Conflict => StatusCode::CONFLICT,
            ServiceError::TransactionExpired => StatusCode::GONE,
            ServiceError::Backend(_) => StatusCode::BAD_REQUEST,
            ServiceError::DataSourceUnavailable(_) | ServiceError::CredentialUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::TimeoutExceeded => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClassifyError> for ServiceError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Syntax(message) => ServiceError::Syntax(message),
            ClassifyError::UnsupportedOperation(verb) => ServiceError::UnsupportedOperation(verb),
            ClassifyError::MultiStatement => ServiceError::MultiStatementForbidden,
            ClassifyError::InvalidArgument(message) => ServiceError::InvalidArgument(message),
        }
    }
}

impl From<VaultError> for ServiceError {
    fn from(err: VaultError) -> Self {
        ServiceError::CredentialUnavailable(err.to_string())
    }
}

impl From<BackendError> for ServiceError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(message) => ServiceError::Backend(message),
            BackendError::Unavailable(message) => ServiceError::DataSourceUnavailable(message),
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound,
            other => ServiceError::Internal(other.to_string()),
        }
    }
}
