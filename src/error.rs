use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::{LedgerError, ReconcileError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => AppError::NotFound(format!("{entity} {id}")),
            LedgerError::Conflict(message) => AppError::Conflict(message),
            other => AppError::Ledger(other),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::NotFound(what) => AppError::NotFound(what),
            ReconcileError::Conflict(message) => AppError::Conflict(message),
            ReconcileError::TierNotFound(_)
            | ReconcileError::Validation(_)
            | ReconcileError::InvalidSignature => AppError::BadRequest(err.to_string()),
            ReconcileError::Access(_) | ReconcileError::Billing(_) => {
                AppError::BadGateway(err.to_string())
            }
            ReconcileError::Ledger(inner) => inner.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Ledger(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
