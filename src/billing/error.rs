use thiserror::Error;

use super::ledger::LedgerError;
use crate::gateways::{AccessError, BillingError};

/// key: reconciliation-errors -> failures surfaced by engine operations
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("tier {0} not found or inactive")]
    TierNotFound(i64),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("webhook signature rejected")]
    InvalidSignature,
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Billing(BillingError),
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<BillingError> for ReconcileError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidSignature => ReconcileError::InvalidSignature,
            BillingError::Malformed(message) => ReconcileError::Validation(message),
            other => ReconcileError::Billing(other),
        }
    }
}

impl From<LedgerError> for ReconcileError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => {
                ReconcileError::NotFound(format!("{entity} {id}"))
            }
            other => ReconcileError::Ledger(other),
        }
    }
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReconcileError::NotFound(_) | ReconcileError::Billing(BillingError::NotFound(_))
        )
    }
}
