use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

use crate::billing::{ReconciliationEngine, WebhookOutcome};
use crate::error::{AppError, AppResult};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub outcome: WebhookOutcome,
}

/// key: webhooks-billing -> signed provider deliveries
///
/// The raw body is handed over untouched; signature checks depend on the exact bytes.
pub async fn billing_webhook(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<WebhookAck>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing Stripe-Signature header".into()))?;
    let outcome = engine.handle_webhook(&body, signature).await?;
    Ok((StatusCode::OK, Json(WebhookAck { outcome })))
}
