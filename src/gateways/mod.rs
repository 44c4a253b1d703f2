use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::billing::models::{SubscriptionStatus, Tier};

pub mod plex;
pub mod stripe;

pub use plex::PlexGateway;
pub use stripe::StripeGateway;

/// key: access-gateway-errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("user already has access or a pending invite")]
    AlreadyGranted,
    #[error("user not found on the access provider")]
    UserNotFound,
    #[error("access provider transport error: {0}")]
    Transport(String),
}

/// key: access-gateway -> media server sharing
#[async_trait]
pub trait AccessProvider: Send + Sync {
    async fn grant(
        &self,
        identity: &str,
        collections: &[String],
        allow_downloads: bool,
    ) -> Result<(), AccessError>;

    /// Removing a user that holds no access is a success.
    async fn revoke(&self, identity: &str) -> Result<(), AccessError>;

    async fn list_collections(&self) -> Result<Vec<String>, AccessError>;
}

/// key: billing-gateway-errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("webhook signature rejected")]
    InvalidSignature,
    #[error("malformed provider payload: {0}")]
    Malformed(String),
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("billing provider rejected request: {0}")]
    Rejected(String),
    #[error("billing provider transport error: {0}")]
    Transport(String),
    #[error("billing provider is not configured: {0} missing")]
    Unconfigured(&'static str),
}

/// key: billing-gateway -> checkout, subscriptions, webhooks
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_checkout(
        &self,
        tier: &Tier,
        customer_email: &str,
        success_url: &str,
        cancel_url: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<CheckoutSession, BillingError>;

    async fn retrieve_subscription(&self, remote_id: &str)
        -> Result<RemoteSubscription, BillingError>;

    async fn cancel(&self, remote_id: &str, at_period_end: bool) -> Result<(), BillingError>;

    /// Local verification only; never touches the network.
    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, BillingError>;
}

/// Remote status as reported by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RemoteStatus {
    Active,
    PastDue,
    Canceled,
    Other(String),
}

impl RemoteStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => RemoteStatus::Active,
            "past_due" => RemoteStatus::PastDue,
            "canceled" => RemoteStatus::Canceled,
            other => RemoteStatus::Other(other.to_string()),
        }
    }

    /// Unrecognised remote states fall back to `active`.
    pub fn local_status(&self) -> SubscriptionStatus {
        match self {
            RemoteStatus::Active | RemoteStatus::Other(_) => SubscriptionStatus::Active,
            RemoteStatus::PastDue => SubscriptionStatus::PastDue,
            RemoteStatus::Canceled => SubscriptionStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSubscription {
    pub id: String,
    pub status: RemoteStatus,
    pub customer_id: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// Checkout session as delivered by `checkout.session.completed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedCheckout {
    pub session_id: String,
    pub customer_email: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CheckoutCompleted(CompletedCheckout),
    SubscriptionUpdated(RemoteSubscription),
    SubscriptionDeleted { subscription_id: String },
    PaymentFailed { subscription_id: Option<String> },
    Unhandled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub event: BillingEvent,
}

/// Bounds a gateway call; an elapsed timer becomes the caller's error.
pub async fn bounded<T, E, F>(
    limit: Duration,
    call: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_statuses_map_onto_local_set() {
        assert_eq!(
            RemoteStatus::parse("active").local_status(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            RemoteStatus::parse("past_due").local_status(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            RemoteStatus::parse("canceled").local_status(),
            SubscriptionStatus::Cancelled
        );
        let trialing = RemoteStatus::parse("trialing");
        assert_eq!(trialing, RemoteStatus::Other("trialing".into()));
        assert_eq!(trialing.local_status(), SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn bounded_converts_elapsed_calls() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, AccessError>(())
        };
        let result = bounded(Duration::from_millis(10), slow, || {
            AccessError::Transport("timed out".into())
        })
        .await;
        assert_eq!(result, Err(AccessError::Transport("timed out".into())));
    }
}
