use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};
use url::Url;

use crate::billing::models::Tier;
use crate::config;

use super::{
    BillingError, BillingEvent, BillingProvider, CheckoutSession, CompletedCheckout,
    RemoteStatus, RemoteSubscription, WebhookEvent,
};

type HmacSha256 = Hmac<Sha256>;

/// key: billing-gateway-stripe -> REST client + webhook verification
#[derive(Clone)]
pub struct StripeGateway {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl StripeGateway {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            tolerance_secs: 300,
        }
    }

    pub fn from_env() -> Result<Self, BillingError> {
        let secret_key = config::STRIPE_SECRET_KEY
            .clone()
            .ok_or(BillingError::Unconfigured("STRIPE_SECRET_KEY"))?;
        let webhook_secret = config::STRIPE_WEBHOOK_SECRET
            .clone()
            .ok_or(BillingError::Unconfigured("STRIPE_WEBHOOK_SECRET"))?;
        Ok(Self::new(config::STRIPE_API_BASE.as_str(), secret_key, webhook_secret)
            .with_tolerance(*config::WEBHOOK_TOLERANCE_SECS))
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Checks a `t=...,v1=...` header against the raw body at `now`.
    pub fn verify_signature(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
        if candidates.is_empty() {
            return Err(BillingError::InvalidSignature);
        }
        if now.timestamp().abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            warn!(timestamp, now = now.timestamp(), "webhook timestamp outside tolerance");
            return Err(BillingError::InvalidSignature);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if matched {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature)
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BillingError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| BillingError::Transport(format!("invalid api base: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| BillingError::Transport("api base cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BillingError> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|err| BillingError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| BillingError::Malformed(err.to_string()));
        }

        let message = response
            .json::<StripeErrorEnvelope>()
            .await
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or_else(|| status.to_string());
        Err(match status {
            StatusCode::NOT_FOUND => BillingError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => BillingError::Transport(message),
            status if status.is_server_error() => BillingError::Transport(message),
            _ => BillingError::Rejected(message),
        })
    }
}

/// Builds a signature header for `payload`, matching what the provider sends.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Decodes a verified event body into the engine's event set.
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, BillingError> {
    let envelope: StripeEvent =
        serde_json::from_slice(payload).map_err(|err| BillingError::Malformed(err.to_string()))?;
    let object = envelope.data.object;

    let event = match envelope.event_type.as_str() {
        "checkout.session.completed" => {
            let session: StripeCheckoutSession = decode_object(object)?;
            BillingEvent::CheckoutCompleted(session.into_completed())
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let subscription: StripeSubscription = decode_object(object)?;
            BillingEvent::SubscriptionUpdated(subscription.into_remote())
        }
        "customer.subscription.deleted" => {
            let subscription: StripeSubscription = decode_object(object)?;
            BillingEvent::SubscriptionDeleted {
                subscription_id: subscription.id,
            }
        }
        "invoice.payment_failed" => {
            let invoice: StripeInvoice = decode_object(object)?;
            BillingEvent::PaymentFailed {
                subscription_id: invoice.subscription_id(),
            }
        }
        other => {
            debug!(event_type = other, "unhandled billing event type");
            BillingEvent::Unhandled
        }
    };

    Ok(WebhookEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        event,
    })
}

#[async_trait]
impl BillingProvider for StripeGateway {
    async fn create_checkout(
        &self,
        tier: &Tier,
        customer_email: &str,
        success_url: &str,
        cancel_url: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<CheckoutSession, BillingError> {
        let price_id = tier.billing_price_id.as_deref().ok_or_else(|| {
            BillingError::Rejected(format!("tier {} has no billing price", tier.id))
        })?;

        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "subscription".into()),
            ("customer_email".into(), customer_email.into()),
            ("success_url".into(), success_url.into()),
            ("cancel_url".into(), cancel_url.into()),
            ("line_items[0][price]".into(), price_id.into()),
            ("line_items[0][quantity]".into(), "1".into()),
        ];
        for (key, value) in metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
            form.push((format!("subscription_data[metadata][{key}]"), value.clone()));
        }

        let url = self.endpoint(&["v1", "checkout", "sessions"])?;
        let session: StripeCreatedSession = self.send(self.http.post(url).form(&form)).await?;
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }

    async fn retrieve_subscription(
        &self,
        remote_id: &str,
    ) -> Result<RemoteSubscription, BillingError> {
        let url = self.endpoint(&["v1", "subscriptions", remote_id])?;
        let subscription: StripeSubscription = self.send(self.http.get(url)).await?;
        Ok(subscription.into_remote())
    }

    async fn cancel(&self, remote_id: &str, at_period_end: bool) -> Result<(), BillingError> {
        let url = self.endpoint(&["v1", "subscriptions", remote_id])?;
        let request = if at_period_end {
            self.http
                .post(url)
                .form(&[("cancel_at_period_end", "true")])
        } else {
            self.http.delete(url)
        };
        let _: Value = self.send(request).await?;
        Ok(())
    }

    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, BillingError> {
        self.verify_signature(raw_body, signature_header, Utc::now())?;
        parse_event(raw_body)
    }
}

fn decode_object<T: DeserializeOwned>(object: Value) -> Result<T, BillingError> {
    serde_json::from_value(object).map_err(|err| BillingError::Malformed(err.to_string()))
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Expandable references arrive either as an id string or as the expanded object.
fn expandable_id(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(object)) => object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct StripeCreatedSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<StripeCustomerDetails>,
    #[serde(default)]
    customer: Option<Value>,
    #[serde(default)]
    subscription: Option<Value>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomerDetails {
    email: Option<String>,
}

impl StripeCheckoutSession {
    fn into_completed(self) -> CompletedCheckout {
        let customer_email = self
            .customer_email
            .or_else(|| self.customer_details.and_then(|details| details.email));
        CompletedCheckout {
            session_id: self.id,
            customer_email,
            customer_id: expandable_id(&self.customer),
            subscription_id: expandable_id(&self.subscription),
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
    #[serde(default)]
    customer: Option<Value>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    items: Option<StripeList<StripeSubscriptionItem>>,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct StripeSubscriptionItem {
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

impl StripeSubscription {
    /// Newer API versions only report the billing window on subscription items.
    fn into_remote(self) -> RemoteSubscription {
        let first_item = self.items.as_ref().and_then(|items| items.data.first());
        let period_start = self
            .current_period_start
            .or_else(|| first_item.and_then(|item| item.current_period_start));
        let period_end = self
            .current_period_end
            .or_else(|| first_item.and_then(|item| item.current_period_end));

        RemoteSubscription {
            customer_id: expandable_id(&self.customer),
            status: RemoteStatus::parse(&self.status),
            period_start: timestamp(period_start),
            period_end: timestamp(period_end),
            cancel_at_period_end: self.cancel_at_period_end,
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    #[serde(default)]
    subscription: Option<Value>,
    #[serde(default)]
    parent: Option<StripeInvoiceParent>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceParent {
    #[serde(default)]
    subscription_details: Option<StripeSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionDetails {
    #[serde(default)]
    subscription: Option<Value>,
}

impl StripeInvoice {
    fn subscription_id(&self) -> Option<String> {
        expandable_id(&self.subscription).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.subscription_details.as_ref())
                .and_then(|details| expandable_id(&details.subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use httpmock::prelude::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn gateway(base: &str) -> StripeGateway {
        StripeGateway::new(base, "sk_test_123", SECRET)
    }

    #[test]
    fn accepts_signature_over_exact_body() {
        let now = Utc::now();
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, now.timestamp(), body);
        let stripe = gateway("http://localhost");
        assert!(stripe.verify_signature(body, &header, now).is_ok());

        let tampered = br#"{"id":"evt_2"}"#;
        assert_eq!(
            stripe.verify_signature(tampered, &header, now),
            Err(BillingError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_stale_or_incomplete_headers() {
        let now = Utc::now();
        let body = b"{}";
        let stripe = gateway("http://localhost");

        let stale = sign_payload(SECRET, (now - Duration::minutes(10)).timestamp(), body);
        assert!(stripe.verify_signature(body, &stale, now).is_err());
        assert!(stripe.verify_signature(body, "v1=abcd", now).is_err());
        let only_time = format!("t={}", now.timestamp());
        assert!(stripe.verify_signature(body, &only_time, now).is_err());

        let other_secret = sign_payload("whsec_other", now.timestamp(), body);
        assert!(stripe.verify_signature(body, &other_secret, now).is_err());

        for extreme in [i64::MIN, i64::MIN + 1, i64::MAX] {
            let header = format!("t={extreme},v1=00");
            assert_eq!(
                stripe.verify_signature(body, &header, now),
                Err(BillingError::InvalidSignature)
            );
        }
    }

    #[test]
    fn parses_checkout_completion() {
        let body = json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "customer": "cus_9",
                "customer_details": {"email": "a@b.com"},
                "subscription": "sub_9",
                "metadata": {"tier_id": "3", "access_username": "alice"}
            }}
        });
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        let BillingEvent::CheckoutCompleted(checkout) = event.event else {
            panic!("expected checkout event");
        };
        assert_eq!(checkout.customer_email.as_deref(), Some("a@b.com"));
        assert_eq!(checkout.subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(checkout.metadata.get("tier_id").map(String::as_str), Some("3"));
    }

    #[test]
    fn reads_period_from_items_when_top_level_is_absent() {
        let body = json!({
            "id": "evt_update",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "id": "sub_9",
                "status": "incomplete",
                "customer": {"id": "cus_9"},
                "cancel_at_period_end": true,
                "items": {"data": [{
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000
                }]}
            }}
        });
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        let BillingEvent::SubscriptionUpdated(remote) = event.event else {
            panic!("expected subscription update");
        };
        assert_eq!(remote.status, RemoteStatus::Other("incomplete".into()));
        assert_eq!(remote.customer_id.as_deref(), Some("cus_9"));
        assert_eq!(remote.period_end.map(|end| end.timestamp()), Some(1702592000));
        assert!(remote.cancel_at_period_end);
    }

    #[test]
    fn invoice_subscription_reference_in_either_shape() {
        let legacy = json!({
            "id": "evt_a", "type": "invoice.payment_failed",
            "data": {"object": {"subscription": "sub_legacy"}}
        });
        let nested = json!({
            "id": "evt_b", "type": "invoice.payment_failed",
            "data": {"object": {"parent": {"subscription_details": {"subscription": "sub_nested"}}}}
        });
        for (body, expected) in [(legacy, "sub_legacy"), (nested, "sub_nested")] {
            let event = parse_event(body.to_string().as_bytes()).unwrap();
            assert_eq!(
                event.event,
                BillingEvent::PaymentFailed {
                    subscription_id: Some(expected.to_string())
                }
            );
        }
    }

    #[test]
    fn unknown_event_types_are_unhandled() {
        let body = json!({"id": "evt_x", "type": "charge.refunded", "data": {"object": {}}});
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.event, BillingEvent::Unhandled);
    }

    #[tokio::test]
    async fn retrieves_subscription_snapshot() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/subscriptions/sub_42");
                then.status(200).json_body(json!({
                    "id": "sub_42",
                    "status": "past_due",
                    "customer": "cus_42",
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000,
                    "cancel_at_period_end": false
                }));
            })
            .await;

        let remote = gateway(&server.base_url())
            .retrieve_subscription("sub_42")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(remote.status, RemoteStatus::PastDue);
        assert_eq!(remote.customer_id.as_deref(), Some("cus_42"));
    }

    #[tokio::test]
    async fn immediate_cancel_of_missing_subscription_reports_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/v1/subscriptions/sub_gone");
                then.status(404).json_body(json!({
                    "error": {"message": "No such subscription: 'sub_gone'"}
                }));
            })
            .await;

        let result = gateway(&server.base_url()).cancel("sub_gone", false).await;
        assert!(
            matches!(result, Err(BillingError::NotFound(message)) if message.contains("sub_gone"))
        );
    }

    #[tokio::test]
    async fn checkout_carries_price_and_metadata() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/checkout/sessions")
                    .body_contains("mode=subscription")
                    .body_contains("price_monthly_1")
                    .body_contains("alice");
                then.status(200)
                    .json_body(json!({"id": "cs_new", "url": "https://checkout.test/cs_new"}));
            })
            .await;

        let now = Utc::now();
        let tier = Tier {
            id: 1,
            name: "Basic".into(),
            description: None,
            price_cents: 999,
            billing_price_id: Some("price_monthly_1".into()),
            allow_downloads: false,
            collections: vec!["Movies".into()],
            active: true,
            created_at: now,
            updated_at: now,
        };
        let metadata = BTreeMap::from([("access_username".to_string(), "alice".to_string())]);
        let session = gateway(&server.base_url())
            .create_checkout(&tier, "a@b.com", "http://ok", "http://cancel", &metadata)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(session.id, "cs_new");
    }
}
