#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gatekeeper::billing::{
    EngineSettings, MemoryLedger, NewSubscription, NewTier, ReconciliationEngine, Subscription,
    SubscriptionLedger, Tier,
};
use gatekeeper::gateways::stripe::{sign_payload, StripeGateway};
use gatekeeper::gateways::{
    AccessError, AccessProvider, BillingError, BillingProvider, CheckoutSession,
    CompletedCheckout, RemoteStatus, RemoteSubscription, WebhookEvent,
};

pub const WEBHOOK_SECRET: &str = "whsec_integration";

#[derive(Debug, Clone, PartialEq)]
pub struct GrantCall {
    pub identity: String,
    pub collections: Vec<String>,
    pub allow_downloads: bool,
}

/// Access provider double that records calls and replays queued failures.
#[derive(Default)]
pub struct FakeAccess {
    grants: Mutex<Vec<GrantCall>>,
    revokes: Mutex<Vec<String>>,
    grant_failures: Mutex<VecDeque<AccessError>>,
    revoke_failures: Mutex<VecDeque<AccessError>>,
}

impl FakeAccess {
    pub fn fail_next_grant(&self, err: AccessError) {
        self.grant_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_revoke(&self, err: AccessError) {
        self.revoke_failures.lock().unwrap().push_back(err);
    }

    pub fn grants(&self) -> Vec<GrantCall> {
        self.grants.lock().unwrap().clone()
    }

    pub fn revokes(&self) -> Vec<String> {
        self.revokes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccessProvider for FakeAccess {
    async fn grant(
        &self,
        identity: &str,
        collections: &[String],
        allow_downloads: bool,
    ) -> Result<(), AccessError> {
        self.grants.lock().unwrap().push(GrantCall {
            identity: identity.to_string(),
            collections: collections.to_vec(),
            allow_downloads,
        });
        match self.grant_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn revoke(&self, identity: &str) -> Result<(), AccessError> {
        self.revokes.lock().unwrap().push(identity.to_string());
        match self.revoke_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, AccessError> {
        Ok(vec!["Movies".into(), "TV".into()])
    }
}

/// Billing provider double. Webhook verification is the real Stripe scheme; remote
/// subscriptions come from an in-memory table.
pub struct FakeBilling {
    verifier: StripeGateway,
    remote: Mutex<HashMap<String, RemoteSubscription>>,
    cancels: Mutex<Vec<(String, bool)>>,
    checkouts: Mutex<Vec<BTreeMap<String, String>>>,
}

impl Default for FakeBilling {
    fn default() -> Self {
        Self {
            verifier: StripeGateway::new("http://127.0.0.1:9", "sk_test", WEBHOOK_SECRET),
            remote: Mutex::new(HashMap::new()),
            cancels: Mutex::new(Vec::new()),
            checkouts: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBilling {
    pub fn insert_remote(&self, subscription: RemoteSubscription) {
        self.remote
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn cancels(&self) -> Vec<(String, bool)> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn checkouts(&self) -> Vec<BTreeMap<String, String>> {
        self.checkouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn create_checkout(
        &self,
        _tier: &Tier,
        _customer_email: &str,
        _success_url: &str,
        _cancel_url: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<CheckoutSession, BillingError> {
        let mut checkouts = self.checkouts.lock().unwrap();
        checkouts.push(metadata.clone());
        Ok(CheckoutSession {
            id: format!("cs_test_{}", checkouts.len()),
            url: Some("https://checkout.example/session".into()),
        })
    }

    async fn retrieve_subscription(
        &self,
        remote_id: &str,
    ) -> Result<RemoteSubscription, BillingError> {
        self.remote
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(remote_id.to_string()))
    }

    async fn cancel(&self, remote_id: &str, at_period_end: bool) -> Result<(), BillingError> {
        self.cancels
            .lock()
            .unwrap()
            .push((remote_id.to_string(), at_period_end));
        Ok(())
    }

    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, BillingError> {
        self.verifier
            .verify_and_parse_webhook(raw_body, signature_header)
    }
}

pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub ledger: Arc<MemoryLedger>,
    pub access: Arc<FakeAccess>,
    pub billing: Arc<FakeBilling>,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        gateway_timeout: StdDuration::from_secs(2),
        warning_window: Duration::days(3),
        outbox_max_attempts: 3,
        outbox_backoff_base: Duration::seconds(30),
        outbox_lease: Duration::seconds(60),
        outbox_batch: 50,
    }
}

pub fn harness() -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let access = Arc::new(FakeAccess::default());
    let billing = Arc::new(FakeBilling::default());
    let engine = Arc::new(ReconciliationEngine::new(
        ledger.clone(),
        access.clone(),
        billing.clone(),
        settings(),
    ));
    Harness {
        engine,
        ledger,
        access,
        billing,
    }
}

impl Harness {
    pub async fn tier(&self, name: &str, price_cents: i64, collections: &[&str]) -> Tier {
        self.ledger
            .create_tier(
                NewTier {
                    name: name.to_string(),
                    description: None,
                    price_cents,
                    billing_price_id: Some(format!("price_{name}")),
                    allow_downloads: false,
                    collections: collections.iter().map(|c| c.to_string()).collect(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    /// Inserts a subscription row directly, bypassing checkout.
    pub async fn subscription(&self, row: NewSubscription) -> Subscription {
        self.ledger
            .create_subscription(row, &[], Utc::now())
            .await
            .unwrap()
            .subscription()
            .clone()
    }
}

pub fn new_row(
    email: &str,
    tier_id: Option<i64>,
    period_end: Option<DateTime<Utc>>,
    remote_id: Option<&str>,
) -> NewSubscription {
    NewSubscription {
        email: email.to_string(),
        access_username: email.to_string(),
        tier_id,
        period_start: Utc::now() - Duration::days(30),
        period_end,
        cancel_at_period_end: false,
        grandfathered: false,
        billing_customer_id: remote_id.map(|_| "cus_test".to_string()),
        billing_subscription_id: remote_id.map(str::to_string),
    }
}

pub fn remote(id: &str, status: &str, period_end: DateTime<Utc>) -> RemoteSubscription {
    RemoteSubscription {
        id: id.to_string(),
        status: RemoteStatus::parse(status),
        customer_id: Some("cus_test".into()),
        period_start: Some(period_end - Duration::days(30)),
        period_end: Some(period_end),
        cancel_at_period_end: false,
    }
}

pub fn completed_checkout(tier_id: i64, email: &str, remote_id: &str) -> CompletedCheckout {
    CompletedCheckout {
        session_id: format!("cs_{remote_id}"),
        customer_email: Some(email.to_string()),
        customer_id: Some("cus_test".into()),
        subscription_id: Some(remote_id.to_string()),
        metadata: BTreeMap::from([("tier_id".to_string(), tier_id.to_string())]),
    }
}

/// Signs `body` the way the provider does, stamped with the current time.
pub fn signature(body: &[u8]) -> String {
    sign_payload(WEBHOOK_SECRET, Utc::now().timestamp(), body)
}
