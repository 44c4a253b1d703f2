use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::ReconcileError;
use super::ledger::{CreateOutcome, SubscriptionLedger, TransitionOutcome};
use super::models::{
    EffectKind, Inconsistencies, InviteRequest, InviteStatus, NewInviteRequest, NewSubscription,
    NewTier, Subscription, Tier, TierUpdate,
};
use super::transitions::Transition;
use crate::config;
use crate::gateways::{
    bounded, AccessError, AccessProvider, BillingError, BillingEvent, BillingProvider,
    CheckoutSession, CompletedCheckout, RemoteStatus, RemoteSubscription,
};
use crate::validation::{is_email, sanitize_input, validate_identity};

/// key: reconciliation-settings -> timeouts and outbox tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub gateway_timeout: StdDuration,
    pub warning_window: Duration,
    pub outbox_max_attempts: i32,
    pub outbox_backoff_base: Duration,
    pub outbox_lease: Duration,
    pub outbox_batch: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: StdDuration::from_secs(5),
            warning_window: Duration::days(3),
            outbox_max_attempts: 12,
            outbox_backoff_base: Duration::seconds(30),
            outbox_lease: Duration::seconds(60),
            outbox_batch: 50,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            gateway_timeout: StdDuration::from_secs(*config::GATEWAY_TIMEOUT_SECS),
            warning_window: Duration::days(*config::EXPIRY_WARNING_DAYS),
            outbox_max_attempts: *config::OUTBOX_MAX_ATTEMPTS,
            outbox_backoff_base: Duration::seconds(*config::OUTBOX_BACKOFF_BASE_SECS),
            outbox_lease: Duration::seconds(*config::OUTBOX_LEASE_SECS),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Ignored,
}

/// Redirect targets handed to the billing provider's hosted checkout.
#[derive(Debug, Clone)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    pub fn for_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            success_url: format!("{base}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{base}/checkout/cancel"),
        }
    }
}

/// key: reconciliation-engine -> keeps ledger, billing and access state aligned
///
/// Every status or period change is a [`Transition`] applied through the ledger; gateway
/// calls only ever happen for outbox effects committed alongside that change.
pub struct ReconciliationEngine {
    pub(super) ledger: Arc<dyn SubscriptionLedger>,
    pub(super) access: Arc<dyn AccessProvider>,
    pub(super) billing: Arc<dyn BillingProvider>,
    pub(super) settings: EngineSettings,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn SubscriptionLedger>,
        access: Arc<dyn AccessProvider>,
        billing: Arc<dyn BillingProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            access,
            billing,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn SubscriptionLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Verifies an inbound delivery and routes it. References to remote objects the
    /// ledger does not know are acknowledged so the provider stops redelivering.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let delivery = self
            .billing
            .verify_and_parse_webhook(raw_body, signature_header)?;
        let event_id = delivery.id.as_str();
        let event_type = delivery.event_type.as_str();

        let result = match &delivery.event {
            BillingEvent::CheckoutCompleted(session) => {
                if session.subscription_id.is_none() {
                    info!(
                        event_id,
                        session_id = %session.session_id,
                        "checkout without subscription ignored"
                    );
                    return Ok(WebhookOutcome::Ignored);
                }
                self.record_checkout_completed(session).await.map(|_| ())
            }
            BillingEvent::SubscriptionUpdated(snapshot) => {
                self.apply_remote_subscription_update(snapshot).await
            }
            BillingEvent::SubscriptionDeleted { subscription_id } => {
                self.apply_remote_subscription_deleted(subscription_id).await
            }
            BillingEvent::PaymentFailed {
                subscription_id: Some(subscription_id),
            } => self.apply_payment_failed(subscription_id).await,
            BillingEvent::PaymentFailed {
                subscription_id: None,
            } => {
                debug!(event_id, "payment failure without subscription ignored");
                return Ok(WebhookOutcome::Ignored);
            }
            BillingEvent::Unhandled => {
                debug!(event_id, event_type, "unhandled webhook event type");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        match result {
            Ok(()) => {
                info!(event_id, event_type, "webhook applied");
                Ok(WebhookOutcome::Applied)
            }
            Err(err) if err.is_not_found() => {
                info!(
                    ?err,
                    event_id,
                    event_type,
                    "webhook references unknown object; acknowledged"
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(err) => Err(err),
        }
    }

    /// Creates the local row for a completed checkout and grants access. Replays of the
    /// same remote subscription resolve to the row created first.
    pub async fn record_checkout_completed(
        &self,
        session: &CompletedCheckout,
    ) -> Result<Subscription, ReconcileError> {
        let now = Utc::now();
        let raw_tier = session.metadata.get("tier_id").ok_or_else(|| {
            ReconcileError::Validation(format!(
                "checkout session {} carries no tier_id",
                session.session_id
            ))
        })?;
        let tier_id = raw_tier.trim().parse::<i64>().map_err(|_| {
            ReconcileError::Validation(format!("tier_id {raw_tier} is not an integer"))
        })?;
        let tier = self.active_tier(tier_id).await?;

        let remote_id = session.subscription_id.as_deref().ok_or_else(|| {
            ReconcileError::Validation(format!(
                "checkout session {} has no subscription",
                session.session_id
            ))
        })?;
        if let Some(existing) = self.ledger.find_by_billing_subscription_id(remote_id).await? {
            info!(
                subscription_id = existing.id,
                billing_subscription_id = remote_id,
                "checkout already recorded"
            );
            return Ok(existing);
        }

        let email = session
            .metadata
            .get("email")
            .filter(|value| !value.trim().is_empty())
            .or(session.customer_email.as_ref())
            .map(|value| sanitize_input(value))
            .ok_or_else(|| {
                ReconcileError::Validation(format!(
                    "checkout session {} has no customer email",
                    session.session_id
                ))
            })?;
        let access_username = session
            .metadata
            .get("access_username")
            .map(|value| sanitize_input(value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| email.clone());

        if let Some(live) = self
            .ledger
            .live_subscription_for(tier.id, &email, &access_username)
            .await?
        {
            warn!(
                subscription_id = live.id,
                tier_id = tier.id,
                billing_subscription_id = remote_id,
                "paid checkout duplicates a live subscription on the same tier"
            );
        }

        let remote = bounded(
            self.settings.gateway_timeout,
            self.billing.retrieve_subscription(remote_id),
            || BillingError::Transport(format!("retrieving {remote_id} timed out")),
        )
        .await?;

        let row = NewSubscription {
            email,
            access_username,
            tier_id: Some(tier.id),
            period_start: remote.period_start.unwrap_or(now),
            period_end: remote.period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
            grandfathered: false,
            billing_customer_id: remote.customer_id.or_else(|| session.customer_id.clone()),
            billing_subscription_id: Some(remote_id.to_string()),
        };
        match self
            .ledger
            .create_subscription(row, &[EffectKind::GrantAccess], now)
            .await?
        {
            CreateOutcome::Existing(existing) => {
                info!(
                    subscription_id = existing.id,
                    billing_subscription_id = remote_id,
                    "concurrent checkout delivery resolved to existing row"
                );
                Ok(existing)
            }
            CreateOutcome::Created {
                subscription,
                effects,
            } => {
                info!(
                    subscription_id = subscription.id,
                    tier_id = tier.id,
                    billing_subscription_id = remote_id,
                    "subscription created from checkout"
                );
                self.dispatch_logged(&effects, now).await;
                Ok(subscription)
            }
        }
    }

    pub async fn apply_remote_subscription_update(
        &self,
        snapshot: &RemoteSubscription,
    ) -> Result<(), ReconcileError> {
        let subscription = self.by_remote_id(&snapshot.id).await?;
        if let RemoteStatus::Other(remote_status) = &snapshot.status {
            warn!(
                subscription_id = subscription.id,
                remote_status = %remote_status,
                "unrecognised remote status; treating as active"
            );
        }
        let transition = Transition::RemoteUpdate {
            status: snapshot.status.local_status(),
            period_start: snapshot.period_start,
            period_end: snapshot.period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
        };
        let now = Utc::now();
        let outcome = self.transition(subscription.id, transition, now).await?;
        self.dispatch_logged(&outcome.effects, now).await;
        Ok(())
    }

    pub async fn apply_remote_subscription_deleted(
        &self,
        remote_id: &str,
    ) -> Result<(), ReconcileError> {
        let subscription = self.by_remote_id(remote_id).await?;
        let now = Utc::now();
        let outcome = self
            .transition(subscription.id, Transition::RemoteDeleted, now)
            .await?;
        self.dispatch_logged(&outcome.effects, now).await;
        Ok(())
    }

    pub async fn apply_payment_failed(&self, remote_id: &str) -> Result<(), ReconcileError> {
        let subscription = self.by_remote_id(remote_id).await?;
        let outcome = self
            .transition(subscription.id, Transition::PaymentFailed, Utc::now())
            .await?;
        if outcome.changed {
            warn!(
                subscription_id = subscription.id,
                email = %subscription.email,
                "payment failed; subscription past due"
            );
        }
        Ok(())
    }

    /// Cancels locally, revokes access and cancels billing immediately. A failed revoke
    /// is returned to the caller; the effect itself stays queued.
    pub async fn manual_revoke(&self, id: i64) -> Result<Subscription, ReconcileError> {
        let now = Utc::now();
        let outcome = self.transition(id, Transition::ManualRevoke, now).await?;
        let mut revoke_error = None;
        let results = self.run_inline(&outcome.effects, now).await;
        for (effect, result) in outcome.effects.iter().zip(results) {
            let Err(err) = result else { continue };
            match effect.kind {
                EffectKind::RevokeAccess => {
                    warn!(?err, subscription_id = id, "manual revoke failed; left in outbox");
                    revoke_error.get_or_insert(err);
                }
                EffectKind::CancelBilling | EffectKind::GrantAccess => warn!(
                    ?err,
                    subscription_id = id,
                    effect = effect.kind.as_str(),
                    "follow-up effect failed; left in outbox"
                ),
            }
        }
        match revoke_error {
            Some(err) => Err(err),
            None => Ok(outcome.subscription),
        }
    }

    pub async fn manual_extend(&self, id: i64, days: i64) -> Result<Subscription, ReconcileError> {
        if days <= 0 || Duration::try_days(days).is_none() {
            return Err(ReconcileError::Validation(format!(
                "extension must be a positive number of days within range, got {days}"
            )));
        }
        let now = Utc::now();
        let outcome = self
            .transition(id, Transition::ManualExtend { days }, now)
            .await?;
        // An extension that leaves the row untouched overflowed the date range.
        if !outcome.changed {
            return Err(ReconcileError::Validation(format!(
                "extending subscription {id} by {days} days overflows its period end"
            )));
        }
        self.dispatch_logged(&outcome.effects, now).await;
        Ok(outcome.subscription)
    }

    /// Opens a hosted checkout for an active, priced tier.
    pub async fn start_checkout(
        &self,
        tier_id: i64,
        email: &str,
        access_username: Option<&str>,
        urls: &CheckoutUrls,
    ) -> Result<CheckoutSession, ReconcileError> {
        let email = sanitize_input(email);
        if !is_email(&email) {
            return Err(ReconcileError::Validation(format!("{email} is not an email address")));
        }
        let access_username = access_username
            .map(sanitize_input)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| email.clone());
        if !validate_identity(&access_username) {
            return Err(ReconcileError::Validation(format!(
                "{access_username} is not a valid username"
            )));
        }

        let tier = self.active_tier(tier_id).await?;
        if tier.billing_price_id.is_none() {
            return Err(ReconcileError::Validation(format!(
                "tier {} has no billing price",
                tier.id
            )));
        }
        if let Some(existing) = self
            .ledger
            .live_subscription_for(tier.id, &email, &access_username)
            .await?
        {
            info!(
                subscription_id = existing.id,
                tier_id = tier.id,
                "checkout refused; live subscription already exists"
            );
            return Err(ReconcileError::Conflict(format!(
                "{email} already holds subscription {} on tier {}",
                existing.id, tier.id
            )));
        }

        let metadata = BTreeMap::from([
            ("tier_id".to_string(), tier.id.to_string()),
            ("email".to_string(), email.clone()),
            ("access_username".to_string(), access_username),
        ]);
        let session = bounded(
            self.settings.gateway_timeout,
            self.billing.create_checkout(
                &tier,
                &email,
                &urls.success_url,
                &urls.cancel_url,
                &metadata,
            ),
            || BillingError::Transport("creating checkout timed out".into()),
        )
        .await?;
        info!(tier_id = tier.id, session_id = %session.id, "checkout session opened");
        Ok(session)
    }

    /// Shares `collections` with `identity` outside of any subscription.
    pub async fn grant_free_access(
        &self,
        identity: &str,
        collections: &[String],
    ) -> Result<InviteRequest, ReconcileError> {
        let identity = sanitize_input(identity);
        if !validate_identity(&identity) {
            return Err(ReconcileError::Validation(format!(
                "{identity} is neither an email nor a username"
            )));
        }

        let result = bounded(
            self.settings.gateway_timeout,
            self.access.grant(&identity, collections, false),
            || AccessError::Transport("grant timed out".into()),
        )
        .await;
        let (status, error) = match result {
            Ok(()) | Err(AccessError::AlreadyGranted) => (InviteStatus::Success, None),
            Err(err) => (InviteStatus::Failed, Some(err)),
        };
        let invite = self
            .ledger
            .record_invite(
                NewInviteRequest {
                    identity,
                    status,
                    error_message: error.as_ref().map(ToString::to_string),
                    subscription_id: None,
                    is_free: true,
                },
                Utc::now(),
            )
            .await?;
        match error {
            Some(err) => {
                warn!(?err, invite_id = invite.id, "free invite failed");
                Err(err.into())
            }
            None => {
                info!(invite_id = invite.id, "free invite granted");
                Ok(invite)
            }
        }
    }

    /// Converts successful, unlinked paid invites into grandfathered rows under `tier_id`.
    pub async fn grandfather_existing_users(&self, tier_id: i64) -> Result<usize, ReconcileError> {
        if self.ledger.get_tier(tier_id).await?.is_none() {
            return Err(ReconcileError::TierNotFound(tier_id));
        }
        let now = Utc::now();
        let mut converted = 0;
        for invite in self.ledger.unlinked_successful_invites().await? {
            match self.ledger.grandfather_invite(invite.id, tier_id, now).await {
                Ok(Some(subscription)) => {
                    converted += 1;
                    info!(
                        invite_id = invite.id,
                        subscription_id = subscription.id,
                        "invite grandfathered"
                    );
                }
                Ok(None) => debug!(invite_id = invite.id, "invite linked concurrently"),
                Err(err) => warn!(?err, invite_id = invite.id, "failed to grandfather invite"),
            }
        }
        Ok(converted)
    }

    pub async fn inconsistencies(&self) -> Result<Inconsistencies, ReconcileError> {
        Ok(Inconsistencies {
            ungranted: self.ledger.subscriptions_without_grant().await?,
            dead_effects: self.ledger.dead_effects().await?,
        })
    }

    pub async fn create_tier(&self, tier: NewTier) -> Result<Tier, ReconcileError> {
        let name = sanitize_input(&tier.name);
        if name.is_empty() {
            return Err(ReconcileError::Validation("tier name is required".into()));
        }
        if tier.price_cents < 0 {
            return Err(ReconcileError::Validation("tier price cannot be negative".into()));
        }
        let tier = self
            .ledger
            .create_tier(NewTier { name, ..tier }, Utc::now())
            .await?;
        info!(tier_id = tier.id, name = %tier.name, "tier created");
        Ok(tier)
    }

    pub async fn update_tier(&self, id: i64, update: TierUpdate) -> Result<Tier, ReconcileError> {
        if update.price_cents.map_or(false, |price| price < 0) {
            return Err(ReconcileError::Validation("tier price cannot be negative".into()));
        }
        Ok(self.ledger.update_tier(id, update, Utc::now()).await?)
    }

    pub async fn toggle_tier(&self, id: i64) -> Result<Tier, ReconcileError> {
        let tier = self
            .ledger
            .get_tier(id)
            .await?
            .ok_or(ReconcileError::TierNotFound(id))?;
        let tier = self
            .ledger
            .set_tier_active(id, !tier.active, Utc::now())
            .await?;
        info!(tier_id = id, active = tier.active, "tier toggled");
        Ok(tier)
    }

    pub async fn list_collections(&self) -> Result<Vec<String>, ReconcileError> {
        Ok(bounded(
            self.settings.gateway_timeout,
            self.access.list_collections(),
            || AccessError::Transport("listing collections timed out".into()),
        )
        .await?)
    }

    async fn active_tier(&self, tier_id: i64) -> Result<Tier, ReconcileError> {
        self.ledger
            .get_tier(tier_id)
            .await?
            .filter(|tier| tier.active)
            .ok_or(ReconcileError::TierNotFound(tier_id))
    }

    async fn by_remote_id(&self, remote_id: &str) -> Result<Subscription, ReconcileError> {
        self.ledger
            .find_by_billing_subscription_id(remote_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("billing subscription {remote_id}")))
    }

    pub(super) async fn transition(
        &self,
        id: i64,
        transition: Transition,
        now: chrono::DateTime<Utc>,
    ) -> Result<TransitionOutcome, ReconcileError> {
        let outcome = self.ledger.apply_transition(id, &transition, now).await?;
        if outcome.changed {
            info!(
                subscription_id = id,
                transition = transition.label(),
                status = %outcome.subscription.status,
                effects = outcome.effects.len(),
                "subscription transitioned"
            );
        } else {
            debug!(subscription_id = id, transition = transition.label(), "transition was a no-op");
        }
        Ok(outcome)
    }
}
