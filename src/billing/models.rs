use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: subscription-status -> closed lifecycle set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states are only left through an explicit administrator extension.
    pub fn is_terminal(&self) -> bool {
        match self {
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => true,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue => false,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: tier-model -> access plan
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Tier {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing_price_id: Option<String>,
    pub allow_downloads: bool,
    pub collections: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTier {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    #[serde(default)]
    pub billing_price_id: Option<String>,
    #[serde(default)]
    pub allow_downloads: bool,
    #[serde(default)]
    pub collections: Vec<String>,
}

/// Partial update; `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierUpdate {
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub billing_price_id: Option<String>,
    pub allow_downloads: Option<bool>,
    pub collections: Option<Vec<String>>,
}

impl TierUpdate {
    pub fn apply(&self, tier: &mut Tier) {
        if let Some(description) = &self.description {
            tier.description = Some(description.clone());
        }
        if let Some(price_cents) = self.price_cents {
            tier.price_cents = price_cents;
        }
        if let Some(price_id) = &self.billing_price_id {
            tier.billing_price_id = Some(price_id.clone());
        }
        if let Some(allow_downloads) = self.allow_downloads {
            tier.allow_downloads = allow_downloads;
        }
        if let Some(collections) = &self.collections {
            tier.collections = collections.clone();
        }
    }
}

/// key: subscription-model -> one user's grant under one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub email: String,
    pub access_username: String,
    pub tier_id: Option<i64>,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub grandfathered: bool,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// An expired row must never carry a period end that is still ahead of `now`.
    pub fn invariant_violation(&self, now: DateTime<Utc>) -> Option<String> {
        match (self.status, self.period_end) {
            (SubscriptionStatus::Expired, Some(end)) if end > now => Some(format!(
                "subscription {} would be expired with period_end {end} in the future",
                self.id
            )),
            _ => None,
        }
    }

    pub fn days_left(&self, now: DateTime<Utc>) -> Option<i64> {
        self.period_end.map(|end| (end - now).num_days())
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub email: String,
    pub access_username: String,
    pub tier_id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub grandfathered: bool,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
}

impl NewSubscription {
    pub fn into_subscription(self, id: i64, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id,
            email: self.email,
            access_username: self.access_username,
            tier_id: self.tier_id,
            status: SubscriptionStatus::Active,
            period_start: self.period_start,
            period_end: self.period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            grandfathered: self.grandfathered,
            billing_customer_id: self.billing_customer_id,
            billing_subscription_id: self.billing_subscription_id,
            revoked_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub status: Option<SubscriptionStatus>,
    pub search: Option<String>,
}

impl SubscriptionFilter {
    pub fn matches(&self, subscription: &Subscription) -> bool {
        if let Some(status) = self.status {
            if subscription.status != status {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            let email = subscription.email.to_lowercase();
            let username = subscription.access_username.to_lowercase();
            if !email.contains(&search) && !username.contains(&search) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Success,
    Failed,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Success => "success",
            InviteStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "success" => Some(InviteStatus::Success),
            "failed" => Some(InviteStatus::Failed),
            _ => None,
        }
    }
}

/// key: invite-audit -> one grant attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteRequest {
    pub id: i64,
    pub identity: String,
    pub status: InviteStatus,
    pub error_message: Option<String>,
    pub subscription_id: Option<i64>,
    pub is_free: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInviteRequest {
    pub identity: String,
    pub status: InviteStatus,
    pub error_message: Option<String>,
    pub subscription_id: Option<i64>,
    pub is_free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    GrantAccess,
    RevokeAccess,
    CancelBilling,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::GrantAccess => "grant_access",
            EffectKind::RevokeAccess => "revoke_access",
            EffectKind::CancelBilling => "cancel_billing",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "grant_access" => Some(EffectKind::GrantAccess),
            "revoke_access" => Some(EffectKind::RevokeAccess),
            "cancel_billing" => Some(EffectKind::CancelBilling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectState {
    Pending,
    Done,
    Dead,
}

impl EffectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectState::Pending => "pending",
            EffectState::Done => "done",
            EffectState::Dead => "dead",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EffectState::Pending),
            "done" => Some(EffectState::Done),
            "dead" => Some(EffectState::Dead),
            _ => None,
        }
    }
}

/// key: outbox-model -> side effect committed alongside a ledger change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEffect {
    pub id: Uuid,
    pub subscription_id: i64,
    pub kind: EffectKind,
    pub state: EffectState,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEffect {
    pub fn pending(subscription_id: i64, kind: EffectKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            kind,
            state: EffectState::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a single effect attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectOutcome {
    Done,
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    Dead {
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub total: i64,
    pub active: i64,
    pub past_due: i64,
    pub cancelled: i64,
    pub expired: i64,
    pub grandfathered: i64,
    pub mrr_cents: i64,
}

impl SubscriptionStats {
    pub fn add(&mut self, status: SubscriptionStatus, count: i64) {
        self.total += count;
        match status {
            SubscriptionStatus::Active => self.active += count,
            SubscriptionStatus::PastDue => self.past_due += count,
            SubscriptionStatus::Cancelled => self.cancelled += count,
            SubscriptionStatus::Expired => self.expired += count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InviteStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Inconsistencies {
    pub ungranted: Vec<Subscription>,
    pub dead_effects: Vec<OutboxEffect>,
}
