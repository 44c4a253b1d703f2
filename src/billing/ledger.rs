use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    EffectKind, EffectOutcome, InviteRequest, InviteStats, NewInviteRequest, NewSubscription,
    NewTier, OutboxEffect, Subscription, SubscriptionFilter, SubscriptionStats,
    SubscriptionStatus, Tier, TierUpdate,
};
use super::transitions::Transition;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Insert-or-fetch result for subscriptions keyed by a billing subscription id.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created {
        subscription: Subscription,
        effects: Vec<OutboxEffect>,
    },
    Existing(Subscription),
}

impl CreateOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            CreateOutcome::Created { subscription, .. } => subscription,
            CreateOutcome::Existing(subscription) => subscription,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub subscription: Subscription,
    pub changed: bool,
    pub effects: Vec<OutboxEffect>,
}

/// key: subscription-ledger -> durable store owned by the reconciliation engine
#[async_trait]
pub trait SubscriptionLedger: Send + Sync {
    async fn create_tier(&self, tier: NewTier, now: DateTime<Utc>) -> Result<Tier, LedgerError>;
    async fn update_tier(
        &self,
        id: i64,
        update: TierUpdate,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError>;
    async fn set_tier_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError>;
    async fn get_tier(&self, id: i64) -> Result<Option<Tier>, LedgerError>;
    async fn list_tiers(&self, include_inactive: bool) -> Result<Vec<Tier>, LedgerError>;

    /// Rows carrying a billing subscription id are unique on it; a second create for the
    /// same id returns the existing row and schedules nothing.
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
        effects: &[EffectKind],
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, LedgerError>;
    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, LedgerError>;
    async fn find_by_billing_subscription_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Subscription>, LedgerError>;
    async fn list_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, LedgerError>;
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, LedgerError>;
    /// An active or past-due row on `tier_id` held by `email` or `access_username`,
    /// compared case-insensitively.
    async fn live_subscription_for(
        &self,
        tier_id: i64,
        email: &str,
        access_username: &str,
    ) -> Result<Option<Subscription>, LedgerError>;

    /// The single mutation path for status and billing-period fields. Reads the row under
    /// lock, plans `transition`, and writes the row plus any effects atomically.
    async fn apply_transition(
        &self,
        id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, LedgerError>;

    async fn stats(&self) -> Result<SubscriptionStats, LedgerError>;
    /// Active or past-due rows that never received a successful grant.
    async fn subscriptions_without_grant(&self) -> Result<Vec<Subscription>, LedgerError>;

    async fn record_invite(
        &self,
        invite: NewInviteRequest,
        now: DateTime<Utc>,
    ) -> Result<InviteRequest, LedgerError>;
    async fn list_invites(&self, limit: i64) -> Result<Vec<InviteRequest>, LedgerError>;
    async fn invite_stats(&self) -> Result<InviteStats, LedgerError>;
    async fn unlinked_successful_invites(&self) -> Result<Vec<InviteRequest>, LedgerError>;
    /// Creates a grandfathered subscription for an unlinked invite and links it. Returns
    /// `None` when the invite was linked meanwhile.
    async fn grandfather_invite(
        &self,
        invite_id: i64,
        tier_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, LedgerError>;

    /// Claims due effects by pushing their visibility out to `now + lease`.
    async fn claim_effects(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxEffect>, LedgerError>;
    /// Claims one effect if it is still pending and due.
    async fn claim_effect(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<OutboxEffect>, LedgerError>;
    async fn finish_effect(
        &self,
        id: Uuid,
        outcome: &EffectOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError>;
    async fn dead_effects(&self) -> Result<Vec<OutboxEffect>, LedgerError>;
}
