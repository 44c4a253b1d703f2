use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CreateOutcome, LedgerError, SubscriptionLedger, TransitionOutcome};
use crate::billing::models::{
    EffectKind, EffectOutcome, EffectState, InviteRequest, InviteStats, InviteStatus,
    NewInviteRequest, NewSubscription, NewTier, OutboxEffect, Subscription, SubscriptionFilter,
    SubscriptionStats, SubscriptionStatus, Tier, TierUpdate,
};
use crate::billing::transitions::{self, Transition};

#[derive(Default)]
struct MemoryState {
    tiers: BTreeMap<i64, Tier>,
    subscriptions: BTreeMap<i64, Subscription>,
    invites: BTreeMap<i64, InviteRequest>,
    effects: Vec<OutboxEffect>,
    next_tier_id: i64,
    next_subscription_id: i64,
    next_invite_id: i64,
}

impl MemoryState {
    fn allocate_subscription(
        &mut self,
        subscription: NewSubscription,
        now: DateTime<Utc>,
    ) -> Subscription {
        self.next_subscription_id += 1;
        let row = subscription.into_subscription(self.next_subscription_id, now);
        self.subscriptions.insert(row.id, row.clone());
        row
    }

    fn enqueue(
        &mut self,
        subscription_id: i64,
        kinds: &[EffectKind],
        now: DateTime<Utc>,
    ) -> Vec<OutboxEffect> {
        let effects: Vec<OutboxEffect> = kinds
            .iter()
            .map(|kind| OutboxEffect::pending(subscription_id, *kind, now))
            .collect();
        self.effects.extend(effects.iter().cloned());
        effects
    }
}

/// key: subscription-ledger-memory -> single-process store for tests and dry runs
///
/// One mutex guards the whole store and is never held across an await on anything
/// but itself, so every operation is atomic.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox row, oldest first.
    pub async fn effects(&self) -> Vec<OutboxEffect> {
        self.state.lock().await.effects.clone()
    }
}

#[async_trait]
impl SubscriptionLedger for MemoryLedger {
    async fn create_tier(&self, tier: NewTier, now: DateTime<Utc>) -> Result<Tier, LedgerError> {
        let mut state = self.state.lock().await;
        if state.tiers.values().any(|existing| existing.name == tier.name) {
            return Err(LedgerError::Conflict(format!(
                "tier name {} already exists",
                tier.name
            )));
        }
        state.next_tier_id += 1;
        let row = Tier {
            id: state.next_tier_id,
            name: tier.name,
            description: tier.description,
            price_cents: tier.price_cents,
            billing_price_id: tier.billing_price_id,
            allow_downloads: tier.allow_downloads,
            collections: tier.collections,
            active: true,
            created_at: now,
            updated_at: now,
        };
        state.tiers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_tier(
        &self,
        id: i64,
        update: TierUpdate,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError> {
        let mut state = self.state.lock().await;
        let tier = state
            .tiers
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("tier", id))?;
        update.apply(tier);
        tier.updated_at = now;
        Ok(tier.clone())
    }

    async fn set_tier_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError> {
        let mut state = self.state.lock().await;
        let tier = state
            .tiers
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("tier", id))?;
        tier.active = active;
        tier.updated_at = now;
        Ok(tier.clone())
    }

    async fn get_tier(&self, id: i64) -> Result<Option<Tier>, LedgerError> {
        Ok(self.state.lock().await.tiers.get(&id).cloned())
    }

    async fn list_tiers(&self, include_inactive: bool) -> Result<Vec<Tier>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .tiers
            .values()
            .filter(|tier| include_inactive || tier.active)
            .cloned()
            .collect())
    }

    async fn create_subscription(
        &self,
        subscription: NewSubscription,
        effects: &[EffectKind],
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(remote_id) = subscription.billing_subscription_id.as_deref() {
            let existing = state
                .subscriptions
                .values()
                .find(|row| row.billing_subscription_id.as_deref() == Some(remote_id));
            if let Some(existing) = existing {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }
        let row = state.allocate_subscription(subscription, now);
        let effects = state.enqueue(row.id, effects, now);
        Ok(CreateOutcome::Created {
            subscription: row,
            effects,
        })
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, LedgerError> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn find_by_billing_subscription_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|row| row.billing_subscription_id.as_deref() == Some(remote_id))
            .cloned())
    }

    async fn list_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, LedgerError> {
        let filter = SubscriptionFilter {
            status: Some(status),
            search: None,
        };
        self.list_subscriptions(&filter).await
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn apply_transition(
        &self,
        id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, LedgerError> {
        let mut state = self.state.lock().await;
        let current = state
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("subscription", id))?;

        let plan = transitions::plan(&current, transition, now);
        let Some(next) = plan.next else {
            return Ok(TransitionOutcome {
                subscription: current,
                changed: false,
                effects: Vec::new(),
            });
        };
        if let Some(violation) = next.invariant_violation(now) {
            return Err(LedgerError::Invariant(violation));
        }

        state.subscriptions.insert(id, next.clone());
        let effects = state.enqueue(id, &plan.effects, now);
        Ok(TransitionOutcome {
            subscription: next,
            changed: true,
            effects,
        })
    }

    async fn stats(&self) -> Result<SubscriptionStats, LedgerError> {
        let state = self.state.lock().await;
        let mut stats = SubscriptionStats::default();
        for row in state.subscriptions.values() {
            stats.add(row.status, 1);
            if row.grandfathered {
                stats.grandfathered += 1;
                continue;
            }
            if row.status == SubscriptionStatus::Active {
                if let Some(tier) = row.tier_id.and_then(|tier_id| state.tiers.get(&tier_id)) {
                    stats.mrr_cents += tier.price_cents;
                }
            }
        }
        Ok(stats)
    }

    async fn live_subscription_for(
        &self,
        tier_id: i64,
        email: &str,
        access_username: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|row| {
                row.tier_id == Some(tier_id)
                    && matches!(
                        row.status,
                        SubscriptionStatus::Active | SubscriptionStatus::PastDue
                    )
                    && (row.email.eq_ignore_ascii_case(email)
                        || row.access_username.eq_ignore_ascii_case(access_username))
            })
            .cloned())
    }

    async fn subscriptions_without_grant(&self) -> Result<Vec<Subscription>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|row| {
                matches!(
                    row.status,
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue
                ) && !row.grandfathered
            })
            .filter(|row| {
                !state.invites.values().any(|invite| {
                    invite.subscription_id == Some(row.id) && invite.status == InviteStatus::Success
                })
            })
            .cloned()
            .collect())
    }

    async fn record_invite(
        &self,
        invite: NewInviteRequest,
        now: DateTime<Utc>,
    ) -> Result<InviteRequest, LedgerError> {
        let mut state = self.state.lock().await;
        state.next_invite_id += 1;
        let row = InviteRequest {
            id: state.next_invite_id,
            identity: invite.identity,
            status: invite.status,
            error_message: invite.error_message,
            subscription_id: invite.subscription_id,
            is_free: invite.is_free,
            created_at: now,
        };
        state.invites.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_invites(&self, limit: i64) -> Result<Vec<InviteRequest>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .invites
            .values()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn invite_stats(&self) -> Result<InviteStats, LedgerError> {
        let state = self.state.lock().await;
        let mut stats = InviteStats::default();
        for invite in state.invites.values() {
            stats.total += 1;
            match invite.status {
                InviteStatus::Success => stats.successful += 1,
                InviteStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn unlinked_successful_invites(&self) -> Result<Vec<InviteRequest>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .invites
            .values()
            .filter(|invite| {
                invite.status == InviteStatus::Success
                    && invite.subscription_id.is_none()
                    && !invite.is_free
            })
            .cloned()
            .collect())
    }

    async fn grandfather_invite(
        &self,
        invite_id: i64,
        tier_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, LedgerError> {
        let mut state = self.state.lock().await;
        if !state.tiers.contains_key(&tier_id) {
            return Err(LedgerError::not_found("tier", tier_id));
        }
        let invite = state
            .invites
            .get(&invite_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("invite", invite_id))?;
        if invite.subscription_id.is_some() {
            return Ok(None);
        }

        let row = state.allocate_subscription(grandfathered_row(&invite, tier_id, now), now);
        if let Some(stored) = state.invites.get_mut(&invite_id) {
            stored.subscription_id = Some(row.id);
        }
        Ok(Some(row))
    }

    async fn claim_effects(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxEffect>, LedgerError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut OutboxEffect> = state
            .effects
            .iter_mut()
            .filter(|effect| effect.state == EffectState::Pending && effect.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|effect| effect.next_attempt_at);
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|effect| {
                effect.next_attempt_at = now + lease;
                effect.updated_at = now;
                effect.clone()
            })
            .collect())
    }

    async fn claim_effect(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<OutboxEffect>, LedgerError> {
        let mut state = self.state.lock().await;
        let claimed = state
            .effects
            .iter_mut()
            .find(|effect| {
                effect.id == id
                    && effect.state == EffectState::Pending
                    && effect.next_attempt_at <= now
            })
            .map(|effect| {
                effect.next_attempt_at = now + lease;
                effect.updated_at = now;
                effect.clone()
            });
        Ok(claimed)
    }

    async fn finish_effect(
        &self,
        id: Uuid,
        outcome: &EffectOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let effect = state
            .effects
            .iter_mut()
            .find(|effect| effect.id == id)
            .ok_or_else(|| LedgerError::not_found("outbox effect", id))?;
        effect.attempts += 1;
        effect.updated_at = now;
        match outcome {
            EffectOutcome::Done => effect.state = EffectState::Done,
            EffectOutcome::Retry {
                error,
                next_attempt_at,
            } => {
                effect.last_error = Some(error.clone());
                effect.next_attempt_at = *next_attempt_at;
            }
            EffectOutcome::Dead { error } => {
                effect.state = EffectState::Dead;
                effect.last_error = Some(error.clone());
            }
        }
        Ok(())
    }

    async fn dead_effects(&self) -> Result<Vec<OutboxEffect>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .effects
            .iter()
            .filter(|effect| effect.state == EffectState::Dead)
            .cloned()
            .collect())
    }
}

pub(crate) fn grandfathered_row(
    invite: &InviteRequest,
    tier_id: i64,
    now: DateTime<Utc>,
) -> NewSubscription {
    NewSubscription {
        email: invite.identity.clone(),
        access_username: invite.identity.clone(),
        tier_id: Some(tier_id),
        period_start: invite.created_at.min(now),
        period_end: None,
        cancel_at_period_end: false,
        grandfathered: true,
        billing_customer_id: None,
        billing_subscription_id: None,
    }
}
