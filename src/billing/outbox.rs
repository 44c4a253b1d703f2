use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::ReconciliationEngine;
use super::error::ReconcileError;
use super::models::{
    EffectKind, EffectOutcome, InviteStatus, NewInviteRequest, OutboxEffect, Subscription,
};
use crate::gateways::{bounded, AccessError, BillingError};

const MAX_BACKOFF_HOURS: i64 = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub done: usize,
    pub retried: usize,
    pub dead: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &EffectOutcome) {
        match outcome {
            EffectOutcome::Done => self.done += 1,
            EffectOutcome::Retry { .. } => self.retried += 1,
            EffectOutcome::Dead { .. } => self.dead += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.done + self.retried + self.dead == 0
    }
}

/// Why a single attempt failed, and whether another one can help.
#[derive(Debug)]
enum AttemptError {
    Transient(ReconcileError),
    Permanent(ReconcileError),
}

impl AttemptError {
    fn into_inner(self) -> ReconcileError {
        match self {
            AttemptError::Transient(err) | AttemptError::Permanent(err) => err,
        }
    }
}

fn transient(err: impl Into<ReconcileError>) -> AttemptError {
    AttemptError::Transient(err.into())
}

/// Delay before retry number `attempts`, doubling from `base` and capped at six hours.
pub fn backoff_delay(base: Duration, attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16);
    let delay = base * 2_i32.pow(exponent as u32);
    delay.min(Duration::hours(MAX_BACKOFF_HOURS))
}

impl ReconciliationEngine {
    /// Runs every due effect once. Effects held by another drainer stay invisible until
    /// their lease runs out.
    pub async fn drain_outbox(&self, now: DateTime<Utc>) -> Result<DrainReport, ReconcileError> {
        let claimed = self
            .ledger
            .claim_effects(now, self.settings.outbox_lease, self.settings.outbox_batch)
            .await?;
        let mut report = DrainReport::default();
        for effect in claimed {
            let result = self.attempt(&effect).await;
            if let Some(outcome) = self.settle(&effect, &result, now).await {
                report.record(&outcome);
            }
        }
        Ok(report)
    }

    /// Attempts freshly committed effects right away, in order. Results line up with
    /// `effects`; an effect someone else already claimed counts as success here.
    pub(super) async fn run_inline(
        &self,
        effects: &[OutboxEffect],
        now: DateTime<Utc>,
    ) -> Vec<Result<(), ReconcileError>> {
        join_all(effects.iter().map(|effect| self.run_claimed(effect.id, now))).await
    }

    /// [`Self::run_inline`] for callers that only log failures.
    pub(super) async fn dispatch_logged(&self, effects: &[OutboxEffect], now: DateTime<Utc>) {
        let results = self.run_inline(effects, now).await;
        for (effect, result) in effects.iter().zip(results) {
            if let Err(err) = result {
                warn!(
                    ?err,
                    subscription_id = effect.subscription_id,
                    effect = effect.kind.as_str(),
                    "inline effect failed; left in outbox"
                );
            }
        }
    }

    async fn run_claimed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), ReconcileError> {
        let Some(effect) = self
            .ledger
            .claim_effect(id, now, self.settings.outbox_lease)
            .await?
        else {
            debug!(effect_id = %id, "effect already claimed elsewhere");
            return Ok(());
        };
        let result = self.attempt(&effect).await;
        self.settle(&effect, &result, now).await;
        result.map_err(AttemptError::into_inner)
    }

    async fn settle(
        &self,
        effect: &OutboxEffect,
        result: &Result<(), AttemptError>,
        now: DateTime<Utc>,
    ) -> Option<EffectOutcome> {
        let outcome = match result {
            Ok(()) => EffectOutcome::Done,
            Err(AttemptError::Permanent(err)) => EffectOutcome::Dead {
                error: err.to_string(),
            },
            Err(AttemptError::Transient(err)) => {
                let attempts = effect.attempts + 1;
                if attempts >= self.settings.outbox_max_attempts {
                    EffectOutcome::Dead {
                        error: format!("{err} (gave up after {attempts} attempts)"),
                    }
                } else {
                    EffectOutcome::Retry {
                        error: err.to_string(),
                        next_attempt_at: now
                            + backoff_delay(self.settings.outbox_backoff_base, attempts),
                    }
                }
            }
        };

        if let EffectOutcome::Dead { error } = &outcome {
            warn!(
                effect_id = %effect.id,
                subscription_id = effect.subscription_id,
                effect = effect.kind.as_str(),
                error = %error,
                "outbox effect is dead"
            );
        }
        match self.ledger.finish_effect(effect.id, &outcome, now).await {
            Ok(()) => Some(outcome),
            Err(err) => {
                warn!(?err, effect_id = %effect.id, "failed to record outbox outcome");
                None
            }
        }
    }

    async fn attempt(&self, effect: &OutboxEffect) -> Result<(), AttemptError> {
        let subscription = self
            .ledger
            .get_subscription(effect.subscription_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                AttemptError::Permanent(ReconcileError::NotFound(format!(
                    "subscription {}",
                    effect.subscription_id
                )))
            })?;
        match effect.kind {
            EffectKind::GrantAccess => self.attempt_grant(&subscription).await,
            EffectKind::RevokeAccess => self.attempt_revoke(&subscription).await,
            EffectKind::CancelBilling => self.attempt_cancel(&subscription).await,
        }
    }

    async fn attempt_grant(&self, subscription: &Subscription) -> Result<(), AttemptError> {
        if subscription.revoked_at.is_some() || subscription.status.is_terminal() {
            debug!(subscription_id = subscription.id, "grant superseded by revocation");
            return Ok(());
        }
        let tier = match subscription.tier_id {
            Some(tier_id) => self.ledger.get_tier(tier_id).await.map_err(transient)?,
            None => None,
        };
        let Some(tier) = tier else {
            return Err(AttemptError::Permanent(ReconcileError::Validation(format!(
                "subscription {} has no tier to grant",
                subscription.id
            ))));
        };

        let result = bounded(
            self.settings.gateway_timeout,
            self.access.grant(
                &subscription.access_username,
                &tier.collections,
                tier.allow_downloads,
            ),
            || AccessError::Transport("grant timed out".into()),
        )
        .await;
        let (status, outcome) = match result {
            Ok(()) => (InviteStatus::Success, Ok(())),
            Err(AccessError::AlreadyGranted) => {
                info!(subscription_id = subscription.id, "access already present");
                (InviteStatus::Success, Ok(()))
            }
            Err(err @ AccessError::UserNotFound) => {
                (InviteStatus::Failed, Err(AttemptError::Permanent(err.into())))
            }
            Err(err) => (InviteStatus::Failed, Err(transient(err))),
        };

        let error_message = match &outcome {
            Err(AttemptError::Transient(err) | AttemptError::Permanent(err)) => {
                Some(err.to_string())
            }
            Ok(()) => None,
        };
        self.ledger
            .record_invite(
                NewInviteRequest {
                    identity: subscription.access_username.clone(),
                    status,
                    error_message,
                    subscription_id: Some(subscription.id),
                    is_free: subscription.grandfathered,
                },
                Utc::now(),
            )
            .await
            .map_err(transient)?;
        if outcome.is_ok() {
            info!(subscription_id = subscription.id, tier_id = tier.id, "access granted");
        }
        outcome
    }

    async fn attempt_revoke(&self, subscription: &Subscription) -> Result<(), AttemptError> {
        if subscription.revoked_at.is_none() {
            debug!(subscription_id = subscription.id, "revoke superseded by re-grant");
            return Ok(());
        }
        let result = bounded(
            self.settings.gateway_timeout,
            self.access.revoke(&subscription.access_username),
            || AccessError::Transport("revoke timed out".into()),
        )
        .await;
        match result {
            Ok(()) | Err(AccessError::UserNotFound) => {
                info!(subscription_id = subscription.id, "access revoked");
                Ok(())
            }
            Err(err) => Err(transient(err)),
        }
    }

    async fn attempt_cancel(&self, subscription: &Subscription) -> Result<(), AttemptError> {
        let Some(remote_id) = subscription.billing_subscription_id.as_deref() else {
            return Ok(());
        };
        let result = bounded(
            self.settings.gateway_timeout,
            self.billing.cancel(remote_id, false),
            || BillingError::Transport("cancel timed out".into()),
        )
        .await;
        match result {
            Ok(()) | Err(BillingError::NotFound(_)) => {
                info!(
                    subscription_id = subscription.id,
                    billing_subscription_id = remote_id,
                    "billing cancelled"
                );
                Ok(())
            }
            Err(err @ BillingError::Transport(_)) => {
                Err(AttemptError::Transient(ReconcileError::Billing(err)))
            }
            Err(err) => Err(AttemptError::Permanent(ReconcileError::Billing(err))),
        }
    }
}

/// key: outbox-worker -> retries effects the inline attempt could not finish
pub fn spawn_outbox_worker(engine: Arc<ReconciliationEngine>, interval: StdDuration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.drain_outbox(Utc::now()).await {
                Ok(report) if !report.is_empty() => info!(
                    done = report.done,
                    retried = report.retried,
                    dead = report.dead,
                    "outbox drained"
                ),
                Ok(_) => {}
                Err(err) => warn!(?err, "outbox drain failed"),
            }
        }
    });
}
