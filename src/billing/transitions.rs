use chrono::{DateTime, Duration, Utc};

use super::models::{EffectKind, Subscription, SubscriptionStatus};

/// key: subscription-transition -> every sanctioned status/period mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Latest remote snapshot, already mapped onto the local status set.
    RemoteUpdate {
        status: SubscriptionStatus,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
        cancel_at_period_end: bool,
    },
    RemoteDeleted,
    PaymentFailed,
    ManualRevoke,
    ManualExtend {
        days: i64,
    },
    Expire,
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::RemoteUpdate { .. } => "remote_update",
            Transition::RemoteDeleted => "remote_deleted",
            Transition::PaymentFailed => "payment_failed",
            Transition::ManualRevoke => "manual_revoke",
            Transition::ManualExtend { .. } => "manual_extend",
            Transition::Expire => "expire",
        }
    }
}

/// Result of planning a transition against the locked row.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    /// `None` when the row already reflects the transition.
    pub next: Option<Subscription>,
    pub effects: Vec<EffectKind>,
}

impl TransitionPlan {
    fn unchanged() -> Self {
        Self {
            next: None,
            effects: Vec::new(),
        }
    }
}

/// Sweep predicate: active, dated, overdue and not exempt.
pub fn is_expiry_candidate(subscription: &Subscription, now: DateTime<Utc>) -> bool {
    subscription.status == SubscriptionStatus::Active
        && !subscription.grandfathered
        && subscription.period_end.map_or(false, |end| end < now)
}

/// Warning predicate: active, not exempt, ending within `window` from `now`.
pub fn is_warning_candidate(
    subscription: &Subscription,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    subscription.status == SubscriptionStatus::Active
        && !subscription.grandfathered
        && subscription
            .period_end
            .map_or(false, |end| end > now && end <= now + window)
}

/// `base + days`, or `None` when the result leaves the representable date range.
pub fn extended_period_end(base: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|delta| base.checked_add_signed(delta))
}

/// Pure state machine. Callers hold the row lock while planning and persist `next` and
/// `effects` in the same transaction.
pub fn plan(current: &Subscription, transition: &Transition, now: DateTime<Utc>) -> TransitionPlan {
    let mut next = current.clone();
    let mut effects = Vec::new();

    match transition {
        Transition::RemoteUpdate {
            status,
            period_start,
            period_end,
            cancel_at_period_end,
        } => {
            if current.grandfathered || current.status.is_terminal() {
                return TransitionPlan::unchanged();
            }
            next.status = *status;
            if let Some(start) = period_start {
                next.period_start = *start;
            }
            if period_end.is_some() {
                next.period_end = *period_end;
            }
            next.cancel_at_period_end = *cancel_at_period_end;
        }
        Transition::RemoteDeleted => {
            if current.grandfathered {
                return TransitionPlan::unchanged();
            }
            match current.status {
                SubscriptionStatus::Expired => {}
                SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Cancelled => next.status = SubscriptionStatus::Cancelled,
            }
            if current.revoked_at.is_none() {
                next.revoked_at = Some(now);
                effects.push(EffectKind::RevokeAccess);
            }
        }
        Transition::PaymentFailed => {
            if current.grandfathered {
                return TransitionPlan::unchanged();
            }
            match current.status {
                SubscriptionStatus::Active => next.status = SubscriptionStatus::PastDue,
                SubscriptionStatus::PastDue
                | SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired => return TransitionPlan::unchanged(),
            }
        }
        Transition::ManualRevoke => {
            next.status = SubscriptionStatus::Cancelled;
            if current.revoked_at.is_none() {
                next.revoked_at = Some(now);
                effects.push(EffectKind::RevokeAccess);
            }
            // Expired rows still carry a live remote subscription; cancelled ones do not.
            if current.billing_subscription_id.is_some()
                && !current.grandfathered
                && current.status != SubscriptionStatus::Cancelled
            {
                effects.push(EffectKind::CancelBilling);
            }
        }
        Transition::ManualExtend { days } => {
            let Some(period_end) = extended_period_end(current.period_end.unwrap_or(now), *days)
            else {
                return TransitionPlan::unchanged();
            };
            next.period_end = Some(period_end);
            next.status = SubscriptionStatus::Active;
            if current.revoked_at.is_some() {
                next.revoked_at = None;
                effects.push(EffectKind::GrantAccess);
            }
        }
        Transition::Expire => {
            if !is_expiry_candidate(current, now) {
                return TransitionPlan::unchanged();
            }
            next.status = SubscriptionStatus::Expired;
            if current.revoked_at.is_none() {
                next.revoked_at = Some(now);
                effects.push(EffectKind::RevokeAccess);
            }
        }
    }

    if next == *current {
        return TransitionPlan::unchanged();
    }
    next.updated_at = now;
    TransitionPlan {
        next: Some(next),
        effects,
    }
}
