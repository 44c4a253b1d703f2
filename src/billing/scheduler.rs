use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use super::engine::ReconciliationEngine;
use super::error::ReconcileError;
use super::models::SubscriptionStatus;
use super::transitions::{is_expiry_candidate, is_warning_candidate, Transition};
use crate::config;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_count: usize,
    pub warned_count: usize,
}

impl ReconciliationEngine {
    /// Runs the expire pass followed by the warning pass.
    pub async fn run_expiry_sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, ReconcileError> {
        let expired_count = self.expire_overdue(now).await?;
        let warned_count = self.warn_expiring(now).await?;
        Ok(SweepReport {
            expired_count,
            warned_count,
        })
    }

    /// Expires overdue rows one by one. Each row is re-checked under its lock, so a
    /// concurrent extension wins; a failure on one row never stops the rest.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let candidates = self.ledger.list_by_status(SubscriptionStatus::Active).await?;
        let mut expired = 0;
        for subscription in candidates
            .into_iter()
            .filter(|subscription| is_expiry_candidate(subscription, now))
        {
            let outcome = match self.transition(subscription.id, Transition::Expire, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(?err, subscription_id = subscription.id, "failed to expire subscription");
                    continue;
                }
            };
            if !outcome.changed {
                debug!(subscription_id = subscription.id, "no longer eligible for expiry");
                continue;
            }
            expired += 1;
            let results = self.run_inline(&outcome.effects, now).await;
            for result in results {
                if let Err(err) = result {
                    warn!(
                        ?err,
                        subscription_id = subscription.id,
                        "revoke after expiry failed; left in outbox"
                    );
                }
            }
        }
        Ok(expired)
    }

    /// Advisory only: logs rows whose period ends inside the warning window.
    pub async fn warn_expiring(&self, now: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let window = self.settings.warning_window;
        let mut warned = 0;
        for subscription in self
            .ledger
            .list_by_status(SubscriptionStatus::Active)
            .await?
            .iter()
            .filter(|subscription| is_warning_candidate(subscription, now, window))
        {
            warned += 1;
            warn!(
                subscription_id = subscription.id,
                email = %subscription.email,
                days_left = subscription.days_left(now).unwrap_or_default(),
                "subscription nearing period end"
            );
        }
        Ok(warned)
    }
}

/// key: expiry-sweeper -> independent cron jobs for the expire and warning passes
pub async fn spawn(engine: Arc<ReconciliationEngine>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let expire_engine = engine.clone();
    scheduler
        .add(Job::new_async(config::EXPIRY_SWEEP_CRON.as_str(), move |_uuid, _l| {
            let engine = expire_engine.clone();
            Box::pin(async move {
                match engine.expire_overdue(Utc::now()).await {
                    Ok(expired) => info!(expired, "expiry pass finished"),
                    Err(err) => warn!(?err, "expiry pass failed"),
                }
            })
        })?)
        .await?;

    let warn_engine = engine;
    scheduler
        .add(Job::new_async(config::EXPIRY_WARNING_CRON.as_str(), move |_uuid, _l| {
            let engine = warn_engine.clone();
            Box::pin(async move {
                match engine.warn_expiring(Utc::now()).await {
                    Ok(warned) => info!(warned, "expiry warning pass finished"),
                    Err(err) => warn!(?err, "expiry warning pass failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!(
        expire = config::EXPIRY_SWEEP_CRON.as_str(),
        warn = config::EXPIRY_WARNING_CRON.as_str(),
        "expiry sweeper scheduled"
    );
    Ok(scheduler)
}
