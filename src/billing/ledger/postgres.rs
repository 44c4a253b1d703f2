use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgConnection;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::memory::grandfathered_row;
use super::{CreateOutcome, LedgerError, SubscriptionLedger, TransitionOutcome};
use crate::billing::models::{
    EffectKind, EffectOutcome, EffectState, InviteRequest, InviteStats, InviteStatus,
    NewInviteRequest, NewSubscription, NewTier, OutboxEffect, Subscription, SubscriptionFilter,
    SubscriptionStats, SubscriptionStatus, Tier, TierUpdate,
};
use crate::billing::transitions::{self, Transition};

/// key: subscription-ledger-postgres -> row-locked store
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: i64,
    email: String,
    access_username: String,
    tier_id: Option<i64>,
    status: String,
    period_start: DateTime<Utc>,
    period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    grandfathered: bool,
    billing_customer_id: Option<String>,
    billing_subscription_id: Option<String>,
    revoked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = LedgerError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::from_str(&row.status).ok_or_else(|| {
            LedgerError::Corrupt(format!(
                "subscription {} has unknown status {}",
                row.id, row.status
            ))
        })?;
        Ok(Subscription {
            id: row.id,
            email: row.email,
            access_username: row.access_username,
            tier_id: row.tier_id,
            status,
            period_start: row.period_start,
            period_end: row.period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            grandfathered: row.grandfathered,
            billing_customer_id: row.billing_customer_id,
            billing_subscription_id: row.billing_subscription_id,
            revoked_at: row.revoked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InviteRow {
    id: i64,
    identity: String,
    status: String,
    error_message: Option<String>,
    subscription_id: Option<i64>,
    is_free: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<InviteRow> for InviteRequest {
    type Error = LedgerError;

    fn try_from(row: InviteRow) -> Result<Self, Self::Error> {
        let status = InviteStatus::from_str(&row.status).ok_or_else(|| {
            LedgerError::Corrupt(format!("invite {} has unknown status {}", row.id, row.status))
        })?;
        Ok(InviteRequest {
            id: row.id,
            identity: row.identity,
            status,
            error_message: row.error_message,
            subscription_id: row.subscription_id,
            is_free: row.is_free,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EffectRow {
    id: Uuid,
    subscription_id: i64,
    kind: String,
    state: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EffectRow> for OutboxEffect {
    type Error = LedgerError;

    fn try_from(row: EffectRow) -> Result<Self, Self::Error> {
        let kind = EffectKind::from_str(&row.kind).ok_or_else(|| {
            LedgerError::Corrupt(format!("effect {} has unknown kind {}", row.id, row.kind))
        })?;
        let state = EffectState::from_str(&row.state).ok_or_else(|| {
            LedgerError::Corrupt(format!("effect {} has unknown state {}", row.id, row.state))
        })?;
        Ok(OutboxEffect {
            id: row.id,
            subscription_id: row.subscription_id,
            kind,
            state,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, LedgerError>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> LedgerError {
    let is_unique = err
        .as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "23505");
    if is_unique {
        LedgerError::Conflict(message())
    } else {
        LedgerError::Db(err)
    }
}

/// Inserts a new active row; `None` when another row already owns the billing id.
async fn insert_subscription(
    conn: &mut PgConnection,
    subscription: &NewSubscription,
    now: DateTime<Utc>,
) -> Result<Option<Subscription>, LedgerError> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        INSERT INTO subscriptions (
            email,
            access_username,
            tier_id,
            status,
            period_start,
            period_end,
            cancel_at_period_end,
            grandfathered,
            billing_customer_id,
            billing_subscription_id,
            created_at,
            updated_at
        ) VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, $10, $10)
        ON CONFLICT (billing_subscription_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&subscription.email)
    .bind(&subscription.access_username)
    .bind(subscription.tier_id)
    .bind(subscription.period_start)
    .bind(subscription.period_end)
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.grandfathered)
    .bind(&subscription.billing_customer_id)
    .bind(&subscription.billing_subscription_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Subscription::try_from).transpose()
}

async fn insert_effects(
    conn: &mut PgConnection,
    subscription_id: i64,
    kinds: &[EffectKind],
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEffect>, LedgerError> {
    let mut effects = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let effect = OutboxEffect::pending(subscription_id, *kind, now);
        sqlx::query(
            r#"
            INSERT INTO outbox_effects (
                id, subscription_id, kind, state, attempts, next_attempt_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, 0, $5, $5, $5)
            "#,
        )
        .bind(effect.id)
        .bind(effect.subscription_id)
        .bind(effect.kind.as_str())
        .bind(effect.state.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        effects.push(effect);
    }
    Ok(effects)
}

#[async_trait]
impl SubscriptionLedger for PgLedger {
    async fn create_tier(&self, tier: NewTier, now: DateTime<Utc>) -> Result<Tier, LedgerError> {
        let name = tier.name.clone();
        sqlx::query_as::<_, Tier>(
            r#"
            INSERT INTO tiers (
                name, description, price_cents, billing_price_id, allow_downloads, collections,
                active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
            RETURNING *
            "#,
        )
        .bind(tier.name)
        .bind(tier.description)
        .bind(tier.price_cents)
        .bind(tier.billing_price_id)
        .bind(tier.allow_downloads)
        .bind(tier.collections)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| unique_violation(err, || format!("tier name {name} already exists")))
    }

    async fn update_tier(
        &self,
        id: i64,
        update: TierUpdate,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let mut tier =
            sqlx::query_as::<_, Tier>("SELECT * FROM tiers WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| LedgerError::not_found("tier", id))?;
        update.apply(&mut tier);

        let tier = sqlx::query_as::<_, Tier>(
            r#"
            UPDATE tiers
            SET description = $2,
                price_cents = $3,
                billing_price_id = $4,
                allow_downloads = $5,
                collections = $6,
                updated_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&tier.description)
        .bind(tier.price_cents)
        .bind(&tier.billing_price_id)
        .bind(tier.allow_downloads)
        .bind(&tier.collections)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tier)
    }

    async fn set_tier_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Tier, LedgerError> {
        sqlx::query_as::<_, Tier>(
            "UPDATE tiers SET active = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::not_found("tier", id))
    }

    async fn get_tier(&self, id: i64) -> Result<Option<Tier>, LedgerError> {
        Ok(
            sqlx::query_as::<_, Tier>("SELECT * FROM tiers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_tiers(&self, include_inactive: bool) -> Result<Vec<Tier>, LedgerError> {
        Ok(sqlx::query_as::<_, Tier>(
            "SELECT * FROM tiers WHERE active OR $1 ORDER BY price_cents ASC, id ASC",
        )
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_subscription(
        &self,
        subscription: NewSubscription,
        effects: &[EffectKind],
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let Some(created) = insert_subscription(&mut tx, &subscription, now).await? else {
            let remote_id = subscription.billing_subscription_id.as_deref().unwrap_or_default();
            let existing = sqlx::query_as::<_, SubscriptionRow>(
                "SELECT * FROM subscriptions WHERE billing_subscription_id = $1",
            )
            .bind(remote_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(CreateOutcome::Existing(existing.try_into()?));
        };

        let effects = insert_effects(&mut tx, created.id, effects, now).await?;
        tx.commit().await?;
        Ok(CreateOutcome::Created {
            subscription: created,
            effects,
        })
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, LedgerError> {
        sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_by_billing_subscription_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE billing_subscription_id = $1",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Subscription::try_from)
        .transpose()
    }

    async fn list_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, LedgerError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = $1
            ORDER BY period_end ASC NULLS LAST, id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, LedgerError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM subscriptions WHERE TRUE");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(search) = filter.search.as_deref() {
            let pattern = format!("%{}%", search.to_lowercase());
            builder
                .push(" AND (LOWER(email) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR LOWER(access_username) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        builder.push(" ORDER BY id ASC");

        let rows = builder
            .build_query_as::<SubscriptionRow>()
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn live_subscription_for(
        &self,
        tier_id: i64,
        email: &str,
        access_username: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE tier_id = $1
              AND status IN ('active', 'past_due')
              AND (LOWER(email) = LOWER($2) OR LOWER(access_username) = LOWER($3))
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(tier_id)
        .bind(email)
        .bind(access_username)
        .fetch_optional(&self.pool)
        .await?
        .map(Subscription::try_from)
        .transpose()
    }

    async fn apply_transition(
        &self,
        id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let current: Subscription = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("subscription", id))?
        .try_into()?;

        let plan = transitions::plan(&current, transition, now);
        let Some(next) = plan.next else {
            tx.rollback().await?;
            return Ok(TransitionOutcome {
                subscription: current,
                changed: false,
                effects: Vec::new(),
            });
        };
        if let Some(violation) = next.invariant_violation(now) {
            tx.rollback().await?;
            return Err(LedgerError::Invariant(violation));
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                period_start = $3,
                period_end = $4,
                cancel_at_period_end = $5,
                revoked_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next.status.as_str())
        .bind(next.period_start)
        .bind(next.period_end)
        .bind(next.cancel_at_period_end)
        .bind(next.revoked_at)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;
        let effects = insert_effects(&mut tx, id, &plan.effects, now).await?;
        tx.commit().await?;

        Ok(TransitionOutcome {
            subscription: next,
            changed: true,
            effects,
        })
    }

    async fn stats(&self) -> Result<SubscriptionStats, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT
                s.status,
                s.grandfathered,
                COUNT(*) AS total,
                COALESCE(SUM(t.price_cents), 0)::BIGINT AS revenue
            FROM subscriptions s
            LEFT JOIN tiers t ON t.id = s.tier_id
            GROUP BY s.status, s.grandfathered
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = SubscriptionStats::default();
        for row in rows {
            let raw_status: String = row.get("status");
            let status = SubscriptionStatus::from_str(&raw_status)
                .ok_or_else(|| LedgerError::Corrupt(format!("unknown status {raw_status}")))?;
            let grandfathered: bool = row.get("grandfathered");
            let total: i64 = row.get("total");
            let revenue: i64 = row.get("revenue");

            stats.add(status, total);
            if grandfathered {
                stats.grandfathered += total;
            } else if status == SubscriptionStatus::Active {
                stats.mrr_cents += revenue;
            }
        }
        Ok(stats)
    }

    async fn subscriptions_without_grant(&self) -> Result<Vec<Subscription>, LedgerError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.*
            FROM subscriptions s
            WHERE s.status IN ('active', 'past_due')
              AND NOT s.grandfathered
              AND NOT EXISTS (
                  SELECT 1 FROM invite_requests i
                  WHERE i.subscription_id = s.id AND i.status = 'success'
              )
            ORDER BY s.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn record_invite(
        &self,
        invite: NewInviteRequest,
        now: DateTime<Utc>,
    ) -> Result<InviteRequest, LedgerError> {
        sqlx::query_as::<_, InviteRow>(
            r#"
            INSERT INTO invite_requests (
                identity, status, error_message, subscription_id, is_free, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(invite.identity)
        .bind(invite.status.as_str())
        .bind(invite.error_message)
        .bind(invite.subscription_id)
        .bind(invite.is_free)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn list_invites(&self, limit: i64) -> Result<Vec<InviteRequest>, LedgerError> {
        let rows = sqlx::query_as::<_, InviteRow>(
            "SELECT * FROM invite_requests ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn invite_stats(&self) -> Result<InviteStats, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'success') AS successful,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM invite_requests
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(InviteStats {
            total: row.get("total"),
            successful: row.get("successful"),
            failed: row.get("failed"),
        })
    }

    async fn unlinked_successful_invites(&self) -> Result<Vec<InviteRequest>, LedgerError> {
        let rows = sqlx::query_as::<_, InviteRow>(
            r#"
            SELECT * FROM invite_requests
            WHERE status = 'success' AND subscription_id IS NULL AND NOT is_free
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn grandfather_invite(
        &self,
        invite_id: i64,
        tier_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let tier_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tiers WHERE id = $1)")
                .bind(tier_id)
                .fetch_one(&mut *tx)
                .await?;
        if !tier_exists {
            return Err(LedgerError::not_found("tier", tier_id));
        }

        let invite: InviteRequest = sqlx::query_as::<_, InviteRow>(
            "SELECT * FROM invite_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(invite_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("invite", invite_id))?
        .try_into()?;
        if invite.subscription_id.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = grandfathered_row(&invite, tier_id, now);
        let subscription = insert_subscription(&mut tx, &row, now)
            .await?
            .ok_or_else(|| LedgerError::Conflict("grandfathered row was not inserted".into()))?;
        sqlx::query("UPDATE invite_requests SET subscription_id = $2 WHERE id = $1")
            .bind(invite_id)
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(subscription))
    }

    async fn claim_effects(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxEffect>, LedgerError> {
        let rows = sqlx::query_as::<_, EffectRow>(
            r#"
            UPDATE outbox_effects
            SET next_attempt_at = $2, updated_at = $1
            WHERE id IN (
                SELECT id FROM outbox_effects
                WHERE state = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn claim_effect(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<OutboxEffect>, LedgerError> {
        sqlx::query_as::<_, EffectRow>(
            r#"
            UPDATE outbox_effects
            SET next_attempt_at = $3, updated_at = $2
            WHERE id = $1 AND state = 'pending' AND next_attempt_at <= $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + lease)
        .fetch_optional(&self.pool)
        .await?
        .map(OutboxEffect::try_from)
        .transpose()
    }

    async fn finish_effect(
        &self,
        id: Uuid,
        outcome: &EffectOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let (state, error, next_attempt_at) = match outcome {
            EffectOutcome::Done => (EffectState::Done, None, None),
            EffectOutcome::Retry {
                error,
                next_attempt_at,
            } => (EffectState::Pending, Some(error.as_str()), Some(*next_attempt_at)),
            EffectOutcome::Dead { error } => (EffectState::Dead, Some(error.as_str()), None),
        };

        let result = sqlx::query(
            r#"
            UPDATE outbox_effects
            SET attempts = attempts + 1,
                state = $2,
                last_error = COALESCE($3, last_error),
                next_attempt_at = COALESCE($4, next_attempt_at),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("outbox effect", id));
        }
        Ok(())
    }

    async fn dead_effects(&self) -> Result<Vec<OutboxEffect>, LedgerError> {
        let rows = sqlx::query_as::<_, EffectRow>(
            "SELECT * FROM outbox_effects WHERE state = 'dead' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}
