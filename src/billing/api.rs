use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::engine::{CheckoutUrls, ReconciliationEngine};
use super::models::{
    Inconsistencies, InviteRequest, InviteStats, NewTier, Subscription, SubscriptionFilter,
    SubscriptionStats, Tier, TierUpdate,
};
use super::outbox::DrainReport;
use super::scheduler::SweepReport;
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AdminUser;

const RECENT_INVITES: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier_id: i64,
    pub email: String,
    #[serde(default)]
    pub access_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// key: checkout-api -> hosted checkout for a tier
pub async fn start_checkout(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    let urls = CheckoutUrls::for_base(config::PUBLIC_BASE_URL.as_str());
    let session = engine
        .start_checkout(
            payload.tier_id,
            &payload.email,
            payload.access_username.as_deref(),
            &urls,
        )
        .await?;
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InviteRequestBody {
    pub identity: String,
    pub invite_code: String,
}

/// key: invite-api -> free access guarded by a shared code
pub async fn request_invite(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Json(payload): Json<InviteRequestBody>,
) -> AppResult<(StatusCode, Json<InviteRequest>)> {
    let expected = config::INVITE_CODE
        .as_deref()
        .ok_or_else(|| AppError::NotFound("invite endpoint".into()))?;
    if payload.invite_code.trim() != expected {
        return Err(AppError::Forbidden);
    }
    let invite = engine
        .grant_free_access(&payload.identity, &config::SHARED_COLLECTIONS)
        .await?;
    Ok((StatusCode::CREATED, Json(invite)))
}

/// key: admin-api -> subscription listing with optional status and search filters
pub async fn list_subscriptions(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Query(filter): Query<SubscriptionFilter>,
) -> AppResult<Json<Vec<Subscription>>> {
    Ok(Json(engine.ledger().list_subscriptions(&filter).await?))
}

pub async fn get_subscription(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Path(id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    engine
        .ledger()
        .get_subscription(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("subscription {id}")))
}

pub async fn revoke_subscription(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Path(id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    Ok(Json(engine.manual_revoke(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub days: i64,
}

pub async fn extend_subscription(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Path(id): Path<i64>,
    Json(payload): Json<ExtendRequest>,
) -> AppResult<Json<Subscription>> {
    Ok(Json(engine.manual_extend(id, payload.days).await?))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub subscriptions: SubscriptionStats,
    pub invites: InviteStats,
}

pub async fn stats(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<StatsResponse>> {
    let ledger = engine.ledger();
    Ok(Json(StatsResponse {
        subscriptions: ledger.stats().await?,
        invites: ledger.invite_stats().await?,
    }))
}

pub async fn list_invites(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<Vec<InviteRequest>>> {
    Ok(Json(engine.ledger().list_invites(RECENT_INVITES).await?))
}

pub async fn inconsistencies(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<Inconsistencies>> {
    Ok(Json(engine.inconsistencies().await?))
}

#[derive(Debug, Deserialize)]
pub struct TierListQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn list_tiers(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Query(query): Query<TierListQuery>,
) -> AppResult<Json<Vec<Tier>>> {
    Ok(Json(
        engine.ledger().list_tiers(query.include_inactive).await?,
    ))
}

pub async fn create_tier(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Json(payload): Json<NewTier>,
) -> AppResult<(StatusCode, Json<Tier>)> {
    let tier = engine.create_tier(payload).await?;
    Ok((StatusCode::CREATED, Json(tier)))
}

pub async fn update_tier(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Path(id): Path<i64>,
    Json(payload): Json<TierUpdate>,
) -> AppResult<Json<Tier>> {
    Ok(Json(engine.update_tier(id, payload).await?))
}

pub async fn toggle_tier(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Path(id): Path<i64>,
) -> AppResult<Json<Tier>> {
    Ok(Json(engine.toggle_tier(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct GrandfatherRequest {
    pub tier_id: i64,
}

#[derive(Debug, Serialize)]
pub struct GrandfatherResponse {
    pub converted: usize,
}

pub async fn grandfather(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Json(payload): Json<GrandfatherRequest>,
) -> AppResult<Json<GrandfatherResponse>> {
    let converted = engine.grandfather_existing_users(payload.tier_id).await?;
    Ok(Json(GrandfatherResponse { converted }))
}

pub async fn run_sweep(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<SweepReport>> {
    Ok(Json(engine.run_expiry_sweep(Utc::now()).await?))
}

pub async fn drain_outbox(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<DrainReport>> {
    Ok(Json(engine.drain_outbox(Utc::now()).await?))
}

pub async fn list_collections(
    _admin: AdminUser,
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<Vec<String>>> {
    Ok(Json(engine.list_collections().await?))
}
