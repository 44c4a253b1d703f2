use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Extension, Router,
};
use axum_prometheus::PrometheusMetricLayer;

use crate::billing::{api, ReconciliationEngine};
use crate::webhooks;

async fn root() -> &'static str {
    "gatekeeper"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/webhooks/billing", post(webhooks::billing_webhook))
        .route("/api/checkout", post(api::start_checkout))
        .route("/api/invites", post(api::request_invite))
        .route("/api/admin/subscriptions", get(api::list_subscriptions))
        .route("/api/admin/subscriptions/:id", get(api::get_subscription))
        .route(
            "/api/admin/subscriptions/:id/revoke",
            post(api::revoke_subscription),
        )
        .route(
            "/api/admin/subscriptions/:id/extend",
            post(api::extend_subscription),
        )
        .route("/api/admin/stats", get(api::stats))
        .route("/api/admin/invites", get(api::list_invites))
        .route("/api/admin/inconsistencies", get(api::inconsistencies))
        .route(
            "/api/admin/tiers",
            get(api::list_tiers).post(api::create_tier),
        )
        .route("/api/admin/tiers/:id", put(api::update_tier))
        .route("/api/admin/tiers/:id/toggle", post(api::toggle_tier))
        .route("/api/admin/grandfather", post(api::grandfather))
        .route("/api/admin/sweep", post(api::run_sweep))
        .route("/api/admin/outbox/drain", post(api::drain_outbox))
        .route("/api/admin/collections", get(api::list_collections))
}

/// Full application router: banner, metrics, API and the shared engine.
pub fn app(engine: Arc<ReconciliationEngine>) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(engine))
}
