use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::billing::{
    self, EngineSettings, PgLedger, ReconciliationEngine, SubscriptionLedger,
};
use gatekeeper::config;
use gatekeeper::gateways::{AccessProvider, BillingProvider, PlexGateway, StripeGateway};
use gatekeeper::routes::app;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let ledger: Arc<dyn SubscriptionLedger> = Arc::new(PgLedger::new(pool.clone()));
    let access: Arc<dyn AccessProvider> = Arc::new(PlexGateway::from_env()?);
    let billing_gateway: Arc<dyn BillingProvider> = Arc::new(StripeGateway::from_env()?);
    let engine = Arc::new(ReconciliationEngine::new(
        ledger,
        access,
        billing_gateway,
        EngineSettings::from_env(),
    ));

    billing::spawn_outbox_worker(
        engine.clone(),
        Duration::from_secs(*config::OUTBOX_POLL_INTERVAL_SECS),
    );
    let _sweeper = billing::spawn_expiry_sweeper(engine.clone())
        .await
        .map_err(|error| -> Box<dyn std::error::Error> { error.into() })?;

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app(engine).into_make_service())
        .await?;

    Ok(())
}
