pub mod api;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod outbox;
pub mod scheduler;
pub mod transitions;

pub use engine::{CheckoutUrls, EngineSettings, ReconciliationEngine, WebhookOutcome};
pub use error::ReconcileError;
pub use ledger::{
    CreateOutcome, LedgerError, MemoryLedger, PgLedger, SubscriptionLedger, TransitionOutcome,
};
pub use models::{
    EffectKind, EffectOutcome, EffectState, Inconsistencies, InviteRequest, InviteStats,
    InviteStatus, NewInviteRequest, NewSubscription, NewTier, OutboxEffect, Subscription,
    SubscriptionFilter, SubscriptionStats, SubscriptionStatus, Tier, TierUpdate,
};
pub use outbox::{backoff_delay, spawn_outbox_worker, DrainReport};
pub use scheduler::{spawn as spawn_expiry_sweeper, SweepReport};
pub use transitions::Transition;
