mod common;

use chrono::{Duration, Utc};
use common::{completed_checkout, harness, new_row, remote, signature};
use gatekeeper::billing::{
    CheckoutUrls, EffectKind, EffectState, InviteStatus, NewInviteRequest, ReconcileError,
    SubscriptionLedger, SubscriptionStatus, TierUpdate, WebhookOutcome,
};
use gatekeeper::gateways::AccessError;
use serde_json::json;

// key: reconciliation-tests -> checkout,grant-coupling
#[tokio::test]
async fn checkout_creates_active_row_and_grants_tier_collections() {
    let h = harness();
    h.tier("basic", 499, &["Movies"]).await;
    h.tier("plus", 799, &["TV"]).await;
    let tier = h.tier("premium", 999, &["Movies", "TV"]).await;
    assert_eq!(tier.id, 3);

    let period_end = Utc::now() + Duration::days(30);
    h.billing.insert_remote(remote("sub_100", "active", period_end));
    let subscription = h
        .engine
        .record_checkout_completed(&completed_checkout(3, "a@b.com", "sub_100"))
        .await
        .unwrap();

    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.tier_id, Some(3));
    assert_eq!(subscription.email, "a@b.com");
    assert_eq!(subscription.period_end, Some(period_end));
    assert_eq!(subscription.billing_subscription_id.as_deref(), Some("sub_100"));

    let grants = h.access.grants();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].identity, "a@b.com");
    assert_eq!(grants[0].collections, vec!["Movies".to_string(), "TV".to_string()]);

    let invites = h.ledger.list_invites(10).await.unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].status, InviteStatus::Success);
    assert_eq!(invites[0].subscription_id, Some(subscription.id));

    let effects = h.ledger.effects().await;
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].kind, EffectKind::GrantAccess);
    assert_eq!(effects[0].state, EffectState::Done);
}

#[tokio::test]
async fn metadata_username_overrides_email_for_access() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    h.billing
        .insert_remote(remote("sub_u", "active", Utc::now() + Duration::days(30)));
    let mut session = completed_checkout(tier.id, "a@b.com", "sub_u");
    session
        .metadata
        .insert("access_username".into(), "plexfan".into());

    let subscription = h.engine.record_checkout_completed(&session).await.unwrap();
    assert_eq!(subscription.access_username, "plexfan");
    assert_eq!(h.access.grants()[0].identity, "plexfan");
}

#[tokio::test]
async fn duplicate_checkout_delivery_grants_once() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    h.billing
        .insert_remote(remote("sub_dup", "active", Utc::now() + Duration::days(30)));
    let session = completed_checkout(tier.id, "a@b.com", "sub_dup");

    let (first, second) = tokio::join!(
        h.engine.record_checkout_completed(&session),
        h.engine.record_checkout_completed(&session)
    );
    let third = h.engine.record_checkout_completed(&session).await.unwrap();

    assert_eq!(first.unwrap().id, second.unwrap().id);
    assert_eq!(
        h.ledger.list_subscriptions(&Default::default()).await.unwrap().len(),
        1
    );
    assert_eq!(third.status, SubscriptionStatus::Active);
    assert_eq!(h.access.grants().len(), 1);
}

#[tokio::test]
async fn unknown_or_inactive_tier_creates_nothing() {
    let h = harness();
    let tier = h.tier("retired", 999, &["Movies"]).await;
    h.ledger
        .set_tier_active(tier.id, false, Utc::now())
        .await
        .unwrap();
    h.billing
        .insert_remote(remote("sub_t", "active", Utc::now() + Duration::days(30)));

    let err = h
        .engine
        .record_checkout_completed(&completed_checkout(tier.id, "a@b.com", "sub_t"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::TierNotFound(id) if id == tier.id));

    let err = h
        .engine
        .record_checkout_completed(&completed_checkout(42, "a@b.com", "sub_t"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::TierNotFound(42)));

    assert!(h
        .ledger
        .list_subscriptions(&Default::default())
        .await
        .unwrap()
        .is_empty());
    assert!(h.access.grants().is_empty());
}

#[tokio::test]
async fn failed_remote_retrieval_aborts_checkout() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;

    let err = h
        .engine
        .record_checkout_completed(&completed_checkout(tier.id, "a@b.com", "sub_missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h
        .ledger
        .list_subscriptions(&Default::default())
        .await
        .unwrap()
        .is_empty());
}

// key: reconciliation-tests -> outbox-retry
#[tokio::test]
async fn failed_inline_grant_is_retried_by_outbox() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies", "TV"]).await;
    h.billing
        .insert_remote(remote("sub_retry", "active", Utc::now() + Duration::days(30)));
    h.access
        .fail_next_grant(AccessError::Transport("connection reset".into()));

    let subscription = h
        .engine
        .record_checkout_completed(&completed_checkout(tier.id, "a@b.com", "sub_retry"))
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);

    let inconsistencies = h.engine.inconsistencies().await.unwrap();
    assert_eq!(inconsistencies.ungranted.len(), 1);

    let effects = h.ledger.effects().await;
    assert_eq!(effects[0].state, EffectState::Pending);
    assert_eq!(effects[0].attempts, 1);
    assert!(effects[0].last_error.is_some());

    let not_yet = h.engine.drain_outbox(Utc::now()).await.unwrap();
    assert!(not_yet.is_empty());

    let report = h
        .engine
        .drain_outbox(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(h.access.grants().len(), 2);

    let invites = h.ledger.list_invites(10).await.unwrap();
    assert_eq!(invites.len(), 2);
    assert!(invites
        .iter()
        .any(|invite| invite.status == InviteStatus::Success
            && invite.subscription_id == Some(subscription.id)));
    assert!(h.engine.inconsistencies().await.unwrap().ungranted.is_empty());
}

#[tokio::test]
async fn user_not_found_marks_grant_dead() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    h.billing
        .insert_remote(remote("sub_nouser", "active", Utc::now() + Duration::days(30)));
    h.access.fail_next_grant(AccessError::UserNotFound);

    h.engine
        .record_checkout_completed(&completed_checkout(tier.id, "ghost@b.com", "sub_nouser"))
        .await
        .unwrap();

    let invites = h.ledger.list_invites(10).await.unwrap();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].status, InviteStatus::Failed);

    let inconsistencies = h.engine.inconsistencies().await.unwrap();
    assert_eq!(inconsistencies.ungranted.len(), 1);
    assert_eq!(inconsistencies.dead_effects.len(), 1);

    let report = h
        .engine
        .drain_outbox(Utc::now() + Duration::days(1))
        .await
        .unwrap();
    assert!(report.is_empty());
    assert_eq!(h.access.grants().len(), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_into_dead_effect() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    h.billing
        .insert_remote(remote("sub_flaky", "active", Utc::now() + Duration::days(30)));
    for _ in 0..3 {
        h.access.fail_next_grant(AccessError::Transport("timeout".into()));
    }

    h.engine
        .record_checkout_completed(&completed_checkout(tier.id, "a@b.com", "sub_flaky"))
        .await
        .unwrap();
    let mut later = Utc::now();
    for _ in 0..2 {
        later = later + Duration::hours(7);
        h.engine.drain_outbox(later).await.unwrap();
    }

    let effects = h.ledger.effects().await;
    assert_eq!(effects[0].state, EffectState::Dead);
    assert_eq!(effects[0].attempts, 3);
}

// key: reconciliation-tests -> remote-updates
#[tokio::test]
async fn remote_updates_move_live_rows() {
    let h = harness();
    let row = h
        .subscription(new_row(
            "a@b.com",
            None,
            Some(Utc::now() + Duration::days(2)),
            Some("sub_live"),
        ))
        .await;

    let renewed = Utc::now() + Duration::days(32);
    h.engine
        .apply_remote_subscription_update(&remote("sub_live", "past_due", renewed))
        .await
        .unwrap();
    let updated = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(updated.status, SubscriptionStatus::PastDue);
    assert_eq!(updated.period_end, Some(renewed));

    h.engine
        .apply_remote_subscription_update(&remote("sub_live", "trialing", renewed))
        .await
        .unwrap();
    let updated = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(updated.status, SubscriptionStatus::Active);

    h.engine
        .apply_remote_subscription_update(&remote("sub_live", "canceled", renewed))
        .await
        .unwrap();
    let updated = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(updated.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn terminal_rows_stay_terminal_under_webhooks() {
    let h = harness();
    let row = h
        .subscription(new_row(
            "a@b.com",
            None,
            Some(Utc::now() + Duration::days(2)),
            Some("sub_term"),
        ))
        .await;
    h.engine.apply_remote_subscription_deleted("sub_term").await.unwrap();

    h.engine
        .apply_remote_subscription_update(&remote(
            "sub_term",
            "active",
            Utc::now() + Duration::days(30),
        ))
        .await
        .unwrap();
    h.engine.apply_payment_failed("sub_term").await.unwrap();

    let current = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn remote_deletion_revokes_exactly_once() {
    let h = harness();
    h.subscription(new_row("a@b.com", None, Some(Utc::now() + Duration::days(9)), Some("sub_del")))
        .await;

    h.engine.apply_remote_subscription_deleted("sub_del").await.unwrap();
    h.engine.apply_remote_subscription_deleted("sub_del").await.unwrap();

    assert_eq!(h.access.revokes(), vec!["a@b.com".to_string()]);
}

#[tokio::test]
async fn payment_failure_marks_active_row_past_due() {
    let h = harness();
    let row = h
        .subscription(new_row(
            "a@b.com",
            None,
            Some(Utc::now() + Duration::days(9)),
            Some("sub_pay"),
        ))
        .await;

    h.engine.apply_payment_failed("sub_pay").await.unwrap();
    let current = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PastDue);
    assert!(h.access.revokes().is_empty());

    let err = h.engine.apply_payment_failed("sub_other").await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound(_)));
}

#[tokio::test]
async fn grandfathered_rows_ignore_billing_events() {
    let h = harness();
    let mut row = new_row("old@b.com", None, None, Some("sub_gf"));
    row.grandfathered = true;
    let row = h.subscription(row).await;

    h.engine
        .apply_remote_subscription_update(&remote(
            "sub_gf",
            "past_due",
            Utc::now() + Duration::days(3),
        ))
        .await
        .unwrap();
    h.engine.apply_remote_subscription_deleted("sub_gf").await.unwrap();

    let current = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(current, row);
    assert!(h.access.revokes().is_empty());
}

// key: reconciliation-tests -> concurrency
#[tokio::test]
async fn concurrent_duplicate_updates_converge_on_one_row() {
    let h = harness();
    h.subscription(new_row("a@b.com", None, Some(Utc::now() + Duration::days(1)), Some("sub_race")))
        .await;
    let period_end = Utc::now() + Duration::days(30);
    let snapshot = remote("sub_race", "active", period_end);

    let (first, second) = tokio::join!(
        h.engine.apply_remote_subscription_update(&snapshot),
        h.engine.apply_remote_subscription_update(&snapshot)
    );
    first.unwrap();
    second.unwrap();

    let rows = h.ledger.list_subscriptions(&Default::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Active);
    assert_eq!(rows[0].period_end, Some(period_end));
    assert!(h.ledger.effects().await.is_empty());
}

// key: reconciliation-tests -> manual-actions
#[tokio::test]
async fn manual_revoke_revokes_and_cancels_billing_once() {
    let h = harness();
    let row = h
        .subscription(new_row(
            "a@b.com",
            None,
            Some(Utc::now() + Duration::days(9)),
            Some("sub_rev"),
        ))
        .await;

    let revoked = h.engine.manual_revoke(row.id).await.unwrap();
    assert_eq!(revoked.status, SubscriptionStatus::Cancelled);
    assert!(revoked.revoked_at.is_some());
    h.engine.manual_revoke(row.id).await.unwrap();

    assert_eq!(h.access.revokes().len(), 1);
    assert_eq!(h.billing.cancels(), vec![("sub_rev".to_string(), false)]);
}

#[tokio::test]
async fn manual_revoke_after_expiry_still_cancels_billing() {
    let h = harness();
    let row = h
        .subscription(new_row(
            "a@b.com",
            None,
            Some(Utc::now() - Duration::days(1)),
            Some("sub_live"),
        ))
        .await;
    let report = h.engine.run_expiry_sweep(Utc::now()).await.unwrap();
    assert_eq!(report.expired_count, 1);
    assert!(h.billing.cancels().is_empty());

    let revoked = h.engine.manual_revoke(row.id).await.unwrap();
    assert_eq!(revoked.status, SubscriptionStatus::Cancelled);
    assert_eq!(h.billing.cancels(), vec![("sub_live".to_string(), false)]);
    assert_eq!(h.access.revokes().len(), 1);

    h.engine.manual_revoke(row.id).await.unwrap();
    assert_eq!(h.billing.cancels().len(), 1);
}

#[tokio::test]
async fn manual_revoke_surfaces_gateway_failure_and_keeps_effect() {
    let h = harness();
    let row = h
        .subscription(new_row("a@b.com", None, Some(Utc::now() + Duration::days(9)), None))
        .await;
    h.access
        .fail_next_revoke(AccessError::Transport("unreachable".into()));

    let err = h.engine.manual_revoke(row.id).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Access(AccessError::Transport(_))));
    let current = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);

    let report = h
        .engine
        .drain_outbox(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(h.access.revokes().len(), 2);
}

#[tokio::test]
async fn manual_revoke_of_unknown_subscription_is_not_found() {
    let h = harness();
    let err = h.engine.manual_revoke(404).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound(_)));
}

#[tokio::test]
async fn manual_extend_on_open_ended_row_starts_from_now() {
    let h = harness();
    let row = h.subscription(new_row("a@b.com", None, None, None)).await;

    let before = Utc::now();
    let extended = h.engine.manual_extend(row.id, 30).await.unwrap();
    let after = Utc::now();

    let end = extended.period_end.unwrap();
    assert!(end >= before + Duration::days(30));
    assert!(end <= after + Duration::days(30));
    assert_eq!(extended.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn manual_extend_rejects_non_positive_days() {
    let h = harness();
    let row = h.subscription(new_row("a@b.com", None, None, None)).await;
    let err = h.engine.manual_extend(row.id, 0).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
    let err = h.engine.manual_extend(404, 5).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound(_)));
}

#[tokio::test]
async fn manual_extend_out_of_date_range_is_rejected() {
    let h = harness();
    let end = Utc::now() + Duration::days(3);
    let row = h.subscription(new_row("a@b.com", None, Some(end), None)).await;

    for days in [i64::MAX, i64::MAX / 1000, 100_000_000] {
        let err = h.engine.manual_extend(row.id, days).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)), "{days}: {err:?}");
    }
    let current = h.ledger.get_subscription(row.id).await.unwrap().unwrap();
    assert_eq!(current.period_end, Some(end));
    assert!(h.ledger.effects().await.is_empty());
}

#[tokio::test]
async fn manual_extend_restores_revoked_access() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    let end = Utc::now() + Duration::days(2);
    let row = h
        .subscription(new_row("a@b.com", Some(tier.id), Some(end), None))
        .await;
    h.engine.manual_revoke(row.id).await.unwrap();

    let extended = h.engine.manual_extend(row.id, 10).await.unwrap();
    assert_eq!(extended.status, SubscriptionStatus::Active);
    assert!(extended.revoked_at.is_none());
    assert_eq!(extended.period_end, Some(end + Duration::days(10)));
    assert_eq!(h.access.grants().len(), 1);
}

// key: reconciliation-tests -> webhook-dispatch
#[tokio::test]
async fn webhook_for_unknown_subscription_is_acknowledged() {
    let h = harness();
    let body = json!({
        "id": "evt_unknown",
        "type": "customer.subscription.updated",
        "data": {"object": {"id": "sub_foreign", "status": "active"}}
    })
    .to_string();

    let outcome = h
        .engine
        .handle_webhook(body.as_bytes(), &signature(body.as_bytes()))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected_before_dispatch() {
    let h = harness();
    h.subscription(new_row("a@b.com", None, Some(Utc::now() + Duration::days(9)), Some("sub_sig")))
        .await;
    let body = json!({
        "id": "evt_forged",
        "type": "customer.subscription.deleted",
        "data": {"object": {"id": "sub_sig", "status": "canceled"}}
    })
    .to_string();
    let header = format!("t={},v1=deadbeef", Utc::now().timestamp());

    let err = h
        .engine
        .handle_webhook(body.as_bytes(), &header)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidSignature));
    assert!(h.access.revokes().is_empty());
}

#[tokio::test]
async fn webhook_checkout_completed_creates_subscription() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    h.billing
        .insert_remote(remote("sub_hook", "active", Utc::now() + Duration::days(30)));
    let body = json!({
        "id": "evt_checkout",
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": "cs_1",
            "customer": "cus_test",
            "customer_details": {"email": "a@b.com"},
            "subscription": "sub_hook",
            "metadata": {"tier_id": tier.id.to_string()}
        }}
    })
    .to_string();

    let outcome = h
        .engine
        .handle_webhook(body.as_bytes(), &signature(body.as_bytes()))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Applied);
    assert!(h
        .ledger
        .find_by_billing_subscription_id("sub_hook")
        .await
        .unwrap()
        .is_some());
}

// key: reconciliation-tests -> supplementary-flows
#[tokio::test]
async fn start_checkout_requires_priced_active_tier() {
    let h = harness();
    let tier = h.tier("premium", 999, &["Movies"]).await;
    let urls = CheckoutUrls::for_base("https://media.example/");

    let session = h
        .engine
        .start_checkout(tier.id, "a@b.com", Some("plexfan"), &urls)
        .await
        .unwrap();
    assert!(session.url.is_some());
    let metadata = &h.billing.checkouts()[0];
    assert_eq!(metadata["tier_id"], tier.id.to_string());
    assert_eq!(metadata["email"], "a@b.com");
    assert_eq!(metadata["access_username"], "plexfan");
    assert!(urls.success_url.starts_with("https://media.example/checkout/success"));

    let unpriced = h
        .ledger
        .create_tier(
            gatekeeper::billing::NewTier {
                name: "manual".into(),
                description: None,
                price_cents: 0,
                billing_price_id: None,
                allow_downloads: false,
                collections: vec![],
            },
            Utc::now(),
        )
        .await
        .unwrap();
    let err = h
        .engine
        .start_checkout(unpriced.id, "a@b.com", None, &urls)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));

    let err = h
        .engine
        .start_checkout(tier.id, "not-an-email", None, &urls)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
}

#[tokio::test]
async fn checkout_is_refused_while_a_live_row_holds_the_tier() {
    let h = harness();
    let premium = h.tier("premium", 999, &["Movies"]).await;
    let basic = h.tier("basic", 499, &["Movies"]).await;
    let urls = CheckoutUrls::for_base("https://media.example");
    let mut row = new_row("a@b.com", Some(premium.id), Some(Utc::now() + Duration::days(9)), None);
    row.access_username = "plexfan".into();
    let live = h.subscription(row).await;

    let err = h
        .engine
        .start_checkout(premium.id, "A@B.com", None, &urls)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
    let err = h
        .engine
        .start_checkout(premium.id, "other@b.com", Some("PlexFan"), &urls)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert!(h.billing.checkouts().is_empty());

    h.engine
        .start_checkout(basic.id, "a@b.com", None, &urls)
        .await
        .unwrap();

    h.engine.manual_revoke(live.id).await.unwrap();
    h.engine
        .start_checkout(premium.id, "a@b.com", None, &urls)
        .await
        .unwrap();
    assert_eq!(h.billing.checkouts().len(), 2);
}

#[tokio::test]
async fn free_invite_records_free_request() {
    let h = harness();
    let invite = h
        .engine
        .grant_free_access("  friend_01 ", &["Movies".to_string()])
        .await
        .unwrap();
    assert!(invite.is_free);
    assert_eq!(invite.identity, "friend_01");
    assert_eq!(invite.status, InviteStatus::Success);
    assert!(!h.access.grants()[0].allow_downloads);

    let err = h
        .engine
        .grant_free_access("x", &["Movies".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));

    h.access.fail_next_grant(AccessError::UserNotFound);
    let err = h
        .engine
        .grant_free_access("nobody", &["Movies".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Access(AccessError::UserNotFound)));
    assert_eq!(h.ledger.invite_stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn grandfathering_converts_unlinked_paid_invites_once() {
    let h = harness();
    let tier = h.tier("legacy", 0, &["Movies"]).await;
    let now = Utc::now();
    for (identity, status, is_free) in [
        ("early@b.com", InviteStatus::Success, false),
        ("earlier@b.com", InviteStatus::Success, false),
        ("free@b.com", InviteStatus::Success, true),
        ("broken@b.com", InviteStatus::Failed, false),
    ] {
        h.ledger
            .record_invite(
                NewInviteRequest {
                    identity: identity.into(),
                    status,
                    error_message: None,
                    subscription_id: None,
                    is_free,
                },
                now,
            )
            .await
            .unwrap();
    }

    assert_eq!(h.engine.grandfather_existing_users(tier.id).await.unwrap(), 2);
    assert_eq!(h.engine.grandfather_existing_users(tier.id).await.unwrap(), 0);

    let stats = h.ledger.stats().await.unwrap();
    assert_eq!(stats.grandfathered, 2);
    assert_eq!(stats.mrr_cents, 0);

    let err = h.engine.grandfather_existing_users(99).await.unwrap_err();
    assert!(matches!(err, ReconcileError::TierNotFound(99)));
}

#[tokio::test]
async fn tier_management_validates_and_toggles() {
    let h = harness();
    let tier = h
        .engine
        .create_tier(gatekeeper::billing::NewTier {
            name: " Premium ".into(),
            description: Some("all libraries".into()),
            price_cents: 999,
            billing_price_id: Some("price_1".into()),
            allow_downloads: true,
            collections: vec!["Movies".into()],
        })
        .await
        .unwrap();
    assert_eq!(tier.name, "Premium");

    let updated = h
        .engine
        .update_tier(
            tier.id,
            TierUpdate {
                price_cents: Some(1299),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.price_cents, 1299);
    assert_eq!(updated.collections, vec!["Movies".to_string()]);

    let toggled = h.engine.toggle_tier(tier.id).await.unwrap();
    assert!(!toggled.active);
    assert!(h.ledger.list_tiers(false).await.unwrap().is_empty());
    assert_eq!(h.ledger.list_tiers(true).await.unwrap().len(), 1);

    let err = h
        .engine
        .update_tier(
            tier.id,
            TierUpdate {
                price_cents: Some(-1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
}
