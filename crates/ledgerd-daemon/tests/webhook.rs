//! Webhook security tests: signature validation, replay protection, and
//! status mapping, driven through the axum router.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestBed;
use ledgerd_core::interact::sign_callback;
use ledgerd_core::model::{EntryState, InferenceLog, NewEntry, OutboxKind, now_ms};
use ledgerd_core::trace::TraceContext;
use ledgerd_daemon::webhook;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tower::util::ServiceExt;

struct CardFixture {
    bed: TestBed,
    entry_id: i64,
    card_id: String,
    token: String,
}

fn fixture() -> CardFixture {
    let bed = TestBed::new();
    let entry_id = bed
        .services
        .store
        .append_entry(&NewEntry {
            trace_id: "t-review".to_string(),
            amount: dec!(-120000.00),
            vendor: "Novel Integrations Ltd".to_string(),
            category: "6604-01".to_string(),
            occurred_at: now_ms(),
            group_id: None,
            project_id: None,
            inference_log: InferenceLog::default(),
            matched_rule: None,
            tenant_id: None,
        })
        .unwrap();
    bed.services
        .store
        .set_entry_state(entry_id, EntryState::Audited)
        .unwrap();

    let (card_id, token) = bed
        .services
        .hub
        .create_card(
            OutboxKind::PushCard,
            &serde_json::json!({"title": "review"}),
            "owner",
            &format!("entry:{entry_id}"),
            &TraceContext::new("auditor"),
        )
        .unwrap();

    CardFixture {
        bed,
        entry_id,
        card_id,
        token,
    }
}

fn secret() -> SecretString {
    SecretString::from("test-deployment-secret".to_string())
}

async fn post_callback(
    fixture: &CardFixture,
    action: &str,
    ts: i64,
    signature: &str,
) -> StatusCode {
    let router = webhook::router(Arc::clone(&fixture.bed.services.hub));
    let body = serde_json::json!({
        "card_id": fixture.card_id,
        "token": fixture.token,
        "action": action,
        "ts": ts,
    });
    let request = Request::builder()
        .method("POST")
        .uri("/callbacks/card")
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap();

    router.oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn valid_signature_performs_the_action() {
    let fixture = fixture();
    let ts = now_ms();
    let signature = sign_callback(&secret(), &fixture.card_id, "CONFIRM", ts);

    let status = post_callback(&fixture, "CONFIRM", ts, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        fixture.bed.services.store.entry(fixture.entry_id).unwrap().state,
        EntryState::Posted
    );
}

#[tokio::test]
async fn bad_signature_is_403_and_changes_nothing() {
    let fixture = fixture();
    let ts = now_ms();
    let wrong = sign_callback(
        &SecretString::from("some-other-secret".to_string()),
        &fixture.card_id,
        "CONFIRM",
        ts,
    );

    let status = post_callback(&fixture, "CONFIRM", ts, &wrong).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        fixture.bed.services.store.entry(fixture.entry_id).unwrap().state,
        EntryState::Audited
    );
}

#[tokio::test]
async fn replayed_callback_performs_the_action_once() {
    let fixture = fixture();
    let ts = now_ms();
    let signature = sign_callback(&secret(), &fixture.card_id, "CONFIRM", ts);

    let first = post_callback(&fixture, "CONFIRM", ts, &signature).await;
    assert_eq!(first, StatusCode::OK);

    let second = post_callback(&fixture, "CONFIRM", ts, &signature).await;
    assert_eq!(second, StatusCode::CONFLICT);
    assert_eq!(
        fixture.bed.services.store.entry(fixture.entry_id).unwrap().state,
        EntryState::Posted
    );
}

#[tokio::test]
async fn stale_timestamp_is_409() {
    let fixture = fixture();
    let ts = now_ms() - 10 * 60_000;
    let signature = sign_callback(&secret(), &fixture.card_id, "CONFIRM", ts);

    let status = post_callback(&fixture, "CONFIRM", ts, &signature).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_action_is_400() {
    let fixture = fixture();
    let ts = now_ms();
    let signature = sign_callback(&secret(), &fixture.card_id, "SELF_DESTRUCT", ts);

    let status = post_callback(&fixture, "SELF_DESTRUCT", ts, &signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_signature_is_403() {
    let fixture = fixture();
    let router = webhook::router(Arc::clone(&fixture.bed.services.hub));
    let body = serde_json::json!({
        "card_id": fixture.card_id,
        "token": fixture.token,
        "action": "CONFIRM",
        "ts": now_ms(),
    });
    let request = Request::builder()
        .method("POST")
        .uri("/callbacks/card")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let status = router.oneshot(request).await.unwrap().status();
    assert_eq!(status, StatusCode::FORBIDDEN);
}
