//! End-to-end pipeline scenarios against a temp store, driving the worker
//! tick functions directly.

mod common;

use std::sync::Arc;

use common::TestBed;
use ledgerd_core::knowledge::LearnFields;
use ledgerd_core::model::{
    AuditLevel, EntryState, FlowSource, OutboxKind, PendingStatus, RuleConditions, RuleSource,
    WorkerState, now_ms,
};
use ledgerd_core::store::StoreError;
use ledgerd_daemon::daemon::MasterDaemon;
use ledgerd_daemon::workers::{accountant, auditor, collector, hub, matcher};
use rust_decimal_macros::dec;

const ALIPAY_CSV: &str = "\
业务流水号,交易创建时间,对方名称,金额,收/支
2026010200001,2026-01-02 09:15:00,Starbucks,500.00,支出
2026010200002,2026-01-02 10:00:00,ACME Cloud Inc.,\"4,980.00\",支出";

/// Day the fixture statements occurred on, as epoch millis.
fn statement_day() -> i64 {
    ledgerd_core::collect::parse_timestamp("2026-01-02 09:15:00").unwrap()
}

async fn matcher_tick(bed: &TestBed) {
    matcher::tick(
        Arc::clone(&bed.services),
        Arc::clone(&bed.config),
        Arc::new(matcher::MatcherState::default()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn s1_alipay_statement_becomes_pending_entries() {
    let bed = TestBed::new();
    bed.drop_file("alipay-流水.csv", ALIPAY_CSV.as_bytes());

    collector::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();

    let pending = bed
        .services
        .store
        .pending_entries_page(PendingStatus::Unreconciled, 10, 0)
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].counterparty, "Starbucks");
    assert_eq!(pending[0].amount, dec!(-500.00));
    assert_eq!(pending[0].source, FlowSource::Alipay);
    assert_eq!(pending[1].counterparty, "ACME Cloud Inc.");
    assert_eq!(pending[1].amount, dec!(-4980.00));
}

#[tokio::test]
async fn s2_receipt_flows_to_posted_entry_and_batch_card() {
    let bed = TestBed::new();

    // A stable rule from an earlier correction: Starbucks books to welfare.
    bed.services
        .bridge
        .learn(
            &LearnFields {
                keyword: "Starbucks".to_string(),
                category: "6602-03".to_string(),
                is_regex: false,
                conditions: RuleConditions::default(),
                priority: 50,
            },
            RuleSource::Manual,
        )
        .unwrap();

    bed.drop_file("alipay-流水.csv", ALIPAY_CSV.as_bytes());
    bed.drop_file("starbucks-receipt.jpg", &TestBed::jpeg_bytes("s2 receipt"));
    bed.ocr
        .set("starbucks-receipt", "Starbucks", dec!(500.00), statement_day());

    collector::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    accountant::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();

    // Classified through the stable rule at high confidence.
    let proposed = bed
        .services
        .store
        .entries_in_state(EntryState::Proposed, 10)
        .unwrap();
    assert_eq!(proposed.len(), 1);
    assert_eq!(proposed[0].category, "6602-03");
    assert!(proposed[0].inference_log.confidence >= 0.9);

    auditor::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    let entry = bed.services.store.entry(proposed[0].id).unwrap();
    assert_eq!(entry.state, EntryState::Posted);

    matcher_tick(&bed).await;

    // The Alipay 500.00 line paired with the posted entry and a batch
    // confirmation card was raised.
    let starbucks_line = bed
        .services
        .store
        .pending_entries_page(PendingStatus::Matched, 10, 0)
        .unwrap();
    assert_eq!(starbucks_line.len(), 1);
    assert_eq!(starbucks_line[0].matched_ledger_id, Some(entry.id));

    let due = bed
        .services
        .store
        .outbox_due(now_ms() + 1, 50)
        .unwrap();
    assert!(
        due.iter().any(|event| event.kind == OutboxKind::BatchConfirm),
        "expected a batch confirmation event"
    );
}

#[tokio::test]
async fn s3_unknown_vendor_goes_through_l2_review_and_manual_learn() {
    let bed = TestBed::new();

    // Three-step reasoning: two tool rounds, then a 0.72 decision.
    bed.provider
        .push(r#"{"action": "web_lookup", "query": "Novel Integrations Ltd"}"#);
    bed.provider
        .push(r#"{"action": "browser_fetch", "url": "https://novel-integrations.example"}"#);
    bed.provider.push(
        r#"{"action": "decide", "category": "6604-01", "confidence": 0.72, "reason": "technology services vendor"}"#,
    );

    bed.drop_file("acme-invoice.jpg", &TestBed::jpeg_bytes("s3 invoice"));
    bed.ocr.set(
        "acme-invoice",
        "Novel Integrations Ltd",
        dec!(120000.00),
        now_ms(),
    );

    collector::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    accountant::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();

    let proposed = bed
        .services
        .store
        .entries_in_state(EntryState::Proposed, 10)
        .unwrap();
    assert_eq!(proposed.len(), 1);
    let entry = &proposed[0];
    assert_eq!(entry.category, "6604-01");
    assert_eq!(entry.inference_log.engine, "L2");
    // input analysis + routing + no-rule + L2 graph (analysis, two tools,
    // decide) + source text
    assert!(entry.inference_log.steps.len() >= 6);

    // Above tier 1 without a trusted rule: review, with a card.
    auditor::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    assert_eq!(
        bed.services.store.entry(entry.id).unwrap().state,
        EntryState::Audited
    );
    let due = bed.services.store.outbox_due(now_ms() + 1, 50).unwrap();
    assert!(due.iter().any(|event| event.kind == OutboxKind::PushCard));

    // The user confirms with a corrected category; the correction becomes
    // a stable rule.
    let card_event = due
        .iter()
        .find(|event| event.kind == OutboxKind::PushCard)
        .unwrap();
    let card_id = card_event.payload["card_id"].as_str().unwrap();
    let token = card_event.payload["callback_token"].as_str().unwrap();
    let now = now_ms();
    let extra = serde_json::json!({
        "updated_category": "6603-01",
        "vendor": "Novel Integrations Ltd",
    });
    bed.services
        .hub
        .handle_callback(card_id, token, "CONFIRM", Some(&extra), now, "owner", now)
        .unwrap();
    assert_eq!(
        bed.services.store.entry(entry.id).unwrap().state,
        EntryState::Posted
    );

    let rule = bed
        .services
        .store
        .active_rule_for_keyword("Novel Integrations Ltd")
        .unwrap()
        .unwrap();
    assert_eq!(rule.proposed_category, "6603-01");
    assert_eq!(rule.audit_level, AuditLevel::Stable);

    // A later invoice from the same vendor matches the new rule directly,
    // with no further external calls.
    let calls_before = *bed.provider.calls.lock().unwrap();
    bed.drop_file("acme-invoice-2.jpg", &TestBed::jpeg_bytes("s3 invoice two"));
    bed.ocr.set(
        "acme-invoice-2",
        "Novel Integrations Ltd",
        dec!(90000.00),
        now_ms(),
    );
    collector::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    accountant::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();

    let proposed = bed
        .services
        .store
        .entries_in_state(EntryState::Proposed, 10)
        .unwrap();
    assert_eq!(proposed.len(), 1);
    assert_eq!(proposed[0].category, "6603-01");
    assert_eq!(proposed[0].inference_log.engine, "L1");
    assert_eq!(*bed.provider.calls.lock().unwrap(), calls_before);
}

#[tokio::test]
async fn s4_identical_receipts_yield_one_entry() {
    let bed = TestBed::new();
    let bytes = TestBed::jpeg_bytes("the same receipt");
    bed.drop_file("receipt-a.jpg", &bytes);
    bed.drop_file("receipt-b.jpg", &bytes);
    bed.ocr.set("receipt-a", "Starbucks", dec!(500.00), now_ms());
    bed.ocr.set("receipt-b", "Starbucks", dec!(500.00), now_ms());

    collector::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();
    accountant::tick(Arc::clone(&bed.services), Arc::clone(&bed.config))
        .await
        .unwrap();

    let stats = bed.services.store.ledger_stats().unwrap();
    let total: u32 = stats.by_state.iter().map(|(_, count)| count).sum();
    assert_eq!(total, 1, "exactly one ledger entry after duplicate drops");
}

#[tokio::test]
async fn s6_corrupted_row_raises_alert_and_blocks_appends() {
    let bed = TestBed::new();

    let id = bed
        .services
        .store
        .append_entry(&ledgerd_core::model::NewEntry {
            trace_id: "t-posted".to_string(),
            amount: dec!(-500.00),
            vendor: "Starbucks".to_string(),
            category: "6602-03".to_string(),
            occurred_at: now_ms(),
            group_id: None,
            project_id: None,
            inference_log: ledgerd_core::model::InferenceLog::default(),
            matched_rule: None,
            tenant_id: None,
        })
        .unwrap();
    bed.services
        .store
        .set_entry_state(id, EntryState::Posted)
        .unwrap();

    // Corrupt a byte the way external tampering would: outside the store
    // API, with the protective triggers removed first.
    {
        let conn = rusqlite::Connection::open(&bed.config.paths.store_file).unwrap();
        conn.execute_batch("DROP TRIGGER trg_ledger_immutable_update")
            .unwrap();
        conn.execute(
            "UPDATE ledger_entries SET amount = '999.99' WHERE id = ?1",
            rusqlite::params![id],
        )
        .unwrap();
    }

    matcher_tick(&bed).await;

    // A CRITICAL event names the break; the row stays POSTED; appends are
    // refused until rollback or override.
    let due = bed.services.store.outbox_due(now_ms() + 1, 50).unwrap();
    let alert = due
        .iter()
        .find(|event| event.kind == OutboxKind::CriticalAlert)
        .expect("critical alert expected");
    assert!(alert.payload["detail"]
        .as_str()
        .unwrap()
        .contains(&id.to_string()));
    assert_eq!(
        bed.services.store.entry(id).unwrap().state,
        EntryState::Posted
    );

    let err = bed
        .services
        .store
        .append_entry(&ledgerd_core::model::NewEntry {
            trace_id: "t-after".to_string(),
            amount: dec!(1),
            vendor: "V".to_string(),
            category: "6601-01".to_string(),
            occurred_at: now_ms(),
            group_id: None,
            project_id: None,
            inference_log: ledgerd_core::model::InferenceLog::default(),
            matched_rule: None,
            tenant_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::ChainViolation));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn daemon_boot_and_graceful_shutdown_leave_no_residue() {
    let bed = TestBed::new();
    let mut daemon = MasterDaemon::new(
        Arc::clone(&bed.services),
        (*bed.config).clone(),
    )
    .unwrap();

    daemon.start().await.unwrap();
    for name in [
        hub::NAME,
        accountant::NAME,
        auditor::NAME,
        matcher::NAME,
        collector::NAME,
    ] {
        let beat = bed.services.store.heartbeat_of(name).unwrap().unwrap();
        assert_eq!(beat.state, WorkerState::Alive, "{name} should be alive");
    }

    daemon.shutdown().await;

    for name in [
        hub::NAME,
        accountant::NAME,
        auditor::NAME,
        matcher::NAME,
        collector::NAME,
    ] {
        let beat = bed.services.store.heartbeat_of(name).unwrap().unwrap();
        assert_eq!(beat.state, WorkerState::Dead, "{name} should have drained");
    }

    // No advisory locks survive the drain plus a maintenance pass.
    let locking = bed
        .services
        .store
        .entries_in_state(EntryState::Locking, 10)
        .unwrap();
    assert!(locking.is_empty());
}

#[tokio::test]
async fn evidence_hunter_requests_missing_documents_once() {
    let bed = TestBed::new();
    bed.services
        .store
        .add_pending_entry(FlowSource::Bank, "Ghost Vendor", dec!(-800.00), 0, "")
        .unwrap();

    // Backdate the row so it is older than the evidence window.
    {
        let conn = rusqlite::Connection::open(&bed.config.paths.store_file).unwrap();
        conn.execute("UPDATE pending_entries SET inserted_at = 0", [])
            .unwrap();
    }

    let state = Arc::new(matcher::MatcherState::default());
    matcher::tick(Arc::clone(&bed.services), Arc::clone(&bed.config), Arc::clone(&state))
        .await
        .unwrap();

    let due = bed.services.store.outbox_due(now_ms() + 1, 50).unwrap();
    let requests = due
        .iter()
        .filter(|event| event.kind == OutboxKind::EvidenceRequest)
        .count();
    assert_eq!(requests, 1);

    // A later hunt does not nag again for the same flow.
    let fresh_state = Arc::new(matcher::MatcherState::default());
    matcher::tick(Arc::clone(&bed.services), Arc::clone(&bed.config), fresh_state)
        .await
        .unwrap();
    let due = bed.services.store.outbox_due(now_ms() + 1, 50).unwrap();
    let requests = due
        .iter()
        .filter(|event| event.kind == OutboxKind::EvidenceRequest)
        .count();
    assert_eq!(requests, 1);
}

#[tokio::test]
async fn outbox_delivers_cards_through_the_channel() {
    let bed = TestBed::new();
    bed.services
        .hub
        .push_critical_alert("TEST_ALERT", "just checking")
        .unwrap();

    hub::tick(
        Arc::clone(&bed.services),
        Arc::clone(&bed.config),
        Arc::new(hub::HubState::default()),
    )
    .await
    .unwrap();

    let delivered = bed.channel.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["kind"], "CRITICAL_ALERT");
    assert_eq!(bed.services.store.outbox_backlog().unwrap(), 0);
}
