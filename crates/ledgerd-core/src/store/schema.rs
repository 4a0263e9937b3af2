//! Schema initialization.
//!
//! Tables, indexes, the immutability triggers enforcing append-only terminal
//! rows, and the `v_audit_trail` view.

use rusqlite::Connection;

use super::StoreError;

pub(super) fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id        TEXT NOT NULL UNIQUE,
            amount          TEXT NOT NULL,
            vendor          TEXT NOT NULL,
            category        TEXT NOT NULL,
            occurred_at     INTEGER NOT NULL,
            group_id        TEXT,
            project_id      TEXT,
            inference_log   TEXT NOT NULL,
            matched_rule    INTEGER,
            prev_hash       TEXT NOT NULL,
            chain_hash      TEXT NOT NULL,
            state           TEXT NOT NULL DEFAULT 'PROPOSED',
            lock_owner      TEXT,
            locked_at       INTEGER,
            reverted_by     INTEGER,
            tenant_id       TEXT,
            inserted_at     INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_state ON ledger_entries(state);
        CREATE INDEX IF NOT EXISTS idx_entries_vendor ON ledger_entries(vendor);
        CREATE INDEX IF NOT EXISTS idx_entries_amount_time
            ON ledger_entries(amount, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_entries_group ON ledger_entries(group_id);

        CREATE TABLE IF NOT EXISTS entry_tags (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id    INTEGER NOT NULL REFERENCES ledger_entries(id),
            tag_key     TEXT NOT NULL,
            tag_value   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tags_kv ON entry_tags(tag_key, tag_value);

        CREATE TABLE IF NOT EXISTS pending_entries (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            source              TEXT NOT NULL,
            counterparty        TEXT NOT NULL,
            amount              TEXT NOT NULL,
            occurred_at         INTEGER NOT NULL,
            description         TEXT NOT NULL DEFAULT '',
            status              TEXT NOT NULL DEFAULT 'UNRECONCILED',
            matched_ledger_id   INTEGER,
            tenant_id           TEXT,
            inserted_at         INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_entries(status);
        CREATE INDEX IF NOT EXISTS idx_pending_amount ON pending_entries(amount);

        CREATE TABLE IF NOT EXISTS rules (
            rule_id             INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword_pattern     TEXT NOT NULL,
            is_regex            INTEGER NOT NULL DEFAULT 0,
            conditions          TEXT NOT NULL DEFAULT '{}',
            proposed_category   TEXT NOT NULL,
            priority            INTEGER NOT NULL DEFAULT 0,
            audit_level         TEXT NOT NULL DEFAULT 'GRAY',
            hit_count           INTEGER NOT NULL DEFAULT 0,
            reject_count        INTEGER NOT NULL DEFAULT 0,
            consecutive_success INTEGER NOT NULL DEFAULT 0,
            version             INTEGER NOT NULL DEFAULT 1,
            valid_until         INTEGER,
            source              TEXT NOT NULL DEFAULT 'SEED',
            tenant_id           TEXT,
            inserted_at         INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rules_keyword ON rules(keyword_pattern);
        CREATE INDEX IF NOT EXISTS idx_rules_active
            ON rules(audit_level) WHERE valid_until IS NULL;

        CREATE TABLE IF NOT EXISTS outbox_events (
            event_id        TEXT PRIMARY KEY,
            kind            TEXT NOT NULL,
            payload         TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'PENDING',
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            tenant_id       TEXT,
            inserted_at     INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_dispatch
            ON outbox_events(status, next_attempt_at);

        CREATE TABLE IF NOT EXISTS interaction_cards (
            card_id             TEXT PRIMARY KEY,
            kind                TEXT NOT NULL,
            callback_token      TEXT NOT NULL,
            created_at          INTEGER NOT NULL,
            expires_at          INTEGER NOT NULL,
            required_role       TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'SENT',
            linked_entity_ref   TEXT NOT NULL,
            consumed            INTEGER NOT NULL DEFAULT 0,
            tenant_id           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_cards_status ON interaction_cards(status);

        CREATE TABLE IF NOT EXISTS heartbeats (
            worker_name     TEXT PRIMARY KEY,
            pid             INTEGER NOT NULL,
            last_beat_at    INTEGER NOT NULL,
            state           TEXT NOT NULL,
            panic_snapshot  TEXT
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id     TEXT PRIMARY KEY,
            created_at      INTEGER NOT NULL,
            description     TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            path            TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_documents (
            doc_id          INTEGER PRIMARY KEY AUTOINCREMENT,
            path            TEXT NOT NULL,
            content_hash    TEXT NOT NULL UNIQUE,
            doc_kind        TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'PENDING',
            failure_cause   TEXT,
            group_id        TEXT,
            trace_id        TEXT NOT NULL UNIQUE,
            inserted_at     INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_status ON source_documents(status);

        CREATE TRIGGER IF NOT EXISTS trg_ledger_immutable_update
        BEFORE UPDATE ON ledger_entries
        WHEN OLD.state IN ('POSTED', 'REJECTED', 'REVERTED')
         AND NOT (OLD.state = 'POSTED' AND NEW.state = 'REVERTED')
        BEGIN
            SELECT RAISE(ABORT, 'ledger row is immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_ledger_immutable_delete
        BEFORE DELETE ON ledger_entries
        WHEN OLD.state IN ('POSTED', 'REJECTED', 'REVERTED')
        BEGIN
            SELECT RAISE(ABORT, 'ledger row is immutable');
        END;

        CREATE VIEW IF NOT EXISTS v_audit_trail AS
        SELECT
            e.id            AS entry_id,
            e.trace_id      AS trace_id,
            e.occurred_at   AS occurred_at,
            e.vendor        AS vendor,
            e.amount        AS amount,
            e.category      AS category,
            e.state         AS state,
            e.matched_rule  AS matched_rule,
            e.inference_log AS inference_log,
            GROUP_CONCAT(t.tag_key || ':' || t.tag_value, '|') AS tags
        FROM ledger_entries e
        LEFT JOIN entry_tags t ON t.entry_id = e.id
        GROUP BY e.id;
        ",
    )?;
    Ok(())
}
