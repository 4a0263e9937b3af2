//! Outbox event and interaction card rows.
//!
//! The outbox is the only cross-worker queue and it is durable: an event is
//! enqueued in the same store as the state change that caused it, and a
//! polling worker delivers it at-least-once.

use rusqlite::{OptionalExtension, Row, params};

use super::{Store, StoreError};
use crate::model::{
    CardStatus, InteractionCard, OutboxEvent, OutboxKind, OutboxStatus, now_ms,
};

fn map_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    Ok(OutboxEvent {
        event_id: row.get("event_id")?,
        kind: OutboxKind::parse(&kind).unwrap_or(OutboxKind::PushCard),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        attempts: row.get("attempts")?,
        next_attempt_at: row.get("next_attempt_at")?,
        tenant_id: row.get("tenant_id")?,
        inserted_at: row.get("inserted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_card(row: &Row<'_>) -> rusqlite::Result<InteractionCard> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    Ok(InteractionCard {
        card_id: row.get("card_id")?,
        kind: OutboxKind::parse(&kind).unwrap_or(OutboxKind::PushCard),
        callback_token: row.get("callback_token")?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
        required_role: row.get("required_role")?,
        status: CardStatus::parse(&status).unwrap_or(CardStatus::Sent),
        linked_entity_ref: row.get("linked_entity_ref")?,
        consumed: row.get("consumed")?,
        tenant_id: row.get("tenant_id")?,
    })
}

const EVENT_COLUMNS: &str =
    "event_id, kind, payload, status, attempts, next_attempt_at, tenant_id, \
     inserted_at, updated_at";

const CARD_COLUMNS: &str = "card_id, kind, callback_token, created_at, expires_at, \
     required_role, status, linked_entity_ref, consumed, tenant_id";

impl Store {
    /// Enqueue an outbox event for at-least-once delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn outbox_enqueue(
        &self,
        event_id: &str,
        kind: OutboxKind,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let payload = payload.to_string();
        self.with_tx(|tx| {
            let now = now_ms();
            tx.execute(
                "INSERT INTO outbox_events
                   (event_id, kind, payload, status, attempts, next_attempt_at,
                    inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?4, ?4)",
                params![event_id, kind.as_str(), payload, now],
            )?;
            Ok(())
        })
    }

    /// Enqueue an event only if its id has never been enqueued. Used for
    /// reminder-style events that are re-derived every pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn outbox_enqueue_once(
        &self,
        event_id: &str,
        kind: OutboxKind,
        payload: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let payload = payload.to_string();
        self.with_tx(|tx| {
            let now = now_ms();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO outbox_events
                   (event_id, kind, payload, status, attempts, next_attempt_at,
                    inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?4, ?4)",
                params![event_id, kind.as_str(), payload, now],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Due `PENDING` events, oldest first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn outbox_due(&self, now: i64, limit: u32) -> Result<Vec<OutboxEvent>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM outbox_events
                 WHERE status = 'PENDING' AND next_attempt_at <= ?1
                 ORDER BY inserted_at ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now, limit], map_event)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Record a delivery outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such event exists.
    pub fn outbox_mark(
        &self,
        event_id: &str,
        status: OutboxStatus,
        attempts: i64,
        next_attempt_at: i64,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE outbox_events
                 SET status = ?1, attempts = ?2, next_attempt_at = ?3, updated_at = ?4
                 WHERE event_id = ?5",
                params![status.as_str(), attempts, next_attempt_at, now_ms(), event_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "outbox event",
                    key: event_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Number of undelivered events, for backlog self-monitoring.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn outbox_backlog(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox_events WHERE status IN ('PENDING', 'SENT')",
                [],
                |row| row.get(0),
            )?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    /// Persist a freshly created interaction card.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_card(&self, card: &InteractionCard) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO interaction_cards
                   (card_id, kind, callback_token, created_at, expires_at, required_role,
                    status, linked_entity_ref, consumed, tenant_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    card.card_id,
                    card.kind.as_str(),
                    card.callback_token,
                    card.created_at,
                    card.expires_at,
                    card.required_role,
                    card.status.as_str(),
                    card.linked_entity_ref,
                    card.consumed,
                    card.tenant_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch a card by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such card exists.
    pub fn card(&self, card_id: &str) -> Result<InteractionCard, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {CARD_COLUMNS} FROM interaction_cards WHERE card_id = ?1"),
                params![card_id],
                map_card,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "card",
                key: card_id.to_string(),
            })
        })
    }

    /// Advance a card's status, optionally consuming its one-shot marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such card exists.
    pub fn update_card(
        &self,
        card_id: &str,
        status: CardStatus,
        consume: bool,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE interaction_cards
                 SET status = ?1, consumed = consumed OR ?2
                 WHERE card_id = ?3",
                params![status.as_str(), consume, card_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "card",
                    key: card_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Expire non-terminal cards whose TTL has elapsed. Returns the number
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn expire_cards(&self, now: i64) -> Result<u32, StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE interaction_cards SET status = 'EXPIRED'
                 WHERE status IN ('SENT', 'CLICKED') AND expires_at <= ?1",
                params![now],
            )?;
            Ok(u32::try_from(changed).unwrap_or(u32::MAX))
        })
    }
}
