//! Interaction hub: action cards and their callbacks.
//!
//! The hub bridges audit and reconciliation decisions with humans. It is
//! the only component that enqueues outbox events; other workers hand it
//! what to say. Cards carry an HMAC-signed token over
//! `card_id | kind | expires_at`; callbacks are verified in constant time,
//! checked for expiry, monotonic status transitions, role, and replay
//! (a timestamp window plus a one-shot marker per card).

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::InteractionConfig;
use crate::knowledge::{KnowledgeBridge, LearnFields};
use crate::model::{
    CardStatus, EntryState, InteractionCard, OutboxKind, PendingEntry, RuleConditions, RuleSource,
    now_ms,
};
use crate::privacy::PrivacyGuard;
use crate::store::{Store, StoreError};
use crate::trace::TraceContext;

type HmacSha256 = Hmac<Sha256>;

/// Callback actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardAction {
    /// User opened the card.
    Click,
    /// Approve the linked entry (optionally with a corrected category).
    Confirm,
    /// Refuse the linked entry.
    Reject,
    /// Confirm a batch of matched pairs.
    BatchConfirm,
}

impl CardAction {
    /// Parse the wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLICK" => Some(Self::Click),
            "CONFIRM" => Some(Self::Confirm),
            "REJECT" => Some(Self::Reject),
            "BATCH_CONFIRM" => Some(Self::BatchConfirm),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Click => "CLICK",
            Self::Confirm => "CONFIRM",
            Self::Reject => "REJECT",
            Self::BatchConfirm => "BATCH_CONFIRM",
        }
    }
}

/// What a successful callback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Card opened; no state change beyond the status.
    Clicked,
    /// Entry posted; a rule may have been learned from a correction.
    Confirmed {
        /// The posted entry.
        entry_id: i64,
        /// Rule learned from a user correction, if any.
        learned_rule: Option<i64>,
    },
    /// Entry rejected.
    Rejected {
        /// The rejected entry.
        entry_id: i64,
    },
    /// Matched pairs confirmed.
    BatchConfirmed {
        /// Pairs flipped to reconciled/posted.
        count: u32,
    },
}

/// Callback verification and processing errors.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Token does not verify.
    #[error("callback signature invalid")]
    SignatureInvalid,

    /// Card TTL elapsed.
    #[error("card expired")]
    Expired,

    /// Callback timestamp outside the replay window.
    #[error("callback timestamp outside the replay window")]
    Stale,

    /// One-shot marker already consumed.
    #[error("callback replayed")]
    Replayed,

    /// Actor role does not match the card's required role.
    #[error("role {0} is not authorized for this card")]
    RoleDenied(String),

    /// Status transition is not monotonic.
    #[error("invalid card transition from {0}")]
    InvalidTransition(&'static str),

    /// Unknown card id.
    #[error("unknown card")]
    UnknownCard,

    /// Action string not recognised.
    #[error("unknown action {0}")]
    UnknownAction(String),

    /// The linked entity reference is malformed.
    #[error("malformed entity reference {0}")]
    BadEntityRef(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rule learning failed.
    #[error(transparent)]
    Knowledge(#[from] crate::knowledge::KnowledgeError),
}

/// Compute the card token: HMAC-SHA256 over `card_id | kind | expires_at`.
#[must_use]
pub fn sign_card(secret: &SecretString, card_id: &str, kind: OutboxKind, expires_at: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(card_id.as_bytes());
    mac.update(b"|");
    mac.update(kind.as_str().as_bytes());
    mac.update(b"|");
    mac.update(expires_at.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compute the webhook signature: HMAC-SHA256 over `card_id | action | ts`.
#[must_use]
pub fn sign_callback(secret: &SecretString, card_id: &str, action: &str, ts: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(card_id.as_bytes());
    mac.update(b"|");
    mac.update(action.as_bytes());
    mac.update(b"|");
    mac.update(ts.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time hex comparison.
fn token_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// The hub.
pub struct InteractionHub {
    store: Store,
    bridge: KnowledgeBridge,
    guard: PrivacyGuard,
    secret: SecretString,
    card_ttl_ms: i64,
    replay_window_ms: i64,
}

impl std::fmt::Debug for InteractionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionHub").finish_non_exhaustive()
    }
}

impl InteractionHub {
    /// Create the hub.
    #[must_use]
    pub fn new(
        store: Store,
        bridge: KnowledgeBridge,
        guard: PrivacyGuard,
        config: &InteractionConfig,
    ) -> Self {
        Self {
            store,
            bridge,
            guard,
            secret: SecretString::from(config.callback_secret.clone()),
            card_ttl_ms: i64::try_from(config.card_ttl_s).unwrap_or(86_400) * 1_000,
            replay_window_ms: i64::try_from(config.replay_window_s).unwrap_or(60) * 1_000,
        }
    }

    /// The callback secret, shared with the webhook surface.
    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Create a card and enqueue its push event.
    ///
    /// The payload is sanitized before it is stored or enqueued; whatever
    /// reaches the outside carries no raw sensitive values.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn create_card(
        &self,
        kind: OutboxKind,
        payload: &Value,
        required_role: &str,
        linked_entity_ref: &str,
        trace: &TraceContext,
    ) -> Result<(String, String), StoreError> {
        let card_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let expires_at = now + self.card_ttl_ms;
        let token = sign_card(&self.secret, &card_id, kind, expires_at);

        let card = InteractionCard {
            card_id: card_id.clone(),
            kind,
            callback_token: token.clone(),
            created_at: now,
            expires_at,
            required_role: required_role.to_string(),
            status: CardStatus::Sent,
            linked_entity_ref: linked_entity_ref.to_string(),
            consumed: false,
            tenant_id: None,
        };
        self.store.insert_card(&card)?;

        let envelope = json!({
            "card_id": card_id,
            "kind": kind.as_str(),
            "payload": self.sanitize_value(payload),
            "expires_at": expires_at,
            "callback_token": token,
            "metadata": {
                "trace_id": trace.trace_id,
                "required_role": required_role,
            },
        });
        self.store
            .outbox_enqueue(&format!("card-{card_id}"), kind, &envelope)?;

        tracing::info!(card_id = %card_id, kind = kind.as_str(), "card created");
        Ok((card_id, token))
    }

    /// Enqueue an evidence request for an unmatched flow. Idempotent per
    /// pending entry: the hunter re-derives its list every pass but the
    /// user is nagged once. Returns whether a new request was enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn push_evidence_request(&self, pending: &PendingEntry) -> Result<bool, StoreError> {
        let sanitized = self.guard.sanitize(&pending.counterparty);
        let payload = json!({
            "pending_id": pending.id,
            "counterparty": sanitized.text,
            "amount": pending.amount.to_string(),
            "occurred_at": pending.occurred_at,
        });
        self.store.outbox_enqueue_once(
            &format!("evidence-{}", pending.id),
            OutboxKind::EvidenceRequest,
            &payload,
        )
    }

    /// Enqueue a CRITICAL operator alert.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn push_critical_alert(&self, code: &str, detail: &str) -> Result<(), StoreError> {
        let sanitized = self.guard.sanitize(detail);
        let payload = json!({ "code": code, "detail": sanitized.text });
        let event_id = format!("critical-{}-{}", code, uuid::Uuid::new_v4());
        tracing::error!(code, "critical alert raised");
        self.store
            .outbox_enqueue(&event_id, OutboxKind::CriticalAlert, &payload)
    }

    /// Verify and process one callback.
    ///
    /// Verification order: signature, expiry, replay window, one-shot
    /// marker, status transition, role. Only then does the action touch
    /// durable state.
    ///
    /// # Errors
    ///
    /// See [`CallbackError`]; nothing is mutated on any verification
    /// failure.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_callback(
        &self,
        card_id: &str,
        token: &str,
        action: &str,
        extra_payload: Option<&Value>,
        ts_ms: i64,
        actor_role: &str,
        now_ms: i64,
    ) -> Result<CallbackOutcome, CallbackError> {
        let card = match self.store.card(card_id) {
            Ok(card) => card,
            Err(StoreError::NotFound { .. }) => return Err(CallbackError::UnknownCard),
            Err(e) => return Err(e.into()),
        };

        let expected = sign_card(&self.secret, &card.card_id, card.kind, card.expires_at);
        if !token_eq(token, &expected) {
            tracing::warn!(card_id = %card_id, "callback with bad signature");
            return Err(CallbackError::SignatureInvalid);
        }

        if now_ms >= card.expires_at {
            self.store.update_card(card_id, CardStatus::Expired, false)?;
            return Err(CallbackError::Expired);
        }
        if (now_ms - ts_ms).abs() > self.replay_window_ms {
            return Err(CallbackError::Stale);
        }
        if card.consumed {
            return Err(CallbackError::Replayed);
        }

        let action =
            CardAction::parse(action).ok_or_else(|| CallbackError::UnknownAction(action.into()))?;

        match (card.status, action) {
            (CardStatus::Sent, CardAction::Click) => {
                self.store.update_card(card_id, CardStatus::Clicked, false)?;
                return Ok(CallbackOutcome::Clicked);
            }
            (CardStatus::Clicked, CardAction::Click) | (CardStatus::Expired, _) => {
                return Err(CallbackError::InvalidTransition(card.status.as_str()));
            }
            (CardStatus::Completed, _) => return Err(CallbackError::Replayed),
            (CardStatus::Sent | CardStatus::Clicked, _) => {}
        }

        if card.required_role != actor_role {
            return Err(CallbackError::RoleDenied(actor_role.to_string()));
        }

        let outcome = self.apply_action(&card, action, extra_payload)?;
        self.store.update_card(card_id, CardStatus::Completed, true)?;
        tracing::info!(card_id = %card_id, action = action.as_str(), "callback completed");
        Ok(outcome)
    }

    fn apply_action(
        &self,
        card: &InteractionCard,
        action: CardAction,
        extra_payload: Option<&Value>,
    ) -> Result<CallbackOutcome, CallbackError> {
        match action {
            CardAction::Click => Ok(CallbackOutcome::Clicked),
            CardAction::Confirm => {
                let entry_id = parse_entity_ref(&card.linked_entity_ref, "entry")?;
                let learned_rule = match extra_payload {
                    Some(extra) => self.learn_correction(extra)?,
                    None => None,
                };
                self.store.set_entry_state(entry_id, EntryState::Posted)?;
                Ok(CallbackOutcome::Confirmed {
                    entry_id,
                    learned_rule,
                })
            }
            CardAction::Reject => {
                let entry_id = parse_entity_ref(&card.linked_entity_ref, "entry")?;
                self.store.set_entry_state(entry_id, EntryState::Rejected)?;
                Ok(CallbackOutcome::Rejected { entry_id })
            }
            CardAction::BatchConfirm => {
                let ids = match extra_payload.and_then(|extra| extra.get("item_ids")) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(Value::as_i64)
                        .collect::<Vec<_>>(),
                    _ => parse_batch_ref(&card.linked_entity_ref)?,
                };
                let count = self.store.batch_confirm(&ids)?;
                Ok(CallbackOutcome::BatchConfirmed { count })
            }
        }
    }

    /// A confirm carrying `updated_category` feeds the correction back into
    /// the knowledge base as a MANUAL rule.
    fn learn_correction(&self, extra: &Value) -> Result<Option<i64>, CallbackError> {
        let Some(category) = extra.get("updated_category").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(vendor) = extra.get("vendor").and_then(Value::as_str) else {
            return Ok(None);
        };
        let rule_id = self.bridge.learn(
            &LearnFields {
                keyword: vendor.to_string(),
                category: category.to_string(),
                is_regex: false,
                conditions: RuleConditions::default(),
                priority: 50,
            },
            RuleSource::Manual,
        )?;
        tracing::info!(rule_id, vendor = %vendor, "correction learned as MANUAL rule");
        Ok(Some(rule_id))
    }

    fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.guard.sanitize(s).text),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.sanitize_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.sanitize_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn parse_entity_ref(entity_ref: &str, expected: &str) -> Result<i64, CallbackError> {
    let (kind, id) = entity_ref
        .split_once(':')
        .ok_or_else(|| CallbackError::BadEntityRef(entity_ref.to_string()))?;
    if kind != expected {
        return Err(CallbackError::BadEntityRef(entity_ref.to_string()));
    }
    id.parse()
        .map_err(|_| CallbackError::BadEntityRef(entity_ref.to_string()))
}

fn parse_batch_ref(entity_ref: &str) -> Result<Vec<i64>, CallbackError> {
    let ids = entity_ref
        .strip_prefix("batch:")
        .ok_or_else(|| CallbackError::BadEntityRef(entity_ref.to_string()))?;
    ids.split(',')
        .map(|id| {
            id.trim()
                .parse()
                .map_err(|_| CallbackError::BadEntityRef(entity_ref.to_string()))
        })
        .collect()
}
