//! Webhook callback surface.
//!
//! `POST /callbacks/card` with JSON `{card_id, token, action, extra_payload?,
//! ts, role?}` and header `X-Signature` carrying the HMAC-SHA256 of
//! `card_id|action|ts` under the per-deployment secret. Responses: 200 on
//! success, 403 on a bad signature or role, 409 on replay/stale/expired.
//!
//! The request body is size-limited to keep the surface hostile-input
//! tolerant; signature comparison is constant time.

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use ledgerd_core::interact::{CallbackError, CallbackOutcome, InteractionHub, sign_callback};
use ledgerd_core::model::now_ms;
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;

/// Header carrying the HMAC-SHA256 signature.
const SIGNATURE_HEADER: &str = "x-signature";

/// Maximum request body size (64 KiB). Callback payloads are small; the
/// limit bounds memory against oversized posts.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Role assumed when the channel does not forward one.
const DEFAULT_ROLE: &str = "owner";

struct WebhookState {
    hub: Arc<InteractionHub>,
}

/// Callback request body.
#[derive(Debug, Deserialize)]
struct CallbackBody {
    card_id: String,
    token: String,
    action: String,
    #[serde(default)]
    extra_payload: Option<Value>,
    ts: i64,
    #[serde(default)]
    role: Option<String>,
}

/// Build the callback router.
#[must_use]
pub fn router(hub: Arc<InteractionHub>) -> Router {
    Router::new()
        .route("/callbacks/card", post(card_callback))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(Arc::new(WebhookState { hub }))
}

/// Webhook-level errors, mapped to status codes.
#[derive(Debug, thiserror::Error)]
enum WebhookError {
    #[error("missing or malformed signature header")]
    MissingSignature,

    #[error("signature mismatch")]
    BadSignature,

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::MissingSignature | Self::BadSignature => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            Self::Callback(inner) => {
                let status = match inner {
                    CallbackError::SignatureInvalid | CallbackError::RoleDenied(_) => {
                        StatusCode::FORBIDDEN
                    }
                    CallbackError::Expired
                    | CallbackError::Stale
                    | CallbackError::Replayed
                    | CallbackError::InvalidTransition(_) => StatusCode::CONFLICT,
                    CallbackError::UnknownCard => StatusCode::NOT_FOUND,
                    CallbackError::UnknownAction(_) | CallbackError::BadEntityRef(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    CallbackError::Store(_) | CallbackError::Knowledge(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, inner.to_string())
            }
        };
        (status, axum::Json(json!({"error": message}))).into_response()
    }
}

async fn card_callback(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CallbackBody>,
) -> Result<Response, WebhookError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;

    let expected = sign_callback(
        state.hub.secret(),
        &body.card_id,
        &body.action,
        body.ts,
    );
    let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        tracing::warn!(card_id = %body.card_id, "webhook signature mismatch");
        return Err(WebhookError::BadSignature);
    }

    let role = body.role.as_deref().unwrap_or(DEFAULT_ROLE);
    let outcome = state.hub.handle_callback(
        &body.card_id,
        &body.token,
        &body.action,
        body.extra_payload.as_ref(),
        body.ts,
        role,
        now_ms(),
    )?;

    let summary = match outcome {
        CallbackOutcome::Clicked => json!({"result": "clicked"}),
        CallbackOutcome::Confirmed {
            entry_id,
            learned_rule,
        } => json!({"result": "confirmed", "entry_id": entry_id, "learned_rule": learned_rule}),
        CallbackOutcome::Rejected { entry_id } => {
            json!({"result": "rejected", "entry_id": entry_id})
        }
        CallbackOutcome::BatchConfirmed { count } => {
            json!({"result": "batch_confirmed", "count": count})
        }
    };
    Ok((StatusCode::OK, axum::Json(summary)).into_response())
}
