//! Default connector seams.
//!
//! OCR, external inference, reason-act tools, and the card channel are
//! external collaborators; deployments wire their own implementations into
//! [`crate::workers::Services`]. The types here are the safe defaults the
//! bare binary starts with: inference and OCR report themselves as not
//! configured (documents fail soft with that cause), and cards are
//! delivered to the structured log.

use std::path::Path;

use ledgerd_core::collect::{OcrEngine, OcrResult};
use ledgerd_core::egress::{EgressError, InferenceProvider, InferenceRequest, InferenceResponse};
use ledgerd_core::classify::ToolConnector;
use ledgerd_core::outbox::CardChannel;
use serde_json::Value;

/// Inference provider used until a real connector is wired in.
#[derive(Debug, Default)]
pub struct UnconfiguredProvider;

impl InferenceProvider for UnconfiguredProvider {
    fn complete(&self, _request: &InferenceRequest) -> Result<InferenceResponse, EgressError> {
        Err(EgressError::Provider(
            "no inference connector configured".to_string(),
        ))
    }
}

/// Tool connector used until real search/browser/chat connectors exist.
#[derive(Debug, Default)]
pub struct UnconfiguredTools;

impl ToolConnector for UnconfiguredTools {
    fn web_lookup(&self, _query: &str) -> Result<String, EgressError> {
        Err(EgressError::Provider("no web connector configured".to_string()))
    }

    fn browser_fetch(&self, _url: &str) -> Result<String, EgressError> {
        Err(EgressError::Provider(
            "no browser connector configured".to_string(),
        ))
    }

    fn ask_user(&self, _question: &str) -> Result<String, EgressError> {
        Err(EgressError::Provider(
            "no chat connector configured".to_string(),
        ))
    }
}

/// OCR engine used until a real pipeline is wired in.
#[derive(Debug, Default)]
pub struct UnconfiguredOcr;

impl OcrEngine for UnconfiguredOcr {
    fn extract(&self, _path: &Path) -> Result<OcrResult, String> {
        Err("no OCR connector configured".to_string())
    }
}

/// Card channel that renders envelopes into the structured log. Useful on
/// a workstation and as the fallback when no platform channel is set up.
#[derive(Debug, Default)]
pub struct LogChannel;

impl CardChannel for LogChannel {
    fn dispatch(&self, envelope: &Value) -> Result<(), String> {
        tracing::info!(envelope = %envelope, "outbound card");
        Ok(())
    }
}
