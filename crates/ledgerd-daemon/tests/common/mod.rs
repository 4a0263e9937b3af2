//! Shared test bed: a temp store, scripted connectors, and the assembled
//! service graph.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ledgerd_core::classify::ToolConnector;
use ledgerd_core::collect::{OcrEngine, OcrResult};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::egress::{EgressError, InferenceProvider, InferenceRequest, InferenceResponse};
use ledgerd_core::outbox::CardChannel;
use ledgerd_daemon::services::{Connectors, build};
use ledgerd_daemon::workers::Services;
use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;

/// Inference provider replaying a scripted list of responses.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Vec<String>>,
    pub calls: Mutex<u32>,
}

impl ScriptedProvider {
    pub fn push(&self, response: &str) {
        self.script.lock().unwrap().push(response.to_string());
    }
}

impl InferenceProvider for ScriptedProvider {
    fn complete(&self, _request: &InferenceRequest) -> Result<InferenceResponse, EgressError> {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(EgressError::Provider("script exhausted".to_string()));
        }
        Ok(InferenceResponse {
            content: script.remove(0),
            input_tokens: 10,
            output_tokens: 10,
        })
    }
}

/// Tools answering with canned summaries.
pub struct CannedTools;

impl ToolConnector for CannedTools {
    fn web_lookup(&self, query: &str) -> Result<String, EgressError> {
        Ok(format!("search results for {query}"))
    }
    fn browser_fetch(&self, url: &str) -> Result<String, EgressError> {
        Ok(format!("page content of {url}"))
    }
    fn ask_user(&self, question: &str) -> Result<String, EgressError> {
        Ok(format!("user replied to {question}"))
    }
}

/// OCR fixture keyed by file stem.
#[derive(Default)]
pub struct FixtureOcr {
    fixtures: Mutex<HashMap<String, OcrResult>>,
}

impl FixtureOcr {
    pub fn set(&self, stem: &str, vendor: &str, amount: Decimal, occurred_at: i64) {
        self.fixtures.lock().unwrap().insert(
            stem.to_string(),
            OcrResult {
                text: format!("invoice issued by {vendor}"),
                vendor: vendor.to_string(),
                amount: Some(amount),
                occurred_at: Some(occurred_at),
            },
        );
    }
}

impl OcrEngine for FixtureOcr {
    fn extract(&self, path: &Path) -> Result<OcrResult, String> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        self.fixtures
            .lock()
            .unwrap()
            .get(stem)
            .cloned()
            .ok_or_else(|| format!("no OCR fixture for {stem}"))
    }
}

/// Channel recording delivered envelopes.
#[derive(Default)]
pub struct RecordingChannel {
    pub delivered: Mutex<Vec<Value>>,
}

impl CardChannel for RecordingChannel {
    fn dispatch(&self, envelope: &Value) -> Result<(), String> {
        self.delivered.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// An assembled daemon environment on a temp directory.
pub struct TestBed {
    pub dir: TempDir,
    pub config: Arc<LedgerConfig>,
    pub services: Arc<Services>,
    pub provider: Arc<ScriptedProvider>,
    pub ocr: Arc<FixtureOcr>,
    pub channel: Arc<RecordingChannel>,
}

impl TestBed {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = LedgerConfig::default();
        config.paths.input_dir = dir.path().join("inbox");
        config.paths.store_file = dir.path().join("ledger.db");
        config.paths.snapshot_dir = dir.path().join("snapshots");
        config.paths.rules_file = dir.path().join("rules.json");
        config.interaction.callback_secret = "test-deployment-secret".to_string();
        config.egress.allowlist = vec!["inference.internal".to_string()];
        config.daemon.boot_timeout_s = 10;

        let provider = Arc::new(ScriptedProvider::default());
        let ocr = Arc::new(FixtureOcr::default());
        let channel = Arc::new(RecordingChannel::default());
        let connectors = Connectors {
            provider: Arc::clone(&provider) as Arc<dyn InferenceProvider>,
            tools: Arc::new(CannedTools),
            ocr: Arc::clone(&ocr) as Arc<dyn OcrEngine>,
            channel: Arc::clone(&channel) as Arc<dyn CardChannel>,
        };
        let services = build(&config, connectors).unwrap();

        Self {
            dir,
            config: Arc::new(config),
            services,
            provider,
            ocr,
            channel,
        }
    }

    /// Drop a file into the watched inbox.
    pub fn drop_file(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let inbox = self.config.paths.input_dir.clone();
        std::fs::create_dir_all(&inbox).unwrap();
        let path = inbox.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// A minimal JPEG-magic body made unique by the seed.
    pub fn jpeg_bytes(seed: &str) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend_from_slice(seed.as_bytes());
        bytes
    }
}
