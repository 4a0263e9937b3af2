//! Service graph assembly.
//!
//! One place builds the shared service set from configuration plus the
//! pluggable connector seams, for both the binary and the integration
//! tests.

use std::sync::Arc;

use anyhow::Context;
use ledgerd_core::audit::AuditorAgent;
use ledgerd_core::classify::{AccountingAgent, ToolConnector};
use ledgerd_core::collect::{OcrEngine, ParserRegistry};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::egress::{EgressProxy, InferenceProvider, TokenBudget};
use ledgerd_core::interact::InteractionHub;
use ledgerd_core::knowledge::KnowledgeBridge;
use ledgerd_core::matching::MatchEngine;
use ledgerd_core::outbox::{CardChannel, OutboxDispatcher};
use ledgerd_core::privacy::PrivacyGuard;
use ledgerd_core::store::Store;

use crate::workers::Services;

/// Pluggable external collaborators.
pub struct Connectors {
    /// External inference provider for the L2 tier.
    pub provider: Arc<dyn InferenceProvider>,
    /// Reason-act tools.
    pub tools: Arc<dyn ToolConnector>,
    /// OCR pipeline for invoice images.
    pub ocr: Arc<dyn OcrEngine>,
    /// Delivery channel for outbound cards.
    pub channel: Arc<dyn CardChannel>,
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            provider: Arc::new(crate::connectors::UnconfiguredProvider),
            tools: Arc::new(crate::connectors::UnconfiguredTools),
            ocr: Arc::new(crate::connectors::UnconfiguredOcr),
            channel: Arc::new(crate::connectors::LogChannel),
        }
    }
}

/// Open the store and assemble the service graph.
///
/// # Errors
///
/// Returns an error if the store cannot be opened.
pub fn build(config: &LedgerConfig, connectors: Connectors) -> anyhow::Result<Arc<Services>> {
    let store = Store::open(&config.paths.store_file, &config.store)
        .with_context(|| format!("open store at {}", config.paths.store_file.display()))?;

    let bridge = KnowledgeBridge::new(store.clone(), config.paths.rules_file.clone());

    let budget = Arc::new(TokenBudget::new(
        config.accounting.token_budget_daily,
        config.accounting.token_budget_monthly,
    ));
    let proxy = Arc::new(EgressProxy::new(
        &config.egress,
        PrivacyGuard::new(&config.privacy),
        connectors.provider,
        budget,
    ));
    let agent = Arc::new(AccountingAgent::new(
        config.accounting.clone(),
        Some((proxy, connectors.tools)),
    ));

    let hub = Arc::new(InteractionHub::new(
        store.clone(),
        bridge.clone(),
        PrivacyGuard::new(&config.privacy),
        &config.interaction,
    ));

    Ok(Arc::new(Services {
        auditor: Arc::new(AuditorAgent::new(config.audit.clone())),
        engine: Arc::new(MatchEngine::new(store.clone(), config.matching.clone())),
        dispatcher: Arc::new(OutboxDispatcher::new(
            store.clone(),
            connectors.channel,
            &config.egress,
        )),
        registry: Arc::new(ParserRegistry::with_builtin()),
        ocr: connectors.ocr,
        store,
        bridge,
        hub,
        agent,
    }))
}
