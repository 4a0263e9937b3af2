//! L2 external reasoning tier.
//!
//! A multi-step reason-act loop against the inference provider, modeled as
//! an explicit step machine with a hard step cap rather than open-ended
//! recursion. Each round the provider either requests a tool (web lookup,
//! browser fetch, ask user) or returns a decision; tool results feed the
//! next round as observations. Every prompt goes out through the egress
//! proxy. The wall-clock budget is enforced by the calling worker; the token
//! budget by the proxy.

use serde::Deserialize;

use crate::egress::{EgressError, EgressProxy, InferenceRequest};
use crate::model::{InferenceStep, now_ms};
use crate::trace::TraceContext;

/// External tool seam for the reason-act loop. Concrete connectors (search,
/// browser automation, chat prompts) live outside the core.
pub trait ToolConnector: Send + Sync {
    /// Web search for a query; returns a text summary.
    ///
    /// # Errors
    ///
    /// Returns an error on connector failure.
    fn web_lookup(&self, query: &str) -> Result<String, EgressError>;

    /// Fetch a page through the browser connector; returns extracted text.
    ///
    /// # Errors
    ///
    /// Returns an error on connector failure.
    fn browser_fetch(&self, url: &str) -> Result<String, EgressError>;

    /// Ask the user a question through the review channel.
    ///
    /// # Errors
    ///
    /// Returns an error on connector failure.
    fn ask_user(&self, question: &str) -> Result<String, EgressError>;
}

/// Final decision of an L2 session.
#[derive(Debug, Clone)]
pub struct L2Decision {
    /// Proposed account code.
    pub category: String,
    /// Decision confidence in `[0, 1]`.
    pub confidence: f64,
    /// The persisted reasoning graph.
    pub steps: Vec<InferenceStep>,
}

/// L2 session errors.
#[derive(Debug, thiserror::Error)]
pub enum L2Error {
    /// The loop hit the step cap without a decision.
    #[error("no decision within {0} steps")]
    StepCapExceeded(u32),

    /// The provider response was not a recognised action.
    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// Egress or connector failure.
    #[error(transparent)]
    Egress(#[from] EgressError),
}

/// One provider action, parsed from the response content.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ProviderAction {
    WebLookup {
        query: String,
    },
    BrowserFetch {
        url: String,
    },
    AskUser {
        question: String,
    },
    Decide {
        category: String,
        confidence: f64,
        #[serde(default)]
        reason: String,
    },
}

/// Render the prompt for one round: the document plus observations so far.
#[must_use]
pub fn render_prompt(doc_text: &str, amount: &str, observations: &[String]) -> String {
    let mut prompt = format!(
        "Classify this business document into an account code.\n\
         Document: {doc_text}\nAmount: {amount}\n"
    );
    for (index, observation) in observations.iter().enumerate() {
        prompt.push_str(&format!("Observation {}: {observation}\n", index + 1));
    }
    prompt.push_str(
        "Respond with JSON: {\"action\": \"web_lookup\"|\"browser_fetch\"|\"ask_user\"|\"decide\", ...}",
    );
    prompt
}

/// Run one reason-act session.
///
/// # Errors
///
/// Returns [`L2Error::StepCapExceeded`] when the cap is reached, or the
/// first egress/parse failure.
#[allow(clippy::too_many_arguments)]
pub fn run_session(
    proxy: &EgressProxy,
    tools: &dyn ToolConnector,
    model: &str,
    destination: &str,
    trace: &TraceContext,
    doc_text: &str,
    amount: &str,
    step_cap: u32,
) -> Result<L2Decision, L2Error> {
    let mut observations: Vec<String> = Vec::new();
    let mut steps: Vec<InferenceStep> = vec![InferenceStep {
        step: 1,
        action: "input_analysis".to_string(),
        result: format!("document length {}", doc_text.len()),
    }];

    for round in 1..=step_cap {
        let prompt = render_prompt(doc_text, amount, &observations);
        let response = proxy.complete(
            &InferenceRequest {
                model: model.to_string(),
                prompt,
                destination: destination.to_string(),
                trace: trace.clone(),
            },
            now_ms(),
        )?;

        let action: ProviderAction = serde_json::from_str(&response.content)
            .map_err(|e| L2Error::Malformed(format!("{e}: {}", response.content)))?;

        let step_number = u32::try_from(steps.len()).unwrap_or(u32::MAX) + 1;
        match action {
            ProviderAction::Decide {
                category,
                confidence,
                reason,
            } => {
                steps.push(InferenceStep {
                    step: step_number,
                    action: "decide".to_string(),
                    result: reason,
                });
                return Ok(L2Decision {
                    category,
                    confidence: confidence.clamp(0.0, 1.0),
                    steps,
                });
            }
            ProviderAction::WebLookup { query } => {
                let observation = tools.web_lookup(&query)?;
                steps.push(InferenceStep {
                    step: step_number,
                    action: format!("web_lookup round {round}"),
                    result: truncate(&observation),
                });
                observations.push(observation);
            }
            ProviderAction::BrowserFetch { url } => {
                let observation = tools.browser_fetch(&url)?;
                steps.push(InferenceStep {
                    step: step_number,
                    action: format!("browser_fetch round {round}"),
                    result: truncate(&observation),
                });
                observations.push(observation);
            }
            ProviderAction::AskUser { question } => {
                let observation = tools.ask_user(&question)?;
                steps.push(InferenceStep {
                    step: step_number,
                    action: format!("ask_user round {round}"),
                    result: truncate(&observation),
                });
                observations.push(observation);
            }
        }
    }

    Err(L2Error::StepCapExceeded(step_cap))
}

/// Observations are persisted in the inference log; keep them bounded.
fn truncate(text: &str) -> String {
    const MAX: usize = 240;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}…")
    }
}
