//! Egress proxy: the single choke point for outgoing inference requests.
//!
//! Every payload leaving the process passes through here. The proxy applies
//! the privacy guard regardless of upstream sanitization, rejects
//! destinations that are not on the allow list, attaches the trace context
//! as metadata, and observes the token budget.

use std::sync::{Arc, Mutex};

use crate::config::EgressConfig;
use crate::privacy::PrivacyGuard;
use crate::trace::TraceContext;

/// A request to an external inference provider.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Model identifier, also part of the cache key.
    pub model: String,
    /// Prompt text. Sanitized by the proxy before emission.
    pub prompt: String,
    /// Destination host; must be allow-listed.
    pub destination: String,
    /// Originating trace.
    pub trace: TraceContext,
}

/// A response from an external inference provider.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    /// Raw response content.
    pub content: String,
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced by the completion.
    pub output_tokens: u64,
}

/// External inference seam. Concrete connectors live outside the core.
pub trait InferenceProvider: Send + Sync {
    /// Perform one completion.
    ///
    /// # Errors
    ///
    /// Returns an error on transport or provider failure.
    fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, EgressError>;
}

/// Egress errors.
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    /// The destination is not on the allow list.
    #[error("destination {0} is not allow-listed")]
    DestinationDenied(String),

    /// The daily or monthly token budget is spent.
    #[error("token budget exhausted ({scope})")]
    BudgetExhausted {
        /// Which window ran out (`daily` or `monthly`).
        scope: &'static str,
    },

    /// The provider failed or timed out.
    #[error("provider failure: {0}")]
    Provider(String),
}

/// Daily and monthly token accounting.
///
/// Windows are derived from the supplied timestamp, so callers in tests can
/// drive the clock explicitly.
#[derive(Debug)]
pub struct TokenBudget {
    daily_cap: u64,
    monthly_cap: u64,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Default)]
struct BudgetState {
    day_key: i64,
    month_key: i64,
    daily_used: u64,
    monthly_used: u64,
}

/// Days since the epoch.
const fn day_key(now_ms: i64) -> i64 {
    now_ms.div_euclid(86_400_000)
}

/// Months since the epoch, approximated by 30-day windows. The reset
/// cadence, not the calendar alignment, is what the budget protects.
const fn month_key(now_ms: i64) -> i64 {
    now_ms.div_euclid(86_400_000 * 30)
}

impl TokenBudget {
    /// Create a budget with the given caps.
    #[must_use]
    pub fn new(daily_cap: u64, monthly_cap: u64) -> Self {
        Self {
            daily_cap,
            monthly_cap,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Check whether a call may proceed at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`EgressError::BudgetExhausted`] when either window is spent.
    pub fn check(&self, now_ms: i64) -> Result<(), EgressError> {
        let mut state = self.state.lock().expect("budget lock");
        Self::roll(&mut state, now_ms);
        if state.daily_used >= self.daily_cap {
            return Err(EgressError::BudgetExhausted { scope: "daily" });
        }
        if state.monthly_used >= self.monthly_cap {
            return Err(EgressError::BudgetExhausted { scope: "monthly" });
        }
        Ok(())
    }

    /// Record consumed tokens at `now_ms`.
    pub fn record(&self, now_ms: i64, tokens: u64) {
        let mut state = self.state.lock().expect("budget lock");
        Self::roll(&mut state, now_ms);
        state.daily_used = state.daily_used.saturating_add(tokens);
        state.monthly_used = state.monthly_used.saturating_add(tokens);
    }

    /// Tokens used in the current daily window.
    #[must_use]
    pub fn daily_used(&self, now_ms: i64) -> u64 {
        let mut state = self.state.lock().expect("budget lock");
        Self::roll(&mut state, now_ms);
        state.daily_used
    }

    fn roll(state: &mut BudgetState, now_ms: i64) {
        let day = day_key(now_ms);
        let month = month_key(now_ms);
        if day != state.day_key {
            state.day_key = day;
            state.daily_used = 0;
        }
        if month != state.month_key {
            state.month_key = month;
            state.monthly_used = 0;
        }
    }
}

/// Sanitizing gate in front of the inference provider.
pub struct EgressProxy {
    guard: PrivacyGuard,
    provider: Arc<dyn InferenceProvider>,
    budget: Arc<TokenBudget>,
    allowlist: Vec<String>,
}

impl std::fmt::Debug for EgressProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressProxy")
            .field("allowlist", &self.allowlist)
            .finish_non_exhaustive()
    }
}

impl EgressProxy {
    /// Create a proxy.
    #[must_use]
    pub fn new(
        config: &EgressConfig,
        guard: PrivacyGuard,
        provider: Arc<dyn InferenceProvider>,
        budget: Arc<TokenBudget>,
    ) -> Self {
        Self {
            guard,
            provider,
            budget,
            allowlist: config.allowlist.clone(),
        }
    }

    /// The shared token budget, for circuit decisions upstream.
    #[must_use]
    pub fn budget(&self) -> &Arc<TokenBudget> {
        &self.budget
    }

    /// Sanitize and forward a completion request.
    ///
    /// # Errors
    ///
    /// Returns an error when the destination is denied, a budget window is
    /// spent, or the provider fails.
    pub fn complete(
        &self,
        request: &InferenceRequest,
        now_ms: i64,
    ) -> Result<InferenceResponse, EgressError> {
        if !self.allowlist.iter().any(|d| d == &request.destination) {
            return Err(EgressError::DestinationDenied(request.destination.clone()));
        }
        self.budget.check(now_ms)?;

        let sanitized = self.guard.sanitize(&request.prompt);
        if !sanitized.is_clean() {
            for (category, count) in &sanitized.counts {
                tracing::info!(
                    category = category.as_str(),
                    count,
                    trace_id = %request.trace.trace_id,
                    worker = %request.trace.worker,
                    "egress payload redacted"
                );
            }
        }

        let outbound = InferenceRequest {
            model: request.model.clone(),
            prompt: sanitized.text,
            destination: request.destination.clone(),
            trace: request.trace.clone(),
        };

        let response = self.provider.complete(&outbound)?;
        self.budget
            .record(now_ms, response.input_tokens + response.output_tokens);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::config::PrivacyConfig;

    /// Provider that records every prompt it was handed.
    struct CapturingProvider {
        prompts: StdMutex<Vec<String>>,
        tokens: u64,
    }

    impl InferenceProvider for CapturingProvider {
        fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse, EgressError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(InferenceResponse {
                content: "{}".to_string(),
                input_tokens: self.tokens,
                output_tokens: 0,
            })
        }
    }

    fn proxy_with(provider: Arc<CapturingProvider>, daily_cap: u64) -> EgressProxy {
        let config = EgressConfig {
            allowlist: vec!["inference.internal".to_string()],
            ..EgressConfig::default()
        };
        EgressProxy::new(
            &config,
            PrivacyGuard::new(&PrivacyConfig::default()),
            provider,
            Arc::new(TokenBudget::new(daily_cap, daily_cap * 30)),
        )
    }

    fn request(prompt: &str, destination: &str) -> InferenceRequest {
        InferenceRequest {
            model: "test-model".to_string(),
            prompt: prompt.to_string(),
            destination: destination.to_string(),
            trace: TraceContext::new("accountant"),
        }
    }

    #[test]
    fn test_denies_unlisted_destination() {
        let provider = Arc::new(CapturingProvider {
            prompts: StdMutex::new(Vec::new()),
            tokens: 1,
        });
        let proxy = proxy_with(Arc::clone(&provider), 1_000);

        let err = proxy
            .complete(&request("hello", "evil.example.com"), 0)
            .unwrap_err();
        assert!(matches!(err, EgressError::DestinationDenied(_)));
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sanitizes_regardless_of_caller() {
        let provider = Arc::new(CapturingProvider {
            prompts: StdMutex::new(Vec::new()),
            tokens: 1,
        });
        let proxy = proxy_with(Arc::clone(&provider), 1_000);

        let corpus = [
            "报销人电话13812345678",
            "卡号6222020200112233 金额500",
            "身份证11010119900101123X",
            "本月薪资表",
        ];
        for payload in corpus {
            proxy
                .complete(&request(payload, "inference.internal"), 0)
                .unwrap();
        }

        let guard = PrivacyGuard::new(&PrivacyConfig::default());
        for emitted in provider.prompts.lock().unwrap().iter() {
            assert!(guard.sanitize(emitted).is_clean(), "leaked: {emitted}");
        }
    }

    #[test]
    fn test_budget_short_circuits() {
        let provider = Arc::new(CapturingProvider {
            prompts: StdMutex::new(Vec::new()),
            tokens: 10,
        });
        let proxy = proxy_with(Arc::clone(&provider), 10);

        proxy.complete(&request("one", "inference.internal"), 0).unwrap();
        let err = proxy
            .complete(&request("two", "inference.internal"), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            EgressError::BudgetExhausted { scope: "daily" }
        ));
        assert_eq!(provider.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_budget_resets_next_day() {
        let budget = TokenBudget::new(10, 1_000);
        budget.record(0, 10);
        assert!(budget.check(0).is_err());
        assert!(budget.check(86_400_000).is_ok());
        assert_eq!(budget.daily_used(86_400_000), 0);
    }
}
