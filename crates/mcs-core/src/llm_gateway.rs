//! C2: LLM Gateway -- stateless call layer producing schema-validated
//! structured output from prompt+schema pairs, per spec §4.2.
//!
//! The gateway itself carries no business logic: callers (the [`crate::planner`]
//! and [`crate::auditor`]) supply a schema description (for the prompt) and a
//! [`Validator`] function pointer that checks the parsed JSON's shape. On
//! validation failure the gateway re-prompts with the validation error
//! appended, up to `max_attempts`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::GatewayError;

/// A pure function that checks whether a parsed JSON value satisfies a
/// schema. Kept as a plain function pointer (not a closure) so it stays
/// `Send + Sync` without extra bounds and the trait remains object-safe.
pub type Validator = fn(&Value) -> Result<(), String>;

/// Stateless call layer over an LLM provider.
///
/// Implementors provide [`raw_complete`](LlmGateway::raw_complete) (one
/// network round-trip); the default [`complete`](LlmGateway::complete)
/// method implements the retry-with-validation-error-reprompt loop so every
/// backend gets identical retry semantics.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Human-readable name for logging (e.g. the configured model).
    fn name(&self) -> &str;

    /// Perform one network round-trip and return the raw response text.
    async fn raw_complete(&self, prompt: &str) -> Result<String, GatewayError>;

    /// Request a schema-validated value. On each attempt, validates the raw
    /// output; on validation failure, re-prompts with the validation error
    /// appended. Returns [`GatewayError::SchemaFailure`] after exhausting
    /// `max_attempts`.
    async fn complete(
        &self,
        prompt: &str,
        schema_hint: &str,
        validator: Validator,
        max_attempts: u32,
    ) -> Result<Value, GatewayError> {
        let attempts = max_attempts.max(1);
        let mut current_prompt = format!(
            "{prompt}\n\nRespond with JSON matching this schema:\n{schema_hint}"
        );
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let raw = self.raw_complete(&current_prompt).await?;
            match parse_and_validate(&raw, validator) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, gateway = self.name(), error = %e, "llm output failed validation");
                    last_error = e;
                    current_prompt = format!(
                        "{prompt}\n\nRespond with JSON matching this schema:\n{schema_hint}\n\n\
                         Your previous response was invalid: {last_error}\n\
                         Previous response was:\n{raw}"
                    );
                }
            }
        }

        Err(GatewayError::SchemaFailure {
            attempts,
            last_error,
        })
    }
}

fn parse_and_validate(raw: &str, validator: Validator) -> Result<Value, String> {
    let value: Value = serde_json::from_str(extract_json(raw)).map_err(|e| format!("invalid JSON: {e}"))?;
    validator(&value)?;
    Ok(value)
}

/// Strip a markdown code fence some models wrap JSON output in.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

// Compile-time assertion: LlmGateway must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn LlmGateway) {}
};

// ---------------------------------------------------------------------------
// Concrete adapter: a generic chat-completions endpoint (OpenAI-compatible
// request/response shape).
// ---------------------------------------------------------------------------

/// Configuration for the HTTP-backed gateway.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Calls a chat-completions endpoint over HTTP. Each [`raw_complete`] call is
/// a single-message, stateless request -- no conversation state is
/// maintained between planner/auditor calls.
pub struct HttpLlmGateway {
    config: HttpGatewayConfig,
    http: reqwest::Client,
}

impl HttpLlmGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn raw_complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.api_base))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!(
                "gateway returned {status}: {text}"
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::Transport("response missing choices[0].message.content".into()))
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// A gateway backed by a fixed, ordered queue of canned raw responses. Used
/// by planner/scheduler/auditor tests.
pub struct MockLlmGateway {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, GatewayError>>>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl MockLlmGateway {
    pub fn new(responses: Vec<Result<String, GatewayError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Convenience constructor for a gateway that always returns the same
    /// raw text, regardless of retry.
    pub fn always(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            responses: std::sync::Mutex::new(std::iter::repeat_with(move || Ok(raw.clone())).take(16).collect()),
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for MockLlmGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn raw_complete(&self, _prompt: &str) -> Result<String, GatewayError> {
        self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut queue = self.responses.lock().expect("mock gateway mutex poisoned");
        queue
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Transport("no more mock responses".into())))
    }
}
