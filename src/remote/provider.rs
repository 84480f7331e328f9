//! Reasoning provider capabilities
//!
//! Each provider knows how to wrap the uniform context bundle into its own
//! request envelope and how to dig the verdict back out of its response
//! envelope. The verdict itself has one shape regardless of provider.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::error::RemoteError;
use crate::remote::keys::Secret;
use crate::types::{ArousalBand, Decision, DecisionSource};

/// Instructions sent alongside every context bundle
pub const SYSTEM_PROMPT: &str = "You assist a caregiver supporting a child during a live session. \
You receive a JSON bundle with the child's profile traits, the current observed signals and a short \
summary of recent session history. Classify the child's arousal into exactly one band: shutdown, calm, \
building, high or crisis. Shutdown means low-arousal withdrawal and is distinct from calm. \
Respond with only a JSON object of the form \
{\"band\": string, \"confidence\": number between 0 and 1, \"rationale\": string, \"key_indicators\": [string]}. \
Never recommend restraining the child or stopping self-regulatory behavior such as stimming.";

/// Identity of a remote reasoning provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built outbound request, ready for a transport
#[derive(Clone)]
pub struct ProviderRequest {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl fmt::Debug for ProviderRequest {
    // Header values carry credentials
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ProviderRequest")
            .field("endpoint", &self.endpoint)
            .field("headers", &names)
            .field("body", &self.body)
            .finish()
    }
}

/// Structured verdict returned by every provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteVerdict {
    pub band: ArousalBand,
    pub confidence: f64,
    pub rationale: String,
    pub key_indicators: Vec<String>,
}

impl RemoteVerdict {
    /// Convert into a remote-sourced decision (tick assigned at publication)
    pub fn into_decision(self) -> Decision {
        Decision {
            band: self.band,
            confidence: self.confidence,
            source: DecisionSource::Remote,
            rationale: self.rationale,
            key_indicators: self.key_indicators,
            tick: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Capability interface implemented by each provider
pub trait ReasoningProvider: Send + Sync + fmt::Debug {
    fn id(&self) -> ProviderId;

    fn model(&self) -> &str;

    /// Wrap a context bundle into this provider's request envelope
    fn build_request(&self, bundle: &str, secret: &Secret) -> ProviderRequest;

    /// Extract the verdict from this provider's response envelope
    fn parse_response(&self, body: &str) -> Result<RemoteVerdict, RemoteError>;
}

/// Build the provider named by the configuration
pub fn provider_for(config: &ProviderConfig) -> Arc<dyn ReasoningProvider> {
    match config.id {
        ProviderId::Anthropic => Arc::new(AnthropicProvider::new(config)),
        ProviderId::OpenAi => Arc::new(OpenAiProvider::new(config)),
    }
}

// ============================================================================
// Anthropic messages API
// ============================================================================

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    model: String,
    endpoint: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            model: config.model.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| ANTHROPIC_ENDPOINT.to_string()),
            max_tokens: config.max_tokens,
        }
    }
}

impl ReasoningProvider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, bundle: &str, secret: &Secret) -> ProviderRequest {
        ProviderRequest {
            endpoint: self.endpoint.clone(),
            headers: vec![
                ("x-api-key".to_string(), secret.expose().to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body: json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "system": SYSTEM_PROMPT,
                "messages": [
                    { "role": "user", "content": bundle }
                ]
            }),
        }
    }

    fn parse_response(&self, body: &str) -> Result<RemoteVerdict, RemoteError> {
        let envelope = parse_envelope(body)?;
        check_provider_error(&envelope)?;

        let text = envelope
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RemoteError::MalformedResponse("response has no text content block".to_string())
            })?;

        parse_verdict(text)
    }
}

// ============================================================================
// OpenAI chat completions API
// ============================================================================

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    model: String,
    endpoint: String,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            model: config.model.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_ENDPOINT.to_string()),
            max_tokens: config.max_tokens,
        }
    }
}

impl ReasoningProvider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, bundle: &str, secret: &Secret) -> ProviderRequest {
        ProviderRequest {
            endpoint: self.endpoint.clone(),
            headers: vec![
                (
                    "authorization".to_string(),
                    format!("Bearer {}", secret.expose()),
                ),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body: json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "response_format": { "type": "json_object" },
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": bundle }
                ]
            }),
        }
    }

    fn parse_response(&self, body: &str) -> Result<RemoteVerdict, RemoteError> {
        let envelope = parse_envelope(body)?;
        check_provider_error(&envelope)?;

        let text = envelope
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RemoteError::MalformedResponse("response has no message content".to_string())
            })?;

        parse_verdict(text)
    }
}

// ============================================================================
// Shared parsing
// ============================================================================

fn parse_envelope(body: &str) -> Result<Value, RemoteError> {
    serde_json::from_str(body)
        .map_err(|e| RemoteError::MalformedResponse(format!("response is not JSON: {}", e)))
}

fn check_provider_error(envelope: &Value) -> Result<(), RemoteError> {
    match envelope.get("error") {
        Some(error) if !error.is_null() => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified provider error");
            Err(RemoteError::Unavailable(format!("provider error: {}", message)))
        }
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    band: String,
    confidence: f64,
    #[serde(default)]
    rationale: String,
    #[serde(default, alias = "keyIndicators")]
    key_indicators: Vec<String>,
}

/// Parse verdict text, tolerating a surrounding markdown code fence
pub fn parse_verdict(text: &str) -> Result<RemoteVerdict, RemoteError> {
    let raw: RawVerdict = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| RemoteError::MalformedResponse(format!("verdict does not match schema: {}", e)))?;

    let band = raw
        .band
        .parse::<ArousalBand>()
        .map_err(RemoteError::MalformedResponse)?;

    if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(RemoteError::MalformedResponse(format!(
            "confidence {} outside 0..=1",
            raw.confidence
        )));
    }

    Ok(RemoteVerdict {
        band,
        confidence: raw.confidence,
        rationale: raw.rationale,
        key_indicators: raw.key_indicators,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::new("sk-test")
    }

    #[test]
    fn test_parse_plain_verdict() {
        let verdict = parse_verdict(
            r#"{"band":"high","confidence":0.82,"rationale":"rapid pacing","key_indicators":["pacing","loud room"]}"#,
        )
        .unwrap();

        assert_eq!(verdict.band, ArousalBand::High);
        assert_eq!(verdict.confidence, 0.82);
        assert_eq!(verdict.key_indicators, vec!["pacing", "loud room"]);
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let text = "```json\n{\"band\":\"Shutdown\",\"confidence\":0.7,\"rationale\":\"withdrawn\",\"keyIndicators\":[]}\n```";
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.band, ArousalBand::Shutdown);
    }

    #[test]
    fn test_malformed_verdicts() {
        for text in [
            "not json",
            r#"{"band":"frantic","confidence":0.5}"#,
            r#"{"band":"calm","confidence":1.5}"#,
            r#"{"band":"calm"}"#,
        ] {
            assert!(
                matches!(parse_verdict(text), Err(RemoteError::MalformedResponse(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_anthropic_round_trip_shape() {
        let provider = AnthropicProvider::new(&ProviderConfig::default());
        let request = provider.build_request("{\"bundle\":true}", &secret());

        assert_eq!(request.endpoint, ANTHROPIC_ENDPOINT);
        assert_eq!(request.body["messages"][0]["content"], "{\"bundle\":true}");
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "x-api-key" && v == "sk-test"));

        let body = r#"{"content":[{"type":"text","text":"{\"band\":\"calm\",\"confidence\":0.9,\"rationale\":\"settled\",\"key_indicators\":[]}"}]}"#;
        assert_eq!(provider.parse_response(body).unwrap().band, ArousalBand::Calm);
    }

    #[test]
    fn test_openai_round_trip_shape() {
        let config = ProviderConfig {
            id: ProviderId::OpenAi,
            model: "gpt-4o-mini".to_string(),
            endpoint: Some("http://localhost:8080/v1/chat/completions".to_string()),
            max_tokens: 200,
        };
        let provider = OpenAiProvider::new(&config);
        let request = provider.build_request("{}", &secret());

        assert_eq!(request.endpoint, "http://localhost:8080/v1/chat/completions");
        assert_eq!(request.body["max_tokens"], 200);
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer sk-test"));

        let body = r#"{"choices":[{"message":{"content":"{\"band\":\"building\",\"confidence\":0.4,\"rationale\":\"\",\"key_indicators\":[\"voice\"]}"}}]}"#;
        assert_eq!(
            provider.parse_response(body).unwrap().band,
            ArousalBand::Building
        );
    }

    #[test]
    fn test_provider_error_is_unavailable() {
        let provider = AnthropicProvider::new(&ProviderConfig::default());
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(
            provider.parse_response(body),
            Err(RemoteError::Unavailable(_))
        ));
    }

    #[test]
    fn test_missing_content_is_malformed() {
        let provider = OpenAiProvider::new(&ProviderConfig::default());
        assert!(matches!(
            provider.parse_response(r#"{"choices":[]}"#),
            Err(RemoteError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_request_debug_hides_credentials() {
        let provider = AnthropicProvider::new(&ProviderConfig::default());
        let request = provider.build_request("{}", &secret());
        let debug = format!("{:?}", request);
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("x-api-key"));
    }

    #[test]
    fn test_provider_id_serialization() {
        assert_eq!(serde_json::to_string(&ProviderId::OpenAi).unwrap(), "\"openai\"");
        assert_eq!(
            serde_json::from_str::<ProviderId>("\"anthropic\"").unwrap(),
            ProviderId::Anthropic
        );
    }
}
