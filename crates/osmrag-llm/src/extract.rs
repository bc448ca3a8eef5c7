//! Structured response extraction.
//!
//! Oracle output is untrusted text. Recovery tries, in order:
//!
//! 1. the whole trimmed response as JSON;
//! 2. the interior of a ```` ```json ```` fenced block;
//! 3. the span from the first `{` to the last `}`.
//!
//! Transport failures and unrecoverable text are reported in the returned
//! [`ParseOutcome`], never as errors.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use osmrag_evidence::RetrievedEvidence;

use crate::oracle::{Oracle, OracleError, OracleRequest, DEFAULT_TEMPERATURE};
use crate::prompt::{render_user_prompt, SYSTEM_PROMPT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier {
    WholeResponse,
    FencedBlock,
    BraceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "tier", rename_all = "snake_case")]
pub enum ParseStatus {
    Parsed(RecoveryTier),
    OracleUnreachable,
    OracleTimeout,
    /// HTTP error, malformed envelope or client failure.
    OracleFailed,
    OracleDisabled,
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseOutcome {
    pub status: ParseStatus,
    /// Recovered JSON; `None` unless `status` is `Parsed`.
    pub data: Option<Value>,
    /// Oracle text, or a diagnostic when the oracle call failed.
    pub raw: String,
}

impl ParseOutcome {
    pub fn ok(&self) -> bool {
        matches!(self.status, ParseStatus::Parsed(_))
    }

    pub fn failed(status: ParseStatus, raw: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            raw: raw.into(),
        }
    }

    pub fn from_oracle_error(err: &OracleError) -> Self {
        let status = match err {
            OracleError::Unreachable { .. } => ParseStatus::OracleUnreachable,
            OracleError::Timeout { .. } => ParseStatus::OracleTimeout,
            OracleError::Disabled => ParseStatus::OracleDisabled,
            OracleError::Http { .. } | OracleError::InvalidResponse(_) | OracleError::Client(_) => {
                ParseStatus::OracleFailed
            }
        };
        Self::failed(status, format!("Error: {err}"))
    }
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"))
}

/// Apply the three recovery tiers to `text`, stopping at the first success.
pub fn recover_json(text: &str) -> Option<(Value, RecoveryTier)> {
    if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
        return Some((v, RecoveryTier::WholeResponse));
    }

    if let Some(inner) = fenced_json_re().captures(text).and_then(|c| c.get(1)) {
        if let Ok(v) = serde_json::from_str::<Value>(inner.as_str()) {
            return Some((v, RecoveryTier::FencedBlock));
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
            return Some((v, RecoveryTier::BraceSpan));
        }
    }
    None
}

pub fn outcome_from_text(raw: String) -> ParseOutcome {
    match recover_json(&raw) {
        Some((data, tier)) => ParseOutcome {
            status: ParseStatus::Parsed(tier),
            data: Some(data),
            raw,
        },
        None => ParseOutcome::failed(ParseStatus::Unparseable, raw),
    }
}

/// Prompts the oracle with a query plus its evidence and recovers JSON from the reply.
#[derive(Clone)]
pub struct StructuredResponseExtractor {
    oracle: Arc<dyn Oracle>,
    temperature: f32,
}

impl std::fmt::Debug for StructuredResponseExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredResponseExtractor")
            .field("oracle", &self.oracle.name())
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl StructuredResponseExtractor {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    pub fn request(&self, query: &str, evidence: &[RetrievedEvidence], model: &str) -> OracleRequest {
        OracleRequest {
            model: model.to_string(),
            system: SYSTEM_PROMPT.to_string(),
            user: render_user_prompt(query, evidence),
            temperature: self.temperature,
        }
    }

    pub fn parse(&self, query: &str, evidence: &[RetrievedEvidence], model: &str) -> ParseOutcome {
        let request = self.request(query, evidence, model);
        let outcome = match self.oracle.complete(&request) {
            Ok(text) => outcome_from_text(text),
            Err(e) => {
                tracing::warn!(oracle = self.oracle.name(), model, error = %e, "oracle call failed");
                return ParseOutcome::from_oracle_error(&e);
            }
        };
        match outcome.status {
            ParseStatus::Parsed(tier) => {
                tracing::debug!(?tier, "recovered JSON from oracle response");
            }
            _ => {
                tracing::warn!(
                    oracle = self.oracle.name(),
                    raw_len = outcome.raw.len(),
                    "oracle response contained no recoverable JSON"
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn whole_response_tier() {
        let (v, tier) = recover_json("  {\"a\":1}\n").unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert_eq!(tier, RecoveryTier::WholeResponse);
    }

    #[test]
    fn fenced_block_tier() {
        let (v, tier) = recover_json("```json\n{\"a\":1}\n```").unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert_eq!(tier, RecoveryTier::FencedBlock);

        let (_, tier) = recover_json("Here you go:\n```json {\"a\": [1, 2]} ``` hope it helps").unwrap();
        assert_eq!(tier, RecoveryTier::FencedBlock);
    }

    #[test]
    fn brace_span_tier() {
        let (v, tier) = recover_json("blah {\"a\":1} blah").unwrap();
        assert_eq!(v, json!({"a": 1}));
        assert_eq!(tier, RecoveryTier::BraceSpan);

        // Unlabelled fence falls through to the brace span.
        let (_, tier) = recover_json("```\n{\"a\":1}\n```").unwrap();
        assert_eq!(tier, RecoveryTier::BraceSpan);
    }

    #[test]
    fn no_tier_succeeds() {
        assert!(recover_json("no json here").is_none());
        assert!(recover_json("} backwards {").is_none());
        assert!(recover_json("{\"a\": 1} and {\"b\": 2}").is_none());
        assert!(recover_json("").is_none());
    }

    #[test]
    fn broken_fence_falls_back_to_brace_span() {
        let text = "```json\n{not json}\n```\nactual: {\"a\": 2}";
        // Brace span runs from the first `{` to the last `}` and is not valid JSON either.
        assert!(recover_json(text).is_none());

        let text = "```json\nnope\n```\n{\"a\": 2}";
        let (v, tier) = recover_json(text).unwrap();
        assert_eq!(v, json!({"a": 2}));
        assert_eq!(tier, RecoveryTier::BraceSpan);
    }

    struct ScriptedOracle {
        reply: Result<String, fn() -> OracleError>,
        seen: Mutex<Vec<OracleRequest>>,
    }

    impl Oracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(f) => Err(f()),
            }
        }
    }

    fn extractor(reply: Result<String, fn() -> OracleError>) -> (StructuredResponseExtractor, Arc<ScriptedOracle>) {
        let oracle = Arc::new(ScriptedOracle {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        (StructuredResponseExtractor::new(oracle.clone()), oracle)
    }

    #[test]
    fn parse_sends_system_prompt_and_model() {
        let (ex, oracle) = extractor(Ok("{\"tag\":{\"key\":\"amenity\",\"value\":\"cafe\"}}".to_string()));
        let out = ex.parse("cafes", &[], "mistral");
        assert!(out.ok());
        assert_eq!(out.status, ParseStatus::Parsed(RecoveryTier::WholeResponse));

        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "mistral");
        assert_eq!(seen[0].system, SYSTEM_PROMPT);
        assert!((seen[0].temperature - 0.1).abs() < 1e-6);
    }

    #[test]
    fn transport_failures_are_captured() {
        let (ex, _) = extractor(Err(|| OracleError::Unreachable {
            url: "http://127.0.0.1:11434/api/chat".to_string(),
            message: "connection refused".to_string(),
        }));
        let out = ex.parse("cafes", &[], "mistral");
        assert!(!out.ok());
        assert_eq!(out.status, ParseStatus::OracleUnreachable);
        assert!(out.data.is_none());
        assert!(out.raw.starts_with("Error: cannot reach oracle"));

        let (ex, _) = extractor(Err(|| OracleError::Timeout {
            after: std::time::Duration::from_secs(120),
        }));
        assert_eq!(ex.parse("q", &[], "m").status, ParseStatus::OracleTimeout);

        let (ex, _) = extractor(Err(|| OracleError::Http {
            status: 404,
            body: "model not found".to_string(),
        }));
        assert_eq!(ex.parse("q", &[], "m").status, ParseStatus::OracleFailed);
    }

    #[test]
    fn unparseable_reply_keeps_raw_text() {
        let (ex, _) = extractor(Ok("I think you want cafes.".to_string()));
        let out = ex.parse("cafes", &[], "mistral");
        assert_eq!(out.status, ParseStatus::Unparseable);
        assert_eq!(out.raw, "I think you want cafes.");
        assert!(out.data.is_none());
    }
}
