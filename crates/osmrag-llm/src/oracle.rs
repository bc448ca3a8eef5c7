//! The oracle: an external text-completion service treated as untrusted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MODEL: &str = "mistral";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("cannot reach oracle at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("oracle request timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("oracle http error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("oracle returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("oracle client error: {0}")]
    Client(String),

    #[error("oracle is disabled")]
    Disabled,
}

/// One synchronous, non-streaming completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// A text-completion backend. Implementations block until the response
/// arrives or their timeout elapses; they never retry.
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

/// Oracle that always fails with [`OracleError::Disabled`]. Forces every
/// query through the fallback chains.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledOracle;

impl Oracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
        Err(OracleError::Disabled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OracleBackend {
    #[default]
    Ollama,
    OpenAi,
    Disabled,
}

impl fmt::Display for OracleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OracleBackend::Ollama => "ollama",
            OracleBackend::OpenAi => "openai",
            OracleBackend::Disabled => "disabled",
        })
    }
}

impl FromStr for OracleBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(OracleBackend::Ollama),
            "openai" => Ok(OracleBackend::OpenAi),
            "disabled" | "none" | "off" => Ok(OracleBackend::Disabled),
            other => Err(format!(
                "unknown oracle backend `{other}` (expected ollama|openai|disabled)"
            )),
        }
    }
}

#[cfg(any(feature = "llm-ollama", feature = "llm-openai"))]
pub(crate) fn http_client(
    base_url: &str,
    timeout: Option<Duration>,
) -> Result<reqwest::blocking::Client, OracleError> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    // Loopback servers are never reached through an environment proxy.
    if is_loopback_url(base_url) {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|e| OracleError::Client(format!("failed to build http client: {e}")))
}

#[cfg(any(feature = "llm-ollama", feature = "llm-openai"))]
pub(crate) fn is_loopback_url(url: &str) -> bool {
    let rest = url
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    rest.starts_with("127.") || rest.starts_with("localhost") || rest.starts_with("[::1]")
}

#[cfg(any(feature = "llm-ollama", feature = "llm-openai"))]
pub(crate) fn classify_transport_error(
    e: reqwest::Error,
    url: &str,
    timeout: Option<Duration>,
) -> OracleError {
    if e.is_timeout() {
        OracleError::Timeout {
            after: timeout.unwrap_or_default(),
        }
    } else if e.is_connect() {
        OracleError::Unreachable {
            url: url.to_string(),
            message: e.to_string(),
        }
    } else {
        OracleError::Client(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_oracle_always_fails() {
        let req = OracleRequest {
            model: DEFAULT_MODEL.to_string(),
            system: String::new(),
            user: "cafes".to_string(),
            temperature: DEFAULT_TEMPERATURE,
        };
        assert!(matches!(DisabledOracle.complete(&req), Err(OracleError::Disabled)));
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("Ollama".parse::<OracleBackend>().unwrap(), OracleBackend::Ollama);
        assert_eq!("off".parse::<OracleBackend>().unwrap(), OracleBackend::Disabled);
        assert!("claude".parse::<OracleBackend>().is_err());
        assert_eq!(OracleBackend::OpenAi.to_string(), "openai");
    }

    #[cfg(any(feature = "llm-ollama", feature = "llm-openai"))]
    #[test]
    fn loopback_urls_are_detected() {
        assert!(is_loopback_url("http://127.0.0.1:11434"));
        assert!(is_loopback_url("http://localhost:11434"));
        assert!(is_loopback_url("http://[::1]:11434"));
        assert!(!is_loopback_url("https://api.openai.com"));
    }

    #[test]
    fn timeout_error_reports_seconds() {
        let e = OracleError::Timeout {
            after: Duration::from_secs(120),
        };
        assert_eq!(e.to_string(), "oracle request timed out after 120s");
    }
}
