//! OpenAI-compatible `/v1/chat/completions` endpoint.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::oracle::{classify_transport_error, http_client, Oracle, OracleError, OracleRequest};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

pub fn normalize_http_base_url(base_url: &str, default: &str) -> String {
    let mut host = base_url.trim().to_string();
    if host.is_empty() {
        host = default.to_string();
    }
    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("https://{host}");
    }
    host.trim_end_matches('/').to_string()
}

#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    base_url: String,
    api_key: String,
    timeout: Option<Duration>,
    client: reqwest::blocking::Client,
}

impl OpenAiOracle {
    pub fn new(base_url: &str, api_key: &str, timeout: Option<Duration>) -> Result<Self, OracleError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(OracleError::Client(format!(
                "OpenAI backend requires {OPENAI_API_KEY_ENV}"
            )));
        }
        let base_url = normalize_http_base_url(base_url, DEFAULT_OPENAI_BASE_URL);
        let client = http_client(&base_url, timeout)?;
        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

pub(crate) fn chat_completions_body(req: &OracleRequest) -> serde_json::Value {
    json!({
        "model": req.model,
        "stream": false,
        "temperature": req.temperature,
        "messages": [
            { "role": "system", "content": req.system },
            { "role": "user", "content": req.user }
        ]
    })
}

pub(crate) fn parse_chat_completions(text: &str) -> Result<String, OracleError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Deserialize)]
    struct Message {
        #[serde(default)]
        content: Option<String>,
    }

    let out: Response = serde_json::from_str(text)
        .map_err(|e| OracleError::InvalidResponse(format!("openai returned invalid JSON: {e}")))?;
    out.choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| OracleError::InvalidResponse("openai response has no choices".to_string()))
}

impl Oracle for OpenAiOracle {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&chat_completions_body(request))
            .send()
            .map_err(|e| classify_transport_error(e, &url, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(OracleError::Http { status, body });
        }
        let text = resp
            .text()
            .map_err(|e| classify_transport_error(e, &url, self.timeout))?;
        parse_chat_completions(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_https() {
        assert_eq!(
            normalize_http_base_url("", DEFAULT_OPENAI_BASE_URL),
            "https://api.openai.com"
        );
        assert_eq!(
            normalize_http_base_url("llm.internal:8080/", DEFAULT_OPENAI_BASE_URL),
            "https://llm.internal:8080"
        );
        assert_eq!(
            normalize_http_base_url("http://localhost:1234", DEFAULT_OPENAI_BASE_URL),
            "http://localhost:1234"
        );
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            OpenAiOracle::new("", "  ", None),
            Err(OracleError::Client(_))
        ));
    }

    #[test]
    fn first_choice_content_is_returned() {
        let text = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}]}"#;
        assert_eq!(parse_chat_completions(text).unwrap(), "hi");
        assert!(matches!(
            parse_chat_completions(r#"{"choices":[]}"#),
            Err(OracleError::InvalidResponse(_))
        ));
    }

    #[test]
    fn body_carries_temperature_and_roles() {
        let body = chat_completions_body(&OracleRequest {
            model: "gpt-4o-mini".to_string(),
            system: "s".to_string(),
            user: "u".to_string(),
            temperature: 0.0,
        });
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["temperature"], json!(0.0));
    }
}
