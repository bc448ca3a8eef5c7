//! Local Ollama server via the native `/api/chat` endpoint.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use osmrag_evidence::embed::normalize_ollama_host;

use crate::oracle::{classify_transport_error, http_client, Oracle, OracleError, OracleRequest};

#[derive(Debug, Clone)]
pub struct OllamaOracle {
    host: String,
    timeout: Option<Duration>,
    client: reqwest::blocking::Client,
}

impl OllamaOracle {
    /// `timeout = None` waits forever.
    pub fn new(host: &str, timeout: Option<Duration>) -> Result<Self, OracleError> {
        let host = normalize_ollama_host(host);
        let client = http_client(&host, timeout)?;
        Ok(Self {
            host,
            timeout,
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// True when `/api/tags` answers 200 within five seconds.
    pub fn check_available(&self) -> bool {
        let url = format!("{}/api/tags", self.host);
        self.client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Names of the models installed on the server.
    pub fn list_models(&self) -> Result<Vec<String>, OracleError> {
        let url = format!("{}/api/tags", self.host);
        let timeout = Duration::from_secs(10);
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .map_err(|e| classify_transport_error(e, &url, Some(timeout)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(OracleError::Http { status, body });
        }
        let text = resp
            .text()
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
        parse_tags_response(&text)
    }
}

pub(crate) fn chat_body(req: &OracleRequest) -> serde_json::Value {
    json!({
        "model": req.model,
        "stream": false,
        "messages": [
            { "role": "system", "content": req.system },
            { "role": "user", "content": req.user }
        ],
        "options": {
            "temperature": req.temperature
        }
    })
}

pub(crate) fn parse_chat_response(text: &str) -> Result<String, OracleError> {
    #[derive(Deserialize)]
    struct ChatResponse {
        #[serde(default)]
        message: Option<ChatMessage>,
    }

    #[derive(Deserialize)]
    struct ChatMessage {
        #[serde(default)]
        content: String,
    }

    let out: ChatResponse = serde_json::from_str(text)
        .map_err(|e| OracleError::InvalidResponse(format!("ollama returned invalid JSON: {e}")))?;
    Ok(out.message.map(|m| m.content).unwrap_or_default())
}

pub(crate) fn parse_tags_response(text: &str) -> Result<Vec<String>, OracleError> {
    #[derive(Deserialize)]
    struct Tags {
        #[serde(default)]
        models: Vec<Model>,
    }

    #[derive(Deserialize)]
    struct Model {
        name: String,
    }

    let tags: Tags = serde_json::from_str(text)
        .map_err(|e| OracleError::InvalidResponse(format!("ollama /api/tags: {e}")))?;
    Ok(tags.models.into_iter().map(|m| m.name).collect())
}

impl Oracle for OllamaOracle {
    fn name(&self) -> &str {
        "ollama"
    }

    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let url = format!("{}/api/chat", self.host);
        let resp = self
            .client
            .post(&url)
            .json(&chat_body(request))
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
        parse_chat_response(&text)
    }
}
