//! Text embedders.
//!
//! Two backends share one contract: every vector returned by [`Embedder::embed`]
//! is unit-normalized, so inner product equals cosine similarity.
//!
//! - [`TokenHashEmbedder`]: deterministic signed feature hashing. No model, no
//!   network; used for offline builds and tests.
//! - `OllamaEmbedder` (feature `ollama`): `/api/embed`, falling back to
//!   `/api/embeddings` on older Ollama versions.

use crate::error::RetrievalError;

pub const TOKEN_HASH_BACKEND: &str = "token-hash";
pub const TOKEN_HASH_DEFAULT_DIM: usize = 256;

/// Produces unit-normalized vectors for batches of text.
pub trait Embedder: Send + Sync {
    /// Backend identifier persisted in the index file (`token-hash`, `ollama`).
    fn backend(&self) -> &str;

    fn model(&self) -> &str;

    /// Output dimension, when known without calling the backend.
    fn dim(&self) -> Option<usize>;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut out = self.embed(&[text.to_string()])?;
        out.pop()
            .ok_or_else(|| RetrievalError::embedding(self.backend(), "backend returned no vector"))
    }
}

pub fn normalize_in_place(v: &mut [f32]) {
    let norm2: f32 = v.iter().map(|x| x * x).sum();
    if norm2 <= 0.0 {
        return;
    }
    let inv = 1.0f32 / norm2.sqrt();
    for x in v.iter_mut() {
        *x *= inv;
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ============================================================================
// Token-hash embeddings
// ============================================================================

#[derive(Debug, Clone)]
pub struct TokenHashEmbedder {
    dim: usize,
}

impl Default for TokenHashEmbedder {
    fn default() -> Self {
        Self::new(TOKEN_HASH_DEFAULT_DIM)
    }
}

impl TokenHashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for t in tokenize(text) {
            let h = fnv1a64(&t);
            let idx = (h % (self.dim as u64)) as usize;
            let sign = if ((h >> 32) & 1) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize_in_place(&mut v);
        v
    }
}

impl Embedder for TokenHashEmbedder {
    fn backend(&self) -> &str {
        TOKEN_HASH_BACKEND
    }

    fn model(&self) -> &str {
        "fnv1a64"
    }

    fn dim(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn fnv1a64(s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Lowercased alphanumeric tokens, stopwords removed, naive plural folding
/// (`cafes` -> `cafe`, but `address` stays).
pub fn tokenize(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "a", "all", "an", "and", "any", "are", "as", "at", "by", "find", "for", "from", "in",
        "is", "me", "near", "of", "on", "or", "show", "the", "to", "where", "with",
    ];

    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .collect()
}

// ============================================================================
// Ollama embeddings
// ============================================================================

#[cfg(feature = "ollama")]
pub use ollama::{default_ollama_host, normalize_ollama_host, OllamaEmbedder};

#[cfg(feature = "ollama")]
mod ollama {
    use std::time::Duration;

    use serde::Deserialize;

    use super::{normalize_in_place, Embedder};
    use crate::error::RetrievalError;

    pub const OLLAMA_BACKEND: &str = "ollama";

    pub fn normalize_ollama_host(host: &str) -> String {
        let mut host = host.trim().to_string();
        if host.is_empty() {
            // IPv4 loopback: some installs bind 127.0.0.1 but not ::1.
            host = "http://127.0.0.1:11434".to_string();
        }
        if !host.starts_with("http://") && !host.starts_with("https://") {
            host = format!("http://{host}");
        }
        host.trim_end_matches('/').to_string()
    }

    pub fn default_ollama_host() -> String {
        normalize_ollama_host(&std::env::var("OLLAMA_HOST").unwrap_or_default())
    }

    #[derive(Debug, Clone)]
    pub struct OllamaEmbedder {
        host: String,
        model: String,
        timeout: Option<Duration>,
    }

    impl OllamaEmbedder {
        pub fn new(host: &str, model: impl Into<String>, timeout: Option<Duration>) -> Self {
            Self {
                host: normalize_ollama_host(host),
                model: model.into(),
                timeout,
            }
        }

        fn err(&self, message: impl Into<String>) -> RetrievalError {
            RetrievalError::embedding(OLLAMA_BACKEND, message)
        }

        fn raw_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            let mut builder = reqwest::blocking::Client::builder();
            if let Some(timeout) = self.timeout {
                builder = builder.timeout(timeout);
            }
            if self.host.starts_with("http://127.") || self.host.starts_with("http://localhost") {
                builder = builder.no_proxy();
            }
            let client = builder
                .build()
                .map_err(|e| self.err(format!("failed to build http client: {e}")))?;

            let url_embed = format!("{}/api/embed", self.host);
            let body = serde_json::json!({
                "model": self.model,
                "input": texts,
                "truncate": true
            });

            match client.post(&url_embed).json(&body).send() {
                Ok(resp) if resp.status().is_success() => {
                    #[derive(Deserialize)]
                    struct EmbedResp {
                        embeddings: Vec<Vec<f32>>,
                    }

                    let out: EmbedResp = resp
                        .json()
                        .map_err(|e| self.err(format!("/api/embed returned invalid JSON: {e}")))?;
                    if out.embeddings.len() != texts.len() {
                        return Err(self.err(format!(
                            "/api/embed returned {} embeddings for {} inputs",
                            out.embeddings.len(),
                            texts.len()
                        )));
                    }
                    return Ok(out.embeddings);
                }
                Ok(resp) => {
                    tracing::debug!(
                        status = %resp.status(),
                        "ollama /api/embed rejected request; falling back to /api/embeddings"
                    );
                }
                Err(e) => {
                    return Err(self.err(format!(
                        "failed to reach ollama at {url_embed} (is it running?) ({e})"
                    )));
                }
            }

            #[derive(Deserialize)]
            struct EmbeddingsResp {
                embedding: Vec<f32>,
            }

            let url = format!("{}/api/embeddings", self.host);
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                let body = serde_json::json!({ "model": self.model, "prompt": t });
                let resp = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .map_err(|e| self.err(format!("failed to reach ollama at {url} ({e})")))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().unwrap_or_default();
                    return Err(self.err(format!("http error {status}: {text}")));
                }
                let r: EmbeddingsResp = resp
                    .json()
                    .map_err(|e| self.err(format!("/api/embeddings returned invalid JSON: {e}")))?;
                out.push(r.embedding);
            }
            Ok(out)
        }
    }

    impl Embedder for OllamaEmbedder {
        fn backend(&self) -> &str {
            OLLAMA_BACKEND
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn dim(&self) -> Option<usize> {
            None
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = self.raw_embed(texts)?;
            if out.iter().any(|v| v.is_empty()) {
                return Err(self.err("backend returned empty vector(s)"));
            }
            for v in out.iter_mut() {
                normalize_in_place(v);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn token_hash_vectors_are_unit_length() {
        let e = TokenHashEmbedder::default();
        let v = e.embed_text("Cafes and coffee shops in Malmö");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let e = TokenHashEmbedder::new(16);
        assert!(e.embed_text("  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn tokenizer_folds_plurals_and_drops_stopwords() {
        assert_eq!(tokenize("Find all cafes in Malmö"), vec!["cafe", "malmö"]);
        assert_eq!(tokenize("address bus_stops"), vec!["address", "bus", "stop"]);
    }

    #[test]
    fn plural_and_singular_queries_share_a_vector() {
        let e = TokenHashEmbedder::default();
        let a = e.embed_text("cafes");
        let b = e.embed_text("cafe");
        assert_relative_eq!(dot(&a, &b), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn normalize_leaves_zero_vector_untouched() {
        let mut v = vec![0.0f32; 3];
        normalize_in_place(&mut v);
        assert_eq!(v, vec![0.0; 3]);

        let mut w = vec![3.0f32, 4.0];
        normalize_in_place(&mut w);
        assert_relative_eq!(w[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(w[1], 0.8, epsilon = 1e-6);
    }

    #[cfg(feature = "ollama")]
    #[test]
    fn ollama_host_is_normalized() {
        assert_eq!(normalize_ollama_host(""), "http://127.0.0.1:11434");
        assert_eq!(normalize_ollama_host("gpu-box:11434/"), "http://gpu-box:11434");
        assert_eq!(
            normalize_ollama_host("https://ollama.example"),
            "https://ollama.example"
        );
    }
}
