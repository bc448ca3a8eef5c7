//! Runtime configuration.
//!
//! Every setting has a default, can be overridden by an `OSMRAG_*` environment
//! variable, and can be overridden again by the caller (CLI flags). A variable
//! that is set but does not parse is an error naming the variable; empty
//! values count as unset.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use osmrag_evidence::embed::{normalize_ollama_host, TOKEN_HASH_DEFAULT_DIM};
use osmrag_evidence::{Embedder, IndexKind, OllamaEmbedder, TokenHashEmbedder};
use osmrag_llm::openai::{
    normalize_http_base_url, DEFAULT_OPENAI_BASE_URL, OPENAI_API_KEY_ENV, OPENAI_BASE_URL_ENV,
};
use osmrag_llm::oracle::{DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TIMEOUT_SECS};
use osmrag_llm::{DisabledOracle, OllamaOracle, OpenAiOracle, Oracle, OracleBackend, StructuredResponseExtractor};

use crate::nominatim::{
    NominatimGeocoder, DEFAULT_GEOCODE_TIMEOUT_SECS, DEFAULT_NOMINATIM_URL, DEFAULT_USER_AGENT,
};
use crate::orchestrator::{LazyEvidenceRetriever, PipelineSettings, QueryPipeline, DEFAULT_TOP_K};
use crate::osmium::{OsmiumExtractor, DEFAULT_OSMIUM_BIN, DEFAULT_OSMIUM_TIMEOUT_SECS};
use crate::resolve::DEFAULT_PLACE;

pub const OSMRAG_LLM_TIMEOUT_SECS_ENV: &str = "OSMRAG_LLM_TIMEOUT_SECS";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_PBF_FILE: &str = "region-latest.osm.pbf";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmbedderBackend {
    #[default]
    TokenHash,
    Ollama,
}

impl std::fmt::Display for EmbedderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EmbedderBackend::TokenHash => "token-hash",
            EmbedderBackend::Ollama => "ollama",
        })
    }
}

impl FromStr for EmbedderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token-hash" | "tokenhash" | "hash" => Ok(EmbedderBackend::TokenHash),
            "ollama" => Ok(EmbedderBackend::Ollama),
            other => Err(format!(
                "unknown embedder backend `{other}` (expected token-hash|ollama)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsmRagConfig {
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub wiki_jsonl: PathBuf,
    pub osm_pbf: PathBuf,
    pub output_dir: PathBuf,
    pub geojson_path: PathBuf,

    pub default_place: String,
    pub top_k: usize,
    pub index_kind: IndexKind,

    pub oracle: OracleBackend,
    pub model: String,
    pub temperature: f32,
    /// `None` waits forever.
    pub oracle_timeout: Option<Duration>,
    pub ollama_host: String,
    pub openai_base_url: String,
    /// Empty when unset; the openai backend then degrades to no oracle.
    pub openai_api_key: String,

    pub embedder: EmbedderBackend,
    pub embed_model: String,
    pub embed_dim: usize,

    pub nominatim_url: String,
    pub user_agent: String,
    pub nominatim_pause: Duration,

    pub osmium_bin: PathBuf,
    pub osmium_timeout: Option<Duration>,
}

fn lookup_parse<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => {
            let v = v.trim();
            v.parse::<T>()
                .map_err(|e| anyhow!("invalid {name}={v:?}: {e}"))
        }
        _ => Ok(default),
    }
}

fn lookup_string<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: &str) -> String {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn secs_or_forever(secs: u64) -> Option<Duration> {
    (secs != 0).then(|| Duration::from_secs(secs))
}

/// Oracle timeout: `override_secs`, else `OSMRAG_LLM_TIMEOUT_SECS`, else 120s.
/// Zero disables the timeout.
pub fn oracle_timeout<F>(override_secs: Option<u64>, lookup: F) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match override_secs {
        Some(v) => v,
        None => lookup_parse(&lookup, OSMRAG_LLM_TIMEOUT_SECS_ENV, DEFAULT_TIMEOUT_SECS)
            .map_err(|e| anyhow!("{e} (expected integer seconds; 0 disables)"))?,
    };
    Ok(secs_or_forever(secs))
}

impl OsmRagConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let output_dir = PathBuf::from("output");
        Self {
            index_dir: data_dir.join("evidence_index"),
            wiki_jsonl: osmrag_evidence::build::default_wiki_jsonl(&data_dir),
            osm_pbf: data_dir.join("osm").join(DEFAULT_PBF_FILE),
            geojson_path: output_dir.join("output.geojson"),
            output_dir,
            data_dir,
            default_place: DEFAULT_PLACE.to_string(),
            top_k: DEFAULT_TOP_K,
            index_kind: IndexKind::Flat,
            oracle: OracleBackend::Ollama,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            oracle_timeout: secs_or_forever(DEFAULT_TIMEOUT_SECS),
            ollama_host: normalize_ollama_host(""),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_api_key: String::new(),
            embedder: EmbedderBackend::TokenHash,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            embed_dim: TOKEN_HASH_DEFAULT_DIM,
            nominatim_url: DEFAULT_NOMINATIM_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            nominatim_pause: Duration::from_secs(1),
            osmium_bin: PathBuf::from(DEFAULT_OSMIUM_BIN),
            osmium_timeout: secs_or_forever(DEFAULT_OSMIUM_TIMEOUT_SECS),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(lookup_string(&lookup, "OSMRAG_DATA_DIR", "data"));
        let mut cfg = Self::with_data_dir(&data_dir);

        if let Some(dir) = lookup("OSMRAG_INDEX_DIR").filter(|v| !v.trim().is_empty()) {
            cfg.index_dir = PathBuf::from(dir.trim());
        }
        if let Some(p) = lookup("OSMRAG_WIKI_JSONL").filter(|v| !v.trim().is_empty()) {
            cfg.wiki_jsonl = PathBuf::from(p.trim());
        }
        if let Some(p) = lookup("OSMRAG_OSM_PBF").filter(|v| !v.trim().is_empty()) {
            cfg.osm_pbf = PathBuf::from(p.trim());
        }
        if let Some(dir) = lookup("OSMRAG_OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            cfg.output_dir = PathBuf::from(dir.trim());
            cfg.geojson_path = cfg.output_dir.join("output.geojson");
        }
        if let Some(p) = lookup("OSMRAG_GEOJSON").filter(|v| !v.trim().is_empty()) {
            cfg.geojson_path = PathBuf::from(p.trim());
        }

        cfg.default_place = lookup_string(&lookup, "OSMRAG_DEFAULT_PLACE", DEFAULT_PLACE);
        cfg.top_k = lookup_parse(&lookup, "OSMRAG_TOP_K", DEFAULT_TOP_K)?;
        cfg.index_kind = lookup_parse(&lookup, "OSMRAG_INDEX_KIND", IndexKind::Flat)?;

        cfg.oracle = lookup_parse(&lookup, "OSMRAG_ORACLE", OracleBackend::Ollama)?;
        cfg.model = lookup_string(&lookup, "OSMRAG_LLM_MODEL", DEFAULT_MODEL);
        cfg.temperature = lookup_parse(&lookup, "OSMRAG_LLM_TEMPERATURE", DEFAULT_TEMPERATURE)?;
        cfg.oracle_timeout = oracle_timeout(None, &lookup)?;
        let host = lookup_string(&lookup, "OSMRAG_OLLAMA_HOST", "");
        cfg.ollama_host = if host.is_empty() {
            normalize_ollama_host(&lookup_string(&lookup, "OLLAMA_HOST", ""))
        } else {
            normalize_ollama_host(&host)
        };
        cfg.openai_base_url = normalize_http_base_url(
            &lookup_string(&lookup, OPENAI_BASE_URL_ENV, ""),
            DEFAULT_OPENAI_BASE_URL,
        );
        cfg.openai_api_key = lookup_string(&lookup, OPENAI_API_KEY_ENV, "");

        cfg.embedder = lookup_parse(&lookup, "OSMRAG_EMBEDDER", EmbedderBackend::TokenHash)?;
        cfg.embed_model = lookup_string(&lookup, "OSMRAG_EMBED_MODEL", DEFAULT_EMBED_MODEL);
        cfg.embed_dim = lookup_parse(&lookup, "OSMRAG_EMBED_DIM", TOKEN_HASH_DEFAULT_DIM)?;

        cfg.nominatim_url = lookup_string(&lookup, "OSMRAG_NOMINATIM_URL", DEFAULT_NOMINATIM_URL);
        cfg.user_agent = lookup_string(&lookup, "OSMRAG_USER_AGENT", DEFAULT_USER_AGENT);
        cfg.nominatim_pause =
            Duration::from_millis(lookup_parse(&lookup, "OSMRAG_NOMINATIM_PAUSE_MS", 1000u64)?);

        cfg.osmium_bin = PathBuf::from(lookup_string(&lookup, "OSMRAG_OSMIUM_BIN", DEFAULT_OSMIUM_BIN));
        cfg.osmium_timeout = secs_or_forever(lookup_parse(
            &lookup,
            "OSMRAG_OSMIUM_TIMEOUT_SECS",
            DEFAULT_OSMIUM_TIMEOUT_SECS,
        )?);

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(anyhow!("top_k must be at least 1"));
        }
        if self.embed_dim == 0 {
            return Err(anyhow!("embedding dimension must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(anyhow!("invalid oracle temperature {}", self.temperature));
        }
        Ok(())
    }

    pub fn build_embedder(&self) -> Arc<dyn Embedder> {
        match self.embedder {
            EmbedderBackend::TokenHash => Arc::new(TokenHashEmbedder::new(self.embed_dim)),
            EmbedderBackend::Ollama => Arc::new(OllamaEmbedder::new(
                &self.ollama_host,
                self.embed_model.clone(),
                self.oracle_timeout,
            )),
        }
    }

    /// A missing OpenAI key degrades to [`DisabledOracle`] like any other
    /// unavailable oracle.
    pub fn build_oracle(&self) -> Result<Arc<dyn Oracle>> {
        Ok(match self.oracle {
            OracleBackend::Ollama => Arc::new(OllamaOracle::new(&self.ollama_host, self.oracle_timeout)?),
            OracleBackend::OpenAi if self.openai_api_key.trim().is_empty() => {
                tracing::warn!(
                    "{OPENAI_API_KEY_ENV} is not set; answering from retrieved evidence without an oracle"
                );
                Arc::new(DisabledOracle)
            }
            OracleBackend::OpenAi => Arc::new(OpenAiOracle::new(
                &self.openai_base_url,
                &self.openai_api_key,
                self.oracle_timeout,
            )?),
            OracleBackend::Disabled => Arc::new(DisabledOracle),
        })
    }

    pub fn build_geocoder(&self) -> Result<NominatimGeocoder> {
        NominatimGeocoder::new(
            &self.nominatim_url,
            &self.user_agent,
            self.nominatim_pause,
            Duration::from_secs(DEFAULT_GEOCODE_TIMEOUT_SECS),
        )
    }

    pub fn build_extractor(&self) -> OsmiumExtractor {
        OsmiumExtractor::new(&self.osm_pbf, &self.output_dir)
            .with_program(&self.osmium_bin)
            .with_geojson_path(&self.geojson_path)
            .with_timeout(self.osmium_timeout)
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            model: self.model.clone(),
            top_k: self.top_k,
            default_place: self.default_place.clone(),
        }
    }

    /// Production pipeline: lazily opened evidence store, configured oracle,
    /// Nominatim and osmium.
    pub fn build_pipeline(&self) -> Result<QueryPipeline> {
        self.validate()?;
        let evidence = LazyEvidenceRetriever::new(&self.index_dir, self.build_embedder(), self.index_kind);
        let extractor =
            StructuredResponseExtractor::new(self.build_oracle()?).with_temperature(self.temperature);
        Ok(QueryPipeline::new(
            Arc::new(evidence),
            extractor,
            Arc::new(self.build_geocoder()?),
            Arc::new(self.build_extractor()),
            self.settings(),
        ))
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }
}

impl Default for OsmRagConfig {
    fn default() -> Self {
        Self::with_data_dir("data")
    }
}
