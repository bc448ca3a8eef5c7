//! Query pipeline: retrieve, parse, validate, resolve, hand off.
//!
//! Only three things end a query early: evidence that cannot be loaded, a tag
//! that cannot be resolved, and a handoff stage that fails. Everything the
//! oracle does wrong is absorbed by the fallback chains.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use osmrag_evidence::{Embedder, EvidenceRetriever, IndexKind, OsmTag, RetrievalError, RetrievedEvidence};
use osmrag_llm::{validate, LlmSignal, ParseOutcome, StructuredResponseExtractor};

use crate::handoff::{BoundingBox, FeatureExtraction, FeatureExtractor, Geocoder, HandoffError, HandoffStage};
use crate::report::{summarize, EvidenceSummary, LlmTrace, QueryReport};
use crate::resolve::{resolve_place, resolve_tag, ResolutionResult, ResolveError, DEFAULT_PLACE};

pub const DEFAULT_TOP_K: usize = 5;

/// Ranked evidence for a query. Failing here means the store itself is
/// unusable; an empty result is not a failure.
pub trait EvidenceSource: Send + Sync {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedEvidence>, RetrievalError>;
}

impl EvidenceSource for EvidenceRetriever {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedEvidence>, RetrievalError> {
        Ok(EvidenceRetriever::retrieve(self, query, k))
    }
}

/// Opens the evidence store on first use and keeps it open.
///
/// A load failure is returned to the query that triggered it and retried by
/// the next one, so a store built after startup is picked up.
pub struct LazyEvidenceRetriever {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    kind: IndexKind,
    opened: Mutex<Option<Arc<EvidenceRetriever>>>,
}

impl fmt::Debug for LazyEvidenceRetriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEvidenceRetriever")
            .field("dir", &self.dir)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl LazyEvidenceRetriever {
    pub fn new(dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, kind: IndexKind) -> Self {
        Self {
            dir: dir.into(),
            embedder,
            kind,
            opened: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Result<Arc<EvidenceRetriever>, RetrievalError> {
        let mut slot = self
            .opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(r) = slot.as_ref() {
            return Ok(Arc::clone(r));
        }
        let r = Arc::new(EvidenceRetriever::open(
            &self.dir,
            Arc::clone(&self.embedder),
            self.kind,
        )?);
        *slot = Some(Arc::clone(&r));
        Ok(r)
    }
}

impl EvidenceSource for LazyEvidenceRetriever {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedEvidence>, RetrievalError> {
        Ok(self.get()?.retrieve(query, k))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Retrieve,
    Resolve,
    Handoff,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStage::Retrieve => "retrieve",
            PipelineStage::Resolve => "resolve",
            PipelineStage::Handoff => "handoff",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("evidence retrieval unavailable: {message}")]
    RetrievalUnavailable { message: String },

    #[error("{}", ResolveError::NoTagResolved)]
    NoTagResolved,

    #[error("{stage} failed: {message}")]
    HandoffFailed { stage: HandoffStage, message: String },
}

impl From<HandoffError> for PipelineError {
    fn from(e: HandoffError) -> Self {
        PipelineError::HandoffFailed {
            stage: e.stage,
            message: e.message,
        }
    }
}

impl From<ResolveError> for PipelineError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NoTagResolved => PipelineError::NoTagResolved,
        }
    }
}

/// A query that did not produce features, with whatever was decided before
/// the failing stage.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("query {query:?} failed at {stage}: {error}")]
pub struct QueryFailure {
    pub query: String,
    pub stage: PipelineStage,
    pub error: PipelineError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_tag: Option<String>,
    pub evidence: Vec<EvidenceSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub model: String,
    pub top_k: usize,
    pub default_place: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model: osmrag_llm::oracle::DEFAULT_MODEL.to_string(),
            top_k: DEFAULT_TOP_K,
            default_place: DEFAULT_PLACE.to_string(),
        }
    }
}

/// Everything decided before the handoff.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub query: String,
    pub evidence: Vec<RetrievedEvidence>,
    pub outcome: ParseOutcome,
    pub signal: LlmSignal,
    pub resolution: ResolutionResult,
}

pub struct QueryPipeline {
    evidence: Arc<dyn EvidenceSource>,
    extractor: StructuredResponseExtractor,
    geocoder: Arc<dyn Geocoder>,
    features: Arc<dyn FeatureExtractor>,
    settings: PipelineSettings,
}

impl fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPipeline")
            .field("oracle", &self.extractor.oracle_name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueryPipeline {
    pub fn new(
        evidence: Arc<dyn EvidenceSource>,
        extractor: StructuredResponseExtractor,
        geocoder: Arc<dyn Geocoder>,
        features: Arc<dyn FeatureExtractor>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            evidence,
            extractor,
            geocoder,
            features,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn failure(
        query: &str,
        stage: PipelineStage,
        error: PipelineError,
        evidence: &[RetrievedEvidence],
    ) -> QueryFailure {
        QueryFailure {
            query: query.to_string(),
            stage,
            error,
            place: None,
            chosen_tag: None,
            evidence: summarize(evidence),
        }
    }

    /// Retrieve, ask the oracle, validate and resolve. No geodata is touched.
    pub fn analyze(&self, query: &str) -> Result<Analysis, QueryFailure> {
        let evidence = self
            .evidence
            .retrieve(query, self.settings.top_k)
            .map_err(|e| {
                tracing::error!(error = %e, "evidence retrieval unavailable");
                Self::failure(
                    query,
                    PipelineStage::Retrieve,
                    PipelineError::RetrievalUnavailable {
                        message: e.to_string(),
                    },
                    &[],
                )
            })?;
        tracing::info!(
            count = evidence.len(),
            tagged = evidence.iter().filter(|e| e.tag().is_some()).count(),
            "retrieved evidence"
        );

        let outcome = self.extractor.parse(query, &evidence, &self.settings.model);
        let signal = validate(&outcome);
        tracing::info!(
            oracle = self.extractor.oracle_name(),
            status = ?outcome.status,
            valid = signal.is_valid(),
            "oracle parse"
        );

        let place = resolve_place(&signal, query, &self.settings.default_place);
        let tag = resolve_tag(&signal, &evidence).map_err(|e| {
            tracing::warn!(place = %place.place, "no tag could be resolved");
            let mut failure = Self::failure(query, PipelineStage::Resolve, e.into(), &evidence);
            failure.place = Some(place.place.clone());
            failure
        })?;
        let resolution = ResolutionResult::new(place, tag);
        tracing::info!(
            place = %resolution.place,
            tag = %resolution.chosen_tag(),
            place_source = %resolution.resolved_from.place_source,
            tag_source = %resolution.resolved_from.tag_source,
            "resolved query"
        );

        Ok(Analysis {
            query: query.to_string(),
            evidence,
            outcome,
            signal,
            resolution,
        })
    }

    /// Full run for a free-text query.
    pub fn run(&self, query: &str) -> Result<QueryReport, QueryFailure> {
        let analysis = self.analyze(query)?;
        let resolution = &analysis.resolution;
        let tag = resolution.tag();

        let (bbox, extraction) = self.handoff(&resolution.place, &tag).map_err(|e| {
            let mut failure =
                Self::failure(query, PipelineStage::Handoff, e.into(), &analysis.evidence);
            failure.place = Some(resolution.place.clone());
            failure.chosen_tag = Some(resolution.chosen_tag());
            failure
        })?;

        Ok(QueryReport {
            success: true,
            query: query.to_string(),
            place: resolution.place.clone(),
            place_source: Some(resolution.resolved_from.place_source),
            chosen_tag: resolution.chosen_tag(),
            tag_source: Some(resolution.resolved_from.tag_source),
            bbox,
            count: extraction.count,
            geojson_path: extraction.geojson_path,
            evidence: summarize(&analysis.evidence),
            llm: LlmTrace::from(&analysis.outcome),
        })
    }

    /// Handoff for an explicit place and tag, skipping retrieval and the oracle.
    pub fn run_direct(&self, query: &str, place: &str, tag: &OsmTag) -> Result<QueryReport, QueryFailure> {
        tracing::info!(place, %tag, "direct run");
        let (bbox, extraction) = self.handoff(place, tag).map_err(|e| {
            let mut failure = Self::failure(query, PipelineStage::Handoff, e.into(), &[]);
            failure.place = Some(place.to_string());
            failure.chosen_tag = Some(tag.to_string());
            failure
        })?;

        Ok(QueryReport {
            success: true,
            query: query.to_string(),
            place: place.to_string(),
            place_source: None,
            chosen_tag: tag.to_string(),
            tag_source: None,
            bbox,
            count: extraction.count,
            geojson_path: extraction.geojson_path,
            evidence: Vec::new(),
            llm: LlmTrace::disabled(),
        })
    }

    fn handoff(&self, place: &str, tag: &OsmTag) -> Result<(BoundingBox, FeatureExtraction), HandoffError> {
        let bbox = self
            .geocoder
            .geocode(place)
            .map_err(|e| HandoffError::new(HandoffStage::Geocode, &e))
            .inspect_err(|e| tracing::error!(error = %e, "handoff failed"))?;
        let region = self
            .features
            .extract_bbox(place, &bbox)
            .map_err(|e| HandoffError::new(HandoffStage::BboxExtract, &e))
            .inspect_err(|e| tracing::error!(error = %e, "handoff failed"))?;
        let extraction = self
            .features
            .extract_features(&region, tag)
            .map_err(|e| HandoffError::new(HandoffStage::NodeExtract, &e))
            .inspect_err(|e| tracing::error!(error = %e, "handoff failed"))?;
        Ok((bbox, extraction))
    }
}
