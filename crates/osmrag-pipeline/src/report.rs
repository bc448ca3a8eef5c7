//! Serializable results of a pipeline run.

use std::path::PathBuf;

use serde::Serialize;

use osmrag_evidence::RetrievedEvidence;
use osmrag_llm::ParseOutcome;

use crate::handoff::BoundingBox;
use crate::resolve::{PlaceSource, TagSource};

pub const REPORT_SNIPPET_CHARS: usize = 220;

fn round4(x: f32) -> f64 {
    (f64::from(x) * 10_000.0).round() / 10_000.0
}

/// Compact view of one retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceSummary {
    pub score: f64,
    pub key: Option<String>,
    pub value: Option<String>,
    pub url: String,
    pub snippet: String,
}

impl From<&RetrievedEvidence> for EvidenceSummary {
    fn from(e: &RetrievedEvidence) -> Self {
        let snippet: String = e
            .chunk
            .content
            .chars()
            .take(REPORT_SNIPPET_CHARS)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        Self {
            score: round4(e.score),
            key: e.tag().map(|t| t.key.clone()),
            value: e.tag().map(|t| t.value.clone()),
            url: e.chunk.source_url.clone(),
            snippet,
        }
    }
}

pub fn summarize(evidence: &[RetrievedEvidence]) -> Vec<EvidenceSummary> {
    evidence.iter().map(EvidenceSummary::from).collect()
}

/// Oracle side-channel carried into the report.
///
/// `explanation` and `confidence` are read from whatever JSON the oracle
/// produced, valid or not; they never influence resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmTrace {
    pub llm_ok: bool,
    pub llm_raw: String,
    pub llm_explanation: String,
    pub llm_confidence: f64,
}

impl LlmTrace {
    pub fn disabled() -> Self {
        Self {
            llm_ok: false,
            llm_raw: String::new(),
            llm_explanation: String::new(),
            llm_confidence: 0.0,
        }
    }
}

impl From<&ParseOutcome> for LlmTrace {
    fn from(outcome: &ParseOutcome) -> Self {
        let data = outcome.data.as_ref();
        Self {
            llm_ok: outcome.ok(),
            llm_raw: outcome.raw.clone(),
            llm_explanation: data
                .and_then(|d| d.get("explanation"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            llm_confidence: data
                .and_then(|d| d.get("confidence"))
                .and_then(|v| v.as_f64())
                .filter(|c| c.is_finite())
                .unwrap_or(0.0),
        }
    }
}

/// Successful run: the resolution, its provenance and the handoff result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryReport {
    pub success: bool,
    pub query: String,
    pub place: String,
    /// `None` for direct runs, where the caller supplied the place.
    pub place_source: Option<PlaceSource>,
    pub chosen_tag: String,
    pub tag_source: Option<TagSource>,
    pub bbox: BoundingBox,
    pub count: usize,
    pub geojson_path: PathBuf,
    pub evidence: Vec<EvidenceSummary>,
    #[serde(flatten)]
    pub llm: LlmTrace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmrag_evidence::{EvidenceChunk, OsmTag};
    use osmrag_llm::{ParseStatus, RecoveryTier};

    #[test]
    fn summary_rounds_score_and_flattens_snippet() {
        let e = RetrievedEvidence {
            score: 0.123_456_7,
            position: 3,
            chunk: EvidenceChunk {
                content: format!("line one\nline two\n{}", "x".repeat(400)),
                source_url: "https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe".to_string(),
                title: "Tag:amenity=cafe".to_string(),
                tag: Some(OsmTag::new("amenity", "cafe")),
            },
        };
        let s = EvidenceSummary::from(&e);
        assert!((s.score - 0.1235).abs() < 1e-9);
        assert_eq!(s.key.as_deref(), Some("amenity"));
        assert_eq!(s.value.as_deref(), Some("cafe"));
        assert_eq!(s.snippet.chars().count(), REPORT_SNIPPET_CHARS);
        assert!(s.snippet.starts_with("line one line two "));
    }

    #[test]
    fn trace_reads_advisory_fields_from_any_json() {
        let outcome = ParseOutcome {
            status: ParseStatus::Parsed(RecoveryTier::WholeResponse),
            data: Some(serde_json::json!({"confidence": 0.7, "explanation": "cafes"})),
            raw: "{...}".to_string(),
        };
        let t = LlmTrace::from(&outcome);
        assert!(t.llm_ok);
        assert_eq!(t.llm_explanation, "cafes");
        assert!((t.llm_confidence - 0.7).abs() < 1e-9);

        let failed = ParseOutcome::failed(ParseStatus::Unparseable, "no json here");
        let t = LlmTrace::from(&failed);
        assert!(!t.llm_ok);
        assert_eq!(t.llm_raw, "no json here");
        assert_eq!(t.llm_confidence, 0.0);
    }
}
