//! Place and tag resolution chains.
//!
//! Both chains read the same inputs: the validated-or-absent oracle signal,
//! the ranked evidence, and the raw query. Each tries its sources in order and
//! takes the first that answers.
//!
//! | chain | 1st       | 2nd                 | last                     |
//! |-------|-----------|---------------------|--------------------------|
//! | place | oracle    | trailing-phrase regex | configured default     |
//! | tag   | oracle    | score-weighted vote | `NoTagResolved` (fatal)  |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use osmrag_evidence::{OsmTag, RetrievedEvidence};
use osmrag_llm::LlmSignal;

pub const DEFAULT_PLACE: &str = "Lund";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceSource {
    Llm,
    Heuristic,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    Llm,
    Vote,
}

impl fmt::Display for PlaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaceSource::Llm => "llm",
            PlaceSource::Heuristic => "heuristic",
            PlaceSource::Default => "default",
        })
    }
}

impl fmt::Display for TagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagSource::Llm => "llm",
            TagSource::Vote => "vote",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub place_source: PlaceSource,
    pub tag_source: TagSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPlace {
    pub place: String,
    pub source: PlaceSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTag {
    pub tag: OsmTag,
    pub source: TagSource,
    /// Accumulated evidence score of the winning tag; `None` for oracle tags.
    pub weight: Option<f64>,
}

/// The pipeline's decision for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionResult {
    pub place: String,
    pub key: String,
    pub value: String,
    pub resolved_from: Provenance,
}

impl ResolutionResult {
    pub fn new(place: ResolvedPlace, tag: ResolvedTag) -> Self {
        Self {
            place: place.place,
            key: tag.tag.key,
            value: tag.tag.value,
            resolved_from: Provenance {
                place_source: place.source,
                tag_source: tag.source,
            },
        }
    }

    pub fn tag(&self) -> OsmTag {
        OsmTag::new(self.key.clone(), self.value.clone())
    }

    /// `key=value`.
    pub fn chosen_tag(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error(
        "no tag resolved: the oracle gave no valid tag and none of the retrieved evidence is tagged"
    )]
    NoTagResolved,
}

fn place_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?i)\bin\s+([\p{L}\-\s]{2,})$",
            r"(?i)\b(?:from|at|near)\s+([\p{L}\-\s]{2,})$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid place pattern"))
        .collect()
    })
}

/// Trailing "in X" / "from X" / "at X" / "near X" phrase of the query.
///
/// Only a phrase that runs to the end of the query is recognised, so
/// "cafes in Malmö near the station" yields "Malmö near the station".
pub fn place_from_query(query: &str) -> Option<String> {
    let query = query.trim();
    place_patterns().iter().find_map(|re| {
        let m = re.captures(query)?.get(1)?;
        let place = m.as_str().trim();
        (!place.is_empty()).then(|| place.to_string())
    })
}

pub fn resolve_place(signal: &LlmSignal, query: &str, default_place: &str) -> ResolvedPlace {
    if let Some(place) = signal.valid().and_then(|r| r.place.as_deref()) {
        return ResolvedPlace {
            place: place.to_string(),
            source: PlaceSource::Llm,
        };
    }
    if let Some(place) = place_from_query(query) {
        return ResolvedPlace {
            place,
            source: PlaceSource::Heuristic,
        };
    }
    let place = match default_place.trim() {
        "" => DEFAULT_PLACE,
        p => p,
    };
    ResolvedPlace {
        place: place.to_string(),
        source: PlaceSource::Default,
    }
}

/// Score-weighted vote over tagged evidence.
///
/// Only tags with a non-blank key and value take part. Ties go to the tag
/// seen first in ranked order. Returns `None` when no evidence item carries
/// a usable tag.
pub fn vote_tag(evidence: &[RetrievedEvidence]) -> Option<(OsmTag, f64)> {
    let mut votes: Vec<(&OsmTag, f64)> = Vec::new();
    for e in evidence {
        let Some(tag) = e.tag() else {
            continue;
        };
        if tag.key.trim().is_empty() || tag.value.trim().is_empty() {
            continue;
        }
        match votes.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, w)) => *w += f64::from(e.score),
            None => votes.push((tag, f64::from(e.score))),
        }
    }

    let mut best: Option<(&OsmTag, f64)> = None;
    for (tag, weight) in votes {
        match best {
            Some((_, w)) if weight <= w => {}
            _ => best = Some((tag, weight)),
        }
    }
    best.map(|(t, w)| (t.clone(), w))
}

pub fn resolve_tag(
    signal: &LlmSignal,
    evidence: &[RetrievedEvidence],
) -> Result<ResolvedTag, ResolveError> {
    if let Some(r) = signal.valid() {
        return Ok(ResolvedTag {
            tag: r.tag.clone(),
            source: TagSource::Llm,
            weight: None,
        });
    }
    let (tag, weight) = vote_tag(evidence).ok_or(ResolveError::NoTagResolved)?;
    Ok(ResolvedTag {
        tag,
        source: TagSource::Vote,
        weight: Some(weight),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmrag_evidence::EvidenceChunk;
    use osmrag_llm::{InvalidReason, ParseStatus, StructuredResponse};

    fn ev(tag: Option<(&str, &str)>, score: f32) -> RetrievedEvidence {
        RetrievedEvidence {
            score,
            position: 0,
            chunk: EvidenceChunk {
                content: "text".to_string(),
                source_url: String::new(),
                title: String::new(),
                tag: tag.map(|(k, v)| OsmTag::new(k, v)),
            },
        }
    }

    fn valid(place: Option<&str>, key: &str, value: &str) -> LlmSignal {
        LlmSignal::Valid(StructuredResponse {
            place: place.map(str::to_string),
            tag: OsmTag::new(key, value),
            confidence: 0.9,
            explanation: String::new(),
        })
    }

    fn absent() -> LlmSignal {
        LlmSignal::InvalidOrAbsent(InvalidReason::Absent(ParseStatus::OracleUnreachable))
    }

    #[test]
    fn llm_place_wins_regardless_of_query() {
        let p = resolve_place(&valid(Some("Malmö"), "amenity", "cafe"), "bus stops near Lund", "Lund");
        assert_eq!(p.place, "Malmö");
        assert_eq!(p.source, PlaceSource::Llm);
    }

    #[test]
    fn heuristic_place_when_llm_invalid() {
        let signal = LlmSignal::InvalidOrAbsent(InvalidReason::MissingTag);
        let p = resolve_place(&signal, "bus stops near Lund", "Stockholm");
        assert_eq!(p.place, "Lund");
        assert_eq!(p.source, PlaceSource::Heuristic);
    }

    #[test]
    fn valid_llm_without_place_falls_through_to_heuristic() {
        let p = resolve_place(&valid(None, "amenity", "cafe"), "Find all cafes in Malmö", "Lund");
        assert_eq!(p.place, "Malmö");
        assert_eq!(p.source, PlaceSource::Heuristic);
    }

    #[test]
    fn default_place_when_nothing_matches() {
        let p = resolve_place(&absent(), "show bus stops", "Lund");
        assert_eq!(p.place, "Lund");
        assert_eq!(p.source, PlaceSource::Default);

        let p = resolve_place(&absent(), "show bus stops", "  ");
        assert_eq!(p.place, DEFAULT_PLACE);
    }

    #[test]
    fn place_heuristic_patterns() {
        assert_eq!(place_from_query("Find all cafes in Malmö").as_deref(), Some("Malmö"));
        assert_eq!(place_from_query("restaurants IN New York  ").as_deref(), Some("New York"));
        assert_eq!(place_from_query("bakeries from Helsingborg").as_deref(), Some("Helsingborg"));
        assert_eq!(place_from_query("toilets at Stortorget").as_deref(), Some("Stortorget"));
        assert_eq!(place_from_query("parking near Lund-Öresund").as_deref(), Some("Lund-Öresund"));
        assert_eq!(
            place_from_query("cafes in Malmö near the station").as_deref(),
            Some("Malmö near the station")
        );
        assert_eq!(place_from_query("show bus stops"), None);
        assert_eq!(place_from_query("cafes in 2024"), None);
        assert_eq!(place_from_query("cafes in X"), None);
        assert_eq!(place_from_query("beaches within reach"), None);
    }

    #[test]
    fn llm_tag_wins_when_valid() {
        let t = resolve_tag(&valid(None, "shop", "bakery"), &[ev(Some(("amenity", "cafe")), 0.9)]).unwrap();
        assert_eq!(t.tag, OsmTag::new("shop", "bakery"));
        assert_eq!(t.source, TagSource::Llm);
        assert_eq!(t.weight, None);
    }

    #[test]
    fn weighted_vote_picks_heaviest_tag() {
        let evidence = [
            ev(Some(("amenity", "cafe")), 0.9),
            ev(Some(("amenity", "cafe")), 0.1),
            ev(Some(("highway", "bus_stop")), 0.5),
        ];
        let t = resolve_tag(&absent(), &evidence).unwrap();
        assert_eq!(t.tag, OsmTag::new("amenity", "cafe"));
        assert_eq!(t.source, TagSource::Vote);
        approx::assert_relative_eq!(t.weight.unwrap(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn single_strong_passage_outweighs_several_weak_ones() {
        let evidence = [
            ev(Some(("shop", "bakery")), 0.95),
            ev(Some(("amenity", "cafe")), 0.3),
            ev(Some(("amenity", "cafe")), 0.3),
            ev(Some(("amenity", "cafe")), 0.3),
        ];
        assert_eq!(vote_tag(&evidence).unwrap().0, OsmTag::new("shop", "bakery"));
    }

    #[test]
    fn vote_tie_goes_to_first_seen() {
        let evidence = [
            ev(Some(("highway", "bus_stop")), 0.5),
            ev(None, 0.45),
            ev(Some(("amenity", "cafe")), 0.5),
        ];
        assert_eq!(vote_tag(&evidence).unwrap().0, OsmTag::new("highway", "bus_stop"));
    }

    #[test]
    fn untagged_evidence_fails_resolution() {
        let evidence = [ev(None, 0.9), ev(None, 0.8)];
        assert_eq!(resolve_tag(&absent(), &evidence), Err(ResolveError::NoTagResolved));
        assert_eq!(resolve_tag(&absent(), &[]), Err(ResolveError::NoTagResolved));
    }

    #[test]
    fn blank_tags_never_vote() {
        let only_blank = [ev(Some(("", "cafe")), 0.9), ev(Some(("amenity", "  ")), 0.8)];
        assert_eq!(resolve_tag(&absent(), &only_blank), Err(ResolveError::NoTagResolved));

        let mixed = [
            ev(Some(("", "cafe")), 0.9),
            ev(Some((" ", "cafe")), 0.9),
            ev(Some(("shop", "bakery")), 0.2),
        ];
        let t = resolve_tag(&absent(), &mixed).unwrap();
        assert_eq!(t.tag, OsmTag::new("shop", "bakery"));
        approx::assert_relative_eq!(t.weight.unwrap(), 0.2, epsilon = 1e-6);
    }

    #[test]
    fn resolution_result_formats_tag() {
        let r = ResolutionResult::new(
            ResolvedPlace {
                place: "Malmö".to_string(),
                source: PlaceSource::Llm,
            },
            ResolvedTag {
                tag: OsmTag::new("amenity", "cafe"),
                source: TagSource::Llm,
                weight: None,
            },
        );
        assert_eq!(r.chosen_tag(), "amenity=cafe");
        assert_eq!(
            serde_json::to_value(r.resolved_from).unwrap(),
            serde_json::json!({"place_source": "llm", "tag_source": "llm"})
        );
    }
}
