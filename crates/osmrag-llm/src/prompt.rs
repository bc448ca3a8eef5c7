//! Prompt rendering for query parsing.

use std::fmt::Write as _;

use osmrag_evidence::RetrievedEvidence;

/// Characters of each evidence passage shown to the oracle.
pub const EVIDENCE_SNIPPET_CHARS: usize = 600;

pub const SYSTEM_PROMPT: &str = r#"You are a GIS assistant that maps natural-language requests onto OpenStreetMap tags.
Ground every decision in the OSM Wiki evidence supplied with the request.
Reply with a single JSON object and nothing else: no markdown, no prose around it.

Response schema:
{
  "place": "<string or null>",
  "tag": {"key": "<string>", "value": "<string>"},
  "confidence": <number between 0.0 and 1.0>,
  "explanation": "<one short sentence>"
}

Rules:
1. "place" is the city, region or area named in the request. Use null when none is named.
2. "tag" must be one key=value pair that appears in the evidence (for example amenity=cafe,
   highway=bus_stop, shop=supermarket). Never invent a tag that the evidence does not show.
3. "confidence" reflects how well the evidence supports the chosen tag.

Examples:
- "Find all cafes in Malmö" -> {"place": "Malmö", "tag": {"key": "amenity", "value": "cafe"}, ...}
- "Show bus stops" -> {"place": null, "tag": {"key": "highway", "value": "bus_stop"}, ...}
- "restaurants in Lund" -> {"place": "Lund", "tag": {"key": "amenity", "value": "restaurant"}, ...}
"#;

/// First `max_chars` characters on a single line.
pub fn single_line_snippet(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    truncated.replace(['\n', '\r'], " ").trim().to_string()
}

pub fn render_evidence(evidence: &[RetrievedEvidence]) -> String {
    let mut out = String::new();
    for (i, e) in evidence.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let tag = e
            .tag()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "(none)".to_string());
        let _ = write!(
            out,
            "[Evidence {}]\n  Tag: {}\n  URL: {}\n  Score: {:.3}\n  Content: {}\n",
            i + 1,
            tag,
            e.chunk.source_url,
            e.score,
            single_line_snippet(&e.chunk.content, EVIDENCE_SNIPPET_CHARS),
        );
    }
    out
}

pub fn render_user_prompt(query: &str, evidence: &[RetrievedEvidence]) -> String {
    let rendered = if evidence.is_empty() {
        "(no evidence retrieved)\n".to_string()
    } else {
        render_evidence(evidence)
    };
    format!(
        "User query:\n\"{query}\"\n\n\
         OSM Wiki evidence (ranked by semantic similarity):\n{rendered}\n\
         Using the query and the evidence above, return one JSON object with:\n\
         - \"place\": the location named in the query, or null\n\
         - \"tag\": the best matching OSM tag from the evidence, as {{\"key\": \"...\", \"value\": \"...\"}}\n\
         - \"confidence\": a number from 0.0 to 1.0\n\
         - \"explanation\": a brief reason for the choice\n\n\
         Return only the JSON object."
    )
}
