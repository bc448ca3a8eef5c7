//! Evidence data model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An OpenStreetMap `key=value` classification, e.g. `amenity=cafe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OsmTag {
    pub key: String,
    pub value: String,
}

impl OsmTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Build a tag only when both halves are present and non-empty.
    pub fn from_parts(key: Option<&str>, value: Option<&str>) -> Option<Self> {
        match (key.map(str::trim), value.map(str::trim)) {
            (Some(k), Some(v)) if !k.is_empty() && !v.is_empty() => Some(Self::new(k, v)),
            _ => None,
        }
    }
}

impl fmt::Display for OsmTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// One indexed passage. Created at index-build time, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceChunk {
    pub content: String,
    pub source_url: String,
    pub title: String,
    pub tag: Option<OsmTag>,
}

/// Metadata row as persisted next to the vector index.
///
/// Row `i` describes vector `i`; the two files are aligned by position only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetaRowV1 {
    #[serde(default)]
    pub page_content: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl From<EvidenceMetaRowV1> for EvidenceChunk {
    fn from(row: EvidenceMetaRowV1) -> Self {
        let tag = OsmTag::from_parts(row.key.as_deref(), row.value.as_deref());
        Self {
            content: row.page_content,
            source_url: row.url,
            title: row.title,
            tag,
        }
    }
}

impl From<&EvidenceChunk> for EvidenceMetaRowV1 {
    fn from(chunk: &EvidenceChunk) -> Self {
        Self {
            page_content: chunk.content.clone(),
            url: chunk.source_url.clone(),
            title: chunk.title.clone(),
            key: chunk.tag.as_ref().map(|t| t.key.clone()),
            value: chunk.tag.as_ref().map(|t| t.value.clone()),
        }
    }
}

/// An evidence chunk annotated with its similarity to one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEvidence {
    pub score: f32,
    /// Position of the chunk in the evidence store.
    pub position: usize,
    pub chunk: EvidenceChunk,
}

impl RetrievedEvidence {
    pub fn tag(&self) -> Option<&OsmTag> {
        self.chunk.tag.as_ref()
    }
}
