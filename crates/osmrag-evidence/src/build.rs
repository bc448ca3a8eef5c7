//! Offline evidence index builder.
//!
//! Input is a JSONL dump of OSM wiki pages (`{"url", "title", "text"}` per
//! line). Each page is cleaned, split into overlapping character windows,
//! tagged from its URL, embedded, and written as an evidence store.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::embed::Embedder;
use crate::error::RetrievalError;
use crate::store::{
    text_digest, write_evidence_store, EvidenceIndexFileV1, EvidencePaths, EvidenceVectorRowV1,
};
use crate::types::{EvidenceChunk, EvidenceMetaRowV1, OsmTag};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WikiPage {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

pub fn load_wiki_jsonl(path: impl AsRef<Path>) -> Result<Vec<WikiPage>, RetrievalError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let mut pages = Vec::new();
    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let page: WikiPage = serde_json::from_str(line).map_err(|e| {
            RetrievalError::Build(format!("{}:{}: invalid page JSON: {e}", path.display(), lineno + 1))
        })?;
        pages.push(page);
    }
    Ok(pages)
}

/// `https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe` -> `amenity=cafe`.
pub fn infer_tag_from_url(url: &str) -> Option<OsmTag> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Tag:([^%]+)%3D(.+)$").expect("valid regex"));
    let caps = re.captures(url)?;
    OsmTag::from_parts(caps.get(1).map(|m| m.as_str()), caps.get(2).map(|m| m.as_str()))
}

/// Drop wiki navigation lines and near-empty lines; collapse runs of spaces/tabs.
pub fn clean_wiki_text(text: &str) -> String {
    const NOISE_LINES: &[&str] = &[
        "Jump to navigation",
        "Jump to search",
        "From OpenStreetMap Wiki",
        "In other languages",
        "Other languages...",
        "Contents",
        "Tools for this tag",
        "More details at tag",
    ];

    static SPACES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"));

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| !NOISE_LINES.contains(s))
        // Language menus are mostly one- and two-letter entries.
        .filter(|s| s.chars().count() > 2)
        .collect();
    spaces.replace_all(&kept.join("\n"), " ").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    /// Chunks shorter than this (after trimming) are discarded.
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1200,
            overlap: 150,
            min_chunk_chars: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.chunk_size <= self.overlap {
            return Err(RetrievalError::Build(format!(
                "chunk_size ({}) must be greater than overlap ({})",
                self.chunk_size, self.overlap
            )));
        }
        Ok(())
    }
}

/// Character windows of `chunk_size` advancing by `chunk_size - overlap`.
pub fn chunk_text(text: &str, cfg: &ChunkingConfig) -> Result<Vec<String>, RetrievalError> {
    cfg.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < n {
        let end = (start + cfg.chunk_size).min(n);
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if piece.chars().count() >= cfg.min_chunk_chars {
            out.push(piece.to_string());
        }
        if end == n {
            break;
        }
        start = end - cfg.overlap;
    }
    Ok(out)
}

pub fn chunk_pages(
    pages: &[WikiPage],
    cfg: &ChunkingConfig,
) -> Result<Vec<EvidenceChunk>, RetrievalError> {
    let mut chunks = Vec::new();
    for page in pages {
        let tag = infer_tag_from_url(&page.url);
        let cleaned = clean_wiki_text(&page.text);
        for piece in chunk_text(&cleaned, cfg)? {
            chunks.push(EvidenceChunk {
                content: piece,
                source_url: page.url.clone(),
                title: page.title.clone(),
                tag: tag.clone(),
            });
        }
    }
    Ok(chunks)
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub pages: usize,
    pub chunks: usize,
    pub tagged_chunks: usize,
    pub dim: usize,
    pub paths: EvidencePaths,
}

pub struct IndexBuilder<'a> {
    embedder: &'a dyn Embedder,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(embedder: &'a dyn Embedder) -> Self {
        Self {
            embedder,
            chunking: ChunkingConfig::default(),
            batch_size: 32,
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Chunk and embed `pages`, returning the two aligned halves of a store.
    pub fn build(
        &self,
        pages: &[WikiPage],
    ) -> Result<(EvidenceIndexFileV1, Vec<EvidenceMetaRowV1>), RetrievalError> {
        let chunks = chunk_pages(pages, &self.chunking)?;
        if chunks.is_empty() {
            return Err(RetrievalError::Build(
                "no chunks generated; check the input pages and cleaning rules".to_string(),
            ));
        }
        tracing::info!(pages = pages.len(), chunks = chunks.len(), "chunked wiki pages");

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let batches: Vec<Vec<Vec<f32>>> = texts
            .par_chunks(self.batch_size)
            .map(|batch| self.embedder.embed(batch))
            .collect::<Result<_, _>>()?;
        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        if vectors.len() != chunks.len() {
            return Err(RetrievalError::Build(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let dim = self
            .embedder
            .dim()
            .unwrap_or_else(|| vectors.first().map(Vec::len).unwrap_or(0));
        if dim == 0 {
            return Err(RetrievalError::Build("embedder produced empty vectors".to_string()));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(RetrievalError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }

        let rows = vectors
            .into_iter()
            .zip(chunks.iter())
            .map(|(vector, chunk)| EvidenceVectorRowV1 {
                vector,
                text_digest: Some(text_digest(&chunk.content)),
            })
            .collect();
        let mut file =
            EvidenceIndexFileV1::new(self.embedder.backend(), self.embedder.model(), dim, rows);
        file.metadata
            .insert("chunk_size".to_string(), self.chunking.chunk_size.to_string());
        file.metadata
            .insert("overlap".to_string(), self.chunking.overlap.to_string());
        file.metadata.insert("pages".to_string(), pages.len().to_string());

        let meta = chunks.iter().map(EvidenceMetaRowV1::from).collect();
        Ok((file, meta))
    }

    pub fn build_and_write(
        &self,
        pages: &[WikiPage],
        out_dir: impl AsRef<Path>,
    ) -> Result<BuildSummary, RetrievalError> {
        let (file, meta) = self.build(pages)?;
        let tagged_chunks = meta.iter().filter(|m| m.key.is_some()).count();
        let paths = write_evidence_store(out_dir, &file, &meta)?;
        tracing::info!(
            index = %paths.index.display(),
            metadata = %paths.metadata.display(),
            chunks = meta.len(),
            "wrote evidence store"
        );
        Ok(BuildSummary {
            pages: pages.len(),
            chunks: meta.len(),
            tagged_chunks,
            dim: file.dim,
            paths,
        })
    }

    /// Convenience: read a JSONL dump and write the store into `out_dir`.
    pub fn build_from_jsonl(
        &self,
        input: impl AsRef<Path>,
        out_dir: impl AsRef<Path>,
    ) -> Result<BuildSummary, RetrievalError> {
        let pages = load_wiki_jsonl(input)?;
        self.build_and_write(&pages, out_dir)
    }
}

/// Default data layout: `<data_dir>/wiki_raw.jsonl`.
pub fn default_wiki_jsonl(data_dir: impl AsRef<Path>) -> PathBuf {
    data_dir.as_ref().join("wiki_raw.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::TokenHashEmbedder;
    use crate::store::EvidenceStore;

    fn long_text(word: &str, n: usize) -> String {
        std::iter::repeat(word).take(n).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn infers_tag_from_wiki_url() {
        assert_eq!(
            infer_tag_from_url("https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe"),
            Some(OsmTag::new("amenity", "cafe"))
        );
        assert_eq!(
            infer_tag_from_url("https://wiki.openstreetmap.org/wiki/Tag:highway%3Dbus_stop"),
            Some(OsmTag::new("highway", "bus_stop"))
        );
        assert_eq!(
            infer_tag_from_url("https://wiki.openstreetmap.org/wiki/Key:amenity"),
            None
        );
    }

    #[test]
    fn cleaning_drops_navigation_and_short_lines() {
        let raw = "Jump to navigation\r\nJump to search\nde\nfr\n  A   cafe\tserves   coffee.  \n\nContents\nHow to map";
        assert_eq!(clean_wiki_text(raw), "A cafe serves coffee.\nHow to map");
    }

    #[test]
    fn chunking_overlaps_and_drops_tiny_tail() {
        let cfg = ChunkingConfig {
            chunk_size: 10,
            overlap: 3,
            min_chunk_chars: 4,
        };
        let chunks = chunk_text("abcdefghijklmnopq", &cfg).unwrap();
        // windows: [0,10) [7,17)
        assert_eq!(chunks, vec!["abcdefghij", "hijklmnopq"]);

        let chunks = chunk_text("abcdefghijkl", &cfg).unwrap();
        // [0,10) then [7,12) = "hijkl"
        assert_eq!(chunks, vec!["abcdefghij", "hijkl"]);

        let cfg = ChunkingConfig { min_chunk_chars: 6, ..cfg };
        assert_eq!(chunk_text("abcdefghijkl", &cfg).unwrap(), vec!["abcdefghij"]);
    }

    #[test]
    fn chunking_counts_characters_not_bytes() {
        let cfg = ChunkingConfig {
            chunk_size: 4,
            overlap: 1,
            min_chunk_chars: 1,
        };
        let chunks = chunk_text("åäöüéè", &cfg).unwrap();
        assert_eq!(chunks, vec!["åäöü", "üéè"]);
    }

    #[test]
    fn chunk_size_must_exceed_overlap() {
        let cfg = ChunkingConfig {
            chunk_size: 100,
            overlap: 100,
            min_chunk_chars: 1,
        };
        assert!(matches!(chunk_text("text", &cfg), Err(RetrievalError::Build(_))));
    }

    #[test]
    fn builder_rejects_empty_result() {
        let embedder = TokenHashEmbedder::new(32);
        let pages = vec![WikiPage {
            url: "https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe".to_string(),
            title: "cafe".to_string(),
            text: "too short".to_string(),
        }];
        let err = IndexBuilder::new(&embedder).build(&pages).unwrap_err();
        assert!(err.to_string().contains("no chunks generated"));
    }

    #[test]
    fn builder_writes_loadable_store() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("wiki_raw.jsonl");
        let pages = [
            WikiPage {
                url: "https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe".to_string(),
                title: "Tag:amenity=cafe".to_string(),
                text: long_text("cafe coffee", 60),
            },
            WikiPage {
                url: "https://wiki.openstreetmap.org/wiki/Map_features".to_string(),
                title: "Map features".to_string(),
                text: long_text("features overview", 60),
            },
        ];
        let body: String = pages
            .iter()
            .map(|p| serde_json::to_string(p).unwrap() + "\n\n")
            .collect();
        std::fs::write(&jsonl, body).unwrap();

        let embedder = TokenHashEmbedder::new(64);
        let summary = IndexBuilder::new(&embedder)
            .with_batch_size(1)
            .build_from_jsonl(&jsonl, dir.path().join("index"))
            .unwrap();
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.tagged_chunks, 1);
        assert_eq!(summary.dim, 64);

        let store = EvidenceStore::load(dir.path().join("index")).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.chunk(0).unwrap().tag, Some(OsmTag::new("amenity", "cafe")));
        assert!(store.chunk(1).unwrap().tag.is_none());
    }

    #[test]
    fn malformed_jsonl_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("bad.jsonl");
        std::fs::write(&jsonl, "{\"url\":\"a\"}\n{oops\n").unwrap();
        let err = load_wiki_jsonl(&jsonl).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }
}
