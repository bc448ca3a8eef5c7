//! Vector retrieval over a loaded [`EvidenceStore`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use hnsw_rs::prelude::{DistL2, Hnsw};

use crate::embed::{dot, normalize_in_place, Embedder};
use crate::error::RetrievalError;
use crate::store::EvidenceStore;
use crate::types::RetrievedEvidence;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexKind {
    /// Exact inner-product scan over every vector.
    #[default]
    Flat,
    /// Approximate search; candidates are re-scored exactly.
    Hnsw,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Flat => f.write_str("flat"),
            IndexKind::Hnsw => f.write_str("hnsw"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" | "exact" => Ok(IndexKind::Flat),
            "hnsw" | "ann" => Ok(IndexKind::Hnsw),
            other => Err(format!("unknown index kind `{other}` (expected flat|hnsw)")),
        }
    }
}

enum SearchIndex {
    Flat,
    Hnsw(Box<Hnsw<'static, f32, DistL2>>),
}

fn build_hnsw(vectors: &[Vec<f32>]) -> Hnsw<'static, f32, DistL2> {
    let m: usize = 16;
    let ef_construction: usize = 200;
    let nb_elem = vectors.len();
    let max_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);

    let hnsw = Hnsw::<f32, DistL2>::new(m, nb_elem, max_layer, ef_construction, DistL2 {});
    for (i, v) in vectors.iter().enumerate() {
        hnsw.insert((&v[..], i));
    }
    hnsw
}

/// Read-only retrieval context: evidence, query embedder and search index.
///
/// Constructed once per process and shared by reference across queries.
pub struct EvidenceRetriever {
    store: EvidenceStore,
    embedder: Arc<dyn Embedder>,
    kind: IndexKind,
    index: SearchIndex,
}

impl fmt::Debug for EvidenceRetriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceRetriever")
            .field("backend", &self.store.backend())
            .field("model", &self.store.model())
            .field("dim", &self.store.dim())
            .field("len", &self.store.len())
            .field("kind", &self.kind)
            .finish()
    }
}

impl EvidenceRetriever {
    pub fn new(
        store: EvidenceStore,
        embedder: Arc<dyn Embedder>,
        kind: IndexKind,
    ) -> Result<Self, RetrievalError> {
        if embedder.backend() != store.backend() || embedder.model() != store.model() {
            return Err(RetrievalError::EmbedderMismatch {
                index_backend: store.backend().to_string(),
                index_model: store.model().to_string(),
                query_backend: embedder.backend().to_string(),
                query_model: embedder.model().to_string(),
            });
        }
        if let Some(dim) = embedder.dim() {
            if dim != store.dim() {
                return Err(RetrievalError::DimensionMismatch {
                    expected: store.dim(),
                    actual: dim,
                });
            }
        }

        let index = match kind {
            IndexKind::Hnsw if !store.is_empty() => {
                SearchIndex::Hnsw(Box::new(build_hnsw(store.vectors())))
            }
            _ => SearchIndex::Flat,
        };

        Ok(Self {
            store,
            embedder,
            kind,
            index,
        })
    }

    /// Load the store persisted in `dir` and build the search index.
    pub fn open(
        dir: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        kind: IndexKind,
    ) -> Result<Self, RetrievalError> {
        let dir = dir.as_ref();
        let store = EvidenceStore::load(dir)?;
        Self::new(store, embedder, kind).map_err(|e| RetrievalError::Unavailable {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Top-`k` evidence for `query`, by descending score then ascending position.
    ///
    /// Never fails: an empty store, `k == 0`, or a failing query embedder all
    /// yield an empty list. Hits whose position has no metadata row are dropped,
    /// so the result may be shorter than `k`.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedEvidence> {
        if k == 0 || self.store.is_empty() {
            return Vec::new();
        }

        let mut qv = match self.embedder.embed_one(query) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; returning no evidence");
                return Vec::new();
            }
        };
        if qv.len() != self.store.dim() {
            tracing::warn!(
                expected = self.store.dim(),
                actual = qv.len(),
                "query vector has wrong dimension; returning no evidence"
            );
            return Vec::new();
        }
        normalize_in_place(&mut qv);

        let vectors = self.store.vectors();
        let mut scored: Vec<(f32, usize)> = match &self.index {
            SearchIndex::Flat => vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (dot(&qv, v), i))
                .collect(),
            SearchIndex::Hnsw(hnsw) => {
                let ef_search = k.max(64);
                hnsw.search(&qv, k, ef_search)
                    .into_iter()
                    .filter_map(|n| vectors.get(n.d_id).map(|v| (dot(&qv, v), n.d_id)))
                    .collect()
            }
        };
        scored.sort_by(|(sa, ia), (sb, ib)| sb.total_cmp(sa).then_with(|| ia.cmp(ib)));
        scored.dedup_by_key(|(_, i)| *i);
        scored.truncate(k);

        let out: Vec<RetrievedEvidence> = scored
            .into_iter()
            .filter_map(|(score, position)| {
                let chunk = self.store.chunk(position)?;
                Some(RetrievedEvidence {
                    score,
                    position,
                    chunk: chunk.clone(),
                })
            })
            .collect();

        tracing::debug!(query, k, hits = out.len(), kind = %self.kind, "retrieved evidence");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::TokenHashEmbedder;
    use crate::types::{EvidenceChunk, OsmTag};

    fn chunk(content: &str, tag: Option<(&str, &str)>) -> EvidenceChunk {
        EvidenceChunk {
            content: content.to_string(),
            source_url: String::new(),
            title: String::new(),
            tag: tag.map(|(k, v)| OsmTag::new(k, v)),
        }
    }

    fn retriever(texts: &[(&str, Option<(&str, &str)>)], kind: IndexKind) -> EvidenceRetriever {
        let embedder = TokenHashEmbedder::new(256);
        let vectors = texts.iter().map(|(t, _)| embedder.embed_text(t)).collect();
        let chunks = texts.iter().map(|(t, tag)| chunk(t, *tag)).collect();
        let store = EvidenceStore::from_parts("token-hash", "fnv1a64", 256, vectors, chunks).unwrap();
        EvidenceRetriever::new(store, Arc::new(embedder), kind).unwrap()
    }

    const CORPUS: &[(&str, Option<(&str, &str)>)] = &[
        ("cafe coffee espresso", Some(("amenity", "cafe"))),
        ("bus stop shelter timetable", Some(("highway", "bus_stop"))),
        ("restaurant dinner menu", Some(("amenity", "restaurant"))),
        ("general mapping guidelines", None),
    ];

    #[test]
    fn flat_search_ranks_matching_chunk_first() {
        let r = retriever(CORPUS, IndexKind::Flat);
        let hits = r.retrieve("coffee cafes", 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].position, 0);
        assert_eq!(hits[0].tag(), Some(&OsmTag::new("amenity", "cafe")));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn hnsw_search_agrees_on_top_hit() {
        let r = retriever(CORPUS, IndexKind::Hnsw);
        let hits = r.retrieve("bus stop", 2);
        assert_eq!(hits[0].position, 1);
    }

    #[test]
    fn zero_k_and_empty_store_return_nothing() {
        let r = retriever(CORPUS, IndexKind::Flat);
        assert!(r.retrieve("cafe", 0).is_empty());

        let empty = retriever(&[], IndexKind::Hnsw);
        assert!(empty.retrieve("cafe", 5).is_empty());
    }

    #[test]
    fn out_of_range_positions_are_skipped() {
        let embedder = TokenHashEmbedder::new(256);
        let vectors = vec![
            embedder.embed_text("cafe coffee"),
            embedder.embed_text("cafe espresso"),
        ];
        // Only one metadata row for two vectors.
        let store = EvidenceStore::from_parts(
            "token-hash",
            "fnv1a64",
            256,
            vectors,
            vec![chunk("cafe coffee", Some(("amenity", "cafe")))],
        )
        .unwrap();
        let r = EvidenceRetriever::new(store, Arc::new(embedder), IndexKind::Flat).unwrap();
        let hits = r.retrieve("cafe", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].position, 0);
    }

    #[test]
    fn mismatched_embedder_is_rejected() {
        let store = EvidenceStore::from_parts("ollama", "nomic-embed-text", 3, vec![], vec![]).unwrap();
        let err = EvidenceRetriever::new(store, Arc::new(TokenHashEmbedder::new(3)), IndexKind::Flat)
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmbedderMismatch { .. }));

        let store = EvidenceStore::from_parts("token-hash", "fnv1a64", 8, vec![], vec![]).unwrap();
        let err = EvidenceRetriever::new(store, Arc::new(TokenHashEmbedder::new(4)), IndexKind::Flat)
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { expected: 8, actual: 4 }));
    }

    #[test]
    fn index_kind_parses() {
        assert_eq!("HNSW".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert_eq!("flat".parse::<IndexKind>().unwrap(), IndexKind::Flat);
        assert!("faiss".parse::<IndexKind>().is_err());
    }
}
