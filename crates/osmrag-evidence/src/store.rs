//! Persisted evidence store.
//!
//! On disk the store is two files in one directory:
//!
//! - `evidence.index.cbor`: a versioned CBOR [`EvidenceIndexFileV1`] holding one
//!   vector per chunk plus the embedder identity (backend, model, dim).
//! - `evidence.metadata.json`: a JSON array of [`EvidenceMetaRowV1`].
//!
//! The two are aligned by position only. Nothing links row `i` of one file to
//! row `i` of the other except the order they were written in, so a store whose
//! files were rebuilt independently can drift. Loading tolerates that drift
//! (it is logged); retrieval skips positions that fall outside the metadata.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embed::normalize_in_place;
use crate::error::RetrievalError;
use crate::types::{EvidenceChunk, EvidenceMetaRowV1};

pub const EVIDENCE_INDEX_VERSION_V1: &str = "osmrag_evidence_index_v1";
pub const INDEX_FILE_NAME: &str = "evidence.index.cbor";
pub const METADATA_FILE_NAME: &str = "evidence.metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceVectorRowV1 {
    pub vector: Vec<f32>,
    /// `sha256:<hex>` of the chunk text the vector was computed from.
    #[serde(default)]
    pub text_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceIndexFileV1 {
    pub version: String,
    pub created_at_unix_secs: u64,
    pub backend: String,
    pub model: String,
    pub dim: usize,
    pub rows: Vec<EvidenceVectorRowV1>,
    /// Free-form build settings (chunk size, overlap, source file).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EvidenceIndexFileV1 {
    pub fn new(backend: &str, model: &str, dim: usize, rows: Vec<EvidenceVectorRowV1>) -> Self {
        Self {
            version: EVIDENCE_INDEX_VERSION_V1.to_string(),
            created_at_unix_secs: now_unix_secs(),
            backend: backend.to_string(),
            model: model.to_string(),
            dim,
            rows,
            metadata: BTreeMap::new(),
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn text_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(7 + 64);
    out.push_str("sha256:");
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

pub fn encode_index_file_v1(file: &EvidenceIndexFileV1) -> Result<Vec<u8>, RetrievalError> {
    if file.version != EVIDENCE_INDEX_VERSION_V1 {
        return Err(RetrievalError::Decode(format!(
            "unsupported evidence index version: {} (expected {EVIDENCE_INDEX_VERSION_V1})",
            file.version
        )));
    }
    let mut out = Vec::new();
    ciborium::ser::into_writer(file, &mut out)
        .map_err(|e| RetrievalError::Decode(format!("failed to CBOR-encode evidence index: {e}")))?;
    Ok(out)
}

pub fn decode_index_file_v1(bytes: &[u8]) -> Result<EvidenceIndexFileV1, RetrievalError> {
    let file: EvidenceIndexFileV1 = ciborium::de::from_reader(bytes)
        .map_err(|e| RetrievalError::Decode(format!("failed to CBOR-decode evidence index: {e}")))?;
    if file.version != EVIDENCE_INDEX_VERSION_V1 {
        return Err(RetrievalError::Decode(format!(
            "unsupported evidence index version: {} (expected {EVIDENCE_INDEX_VERSION_V1})",
            file.version
        )));
    }
    if file.dim == 0 {
        return Err(RetrievalError::Decode(format!(
            "evidence index has dim=0 (backend={}, model={})",
            file.backend, file.model
        )));
    }
    for row in &file.rows {
        if row.vector.len() != file.dim {
            return Err(RetrievalError::DimensionMismatch {
                expected: file.dim,
                actual: row.vector.len(),
            });
        }
    }
    Ok(file)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidencePaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
}

impl EvidencePaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            index: dir.join(INDEX_FILE_NAME),
            metadata: dir.join(METADATA_FILE_NAME),
        }
    }

    pub fn exists(&self) -> bool {
        self.index.is_file() && self.metadata.is_file()
    }
}

/// Write both store files into `dir`, creating it if needed.
pub fn write_evidence_store(
    dir: impl AsRef<Path>,
    file: &EvidenceIndexFileV1,
    rows: &[EvidenceMetaRowV1],
) -> Result<EvidencePaths, RetrievalError> {
    if file.rows.len() != rows.len() {
        return Err(RetrievalError::Build(format!(
            "refusing to write misaligned store: {} vectors vs {} metadata rows",
            file.rows.len(),
            rows.len()
        )));
    }
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let paths = EvidencePaths::in_dir(dir);

    std::fs::write(&paths.index, encode_index_file_v1(file)?)?;
    let json = serde_json::to_vec_pretty(rows)
        .map_err(|e| RetrievalError::Build(format!("failed to serialize metadata: {e}")))?;
    std::fs::write(&paths.metadata, json)?;
    Ok(paths)
}

/// Loaded, read-only evidence: unit vectors plus their chunks.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    backend: String,
    model: String,
    dim: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<EvidenceChunk>,
}

impl EvidenceStore {
    /// Build an in-memory store. Vectors are normalized; every vector must have `dim` entries.
    pub fn from_parts(
        backend: &str,
        model: &str,
        dim: usize,
        vectors: Vec<Vec<f32>>,
        chunks: Vec<EvidenceChunk>,
    ) -> Result<Self, RetrievalError> {
        let mut vectors = vectors;
        for v in vectors.iter_mut() {
            if v.len() != dim {
                return Err(RetrievalError::DimensionMismatch {
                    expected: dim,
                    actual: v.len(),
                });
            }
            normalize_in_place(v);
        }
        if vectors.len() != chunks.len() {
            tracing::warn!(
                vectors = vectors.len(),
                chunks = chunks.len(),
                "evidence vectors and metadata have different lengths; out-of-range hits will be skipped"
            );
        }
        Ok(Self {
            backend: backend.to_string(),
            model: model.to_string(),
            dim,
            vectors,
            chunks,
        })
    }

    /// Load the store persisted in `dir`. Any failure is reported as
    /// [`RetrievalError::Unavailable`].
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let paths = EvidencePaths::in_dir(dir);

        let bytes = std::fs::read(&paths.index)
            .map_err(|e| RetrievalError::unavailable(&paths.index, e.to_string()))?;
        let file = decode_index_file_v1(&bytes)
            .map_err(|e| RetrievalError::unavailable(&paths.index, e.to_string()))?;

        let meta_bytes = std::fs::read(&paths.metadata)
            .map_err(|e| RetrievalError::unavailable(&paths.metadata, e.to_string()))?;
        let rows: Vec<EvidenceMetaRowV1> = serde_json::from_slice(&meta_bytes).map_err(|e| {
            RetrievalError::unavailable(&paths.metadata, format!("invalid metadata JSON: {e}"))
        })?;

        let drifted = file
            .rows
            .iter()
            .zip(rows.iter())
            .filter(|(v, m)| {
                v.text_digest
                    .as_deref()
                    .is_some_and(|d| d != text_digest(&m.page_content))
            })
            .count();
        if drifted > 0 {
            tracing::warn!(
                path = %paths.index.display(),
                drifted,
                "evidence vectors were computed from different text than the metadata holds"
            );
        }

        let vectors = file.rows.into_iter().map(|r| r.vector).collect();
        let chunks = rows.into_iter().map(EvidenceChunk::from).collect();
        let store = Self::from_parts(&file.backend, &file.model, file.dim, vectors, chunks)
            .map_err(|e| RetrievalError::unavailable(&paths.index, e.to_string()))?;

        tracing::info!(
            path = %paths.index.display(),
            vectors = store.vectors.len(),
            chunks = store.chunks.len(),
            backend = %store.backend,
            model = %store.model,
            dim = store.dim,
            "loaded evidence store"
        );
        Ok(store)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn chunks(&self) -> &[EvidenceChunk] {
        &self.chunks
    }

    pub fn chunk(&self, position: usize) -> Option<&EvidenceChunk> {
        self.chunks.get(position)
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OsmTag;

    fn meta(content: &str, key: Option<&str>, value: Option<&str>) -> EvidenceMetaRowV1 {
        EvidenceMetaRowV1 {
            page_content: content.to_string(),
            url: "https://wiki.openstreetmap.org/wiki/Tag:amenity%3Dcafe".to_string(),
            title: "Tag:amenity=cafe".to_string(),
            key: key.map(str::to_string),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn text_digest_is_prefixed_hex() {
        let d = text_digest("hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), 7 + 64);
        assert_eq!(
            d,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn decode_rejects_wrong_version_and_zero_dim() {
        let mut file = EvidenceIndexFileV1::new("token-hash", "fnv1a64", 2, vec![]);
        file.version = "something_else".to_string();
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&file, &mut bytes).unwrap();
        assert!(matches!(decode_index_file_v1(&bytes), Err(RetrievalError::Decode(_))));

        let file = EvidenceIndexFileV1::new("token-hash", "fnv1a64", 0, vec![]);
        let bytes = encode_index_file_v1(&file).unwrap();
        assert!(matches!(decode_index_file_v1(&bytes), Err(RetrievalError::Decode(_))));
    }

    #[test]
    fn decode_rejects_rows_with_wrong_dimension() {
        let file = EvidenceIndexFileV1::new(
            "token-hash",
            "fnv1a64",
            3,
            vec![EvidenceVectorRowV1 {
                vector: vec![1.0, 0.0],
                text_digest: None,
            }],
        );
        let bytes = encode_index_file_v1(&file).unwrap();
        assert!(matches!(
            decode_index_file_v1(&bytes),
            Err(RetrievalError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn write_then_load_preserves_alignment_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            meta("Cafés serve coffee.", Some("amenity"), Some("cafe")),
            meta("General map features page.", None, None),
        ];
        let file = EvidenceIndexFileV1::new(
            "token-hash",
            "fnv1a64",
            2,
            vec![
                EvidenceVectorRowV1 {
                    vector: vec![3.0, 4.0],
                    text_digest: Some(text_digest(&rows[0].page_content)),
                },
                EvidenceVectorRowV1 {
                    vector: vec![0.0, 2.0],
                    text_digest: Some(text_digest(&rows[1].page_content)),
                },
            ],
        );
        let paths = write_evidence_store(dir.path(), &file, &rows).unwrap();
        assert!(paths.exists());

        let store = EvidenceStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.dim(), 2);
        assert_eq!(store.backend(), "token-hash");
        assert_eq!(store.chunk(0).unwrap().tag, Some(OsmTag::new("amenity", "cafe")));
        assert!(store.chunk(1).unwrap().tag.is_none());
        approx::assert_relative_eq!(store.vectors()[0][0], 0.6, epsilon = 1e-6);
        approx::assert_relative_eq!(store.vectors()[1][1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn load_missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = EvidenceStore::load(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { .. }), "{err}");
    }

    #[test]
    fn load_with_corrupt_metadata_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let file = EvidenceIndexFileV1::new("token-hash", "fnv1a64", 2, vec![]);
        write_evidence_store(dir.path(), &file, &[]).unwrap();
        std::fs::write(dir.path().join(METADATA_FILE_NAME), b"{not json").unwrap();

        let err = EvidenceStore::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("invalid metadata JSON"), "{err}");
    }

    #[test]
    fn length_mismatch_is_tolerated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = EvidenceIndexFileV1::new(
            "token-hash",
            "fnv1a64",
            2,
            vec![EvidenceVectorRowV1 {
                vector: vec![1.0, 0.0],
                text_digest: None,
            }],
        );
        write_evidence_store(dir.path(), &file, &[meta("x", None, None)]).unwrap();
        // Simulate a metadata file rebuilt independently with fewer rows.
        std::fs::write(dir.path().join(METADATA_FILE_NAME), b"[]").unwrap();

        let store = EvidenceStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.chunks().is_empty());
    }

    #[test]
    fn writer_refuses_misaligned_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = EvidenceIndexFileV1::new("token-hash", "fnv1a64", 2, vec![]);
        let err = write_evidence_store(dir.path(), &file, &[meta("x", None, None)]).unwrap_err();
        assert!(matches!(err, RetrievalError::Build(_)));
    }
}
