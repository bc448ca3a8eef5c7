//! Evidence corpus for OSM query resolution.
//!
//! Passages from the OpenStreetMap wiki, each optionally tagged with the
//! `key=value` its page documents, embedded into unit vectors and searched by
//! inner product. The store is built offline ([`build`]) and read-only at query
//! time ([`EvidenceRetriever`]).

pub mod build;
pub mod embed;
pub mod error;
pub mod retriever;
pub mod store;
pub mod types;

pub use build::{BuildSummary, ChunkingConfig, IndexBuilder, WikiPage};
pub use embed::{Embedder, TokenHashEmbedder};
#[cfg(feature = "ollama")]
pub use embed::OllamaEmbedder;
pub use error::RetrievalError;
pub use retriever::{EvidenceRetriever, IndexKind};
pub use store::{EvidencePaths, EvidenceStore};
pub use types::{EvidenceChunk, EvidenceMetaRowV1, OsmTag, RetrievedEvidence};
