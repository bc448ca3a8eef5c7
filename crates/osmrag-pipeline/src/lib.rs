//! OSM query pipeline.
//!
//! Wires the evidence retriever and the oracle into a single decision per
//! query (place, tag, provenance), then hands that decision to the geodata
//! collaborators: Nominatim for the bounding box, osmium for the features.

pub mod config;
pub mod handoff;
pub mod nominatim;
pub mod orchestrator;
pub mod osmium;
pub mod report;
pub mod resolve;

pub use config::{EmbedderBackend, OsmRagConfig};
pub use handoff::{BoundingBox, FeatureExtraction, FeatureExtractor, Geocoder, HandoffError, HandoffStage};
pub use nominatim::NominatimGeocoder;
pub use orchestrator::{
    Analysis, EvidenceSource, LazyEvidenceRetriever, PipelineError, PipelineSettings, PipelineStage,
    QueryFailure, QueryPipeline,
};
pub use osmium::{safe_slug, OsmiumExtractor};
pub use report::{EvidenceSummary, LlmTrace, QueryReport};
pub use resolve::{
    place_from_query, resolve_place, resolve_tag, vote_tag, PlaceSource, Provenance, ResolutionResult,
    ResolveError, ResolvedPlace, ResolvedTag, TagSource, DEFAULT_PLACE,
};
