//! Geodata handoff: the collaborators that turn a resolved `(place, tag)` into
//! features on disk.
//!
//! Three stages run in order and any of them may fail:
//! geocode (place -> bounding box), bbox extract (regional PBF -> sub-region),
//! node extract (sub-region -> GeoJSON of matching nodes). Collaborator errors
//! are opaque; the orchestrator tags them with the stage they came from.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use osmrag_evidence::OsmTag;

/// `(min_lon, min_lat, max_lon, max_lat)` in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Square box of `half_side` degrees around a point.
    pub fn around(lon: f64, lat: f64, half_side: f64) -> Self {
        Self::new(lon - half_side, lat - half_side, lon + half_side, lat + half_side)
    }

    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .all(|c| c.is_finite())
            && self.min_lon <= self.max_lon
            && self.min_lat <= self.max_lat
    }
}

/// Comma-separated `min_lon,min_lat,max_lon,max_lat`, as `osmium extract --bbox` expects.
impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStage {
    Geocode,
    BboxExtract,
    NodeExtract,
}

impl fmt::Display for HandoffStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandoffStage::Geocode => "geocode",
            HandoffStage::BboxExtract => "bbox extract",
            HandoffStage::NodeExtract => "node extract",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed: {message}")]
pub struct HandoffError {
    pub stage: HandoffStage,
    pub message: String,
}

impl HandoffError {
    pub fn new(stage: HandoffStage, err: &anyhow::Error) -> Self {
        Self {
            stage,
            message: format!("{err:#}"),
        }
    }
}

/// Matching features written for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureExtraction {
    pub count: usize,
    pub geojson_path: PathBuf,
}

pub trait Geocoder: Send + Sync {
    fn geocode(&self, place: &str) -> anyhow::Result<BoundingBox>;
}

pub trait FeatureExtractor: Send + Sync {
    /// Cut the regional extract down to `bbox`; returns the sub-region file.
    fn extract_bbox(&self, place: &str, bbox: &BoundingBox) -> anyhow::Result<PathBuf>;

    /// Write the nodes of `region` carrying `tag` as GeoJSON.
    fn extract_features(&self, region: &Path, tag: &OsmTag) -> anyhow::Result<FeatureExtraction>;
}
