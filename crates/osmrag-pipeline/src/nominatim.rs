//! Nominatim geocoder.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::handoff::{BoundingBox, Geocoder};

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_USER_AGENT: &str = "osmrag/0.1 (OSM query resolution; educational use)";
pub const DEFAULT_GEOCODE_TIMEOUT_SECS: u64 = 30;

/// Half-side, in degrees, of the box built around a point-only result.
pub const POINT_BBOX_HALF_SIDE: f64 = 0.05;

/// One search hit. Nominatim serializes coordinates as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct NominatimPlace {
    pub lat: String,
    pub lon: String,
    /// `[south, north, west, east]`.
    #[serde(default)]
    pub boundingbox: Vec<String>,
    #[serde(default)]
    pub display_name: String,
}

fn parse_coord(s: &str, what: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| anyhow!("nominatim returned a non-numeric {what}: {s:?}"))
}

fn boundingbox_coords(south: &str, north: &str, west: &str, east: &str) -> Result<BoundingBox> {
    Ok(BoundingBox::new(
        parse_coord(west, "west")?,
        parse_coord(south, "south")?,
        parse_coord(east, "east")?,
        parse_coord(north, "north")?,
    ))
}

/// Bounding box of a search hit; a ±0.05° box around the point when the hit
/// has no usable `boundingbox`.
pub fn bbox_from_place(place: &NominatimPlace) -> Result<BoundingBox> {
    if let [south, north, west, east] = place.boundingbox.as_slice() {
        match boundingbox_coords(south, north, west, east) {
            Ok(bbox) if bbox.is_valid() => return Ok(bbox),
            Ok(bbox) => tracing::debug!(?bbox, "ignoring degenerate nominatim bounding box"),
            Err(err) => tracing::debug!(error = %err, "ignoring malformed nominatim bounding box"),
        }
    }
    let lat = parse_coord(&place.lat, "lat")?;
    let lon = parse_coord(&place.lon, "lon")?;
    Ok(BoundingBox::around(lon, lat, POINT_BBOX_HALF_SIDE))
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    endpoint: Url,
    user_agent: String,
    /// Pause after each request; the public instance allows one per second.
    politeness: Duration,
    client: reqwest::blocking::Client,
}

impl NominatimGeocoder {
    pub fn new(endpoint: &str, user_agent: &str, politeness: Duration, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint.trim())
            .with_context(|| format!("invalid nominatim endpoint {endpoint:?}"))?;
        let mut builder = reqwest::blocking::Client::builder().timeout(timeout);
        if matches!(endpoint.host_str(), Some("localhost" | "127.0.0.1" | "[::1]")) {
            builder = builder.no_proxy();
        }
        let client = builder.build().context("failed to build http client")?;
        Ok(Self {
            endpoint,
            user_agent: user_agent.to_string(),
            politeness,
            client,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn search_url(&self, place: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", place)
            .append_pair("format", "json")
            .append_pair("limit", "1");
        url
    }

    fn search(&self, place: &str) -> Result<Vec<NominatimPlace>> {
        let url = self.search_url(place);
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .with_context(|| format!("nominatim request failed: {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!("nominatim http error {status}: {}", body.trim());
        }
        resp.json()
            .context("nominatim returned invalid JSON")
    }
}

impl Geocoder for NominatimGeocoder {
    fn geocode(&self, place: &str) -> Result<BoundingBox> {
        let place = place.trim();
        if place.is_empty() {
            bail!("cannot geocode an empty place name");
        }
        let result = self.search(place);
        if !self.politeness.is_zero() {
            thread::sleep(self.politeness);
        }
        let hit = result?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no results for place: {place}"))?;
        let bbox = bbox_from_place(&hit)?;
        tracing::info!(place, display_name = %hit.display_name, %bbox, "geocoded place");
        Ok(bbox)
    }
}
