//! Extraction through the `osmium` command-line tool.
//!
//! `extract --bbox` cuts the regional PBF to the geocoded box,
//! `tags-filter n/key=value` keeps matching nodes, and `export` writes them
//! as a GeoJSON FeatureCollection.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use osmrag_evidence::OsmTag;

use crate::handoff::{BoundingBox, FeatureExtraction, FeatureExtractor};

pub const DEFAULT_OSMIUM_BIN: &str = "osmium";
pub const DEFAULT_OSMIUM_TIMEOUT_SECS: u64 = 600;

fn fold_char(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ß' => "ss",
        'ś' | 'š' | 'ş' => "s",
        'ť' | 'ţ' => "t",
        'þ' => "th",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    })
}

/// Filesystem-safe form of a place name: lowercase ASCII, runs of anything
/// else collapsed to `_`, `unknown` when nothing survives.
pub fn safe_slug(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.trim().to_lowercase().chars() {
        match fold_char(c) {
            Some(s) => folded.push_str(s),
            None => folded.push(c),
        }
    }

    let mut out = String::with_capacity(folded.len());
    let mut pending_sep = false;
    for c in folded.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Wait for `child`, killing it once `timeout` elapses.
pub fn wait_with_output_timeout(
    mut child: std::process::Child,
    timeout: Option<Duration>,
    context: &str,
) -> Result<Output> {
    let Some(timeout) = timeout else {
        return child
            .wait_with_output()
            .map_err(|e| anyhow!("{context}: {e}"));
    };

    let start = Instant::now();
    loop {
        if child
            .try_wait()
            .map_err(|e| anyhow!("{context}: failed to poll child status: {e}"))?
            .is_some()
        {
            break;
        }

        if start.elapsed() > timeout {
            let _ = child.kill();
            let output = child
                .wait_with_output()
                .map_err(|e| anyhow!("{context}: failed to collect output after kill: {e}"))?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{context}: timed out after {}s. stderr: {}",
                timeout.as_secs_f64(),
                stderr.trim()
            );
        }

        thread::sleep(Duration::from_millis(50));
    }

    child
        .wait_with_output()
        .map_err(|e| anyhow!("{context}: failed to collect output: {e}"))
}

/// Number of features in a GeoJSON FeatureCollection file.
pub fn count_geojson_features(path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if doc.get("type").and_then(|t| t.as_str()) != Some("FeatureCollection") {
        bail!("{} is not a GeoJSON FeatureCollection", path.display());
    }
    Ok(doc
        .get("features")
        .and_then(|f| f.as_array())
        .map_or(0, Vec::len))
}

#[derive(Debug, Clone)]
pub struct OsmiumExtractor {
    program: PathBuf,
    /// Arguments placed before the osmium subcommand (e.g. for a container wrapper).
    leading_args: Vec<OsString>,
    input_pbf: PathBuf,
    output_dir: PathBuf,
    geojson_path: PathBuf,
    timeout: Option<Duration>,
}

impl OsmiumExtractor {
    pub fn new(input_pbf: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            program: PathBuf::from(DEFAULT_OSMIUM_BIN),
            leading_args: Vec::new(),
            input_pbf: input_pbf.into(),
            geojson_path: output_dir.join("output.geojson"),
            output_dir,
            timeout: Some(Duration::from_secs(DEFAULT_OSMIUM_TIMEOUT_SECS)),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_geojson_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.geojson_path = path.into();
        self
    }

    /// `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input_pbf(&self) -> &Path {
        &self.input_pbf
    }

    pub fn geojson_path(&self) -> &Path {
        &self.geojson_path
    }

    pub fn region_path(&self, place: &str) -> PathBuf {
        self.output_dir
            .join(format!("sub_{}.osm.pbf", safe_slug(place)))
    }

    fn run(&self, subcommand: &str, args: Vec<OsString>) -> Result<()> {
        let context = format!("osmium {subcommand}");
        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(subcommand)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to run `{}` (is osmium-tool installed?)",
                    self.program.display()
                )
            })?;
        let output = wait_with_output_timeout(child, self.timeout, &context)?;
        if !output.status.success() {
            bail!(
                "{context} failed ({}): {}\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }
        Ok(())
    }
}

fn expect_output(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{what} finished but {} was not created", path.display());
    }
    Ok(())
}

impl FeatureExtractor for OsmiumExtractor {
    fn extract_bbox(&self, place: &str, bbox: &BoundingBox) -> Result<PathBuf> {
        if !self.input_pbf.exists() {
            bail!("input PBF file not found: {}", self.input_pbf.display());
        }
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;

        let out = self.region_path(place);
        tracing::info!(place, %bbox, output = %out.display(), "extracting bounding box");
        self.run(
            "extract",
            vec![
                "--bbox".into(),
                bbox.to_string().into(),
                self.input_pbf.clone().into(),
                "-o".into(),
                out.clone().into(),
                "-O".into(),
                "--set-bounds".into(),
            ],
        )?;
        expect_output(&out, "osmium extract")?;
        Ok(out)
    }

    fn extract_features(&self, region: &Path, tag: &OsmTag) -> Result<FeatureExtraction> {
        if !region.exists() {
            bail!("region file not found: {}", region.display());
        }
        let filtered = self.output_dir.join(format!(
            "filtered_{}.osm.pbf",
            safe_slug(&format!("{}_{}", tag.key, tag.value))
        ));
        if let Some(parent) = self.geojson_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        self.run(
            "tags-filter",
            vec![
                region.into(),
                format!("n/{}={}", tag.key, tag.value).into(),
                "-o".into(),
                filtered.clone().into(),
                "-O".into(),
            ],
        )?;
        expect_output(&filtered, "osmium tags-filter")?;

        self.run(
            "export",
            vec![
                filtered.clone().into(),
                "-f".into(),
                "geojson".into(),
                "-o".into(),
                self.geojson_path.clone().into(),
                "-O".into(),
            ],
        )?;
        expect_output(&self.geojson_path, "osmium export")?;

        let count = count_geojson_features(&self.geojson_path)?;
        tracing::info!(%tag, count, geojson = %self.geojson_path.display(), "extracted features");
        Ok(FeatureExtraction {
            count,
            geojson_path: self.geojson_path.clone(),
        })
    }
}
