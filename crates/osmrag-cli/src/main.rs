//! osmrag CLI
//!
//! - `query`: natural-language query to GeoJSON features
//! - `direct`: place + tag straight to the geodata handoff
//! - `retrieve` / `parse`: inspect retrieval and the oracle without touching geodata
//! - `index build`: offline evidence store from an OSM wiki dump
//! - `status`: oracle reachability and store presence

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use osmrag_evidence::build::ChunkingConfig;
use osmrag_evidence::{EvidencePaths, EvidenceRetriever, IndexBuilder, IndexKind, OsmTag, RetrievedEvidence};
use osmrag_llm::{LlmSignal, OllamaOracle, OracleBackend};
use osmrag_pipeline::config::oracle_timeout;
use osmrag_pipeline::{EmbedderBackend, OsmRagConfig, QueryFailure, QueryReport};

#[derive(Parser)]
#[command(name = "osmrag")]
#[command(
    author,
    version,
    about = "Resolve natural-language map queries to OpenStreetMap features"
)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (wiki dump, evidence store, OSM extracts)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Oracle backend: ollama | openai | disabled
    #[arg(long, global = true)]
    oracle: Option<OracleBackend>,

    /// Embedding backend: token-hash | ollama
    #[arg(long, global = true)]
    embedder: Option<EmbedderBackend>,

    /// Search structure over the evidence store: flat | hnsw
    #[arg(long, global = true)]
    index: Option<IndexKind>,

    /// Oracle timeout in seconds (0 disables)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a query.
    Query {
        query: String,
        /// Oracle model
        #[arg(long)]
        model: Option<String>,
        /// Evidence passages to retrieve
        #[arg(short, long)]
        k: Option<usize>,
        /// Skip the oracle; resolve from the query text and evidence only
        #[arg(long)]
        no_llm: bool,
        #[arg(long)]
        json: bool,
    },

    /// Geocode a place and extract features for a tag, skipping retrieval and the oracle.
    Direct {
        #[arg(long)]
        place: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        /// Label recorded in the report
        #[arg(long, default_value = "direct")]
        query: String,
        #[arg(long)]
        json: bool,
    },

    /// Print the ranked evidence for a query.
    Retrieve {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Retrieve, ask the oracle and resolve, without any geodata work.
    Parse {
        query: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Evidence store maintenance.
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Oracle availability and evidence store presence.
    Status,
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Build the evidence store from a JSONL dump of OSM wiki pages.
    Build {
        /// Input JSONL (`{url, title, text}` per line); default `<data-dir>/wiki_raw.jsonl`
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output directory; default `<data-dir>/evidence_index`
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 1200)]
        chunk_size: usize,
        #[arg(long, default_value_t = 150)]
        overlap: usize,
        #[arg(long, default_value_t = 200)]
        min_chunk_chars: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Query {
            query,
            model,
            k,
            no_llm,
            json,
        } => {
            let mut cfg = cfg;
            if no_llm {
                cfg.oracle = OracleBackend::Disabled;
            }
            apply_query_overrides(&mut cfg, model, k);
            cmd_query(&cfg, &query, json)
        }
        Commands::Direct {
            place,
            key,
            value,
            query,
            json,
        } => {
            let tag = OsmTag::from_parts(Some(&key), Some(&value))
                .ok_or_else(|| anyhow!("--key and --value must both be non-empty"))?;
            cmd_direct(&cfg, &query, place.trim(), &tag, json)
        }
        Commands::Retrieve { query, k, json } => {
            cmd_retrieve(&cfg, &query, k.unwrap_or(cfg.top_k), json)
        }
        Commands::Parse {
            query,
            model,
            k,
            json,
        } => {
            let mut cfg = cfg;
            apply_query_overrides(&mut cfg, model, k);
            cmd_parse(&cfg, &query, json)
        }
        Commands::Index { command } => match command {
            IndexCommands::Build {
                input,
                out,
                chunk_size,
                overlap,
                min_chunk_chars,
                batch_size,
            } => cmd_index_build(
                &cfg,
                input.unwrap_or_else(|| cfg.wiki_jsonl.clone()),
                out.unwrap_or_else(|| cfg.index_dir.clone()),
                ChunkingConfig {
                    chunk_size,
                    overlap,
                    min_chunk_chars,
                },
                batch_size,
            ),
        },
        Commands::Status => cmd_status(&cfg),
    }
}

/// Environment first, then global flags on top.
fn load_config(cli: &Cli) -> Result<OsmRagConfig> {
    let data_dir = cli.data_dir.as_ref().map(|d| d.display().to_string());
    let mut cfg = OsmRagConfig::from_lookup(|name| match (name, &data_dir) {
        ("OSMRAG_DATA_DIR", Some(dir)) => Some(dir.clone()),
        _ => std::env::var(name).ok(),
    })?;
    if let Some(oracle) = cli.oracle {
        cfg.oracle = oracle;
    }
    if let Some(embedder) = cli.embedder {
        cfg.embedder = embedder;
    }
    if let Some(index) = cli.index {
        cfg.index_kind = index;
    }
    if cli.timeout_secs.is_some() {
        cfg.oracle_timeout = oracle_timeout(cli.timeout_secs, |_| None)?;
    }
    Ok(cfg)
}

fn apply_query_overrides(cfg: &mut OsmRagConfig, model: Option<String>, k: Option<usize>) {
    if let Some(model) = model {
        cfg.model = model;
    }
    if let Some(k) = k {
        cfg.top_k = k;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_query(cfg: &OsmRagConfig, query: &str, json: bool) -> Result<()> {
    let pipeline = cfg.build_pipeline()?;
    finish(pipeline.run(query), json)
}

fn cmd_direct(cfg: &OsmRagConfig, query: &str, place: &str, tag: &OsmTag, json: bool) -> Result<()> {
    if place.is_empty() {
        return Err(anyhow!("--place must be non-empty"));
    }
    let pipeline = cfg.build_pipeline()?;
    finish(pipeline.run_direct(query, place, tag), json)
}

fn finish(result: std::result::Result<QueryReport, QueryFailure>, json: bool) -> Result<()> {
    match result {
        Ok(report) if json => print_json(&report),
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(failure) => {
            if json {
                print_json(&failure)?;
            } else {
                print_failure(&failure);
            }
            Err(failure.into())
        }
    }
}

fn print_report(report: &QueryReport) {
    let source = |s: Option<String>| s.map(|s| format!(" ({s})")).unwrap_or_default();
    println!(
        "{} {} in {}",
        "ok".green().bold(),
        report.chosen_tag.bold(),
        report.place.bold()
    );
    println!(
        "  {} place    {}{}",
        "→".cyan(),
        report.place,
        source(report.place_source.map(|s| s.to_string()))
    );
    println!(
        "  {} tag      {}{}",
        "→".cyan(),
        report.chosen_tag,
        source(report.tag_source.map(|s| s.to_string()))
    );
    println!("  {} bbox     {}", "→".cyan(), report.bbox);
    println!("  {} features {}", "→".cyan(), report.count);
    println!("  {} geojson  {}", "→".cyan(), report.geojson_path.display());
    if !report.evidence.is_empty() {
        println!("  {} evidence", "→".yellow());
        for e in &report.evidence {
            let tag = match (&e.key, &e.value) {
                (Some(k), Some(v)) => format!("{k}={v}"),
                _ => "(untagged)".to_string(),
            };
            println!("      {:.4}  {:<24} {}", e.score, tag, e.url.dimmed());
        }
    }
    if !report.llm.llm_ok && !report.llm.llm_raw.is_empty() {
        println!("  {} oracle   {}", "→".yellow(), report.llm.llm_raw.dimmed());
    }
}

fn print_failure(failure: &QueryFailure) {
    eprintln!("{} {}", "error:".red().bold(), failure.error);
    eprintln!("  {} stage    {}", "→".cyan(), failure.stage);
    if let Some(place) = &failure.place {
        eprintln!("  {} place    {place}", "→".cyan());
    }
    if let Some(tag) = &failure.chosen_tag {
        eprintln!("  {} tag      {tag}", "→".cyan());
    }
    if !failure.evidence.is_empty() {
        eprintln!("  {} {} evidence passages retrieved", "→".yellow(), failure.evidence.len());
    }
}

fn open_retriever(cfg: &OsmRagConfig) -> Result<EvidenceRetriever> {
    EvidenceRetriever::open(&cfg.index_dir, cfg.build_embedder(), cfg.index_kind).with_context(|| {
        format!(
            "evidence store unavailable (build it with `osmrag index build`): {}",
            cfg.index_dir.display()
        )
    })
}

fn cmd_retrieve(cfg: &OsmRagConfig, query: &str, k: usize, json: bool) -> Result<()> {
    let retriever = open_retriever(cfg)?;
    let hits = retriever.retrieve(query, k);
    if json {
        return print_json(&hits);
    }
    if hits.is_empty() {
        println!("{} no evidence retrieved", "info:".yellow().bold());
    }
    for (rank, hit) in hits.iter().enumerate() {
        print_hit(rank, hit);
    }
    Ok(())
}

fn print_hit(rank: usize, hit: &RetrievedEvidence) {
    let tag = hit
        .tag()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "(untagged)".to_string());
    println!(
        "{:>2}. {:.4}  {}  {}",
        rank + 1,
        hit.score,
        tag.bold(),
        hit.chunk.source_url.dimmed()
    );
    let snippet: String = hit
        .chunk
        .content
        .chars()
        .take(160)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    println!("    {snippet}");
}

#[derive(Serialize)]
struct ParseView<'a> {
    query: &'a str,
    evidence: usize,
    outcome: &'a osmrag_llm::ParseOutcome,
    signal: &'a LlmSignal,
    resolution: &'a osmrag_pipeline::ResolutionResult,
}

fn cmd_parse(cfg: &OsmRagConfig, query: &str, json: bool) -> Result<()> {
    let pipeline = cfg.build_pipeline()?;
    let analysis = match pipeline.analyze(query) {
        Ok(a) => a,
        Err(failure) => return finish(Err(failure), json),
    };

    if json {
        return print_json(&ParseView {
            query,
            evidence: analysis.evidence.len(),
            outcome: &analysis.outcome,
            signal: &analysis.signal,
            resolution: &analysis.resolution,
        });
    }

    let r = &analysis.resolution;
    println!("{} {}", "query:".bold(), query);
    println!("  {} evidence {}", "→".cyan(), analysis.evidence.len());
    println!("  {} oracle   {:?}", "→".cyan(), analysis.outcome.status);
    match &analysis.signal {
        LlmSignal::Valid(resp) => println!(
            "  {} signal   valid (confidence {:.2}) {}",
            "→".cyan(),
            resp.confidence,
            resp.explanation.dimmed()
        ),
        LlmSignal::InvalidOrAbsent(reason) => {
            println!("  {} signal   {} {:?}", "→".yellow(), "invalid".yellow(), reason)
        }
    }
    println!(
        "  {} place    {} ({})",
        "→".cyan(),
        r.place.bold(),
        r.resolved_from.place_source
    );
    println!(
        "  {} tag      {} ({})",
        "→".cyan(),
        r.chosen_tag().bold(),
        r.resolved_from.tag_source
    );
    Ok(())
}

fn cmd_index_build(
    cfg: &OsmRagConfig,
    input: PathBuf,
    out: PathBuf,
    chunking: ChunkingConfig,
    batch_size: usize,
) -> Result<()> {
    let embedder = cfg.build_embedder();
    println!(
        "{} {} with {} ({})",
        "Indexing".green().bold(),
        input.display(),
        embedder.backend(),
        embedder.model()
    );
    let summary = IndexBuilder::new(embedder.as_ref())
        .with_chunking(chunking)
        .with_batch_size(batch_size)
        .build_from_jsonl(&input, &out)?;
    println!(
        "  {} {} pages, {} chunks ({} tagged), dim {}",
        "→".yellow(),
        summary.pages,
        summary.chunks,
        summary.tagged_chunks,
        summary.dim
    );
    println!("  {} {}", "→".cyan(), summary.paths.index.display());
    println!("  {} {}", "→".cyan(), summary.paths.metadata.display());
    Ok(())
}

fn cmd_status(cfg: &OsmRagConfig) -> Result<()> {
    let paths = EvidencePaths::in_dir(&cfg.index_dir);
    if paths.exists() {
        match open_retriever(cfg) {
            Ok(r) => println!(
                "{} evidence store {} ({} chunks, {} {}, dim {})",
                "ok".green().bold(),
                cfg.index_dir.display(),
                r.store().len(),
                r.store().backend(),
                r.store().model(),
                r.store().dim()
            ),
            Err(e) => println!("{} {e:#}", "error:".red().bold()),
        }
    } else {
        println!(
            "{} no evidence store at {} (run `osmrag index build`)",
            "missing".yellow().bold(),
            cfg.index_dir.display()
        );
    }

    let pbf = if cfg.osm_pbf.exists() {
        "ok".green().bold()
    } else {
        "missing".yellow().bold()
    };
    println!("{pbf} OSM extract {}", cfg.osm_pbf.display());

    match cfg.oracle {
        OracleBackend::Ollama => {
            let oracle = OllamaOracle::new(&cfg.ollama_host, Some(Duration::from_secs(10)))?;
            if oracle.check_available() {
                let models = oracle.list_models().unwrap_or_default();
                let has_model = models
                    .iter()
                    .any(|m| m == &cfg.model || m.split(':').next() == Some(cfg.model.as_str()));
                println!(
                    "{} ollama at {} ({} models)",
                    "ok".green().bold(),
                    oracle.host(),
                    models.len()
                );
                if !has_model {
                    println!(
                        "{} model `{}` not installed (try `ollama pull {}`)",
                        "warning:".yellow().bold(),
                        cfg.model,
                        cfg.model
                    );
                }
            } else {
                println!(
                    "{} ollama not reachable at {}; queries fall back to heuristics",
                    "warning:".yellow().bold(),
                    oracle.host()
                );
            }
        }
        OracleBackend::OpenAi => {
            if cfg.openai_api_key.trim().is_empty() {
                println!(
                    "{} {} is not set; queries fall back to heuristics",
                    "warning:".yellow().bold(),
                    osmrag_llm::openai::OPENAI_API_KEY_ENV
                );
            } else {
                println!(
                    "{} openai-compatible oracle at {}",
                    "ok".green().bold(),
                    cfg.openai_base_url
                );
            }
        }
        OracleBackend::Disabled => println!("{} oracle disabled", "info:".yellow().bold()),
    }
    Ok(())
}
