#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use critic_harness::cache::SqliteJudgementCache;
use critic_harness::config::CriticConfig;
use critic_harness::critic::Critic;
use critic_harness::draft::Draft;
use critic_harness::gateway::{ProviderGateway, TracingUsageSink};
use critic_harness::reference::{select_initial_anchors, Corpus, Scope};
use critic_harness::trace::{AuditSink, JsonlAuditSink};

#[derive(Parser)]
#[command(name = "critic", version, about = "Blind comparative-judgment critic CLI")]
struct Cli {
    /// Layered config file (JSON); env overrides apply on top
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Critique a draft against the reference corpus (LLM calls)
    Score {
        #[arg(long)]
        corpus: PathBuf,
        /// Draft JSON (title, problem, method, claim, experiments)
        #[arg(long)]
        draft: PathBuf,
        /// Pattern the draft was written from
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        no_cache: bool,
        /// Append audit events to this JSONL file
        #[arg(long)]
        audit: Option<PathBuf>,
    },
    /// Show the initial anchors selected for a pattern
    Anchors {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        pattern: String,
    },
    /// Print score quantiles for a pattern and the whole corpus
    Quantiles {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print the effective configuration and any corrections
    Config,
    /// Export the judgement cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the judgement cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Serialize)]
struct AnchorRow<'a> {
    label: &'a str,
    id: &'a str,
    score10: f64,
    weight: f64,
    source: &'a critic_harness::reference::AnchorSource,
}

#[derive(Serialize)]
struct QuantileReport {
    pattern: Option<PatternQuantiles>,
    global: Option<critic_harness::reference::QuantileSummary>,
}

#[derive(Serialize)]
struct PatternQuantiles {
    id: String,
    summary: Option<critic_harness::reference::QuantileSummary>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let (config, warnings) = CriticConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Score {
            corpus,
            draft,
            pattern,
            out,
            cache,
            no_cache,
            audit,
        } => {
            let corpus = Corpus::load(&corpus)?;
            let draft: Draft = read_json(&draft)?;
            let pattern = corpus
                .catalog
                .get(&pattern)
                .cloned()
                .ok_or_else(|| format!("unknown pattern: {pattern}"))?;

            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink), config.retry.clone())?;
            let mut critic = Critic::new(Arc::new(gateway), Arc::new(corpus.index), config);
            if !no_cache {
                let path = cache.unwrap_or_else(SqliteJudgementCache::default_path);
                critic = critic.with_cache(Arc::new(SqliteJudgementCache::new(path)?));
            }
            let mut worker = None;
            if let Some(path) = audit {
                let (sink, w) = JsonlAuditSink::new(path)?;
                let sink: Arc<dyn AuditSink> = Arc::new(sink);
                critic = critic.with_audit(sink);
                worker = Some(w);
            }

            let report = critic.review(&draft, &pattern).await?;
            // Release the sink so the writer thread drains and exits.
            drop(critic);
            if let Some(w) = worker {
                w.join()?;
            }

            match out {
                Some(path) => write_json(&path, &report)?,
                None => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Anchors { corpus, pattern } => {
            let corpus = Corpus::load(&corpus)?;
            let exemplars = corpus
                .catalog
                .get(&pattern)
                .map(|p| p.exemplar_ids.clone())
                .unwrap_or_default();
            let anchors = select_initial_anchors(&corpus.index, &pattern, &exemplars, &config.anchors);
            let rows: Vec<AnchorRow<'_>> = anchors
                .iter()
                .map(|a| AnchorRow {
                    label: &a.label,
                    id: a.id(),
                    score10: a.score10(),
                    weight: a.weight(),
                    source: &a.source,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Quantiles { corpus, pattern } => {
            let corpus = Corpus::load(&corpus)?;
            let report = QuantileReport {
                pattern: pattern.map(|id| PatternQuantiles {
                    summary: corpus.index.quantile_summary(Scope::Pattern(&id)),
                    id,
                }),
                global: corpus.index.quantile_summary(Scope::Global),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            let value = serde_json::json!({ "config": config, "warnings": warnings });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteJudgementCache::default_path);
            let cache = SqliteJudgementCache::new(path)?;
            let rows = cache.export_jsonl(&out).await?;
            eprintln!("exported {rows} rows to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteJudgementCache::default_path);
            let cache = SqliteJudgementCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
