use std::path::PathBuf;

use anyhow::{Context, Result};
use atlas_core::ModelRecord;
use atlas_storage::CatalogStore;
use atlas_sync::{SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atlas-cli")]
#[command(about = "Model Atlas command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize the local catalog against the remote index.
    Sync {
        /// Concurrent entity pipelines.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Process a single model end-to-end, for debugging.
        #[arg(long)]
        only: Option<String>,
        #[arg(long)]
        models_dir: Option<PathBuf>,
        #[arg(long)]
        debug_dir: Option<PathBuf>,
        #[arg(long)]
        enriched_dir: Option<PathBuf>,
        /// Delay between sequential requests within one pipeline.
        #[arg(long)]
        politeness_ms: Option<u64>,
    },
    /// Score the persisted catalog and write the merged export.
    Score {
        #[arg(long)]
        models_dir: Option<PathBuf>,
        #[arg(long, default_value = "models_enriched.json")]
        output: PathBuf,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Substring search over the scored catalog export.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value = "models_enriched.json")]
        catalog: PathBuf,
    },
    /// Serve the catalog over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        concurrency: None,
        only: None,
        models_dir: None,
        debug_dir: None,
        enriched_dir: None,
        politeness_ms: None,
    }) {
        Commands::Sync {
            concurrency,
            only,
            models_dir,
            debug_dir,
            enriched_dir,
            politeness_ms,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(models_dir) = models_dir {
                config.models_dir = models_dir;
            }
            if let Some(debug_dir) = debug_dir {
                config.debug_dir = debug_dir;
            }
            if let Some(enriched_dir) = enriched_dir {
                config.enriched_dir = enriched_dir;
            }
            if let Some(politeness_ms) = politeness_ms {
                config.politeness_delay = std::time::Duration::from_millis(politeness_ms);
            }
            config.only = only;

            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} discovered={} skipped={} refreshed={} failed={}",
                summary.run_id,
                summary.discovered,
                summary.skipped,
                summary.refreshed,
                summary.failed.len()
            );
            for failure in &summary.failed {
                eprintln!("  {}: {}", failure.name, failure.reason);
            }
        }
        Commands::Score {
            models_dir,
            output,
            top_k,
        } => {
            let store = CatalogStore::new(resolve_models_dir(models_dir));
            let mut records = store.load_all().await?;
            atlas_score::score_catalog(&mut records, top_k);
            let bytes =
                serde_json::to_vec_pretty(&records).context("encoding scored catalog")?;
            std::fs::write(&output, bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("scored {} models into {}", records.len(), output.display());
        }
        Commands::Search {
            query,
            top_k,
            catalog,
        } => {
            let text = std::fs::read_to_string(&catalog)
                .with_context(|| format!("reading {}", catalog.display()))?;
            let records: Vec<ModelRecord> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", catalog.display()))?;
            let matches = search_records(&records, &query, top_k);
            if matches.is_empty() {
                println!("no matches for {query:?}");
            } else {
                println!("{:<28} {:>7}  {}", "NAME", "TRUST", "SUMMARY");
                for record in matches {
                    let trust = record
                        .scores
                        .get(atlas_score::TRUST_SCORE_KEY)
                        .map(|v| format!("{v:.3}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<28} {:>7}  {}",
                        record.name,
                        trust,
                        truncate(summary_text(record), 50)
                    );
                }
            }
        }
        Commands::Serve { addr, models_dir } => {
            let store = CatalogStore::new(resolve_models_dir(models_dir));
            atlas_web::serve(&addr, store).await?;
        }
    }

    Ok(())
}

fn resolve_models_dir(models_dir: Option<PathBuf>) -> PathBuf {
    models_dir.unwrap_or_else(|| SyncConfig::from_env().models_dir)
}

fn summary_text(record: &ModelRecord) -> &str {
    record
        .summary
        .as_deref()
        .or(record.description.as_deref())
        .unwrap_or("")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}…")
    }
}

/// Top-k records whose name, summary, or description contain the query,
/// ranked by occurrence count, ties broken by name.
fn search_records<'a>(records: &'a [ModelRecord], query: &str, top_k: usize) -> Vec<&'a ModelRecord> {
    let needle = query.to_ascii_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &ModelRecord)> = records
        .iter()
        .filter_map(|record| {
            let haystack = format!(
                "{} {} {}",
                record.name,
                record.summary.as_deref().unwrap_or(""),
                record.description.as_deref().unwrap_or("")
            )
            .to_ascii_lowercase();
            let count = haystack.matches(&needle).count();
            if count > 0 {
                Some((count, record))
            } else {
                None
            }
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    scored.into_iter().take(top_k).map(|(_, r)| r).collect()
}
