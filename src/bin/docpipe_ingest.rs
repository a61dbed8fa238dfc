use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use docpipe::{
    bootstrap, config, logging,
    pipeline::{BatchItem, BatchItemResult, BatchOptions, UploadInput},
};
use serde_json::json;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "docpipe-ingest",
    about = "Upload every manual under a directory and run the pipeline on each"
)]
struct Cli {
    /// Directory searched recursively for manuals.
    root: PathBuf,
    /// File extensions to ingest.
    #[arg(long, value_delimiter = ',', default_value = "txt,md")]
    extensions: Vec<String>,
    /// Documents processed at once; defaults to MAX_CONCURRENCY.
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Give up on unfinished documents after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
    /// Write the per-document results as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    /// List the files that would be ingested and exit.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("Failed to load configuration")?;
    logging::init_tracing();

    let files = collect_manuals(&cli.root, &cli.extensions)?;
    if files.is_empty() {
        bail!("no manuals found under {}", cli.root.display());
    }
    if cli.dry_run {
        for file in &files {
            println!("{}", file.display());
        }
        return Ok(());
    }

    let services = bootstrap::build_services(config)
        .await
        .context("Failed to initialize services")?;
    let options = BatchOptions {
        max_concurrency: cli.max_concurrency.unwrap_or(config.max_concurrency).max(1),
        deadline: cli.deadline_secs.map(Duration::from_secs),
    };
    tracing::info!(
        root = %cli.root.display(),
        files = files.len(),
        max_concurrency = options.max_concurrency,
        "Starting batch ingest"
    );

    let items = files
        .iter()
        .map(|path| BatchItem::Upload(UploadInput::new(path.clone())))
        .collect();
    let results = services.orchestrator.process_batch(items, options).await;

    let mut completed = 0;
    let mut unfinished = 0;
    let mut failed = 0;
    for (path, result) in files.iter().zip(&results) {
        let line = match result {
            BatchItemResult::Processed { result } if result.success => {
                completed += 1;
                format!("completed   {}", result.document_id)
            }
            BatchItemResult::Processed { result } => {
                unfinished += 1;
                format!(
                    "{:<11} {} ({} of {} stages failed)",
                    "incomplete",
                    result.document_id,
                    result.stages.failed,
                    result.stages.failed + result.stages.successful
                )
            }
            BatchItemResult::Failed { error, .. } => {
                failed += 1;
                format!("failed      {error}")
            }
            BatchItemResult::AlreadyProcessing { document_id } => {
                unfinished += 1;
                format!("busy        {document_id}")
            }
            BatchItemResult::Incomplete { .. } => {
                unfinished += 1;
                "timed out".to_string()
            }
            BatchItemResult::NotStarted { .. } => {
                unfinished += 1;
                "not started".to_string()
            }
        };
        println!("{line}  {}", path.display());
    }
    println!(
        "{} manuals: {completed} completed, {unfinished} unfinished, {failed} failed",
        files.len()
    );
    println!(
        "metrics: {}",
        serde_json::to_string(&services.metrics.snapshot())?
    );

    if let Some(report) = &cli.report {
        let entries: Vec<_> = files
            .iter()
            .zip(&results)
            .map(|(path, result)| json!({ "path": path, "result": result }))
            .collect();
        fs::write(report, serde_json::to_vec_pretty(&entries)?)
            .with_context(|| format!("Failed to write {}", report.display()))?;
    }

    if failed > 0 {
        bail!("{failed} manuals failed");
    }
    Ok(())
}

/// Files under `root` with one of `extensions`, sorted for a stable submission order.
fn collect_manuals(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                extensions
                    .iter()
                    .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(extension))
            });
        if matches {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
