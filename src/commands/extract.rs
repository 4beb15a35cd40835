//! Extraction command: stage-two record harvesting

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::checkpoint::CheckpointManager;
use crate::config::{Config, FetchPath};
use crate::extraction::ExtractionEngine;
use crate::fetch::create_fetcher;
use crate::output::RecordWriter;
use crate::record::RecordParser;

pub async fn run_extraction(
    mut config: Config,
    limit: Option<usize>,
    path: Option<FetchPath>,
    quiet: bool,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    if let Some(path) = path {
        config.fetch.path = path;
    }

    let mut checkpoint = CheckpointManager::from_paths(&config.paths);
    checkpoint.load().context("loading checkpoint")?;

    let pending = checkpoint.pending_ids().len();
    if pending == 0 {
        println!("Nothing to extract; run discovery first.");
        return Ok(());
    }
    info!("{} identifiers pending extraction", pending);

    let fetcher = create_fetcher(&config).context("building detail fetcher")?;
    let parser = RecordParser::new().context("building record parser")?;
    let mut writer = RecordWriter::open(&config.paths).context("opening output files")?;

    let mut engine = ExtractionEngine::new(
        fetcher,
        parser,
        config.pacing.clone(),
        &config.fetch,
        cancel,
    )
    .quiet(quiet);

    let report = engine
        .run(&mut checkpoint, &mut writer, &config.checkpoint, limit)
        .await
        .context("extraction run")?;

    let summary = checkpoint.summary();
    println!("\nExtraction Summary");
    println!("==================");
    println!("Attempted:        {}", report.attempted);
    println!("Extracted:        {}", report.extracted);
    println!("Fetch failures:   {}", report.fetch_failures);
    println!("Parse failures:   {}", report.parse_failures);
    println!("Already written:  {}", report.already_written);
    println!("Total extracted:  {}", summary.total_extracted);
    println!("Still pending:    {}", summary.pending_extraction);
    println!("Output file:      {}", writer.csv_path().display());
    if report.interrupted {
        println!("\nRun interrupted; progress saved. Re-run to continue.");
    }
    Ok(())
}
