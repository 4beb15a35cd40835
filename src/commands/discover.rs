//! Discovery command: stage-one identifier enumeration

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::discovery::DiscoveryEngine;
use crate::prefix::{PlanMode, SearchPlan};
use crate::search::HttpSearchBackend;

pub async fn run_discovery(
    mut config: Config,
    mode: PlanMode,
    depth: Option<usize>,
    no_resume: bool,
    prefix: Option<String>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    if let Some(depth) = depth {
        config.search.max_depth = depth;
        config.validate()?;
    }

    let mut checkpoint = CheckpointManager::from_paths(&config.paths);
    let resumed = checkpoint.load().context("loading checkpoint")?;
    if resumed {
        let summary = checkpoint.summary();
        info!(
            "Resuming: {} partitions complete, {} ids discovered",
            summary.partitions_completed, summary.total_discovered
        );
    }
    if no_resume {
        info!("Fresh enumeration requested; forgetting partition completion");
        checkpoint.clear_completed_partitions();
    }

    let backend = HttpSearchBackend::new(&config).context("building search backend")?;
    let plan = SearchPlan::new(mode, &config.search);
    let mut engine = DiscoveryEngine::new(
        Box::new(backend),
        plan,
        config.pacing.clone(),
        &config.search,
        cancel,
    )
    .with_prefix_filter(prefix);

    let report = engine
        .run(&mut checkpoint, &config.checkpoint)
        .await
        .context("discovery run")?;

    let summary = checkpoint.summary();
    println!("\nDiscovery Summary");
    println!("=================");
    println!("Partitions searched:   {}", report.partitions_searched);
    println!("Partitions expanded:   {}", report.partitions_expanded);
    println!("Under-covered:         {}", report.partitions_undercovered);
    println!("Left incomplete:       {}", report.partitions_abandoned);
    println!("New identifiers:       {}", report.new_ids);
    println!("Duplicate identifiers: {}", report.duplicate_ids);
    println!("Errors:                {}", report.errors);
    println!("Total discovered:      {}", summary.total_discovered);
    if report.interrupted {
        println!("\nRun interrupted; progress saved. Re-run to continue.");
    }
    Ok(())
}
