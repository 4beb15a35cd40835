//! Reset command: destructively clear harvest progress

use anyhow::{Context, Result};

use crate::checkpoint::CheckpointManager;
use crate::config::Config;

pub async fn reset_progress(config: Config, confirm: bool) -> Result<()> {
    if !confirm {
        println!("This deletes the checkpoint and the raw identifier backup.");
        println!("Extracted CSV and JSONL output files are left untouched.");
        println!("\nRe-run with --confirm to proceed.");
        return Ok(());
    }

    let mut checkpoint = CheckpointManager::from_paths(&config.paths);
    checkpoint.load().context("loading checkpoint")?;
    let summary = checkpoint.summary();

    checkpoint.reset().context("deleting harvest state")?;

    println!("Harvest state reset.");
    println!(
        "Forgot {} completed partitions and {} discovered identifiers.",
        summary.partitions_completed, summary.total_discovered
    );
    println!("Extracted output files were not touched.");
    Ok(())
}
