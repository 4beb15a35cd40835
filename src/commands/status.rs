//! Status command: report harvest progress without touching anything

use anyhow::{Context, Result};

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::output;

pub async fn show_status(config: Config) -> Result<()> {
    let mut checkpoint = CheckpointManager::from_paths(&config.paths);
    let existed = checkpoint.load().context("loading checkpoint")?;

    if !existed && checkpoint.summary().total_discovered == 0 {
        println!("No harvest state found under {}", config.paths.data_dir.display());
        println!("Run `regharvest discover` to start.");
        return Ok(());
    }

    let summary = checkpoint.summary();

    println!("\nHarvest Status");
    println!("==============");
    println!("Data directory:       {}", config.paths.data_dir.display());
    println!("Partitions completed: {}", summary.partitions_completed);
    println!("Under-covered:        {}", summary.undercovered);
    println!("Identifiers found:    {}", summary.total_discovered);
    println!("Records extracted:    {}", summary.total_extracted);
    println!("Pending extraction:   {}", summary.pending_extraction);
    println!("Failed identifiers:   {}", summary.failed);
    println!("Errors recorded:      {}", summary.errors);
    println!("Failure streak:       {}", checkpoint.consecutive_failures());

    // Completion per depth, counting plain prefix keys only
    let max_depth = config.search.max_depth;
    let alphabet_size = config.search.alphabet.chars().count();
    for depth in 1..=max_depth {
        let total = alphabet_size.pow(depth as u32);
        let done = checkpoint
            .state()
            .completed_partitions
            .iter()
            .filter(|k| !k.contains('|') && k.chars().count() == depth)
            .count();
        println!(
            "Depth {}:              {}/{} ({:.1}%)",
            depth,
            done,
            total,
            done as f64 / total as f64 * 100.0
        );
    }

    if let Some(started) = summary.started_at {
        println!("Started:              {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(saved) = summary.last_saved_at {
        println!("Last saved:           {}", saved.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    match output::read_meta(&config.paths).context("reading output metadata")? {
        Some(meta) => {
            println!("Output file:          {}", meta.csv_file);
            println!("Output records:       {}", meta.records);
        }
        None => println!("Output file:          none yet"),
    }

    Ok(())
}
