//! Stage-two extraction pipeline
//!
//! Drains the pending identifier queue (discovered minus extracted, in
//! discovery order) through a [`DetailFetcher`], parses each detail page
//! into a record, and persists it backup-first. Every identifier's fate is
//! recorded in the checkpoint, so the pipeline can be stopped and resumed
//! at any point without losing or repeating work.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};

use crate::checkpoint::CheckpointManager;
use crate::config::{CheckpointConfig, FetchConfig, PacingConfig};
use crate::fetch::DetailFetcher;
use crate::output::RecordWriter;
use crate::pacing::{PacingController, SlotKind};
use crate::record::RecordParser;

/// What one extraction run accomplished
#[derive(Debug, Default, Clone)]
pub struct ExtractionReport {
    pub attempted: usize,
    pub extracted: usize,
    /// Fetches that exhausted their retry budget
    pub fetch_failures: usize,
    /// Pages fetched but not parseable into a usable record
    pub parse_failures: usize,
    /// Already present in the output file; marked extracted without a fetch
    pub already_written: usize,
    pub interrupted: bool,
}

/// Progress display for the long-running extraction stage
struct ExtractionProgress {
    bar: Option<ProgressBar>,
    start: Instant,
    done: u64,
}

impl ExtractionProgress {
    fn new(total: u64, quiet: bool) -> Self {
        let bar = if quiet {
            None
        } else {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        };
        Self {
            bar,
            start: Instant::now(),
            done: 0,
        }
    }

    fn item_done(&mut self, reg_id: &str) {
        self.done += 1;
        if let Some(ref pb) = self.bar {
            pb.set_position(self.done);
            let elapsed = self.start.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                self.done as f64 * 60.0 / elapsed
            } else {
                0.0
            };
            pb.set_message(format!("{:.1} rec/min | {}", rate, reg_id));
        }
    }

    fn finish(&self, report: &ExtractionReport) {
        if let Some(ref pb) = self.bar {
            if report.interrupted {
                pb.abandon_with_message("Interrupted");
            } else {
                pb.finish_with_message(format!(
                    "Done: {} extracted, {} fetch failures, {} parse failures",
                    report.extracted, report.fetch_failures, report.parse_failures
                ));
            }
        }
    }
}

pub struct ExtractionEngine {
    fetcher: Box<dyn DetailFetcher>,
    parser: RecordParser,
    pacing: PacingController,
    max_retries: u32,
    cancel: Arc<AtomicBool>,
    quiet: bool,
}

impl ExtractionEngine {
    pub fn new(
        fetcher: Box<dyn DetailFetcher>,
        parser: RecordParser,
        pacing_config: PacingConfig,
        fetch_config: &FetchConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fetcher,
            parser,
            pacing: PacingController::new(pacing_config),
            max_retries: fetch_config.max_retries,
            cancel,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Extract up to `limit` pending identifiers (all of them when None).
    pub async fn run(
        &mut self,
        checkpoint: &mut CheckpointManager,
        writer: &mut RecordWriter,
        cadence: &CheckpointConfig,
        limit: Option<usize>,
    ) -> Result<ExtractionReport> {
        checkpoint.start_session();
        self.pacing
            .set_consecutive_failures(checkpoint.consecutive_failures());

        let mut pending = checkpoint.pending_ids();
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        info!(
            "Extracting {} identifiers via the {} path",
            pending.len(),
            self.fetcher.name()
        );

        let mut report = ExtractionReport::default();
        let mut progress = ExtractionProgress::new(pending.len() as u64, self.quiet);

        for reg_id in pending {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Interrupt received; saving checkpoint");
                report.interrupted = true;
                break;
            }

            // Output dedup can outlive checkpoint state after a crash
            if writer.contains(&reg_id) {
                checkpoint.mark_extracted(&reg_id);
                report.already_written += 1;
                progress.item_done(&reg_id);
                continue;
            }

            report.attempted += 1;
            match self.fetch_with_retries(&reg_id).await {
                Some(html) => match self.parser.parse(&html) {
                    Ok(record) => {
                        writer
                            .persist(&record)
                            .with_context(|| format!("persisting record {}", record.reg_id))?;
                        checkpoint.mark_extracted(&reg_id);
                        report.extracted += 1;
                        debug!("Extracted {}", reg_id);
                    }
                    Err(err) => {
                        warn!("Unparseable detail page for {}: {}", reg_id, err);
                        checkpoint.record_failed(&reg_id);
                        report.parse_failures += 1;
                    }
                },
                None => {
                    // A cancelled fetch leaves the identifier pending,
                    // not failed
                    if self.cancel.load(Ordering::Relaxed) {
                        info!("Interrupt received; saving checkpoint");
                        report.interrupted = true;
                        break;
                    }
                    checkpoint.record_failed(&reg_id);
                    report.fetch_failures += 1;
                }
            }

            progress.item_done(&reg_id);
            checkpoint.set_consecutive_failures(self.pacing.consecutive_failures());
            checkpoint
                .maybe_save(cadence)
                .context("periodic checkpoint save")?;
        }

        checkpoint.set_consecutive_failures(self.pacing.consecutive_failures());
        checkpoint.save().context("final checkpoint save")?;
        progress.finish(&report);

        info!(
            "Extraction finished: {} extracted, {} fetch failures, {} parse failures{}",
            report.extracted,
            report.fetch_failures,
            report.parse_failures,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }

    /// One identifier, retried in place on transient errors. Failure
    /// escalation (cooldowns) happens inside the pacing controller.
    async fn fetch_with_retries(&mut self, reg_id: &str) -> Option<String> {
        for attempt in 1..=self.max_retries {
            if self.cancel.load(Ordering::Relaxed) {
                return None;
            }

            self.pacing.await_slot(SlotKind::Request).await;
            match self.fetcher.fetch(reg_id).await {
                Ok(html) => {
                    self.pacing.record_success();
                    return Some(html);
                }
                Err(err) => {
                    warn!(
                        "Fetch failed for {} (attempt {}/{}): {}",
                        reg_id, attempt, self.max_retries, err
                    );
                    self.pacing.fail_and_wait().await;
                    if !err.is_transient() {
                        return None;
                    }
                }
            }
        }
        warn!("Giving up on {} after {} attempts", reg_id, self.max_retries);
        None
    }
}
