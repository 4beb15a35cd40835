//! Stage-one discovery engine
//!
//! Walks the prefix partition queue against a [`SearchBackend`], records
//! every identifier it sees, and expands truncated partitions according to
//! the active plan. All progress flows through the checkpoint manager, so
//! an interrupted run resumes exactly where it stopped.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};

use crate::checkpoint::CheckpointManager;
use crate::config::{CheckpointConfig, PacingConfig, SearchConfig};
use crate::pacing::{PacingController, SlotKind};
use crate::prefix::{Expansion, Partition, SearchPlan};
use crate::search::SearchBackend;

/// What one discovery run accomplished
#[derive(Debug, Default, Clone)]
pub struct DiscoveryReport {
    pub partitions_searched: usize,
    pub partitions_completed: usize,
    pub partitions_expanded: usize,
    pub partitions_undercovered: usize,
    /// Partitions that failed a second full pass and stay incomplete
    pub partitions_abandoned: usize,
    pub new_ids: usize,
    pub duplicate_ids: usize,
    pub errors: u64,
    pub interrupted: bool,
}

pub struct DiscoveryEngine {
    backend: Box<dyn SearchBackend>,
    plan: SearchPlan,
    pacing: PacingController,
    max_retries: u32,
    retry_delay_step: Duration,
    cancel: Arc<AtomicBool>,
    /// Restrict the run to partitions under this prefix
    prefix_filter: Option<String>,
}

impl DiscoveryEngine {
    pub fn new(
        backend: Box<dyn SearchBackend>,
        plan: SearchPlan,
        pacing_config: PacingConfig,
        search_config: &SearchConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            plan,
            pacing: PacingController::new(pacing_config),
            max_retries: search_config.max_retries,
            retry_delay_step: Duration::from_secs(search_config.retry_delay_secs),
            cancel,
            prefix_filter: None,
        }
    }

    /// Limit the run to partitions whose prefix starts with `prefix`.
    pub fn with_prefix_filter(mut self, prefix: Option<String>) -> Self {
        self.prefix_filter = prefix.map(|p| p.to_uppercase());
        self
    }

    /// Run discovery to completion, interruption, or queue exhaustion.
    pub async fn run(
        &mut self,
        checkpoint: &mut CheckpointManager,
        cadence: &CheckpointConfig,
    ) -> Result<DiscoveryReport> {
        checkpoint.start_session();
        self.pacing
            .set_consecutive_failures(checkpoint.consecutive_failures());

        let completed: HashSet<String> = checkpoint
            .state()
            .completed_partitions
            .iter()
            .cloned()
            .collect();
        let mut queue: VecDeque<Partition> = self
            .plan
            .initial_queue(&completed)
            .into_iter()
            .filter(|p| match &self.prefix_filter {
                Some(filter) => p.prefix.starts_with(filter.as_str()),
                None => true,
            })
            .collect();

        info!("Discovery queue holds {} partitions", queue.len());

        let mut report = DiscoveryReport::default();
        // Partitions already given their one requeue pass this run
        let mut deferred: HashSet<String> = HashSet::new();

        while let Some(partition) = queue.pop_front() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Interrupt received; saving checkpoint");
                report.interrupted = true;
                break;
            }
            if checkpoint.is_partition_complete(&partition.key()) {
                continue;
            }

            match self.search_with_retries(&partition).await {
                Some(outcome) => {
                    report.partitions_searched += 1;

                    for id in &outcome.identifiers {
                        if checkpoint
                            .record_discovered(id)
                            .context("recording discovered identifier")?
                        {
                            report.new_ids += 1;
                        } else {
                            report.duplicate_ids += 1;
                        }
                    }

                    match self.plan.expansion(&partition, &outcome) {
                        Expansion::Complete => {
                            checkpoint.mark_partition_complete(&partition.key());
                            report.partitions_completed += 1;
                        }
                        Expansion::Expand(children) => {
                            debug!(
                                "Expanding {} into {} children",
                                partition,
                                children.len()
                            );
                            report.partitions_expanded += 1;
                            // Depth-first: children go to the front so a
                            // hot prefix is fully resolved before moving on.
                            // The parent stays incomplete until every child
                            // is done, so an interrupted expansion is redone
                            // from the parent on resume.
                            let mut still_pending = 0usize;
                            for child in children.into_iter().rev() {
                                if !checkpoint.is_partition_complete(&child.key()) {
                                    queue.push_front(child);
                                    still_pending += 1;
                                }
                            }
                            if still_pending == 0 {
                                checkpoint.mark_partition_complete(&partition.key());
                                report.partitions_completed += 1;
                            }
                        }
                        Expansion::UnderCovered => {
                            checkpoint.record_undercovered(&partition.key());
                            checkpoint.mark_partition_complete(&partition.key());
                            report.partitions_undercovered += 1;
                        }
                    }
                }
                None => {
                    // A cancelled attempt is not a failure; the partition
                    // simply stays incomplete for the next run
                    if self.cancel.load(Ordering::Relaxed) {
                        info!("Interrupt received; saving checkpoint");
                        report.interrupted = true;
                        break;
                    }
                    report.errors += 1;
                    checkpoint.increment_errors();
                    let key = partition.key();
                    if deferred.insert(key.clone()) {
                        warn!("Partition {} exhausted retries; requeued at tail", key);
                        queue.push_back(partition);
                    } else {
                        warn!(
                            "Partition {} failed its requeue pass; left for a future run",
                            key
                        );
                        report.partitions_abandoned += 1;
                    }
                }
            }

            checkpoint.set_consecutive_failures(self.pacing.consecutive_failures());
            checkpoint
                .maybe_save(cadence)
                .context("periodic checkpoint save")?;
        }

        checkpoint.set_consecutive_failures(self.pacing.consecutive_failures());
        checkpoint.save().context("final checkpoint save")?;

        info!(
            "Discovery finished: {} searched, {} new ids, {} errors{}",
            report.partitions_searched,
            report.new_ids,
            report.errors,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }

    /// One partition, retried in place on transient errors with a linearly
    /// growing delay. Returns None once the retry budget is spent.
    async fn search_with_retries(
        &mut self,
        partition: &Partition,
    ) -> Option<crate::search::SearchOutcome> {
        for attempt in 1..=self.max_retries {
            if self.cancel.load(Ordering::Relaxed) {
                return None;
            }

            self.pacing.await_slot(SlotKind::Request).await;
            if let Err(err) = self.backend.open_session().await {
                warn!(
                    "Session open failed for {} (attempt {}/{}): {}",
                    partition, attempt, self.max_retries, err
                );
                self.pacing.fail_and_wait().await;
                continue;
            }

            self.pacing.await_slot(SlotKind::Interaction).await;
            self.pacing.await_slot(SlotKind::Request).await;

            match self.backend.search(partition).await {
                Ok(outcome) => {
                    self.pacing.record_success();
                    debug!(
                        "Partition {}: {} results{}",
                        partition,
                        outcome.total_results,
                        if outcome.truncated { " (truncated)" } else { "" }
                    );
                    return Some(outcome);
                }
                Err(err) => {
                    warn!(
                        "Search failed for {} (attempt {}/{}): {}",
                        partition, attempt, self.max_retries, err
                    );
                    self.pacing.fail_and_wait().await;
                    if !err.is_transient() {
                        return None;
                    }
                    if attempt < self.max_retries {
                        sleep(self.retry_delay_step * attempt).await;
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix::PlanMode;
    use crate::search::{SearchError, SearchOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct MockBackend {
        /// Scripted outcomes by partition key; missing keys yield empty
        outcomes: HashMap<String, SearchOutcome>,
        /// Keys that fail with a transient error this many times first
        failures: HashMap<String, u32>,
        /// Set this flag after answering the named partition
        cancel_after: Option<(String, Arc<AtomicBool>)>,
        queries: usize,
    }

    impl MockBackend {
        fn new(outcomes: HashMap<String, SearchOutcome>) -> Self {
            Self {
                outcomes,
                failures: HashMap::new(),
                cancel_after: None,
                queries: 0,
            }
        }
    }

    #[async_trait]
    impl SearchBackend for MockBackend {
        async fn open_session(&mut self) -> Result<(), SearchError> {
            Ok(())
        }

        async fn search(&mut self, partition: &Partition) -> Result<SearchOutcome, SearchError> {
            self.queries += 1;
            let key = partition.key();
            let result = match self.failures.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(SearchError::Timeout)
                }
                _ => Ok(self.outcomes.get(&key).cloned().unwrap_or_default()),
            };
            if let Some((trigger, flag)) = &self.cancel_after {
                if *trigger == key {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            result
        }
    }

    fn outcome(ids: &[&str], truncated: bool) -> SearchOutcome {
        SearchOutcome {
            identifiers: ids.iter().map(|s| s.to_string()).collect(),
            total_results: ids.len(),
            truncated,
        }
    }

    fn tiny_config() -> SearchConfig {
        SearchConfig {
            alphabet: "AB".to_string(),
            max_depth: 2,
            result_cap: 2,
            max_retries: 2,
            retry_delay_secs: 0,
            professions: Vec::new(),
            regions: Vec::new(),
        }
    }

    fn engine(backend: MockBackend, mode: PlanMode, config: &SearchConfig) -> DiscoveryEngine {
        DiscoveryEngine::new(
            Box::new(backend),
            SearchPlan::new(mode, config),
            PacingConfig::instant(),
            config,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn checkpoint(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(
            dir.path().join("checkpoint.json"),
            dir.path().join("ids.raw.txt"),
        )
    }

    fn cadence() -> CheckpointConfig {
        CheckpointConfig {
            items_interval: 1000,
            time_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_adaptive_expands_truncated_partition() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        // "A" is truncated; its children hold the real ids
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001", "AAB0000000002"], true));
        outcomes.insert("AA".to_string(), outcome(&["AAA0000000001"], false));
        outcomes.insert("AB".to_string(), outcome(&["AAB0000000002"], false));
        outcomes.insert("B".to_string(), outcome(&["BBB0000000003"], false));

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine = engine(MockBackend::new(outcomes), PlanMode::Adaptive, &config);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert_eq!(report.partitions_expanded, 1);
        assert_eq!(report.partitions_searched, 4);
        assert_eq!(report.new_ids, 3);
        assert_eq!(report.duplicate_ids, 2);
        assert!(cp.is_partition_complete("AA"));
        assert!(cp.is_partition_complete("AB"));
    }

    #[tokio::test]
    async fn test_resume_with_complete_checkpoint_queries_nothing() {
        let config = tiny_config();
        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        cp.mark_partition_complete("A");
        cp.mark_partition_complete("B");

        let backend = MockBackend::new(HashMap::new());
        let mut engine = engine(backend, PlanMode::Adaptive, &config);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert_eq!(report.partitions_searched, 0);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_in_place() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001"], false));
        let mut backend = MockBackend::new(outcomes);
        backend.failures.insert("A".to_string(), 1);

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine = engine(backend, PlanMode::Adaptive, &config);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert!(cp.is_partition_complete("A"));
        assert_eq!(report.errors, 0);
        assert_eq!(report.new_ids, 1);
    }

    #[tokio::test]
    async fn test_exhausted_partition_requeued_once_then_abandoned() {
        let config = tiny_config();
        let mut backend = MockBackend::new(HashMap::new());
        // Fails through both the in-place budget and the requeue pass
        backend.failures.insert("A".to_string(), 100);

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine = engine(backend, PlanMode::Adaptive, &config);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert!(!cp.is_partition_complete("A"));
        assert!(cp.is_partition_complete("B"));
        assert_eq!(report.partitions_abandoned, 1);
        assert_eq!(report.errors, 2);
    }

    #[tokio::test]
    async fn test_undercovered_at_max_depth() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001", "AAB0000000002"], true));
        // Depth-2 children still truncated; nowhere deeper to go
        outcomes.insert("AA".to_string(), outcome(&["AAA0000000001", "AAB0000000002"], true));
        outcomes.insert("AB".to_string(), outcome(&[], false));
        outcomes.insert("B".to_string(), outcome(&[], false));

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine = engine(MockBackend::new(outcomes), PlanMode::Adaptive, &config);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert_eq!(report.partitions_undercovered, 1);
        assert!(cp.is_partition_complete("AA"));
        assert_eq!(cp.state().undercovered_partitions, vec!["AA".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_saves_and_stops() {
        let config = tiny_config();
        let cancel = Arc::new(AtomicBool::new(true));
        let backend = MockBackend::new(HashMap::new());
        let mut engine = DiscoveryEngine::new(
            Box::new(backend),
            SearchPlan::new(PlanMode::Adaptive, &config),
            PacingConfig::instant(),
            &config,
            cancel,
        );

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.partitions_searched, 0);
        assert!(dir.path().join("checkpoint.json").exists());
    }

    #[tokio::test]
    async fn test_interrupted_expansion_resumes_from_the_parent() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001", "AAB0000000002"], true));
        outcomes.insert("AA".to_string(), outcome(&["AAA0000000003"], false));
        outcomes.insert("AB".to_string(), outcome(&["AAB0000000004"], false));
        outcomes.insert("B".to_string(), outcome(&[], false));

        let dir = TempDir::new().unwrap();

        // First run is interrupted right after "A" expands, before any
        // child is searched
        let cancel = Arc::new(AtomicBool::new(false));
        let mut backend = MockBackend::new(outcomes.clone());
        backend.cancel_after = Some(("A".to_string(), Arc::clone(&cancel)));
        let mut first = DiscoveryEngine::new(
            Box::new(backend),
            SearchPlan::new(PlanMode::Adaptive, &config),
            PacingConfig::instant(),
            &config,
            cancel,
        );
        let mut cp = checkpoint(&dir);
        let report = first.run(&mut cp, &cadence()).await.unwrap();
        assert!(report.interrupted);
        assert!(!cp.is_partition_complete("A"));
        drop(cp);

        // Resume re-searches the parent, regenerates the children, and
        // reaches the identifiers only they hold
        let mut reloaded = checkpoint(&dir);
        assert!(reloaded.load().unwrap());
        let mut second = engine(MockBackend::new(outcomes), PlanMode::Adaptive, &config);
        let report = second.run(&mut reloaded, &cadence()).await.unwrap();

        assert_eq!(report.partitions_searched, 4);
        assert!(reloaded.is_partition_complete("AA"));
        assert!(reloaded.is_partition_complete("AB"));
        let ids = reloaded.pending_ids();
        assert!(ids.contains(&"AAA0000000003".to_string()));
        assert!(ids.contains(&"AAB0000000004".to_string()));
    }

    #[tokio::test]
    async fn test_parent_completes_once_all_children_are_done() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001", "AAB0000000002"], true));
        outcomes.insert("AA".to_string(), outcome(&["AAA0000000001"], false));
        outcomes.insert("AB".to_string(), outcome(&["AAB0000000002"], false));
        outcomes.insert("B".to_string(), outcome(&[], false));

        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine1 = engine(MockBackend::new(outcomes.clone()), PlanMode::Adaptive, &config);
        engine1.run(&mut cp, &cadence()).await.unwrap();

        // The children finished during the first run, so the follow-up
        // re-expansion finds nothing pending and closes the parent out
        assert!(!cp.is_partition_complete("A"));
        let mut engine2 = engine(MockBackend::new(outcomes), PlanMode::Adaptive, &config);
        let report = engine2.run(&mut cp, &cadence()).await.unwrap();

        assert!(cp.is_partition_complete("A"));
        assert_eq!(report.partitions_searched, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_retries_is_not_a_failure() {
        let config = tiny_config();
        let mut backend = MockBackend::new(HashMap::new());
        let cancel = Arc::new(AtomicBool::new(false));
        // "A" fails and the interrupt lands while its retries are running
        backend.failures.insert("A".to_string(), 100);
        backend.cancel_after = Some(("A".to_string(), Arc::clone(&cancel)));

        let mut engine = DiscoveryEngine::new(
            Box::new(backend),
            SearchPlan::new(PlanMode::Adaptive, &config),
            PacingConfig::instant(),
            &config,
            cancel,
        );
        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.errors, 0);
        assert_eq!(report.partitions_abandoned, 0);
        assert!(!cp.is_partition_complete("A"));
    }

    #[tokio::test]
    async fn test_prefix_filter_restricts_queue() {
        let config = tiny_config();
        let mut outcomes = HashMap::new();
        outcomes.insert("A".to_string(), outcome(&["AAA0000000001"], false));
        let dir = TempDir::new().unwrap();
        let mut cp = checkpoint(&dir);
        let mut engine = engine(MockBackend::new(outcomes), PlanMode::Adaptive, &config)
            .with_prefix_filter(Some("a".to_string()));
        let report = engine.run(&mut cp, &cadence()).await.unwrap();

        assert_eq!(report.partitions_searched, 1);
        assert!(cp.is_partition_complete("A"));
        assert!(!cp.is_partition_complete("B"));
    }
}
