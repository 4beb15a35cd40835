//! Request pacing and failure-escalation cooldowns
//!
//! Every outbound request waits for a slot first. Requests that reach the
//! origin server get a large jittered delay; in-page interactions get a
//! small one. Repeated failures escalate through two cooldown tiers: a
//! short cooldown that leaves the failure count intact, and a long cooldown
//! that clears it. The defense layer upstream rates both a short window and
//! a sliding window, so a single tier clears neither.

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::PacingConfig;

/// Delay class for an upcoming action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Hits the origin server; large jittered delay
    Request,
    /// In-page interaction only; small jittered delay
    Interaction,
}

/// Cooldown tier triggered by consecutive failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownTier {
    /// Tens of seconds; failure count is kept
    Short,
    /// Several minutes; failure count resets to zero
    Long,
}

/// Governs delays before outbound actions and escalates on failure.
///
/// Single-consumer by design: both engines run one logical worker, so the
/// controller holds plain mutable state.
pub struct PacingController {
    config: PacingConfig,
    consecutive_failures: u32,
    last_request: Option<Instant>,
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_request: None,
        }
    }

    /// Block until the next action of the given kind may proceed.
    ///
    /// For request slots, time already spent since the previous request
    /// counts toward the delay.
    pub async fn await_slot(&mut self, kind: SlotKind) {
        let mut delay = self.jittered_delay(kind);

        if kind == SlotKind::Request {
            if let Some(last) = self.last_request {
                delay = delay.saturating_sub(last.elapsed());
            }
        }

        if !delay.is_zero() {
            debug!("Pacing: waiting {:.1}s before {:?}", delay.as_secs_f64(), kind);
            tokio::time::sleep(delay).await;
        }

        if kind == SlotKind::Request {
            self.last_request = Some(Instant::now());
        }
    }

    fn jittered_delay(&self, kind: SlotKind) -> Duration {
        let (min_ms, max_ms) = match kind {
            SlotKind::Request => (
                self.config.request_delay_min_ms,
                self.config.request_delay_max_ms,
            ),
            SlotKind::Interaction => (
                self.config.interaction_delay_min_ms,
                self.config.interaction_delay_max_ms,
            ),
        };
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }

    /// Reset the consecutive-failure count.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "Pacing: success after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    /// Count a failure and return the cooldown tier it triggers, if any.
    ///
    /// The long tier resets the count; the short tier does not.
    pub fn record_failure(&mut self) -> Option<CooldownTier> {
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.config.long_cooldown_threshold {
            self.consecutive_failures = 0;
            Some(CooldownTier::Long)
        } else if self.consecutive_failures >= self.config.short_cooldown_threshold {
            Some(CooldownTier::Short)
        } else {
            None
        }
    }

    /// Sleep for the given cooldown tier.
    pub async fn cooldown(&self, tier: CooldownTier) {
        let duration = match tier {
            CooldownTier::Short => Duration::from_secs(self.config.short_cooldown_secs),
            CooldownTier::Long => Duration::from_secs(self.config.long_cooldown_secs),
        };
        warn!(
            "Cooling down for {:.0}s ({:?} tier)",
            duration.as_secs_f64(),
            tier
        );
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Record a failure and serve whatever cooldown it triggers.
    pub async fn fail_and_wait(&mut self) {
        if let Some(tier) = self.record_failure() {
            self.cooldown(tier).await;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Seed the failure count from a loaded checkpoint.
    pub fn set_consecutive_failures(&mut self, count: u32) {
        self.consecutive_failures = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PacingController {
        PacingController::new(PacingConfig::instant())
    }

    #[test]
    fn test_success_resets_count() {
        let mut pacing = controller();
        pacing.record_failure();
        pacing.record_failure();
        assert_eq!(pacing.consecutive_failures(), 2);
        pacing.record_success();
        assert_eq!(pacing.consecutive_failures(), 0);
    }

    #[test]
    fn test_two_tier_escalation() {
        let mut pacing = controller();

        // Failures 1 and 2: no cooldown yet
        assert_eq!(pacing.record_failure(), None);
        assert_eq!(pacing.record_failure(), None);

        // Third consecutive failure crosses the short threshold; count kept
        assert_eq!(pacing.record_failure(), Some(CooldownTier::Short));
        assert_eq!(pacing.consecutive_failures(), 3);

        // Still in the short regime
        assert_eq!(pacing.record_failure(), Some(CooldownTier::Short));
        assert_eq!(pacing.record_failure(), Some(CooldownTier::Short));

        // Sixth uninterrupted failure crosses the long threshold and resets
        assert_eq!(pacing.record_failure(), Some(CooldownTier::Long));
        assert_eq!(pacing.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_interrupts_escalation() {
        let mut pacing = controller();
        for _ in 0..3 {
            pacing.record_failure();
        }
        pacing.record_success();
        // Escalation starts over
        assert_eq!(pacing.record_failure(), None);
    }

    #[tokio::test]
    async fn test_instant_slot_does_not_block() {
        let mut pacing = controller();
        let start = Instant::now();
        pacing.await_slot(SlotKind::Request).await;
        pacing.await_slot(SlotKind::Interaction).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_request_slot_honors_elapsed_time() {
        let config = PacingConfig {
            request_delay_min_ms: 20,
            request_delay_max_ms: 20,
            ..PacingConfig::instant()
        };
        let mut pacing = PacingController::new(config);

        pacing.await_slot(SlotKind::Request).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Previous request was longer ago than the window; no extra wait
        let start = Instant::now();
        pacing.await_slot(SlotKind::Request).await;
        assert!(start.elapsed() < Duration::from_millis(15));
    }
}
