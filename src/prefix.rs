//! Prefix enumeration over the registry's name space
//!
//! The registry only answers bounded text searches, so full coverage is
//! reconstructed by tiling the name space with prefixes: depth 1 is A-Z,
//! depth 2 AA-ZZ, and so on. Partitions can optionally be crossed with
//! profession/region facets, which multiplies the query count but pushes
//! individual result sets below the truncation cap.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::SearchConfig;
use crate::search::SearchOutcome;

/// One slice of the search space: a name prefix plus optional facets.
///
/// The set of all partitions at a given depth tiles the full name space
/// with no gaps and no overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Name prefix over the configured alphabet
    pub prefix: String,
    /// Profession facet (faceted mode only)
    pub profession: Option<String>,
    /// Region facet (faceted mode only)
    pub region: Option<String>,
}

impl Partition {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            profession: None,
            region: None,
        }
    }

    pub fn faceted(prefix: impl Into<String>, profession: &str, region: &str) -> Self {
        Self {
            prefix: prefix.into(),
            profession: Some(profession.to_string()),
            region: Some(region.to_string()),
        }
    }

    /// Canonical key used in the completed-partition set
    pub fn key(&self) -> String {
        match (&self.profession, &self.region) {
            (Some(p), Some(r)) => format!("{}|{}|{}", p, r, self.prefix),
            (Some(p), None) => format!("{}||{}", p, self.prefix),
            (None, Some(r)) => format!("|{}|{}", r, self.prefix),
            (None, None) => self.prefix.clone(),
        }
    }

    pub fn depth(&self) -> usize {
        self.prefix.chars().count()
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'", self.key())
    }
}

/// Generates partitions at and across depths.
#[derive(Debug, Clone)]
pub struct PrefixGenerator {
    alphabet: Vec<char>,
    max_depth: usize,
}

impl PrefixGenerator {
    pub fn new(alphabet: &str, max_depth: usize) -> Self {
        Self {
            alphabet: alphabet.chars().collect(),
            max_depth,
        }
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// All prefixes of exactly `depth` characters, lexicographic order.
    pub fn prefixes_at_depth(&self, depth: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(self.count_at_depth(depth));
        let mut current = String::with_capacity(depth);
        self.fill_depth(depth, &mut current, &mut out);
        out
    }

    fn fill_depth(&self, depth: usize, current: &mut String, out: &mut Vec<String>) {
        if current.chars().count() == depth {
            out.push(current.clone());
            return;
        }
        for &c in &self.alphabet {
            current.push(c);
            self.fill_depth(depth, current, out);
            current.pop();
        }
    }

    /// Child prefixes one level deeper, or empty at max depth.
    pub fn children(&self, prefix: &str) -> Vec<String> {
        if prefix.chars().count() >= self.max_depth {
            return Vec::new();
        }
        self.alphabet
            .iter()
            .map(|c| format!("{}{}", prefix, c))
            .collect()
    }

    /// Number of prefixes at a single depth (k^depth)
    pub fn count_at_depth(&self, depth: usize) -> usize {
        self.alphabet.len().pow(depth as u32)
    }

    /// Total prefixes across depths 1..=d (sum of k^i)
    pub fn total_count(&self, up_to_depth: usize) -> usize {
        (1..=up_to_depth).map(|d| self.count_at_depth(d)).sum()
    }
}

/// Search-space enumeration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Depth-1 seeds, expanded only where the registry truncates
    Adaptive,
    /// Every partition at every depth up to max_depth, unconditionally
    Comprehensive,
    /// Profession x region x depth-1 prefix cross product
    Faceted,
}

/// Builds the initial work queue and decides expansion at runtime.
pub struct SearchPlan {
    mode: PlanMode,
    generator: PrefixGenerator,
    result_cap: usize,
    professions: Vec<String>,
    regions: Vec<String>,
}

impl SearchPlan {
    pub fn new(mode: PlanMode, config: &SearchConfig) -> Self {
        Self {
            mode,
            generator: PrefixGenerator::new(&config.alphabet, config.max_depth),
            result_cap: config.result_cap,
            professions: config.professions.clone(),
            regions: config.regions.clone(),
        }
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn generator(&self) -> &PrefixGenerator {
        &self.generator
    }

    /// Initial partitions, skipping anything already completed.
    pub fn initial_queue(&self, completed: &HashSet<String>) -> Vec<Partition> {
        let partitions: Vec<Partition> = match self.mode {
            PlanMode::Adaptive => self
                .generator
                .prefixes_at_depth(1)
                .into_iter()
                .map(Partition::new)
                .collect(),
            PlanMode::Comprehensive => (1..=self.generator.max_depth())
                .flat_map(|d| self.generator.prefixes_at_depth(d))
                .map(Partition::new)
                .collect(),
            PlanMode::Faceted => {
                let prefixes = self.generator.prefixes_at_depth(1);
                let mut out =
                    Vec::with_capacity(self.professions.len() * self.regions.len() * prefixes.len());
                for profession in &self.professions {
                    for region in &self.regions {
                        for prefix in &prefixes {
                            out.push(Partition::faceted(prefix, profession, region));
                        }
                    }
                }
                out
            }
        };

        partitions
            .into_iter()
            .filter(|p| !completed.contains(&p.key()))
            .collect()
    }

    /// Decide whether a partition's result set requires subdivision.
    ///
    /// Only the adaptive mode expands; comprehensive pre-plans every depth
    /// and faceted mode relies on facets to stay under the cap. A truncated
    /// partition already at max depth cannot be subdivided and is accepted
    /// as-is (the caller records the under-coverage).
    pub fn expansion(&self, partition: &Partition, outcome: &SearchOutcome) -> Expansion {
        if !outcome.truncated && outcome.total_results < self.result_cap {
            return Expansion::Complete;
        }
        if self.mode != PlanMode::Adaptive {
            return Expansion::Complete;
        }
        if partition.depth() >= self.generator.max_depth() {
            return Expansion::UnderCovered;
        }

        let children = self
            .generator
            .children(&partition.prefix)
            .into_iter()
            .map(|prefix| Partition {
                prefix,
                profession: partition.profession.clone(),
                region: partition.region.clone(),
            })
            .collect();
        Expansion::Expand(children)
    }
}

/// Outcome of the expansion decision for one searched partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Result set fully consumed; mark the partition complete
    Complete,
    /// Truncated; enqueue these children instead of accepting the result
    Expand(Vec<Partition>),
    /// Truncated at max depth; accept with an under-coverage flag
    UnderCovered,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(mode: PlanMode, max_depth: usize) -> SearchPlan {
        let config = SearchConfig {
            alphabet: "ABC".to_string(),
            max_depth,
            result_cap: 10,
            ..SearchConfig::default()
        };
        SearchPlan::new(mode, &config)
    }

    fn outcome(n: usize, truncated: bool) -> SearchOutcome {
        SearchOutcome {
            identifiers: Vec::new(),
            total_results: n,
            truncated,
        }
    }

    #[test]
    fn test_comprehensive_counts() {
        // k=3, d=3: 3 + 9 + 27 = 39
        let plan = plan(PlanMode::Comprehensive, 3);
        let queue = plan.initial_queue(&HashSet::new());
        assert_eq!(queue.len(), 39);

        let unique: HashSet<String> = queue.iter().map(|p| p.key()).collect();
        assert_eq!(unique.len(), 39, "no duplicate partitions");
    }

    #[test]
    fn test_comprehensive_skips_completed() {
        let plan = plan(PlanMode::Comprehensive, 2);
        let completed: HashSet<String> = ["A", "AB"].iter().map(|s| s.to_string()).collect();
        let queue = plan.initial_queue(&completed);
        assert_eq!(queue.len(), 3 + 9 - 2);
        assert!(!queue.iter().any(|p| p.prefix == "A" || p.prefix == "AB"));
    }

    #[test]
    fn test_adaptive_seeds_depth_one() {
        let plan = plan(PlanMode::Adaptive, 3);
        let queue = plan.initial_queue(&HashSet::new());
        assert_eq!(queue.len(), 3);
        assert!(queue.iter().all(|p| p.depth() == 1));
    }

    #[test]
    fn test_adaptive_expands_truncated_into_k_children() {
        let plan = plan(PlanMode::Adaptive, 3);
        let partition = Partition::new("A");

        match plan.expansion(&partition, &outcome(10, true)) {
            Expansion::Expand(children) => {
                assert_eq!(children.len(), 3);
                let prefixes: Vec<&str> = children.iter().map(|c| c.prefix.as_str()).collect();
                assert_eq!(prefixes, vec!["AA", "AB", "AC"]);
                assert!(children.iter().all(|c| c.depth() == 2));
            }
            other => panic!("expected Expand, got {:?}", other),
        }
    }

    #[test]
    fn test_adaptive_accepts_untruncated() {
        let plan = plan(PlanMode::Adaptive, 3);
        let partition = Partition::new("A");
        assert_eq!(plan.expansion(&partition, &outcome(4, false)), Expansion::Complete);
    }

    #[test]
    fn test_truncated_at_max_depth_is_under_covered() {
        let plan = plan(PlanMode::Adaptive, 2);
        let partition = Partition::new("AB");
        assert_eq!(
            plan.expansion(&partition, &outcome(10, true)),
            Expansion::UnderCovered
        );
    }

    #[test]
    fn test_comprehensive_never_expands() {
        let plan = plan(PlanMode::Comprehensive, 3);
        let partition = Partition::new("A");
        assert_eq!(plan.expansion(&partition, &outcome(10, true)), Expansion::Complete);
    }

    #[test]
    fn test_faceted_plan_size() {
        let config = SearchConfig {
            alphabet: "AB".to_string(),
            max_depth: 1,
            professions: vec!["Nurse".to_string(), "Midwife".to_string()],
            regions: vec!["Victoria".to_string()],
            ..SearchConfig::default()
        };
        let plan = SearchPlan::new(PlanMode::Faceted, &config);
        let queue = plan.initial_queue(&HashSet::new());
        // 2 professions x 1 region x 2 prefixes
        assert_eq!(queue.len(), 4);
        assert!(queue.iter().all(|p| p.profession.is_some() && p.region.is_some()));
    }

    #[test]
    fn test_partition_key_roundtrip() {
        assert_eq!(Partition::new("AB").key(), "AB");
        assert_eq!(
            Partition::faceted("A", "Nurse", "Victoria").key(),
            "Nurse|Victoria|A"
        );
    }

    #[test]
    fn test_generator_totals() {
        let g = PrefixGenerator::new("ABCDEFGHIJKLMNOPQRSTUVWXYZ", 3);
        assert_eq!(g.count_at_depth(1), 26);
        assert_eq!(g.count_at_depth(2), 676);
        assert_eq!(g.total_count(3), 26 + 676 + 17_576);
    }

    #[test]
    fn test_children_stop_at_max_depth() {
        let g = PrefixGenerator::new("AB", 2);
        assert_eq!(g.children("A"), vec!["AA", "AB"]);
        assert!(g.children("AA").is_empty());
    }
}
