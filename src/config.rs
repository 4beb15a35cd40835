//! Configuration for the harvester
//!
//! All tunables live here as an explicit value object threaded into each
//! component at construction. Loadable from TOML; every section has
//! sensible defaults so a bare `regharvest discover` works out of the box.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the harvester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory layout
    #[serde(default)]
    pub paths: PathsConfig,
    /// Registry endpoint settings
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Search / enumeration settings
    #[serde(default)]
    pub search: SearchConfig,
    /// Request pacing and cooldown escalation
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Detail fetch settings
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Checkpoint cadence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            registry: RegistryConfig::default(),
            search: SearchConfig::default(),
            pacing: PacingConfig::default(),
            fetch: FetchConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass rather than playing whack-a-mole.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.search.max_depth == 0 || self.search.max_depth > 4 {
            errors.push("search max_depth must be between 1 and 4".to_string());
        }
        if self.search.result_cap == 0 {
            errors.push("search result_cap must be positive".to_string());
        }
        if self.search.alphabet.is_empty() {
            errors.push("search alphabet must not be empty".to_string());
        }
        if self.search.max_retries == 0 {
            errors.push("search max_retries must be positive".to_string());
        }

        if self.pacing.request_delay_min_ms > self.pacing.request_delay_max_ms {
            errors.push("pacing request delay: min must not exceed max".to_string());
        }
        if self.pacing.interaction_delay_min_ms > self.pacing.interaction_delay_max_ms {
            errors.push("pacing interaction delay: min must not exceed max".to_string());
        }
        if self.pacing.short_cooldown_threshold == 0 {
            errors.push("pacing short_cooldown_threshold must be positive".to_string());
        }
        if self.pacing.long_cooldown_threshold <= self.pacing.short_cooldown_threshold {
            errors.push(
                "pacing long_cooldown_threshold must exceed short_cooldown_threshold".to_string(),
            );
        }

        if self.checkpoint.items_interval == 0 {
            errors.push("checkpoint items_interval must be positive".to_string());
        }

        if url::Url::parse(&self.registry.base_url).is_err() {
            errors.push(format!(
                "registry base_url '{}' is not a valid URL",
                self.registry.base_url
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }
}

/// Data directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root data directory; everything else lives under it
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl PathsConfig {
    pub fn checkpoint_file(&self) -> PathBuf {
        self.data_dir.join("checkpoints").join("harvest.json")
    }

    pub fn raw_ids_file(&self) -> PathBuf {
        self.data_dir.join("discovery").join("discovered_ids.raw.txt")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.data_dir.join("extracted")
    }

    pub fn backup_file(&self) -> PathBuf {
        self.data_dir.join("backup").join("extracted_backup.jsonl")
    }
}

/// Registry endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the registry site
    pub base_url: String,
    /// Path of the search page relative to the base URL
    pub search_path: String,
    /// User agents rotated by the session fetch path
    pub user_agents: Vec<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.ahpra.gov.au".to_string(),
            search_path: "/Registration/Registers-of-Practitioners.aspx".to_string(),
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string(),
            ],
            timeout_secs: 30,
        }
    }
}

impl RegistryConfig {
    pub fn search_url(&self) -> String {
        format!("{}{}", self.base_url, self.search_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Search / enumeration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Alphabet the prefix space is built over
    pub alphabet: String,
    /// Maximum prefix depth (1 = A-Z, 2 = AA-ZZ, 3 = AAA-ZZZ)
    pub max_depth: usize,
    /// Result count at or above which a query is considered truncated.
    /// Empirically tuned against the live registry; keep configurable.
    pub result_cap: usize,
    /// Per-partition retry budget for transient errors
    pub max_retries: u32,
    /// Linear retry delay step in seconds (attempt n waits n * step)
    pub retry_delay_secs: u64,
    /// Profession facets for faceted mode
    pub professions: Vec<String>,
    /// Region facets for faceted mode
    pub regions: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alphabet: "ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
            max_depth: 3,
            result_cap: 100,
            max_retries: 3,
            retry_delay_secs: 5,
            professions: vec![
                "Aboriginal and Torres Strait Islander Health Practitioner".to_string(),
                "Chinese Medicine Practitioner".to_string(),
                "Chiropractor".to_string(),
                "Dental Practitioner".to_string(),
                "Medical Practitioner".to_string(),
                "Medical Radiation Practitioner".to_string(),
                "Midwife".to_string(),
                "Nurse".to_string(),
                "Occupational Therapist".to_string(),
                "Optometrist".to_string(),
                "Osteopath".to_string(),
                "Paramedic".to_string(),
                "Pharmacist".to_string(),
                "Physiotherapist".to_string(),
                "Podiatrist".to_string(),
                "Psychologist".to_string(),
            ],
            regions: vec![
                "Australian Capital Territory".to_string(),
                "New South Wales".to_string(),
                "Northern Territory".to_string(),
                "Queensland".to_string(),
                "South Australia".to_string(),
                "Tasmania".to_string(),
                "Victoria".to_string(),
                "Western Australia".to_string(),
            ],
        }
    }
}

/// Request pacing and cooldown escalation.
///
/// Two delay classes: the request window applies before anything that hits
/// the origin server, the interaction window before in-page interactions.
/// Two cooldown tiers because the upstream defense layer tracks both a
/// short window and a sliding window; one tier clears neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,
    pub interaction_delay_min_ms: u64,
    pub interaction_delay_max_ms: u64,
    /// Consecutive failures before the short cooldown kicks in
    pub short_cooldown_threshold: u32,
    pub short_cooldown_secs: u64,
    /// Consecutive failures before the long cooldown kicks in (resets count)
    pub long_cooldown_threshold: u32,
    pub long_cooldown_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_delay_min_ms: 20_000,
            request_delay_max_ms: 40_000,
            interaction_delay_min_ms: 300,
            interaction_delay_max_ms: 900,
            short_cooldown_threshold: 3,
            short_cooldown_secs: 30,
            long_cooldown_threshold: 6,
            long_cooldown_secs: 300,
        }
    }
}

impl PacingConfig {
    /// Pacing profile with no real sleeping, for tests.
    pub fn instant() -> Self {
        Self {
            request_delay_min_ms: 0,
            request_delay_max_ms: 0,
            interaction_delay_min_ms: 0,
            interaction_delay_max_ms: 0,
            short_cooldown_secs: 0,
            long_cooldown_secs: 0,
            ..Self::default()
        }
    }
}

/// Which implementation serves the "fetch detail document" capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPath {
    /// One-shot request per identifier
    Direct,
    /// Warmed interactive session with cookie jar and UA rotation.
    /// Substitute this when the defense layer starts blocking the direct path.
    Session,
}

/// Detail fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Active fetch path
    pub path: FetchPath,
    /// Per-identifier retry budget
    pub max_retries: u32,
    /// Rotate the user agent every N requests (session path)
    pub ua_rotate_every: u64,
    /// Bodies shorter than this are treated as blocking pages
    pub min_body_len: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            path: FetchPath::Session,
            max_retries: 3,
            ua_rotate_every: 10,
            min_body_len: 500,
        }
    }
}

/// Checkpoint cadence: save every N items or T seconds, whichever first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub items_interval: usize,
    pub time_interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            items_interval: 10,
            time_interval_secs: 300,
        }
    }
}

impl CheckpointConfig {
    pub fn time_interval(&self) -> Duration {
        Duration::from_secs(self.time_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.search.max_depth = 0;
        config.search.result_cap = 0;
        config.pacing.long_cooldown_threshold = 1;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_depth"));
        assert!(err.contains("result_cap"));
        assert!(err.contains("long_cooldown_threshold"));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[search]
max_depth = 2
result_cap = 50

[pacing]
request_delay_min_ms = 1000
request_delay_max_ms = 2000
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.search.max_depth, 2);
        assert_eq!(config.search.result_cap, 50);
        assert_eq!(config.pacing.request_delay_min_ms, 1000);
        // Untouched sections fall back to defaults
        assert_eq!(config.checkpoint.items_interval, 10);
    }
}
