//! regharvest: resumable, rate-governed harvesting for search-only
//! public registries
//!
//! The registry this targets offers no listing or export endpoint, only a
//! rate-limited search form. Harvesting therefore runs in two stages:
//!
//! 1. **Discovery** enumerates the name-prefix search space (adaptively
//!    subdividing prefixes whose result sets are truncated) and collects
//!    registration identifiers.
//! 2. **Extraction** fetches each identifier's detail page and parses it
//!    into a structured record, persisted backup-first to JSONL and CSV.
//!
//! Both stages checkpoint continuously and resume exactly where they
//! stopped. Pacing applies jittered per-request delays plus a two-tier
//! escalating cooldown, since the registry sits behind an aggressive
//! defense layer.

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod extraction;
pub mod fetch;
pub mod output;
pub mod pacing;
pub mod prefix;
pub mod record;
pub mod search;

pub use config::Config;
pub use record::PractitionerRecord;
