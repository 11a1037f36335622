//! Configuration parsing and validation.
//!
//! Corpus Ledger is configured with a single TOML file (default
//! `config/corpus.toml`). Every section deserializes into a typed struct
//! with defaults; [`load_config`] rejects out-of-range values before any
//! command touches the ledger.
//!
//! ```toml
//! [db]
//! path = "data/ledger.sqlite"
//!
//! [staging]
//! root = "data/staging"
//!
//! [output]
//! dir = "data/output"
//!
//! [orchestration]
//! project_start = "2026-01-01"
//! initial_collection_days = 7
//!
//! [sources.wiki]
//! kind = "http_dump"
//! url = "https://dumps.example.org/wiki.jsonl"
//! cadence_days = 7
//! daily_quota = 50000
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use corpus_ledger_core::dedup::DedupConfig;
use corpus_ledger_core::filters::{FilterRegistry, MinLengthFilter, SinceFilter};
use corpus_ledger_core::policy::OrchestrationPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub staging: StagingConfig,
    pub output: OutputConfig,
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Extra attempts for a ledger write that failed transiently.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_write_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    /// Per-source checkpoint directories live under this root.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestrationConfig {
    pub project_start: NaiveDate,
    #[serde(default = "default_initial_collection_days")]
    pub initial_collection_days: u32,
    #[serde(default = "default_cadence_days")]
    pub default_cadence_days: u32,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

fn default_initial_collection_days() -> u32 {
    7
}
fn default_cadence_days() -> u32 {
    1
}
fn default_lock_ttl_seconds() -> u64 {
    3600
}
fn default_checkpoint_every() -> u64 {
    1000
}

/// `[dedup]`: engine settings plus where the LSH index is persisted.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DedupSection {
    #[serde(flatten)]
    pub engine: DedupConfig,
    /// Where the near-duplicate index is kept between runs. Defaults to a
    /// file under the staging root.
    #[serde(default)]
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FiltersConfig {
    /// Minimum trimmed text length; 0 disables the filter.
    #[serde(default)]
    pub min_chars: usize,
    /// Drop records timestamped before this day (UTC).
    #[serde(default)]
    pub since: Option<NaiveDate>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub cadence_days: Option<u32>,
    /// Items per UTC day; 0 = unlimited.
    #[serde(default)]
    pub daily_quota: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(flatten)]
    pub kind: SourceKind,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Filesystem(FilesystemSourceConfig),
    Jsonl(JsonlSourceConfig),
    HttpDump(HttpDumpSourceConfig),
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Filesystem(_) => "filesystem",
            SourceKind::Jsonl(_) => "jsonl",
            SourceKind::HttpDump(_) => "http_dump",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonlSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_url_field")]
    pub url_field: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpDumpSourceConfig {
    pub url: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_url_field")]
    pub url_field: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: Option<String>,
}

fn default_id_field() -> String {
    "id".to_string()
}
fn default_text_field() -> String {
    "text".to_string()
}
fn default_url_field() -> Option<String> {
    Some("url".to_string())
}
fn default_timestamp_field() -> Option<String> {
    Some("timestamp".to_string())
}

/// Field mapping for line-delimited JSON records.
#[derive(Debug, Clone)]
pub struct JsonlFields {
    pub id_field: String,
    pub text_field: String,
    pub url_field: Option<String>,
    pub timestamp_field: Option<String>,
}

impl JsonlSourceConfig {
    pub fn fields(&self) -> JsonlFields {
        JsonlFields {
            id_field: self.id_field.clone(),
            text_field: self.text_field.clone(),
            url_field: self.url_field.clone(),
            timestamp_field: self.timestamp_field.clone(),
        }
    }
}

impl HttpDumpSourceConfig {
    pub fn fields(&self) -> JsonlFields {
        JsonlFields {
            id_field: self.id_field.clone(),
            text_field: self.text_field.clone(),
            url_field: self.url_field.clone(),
            timestamp_field: self.timestamp_field.clone(),
        }
    }
}

impl Config {
    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let orch = &self.orchestration;
        if !(1..=30).contains(&orch.initial_collection_days) {
            bail!("orchestration.initial_collection_days must be within 1..=30");
        }
        if orch.default_cadence_days < 1 {
            bail!("orchestration.default_cadence_days must be >= 1");
        }
        if orch.lock_ttl_seconds == 0 {
            bail!("orchestration.lock_ttl_seconds must be > 0");
        }
        if orch.checkpoint_every == 0 {
            bail!("orchestration.checkpoint_every must be > 0");
        }

        self.dedup.engine.validate()?;

        for (name, source) in &self.sources {
            validate_source_name(name)?;
            if source.cadence_days == Some(0) {
                bail!("sources.{}.cadence_days must be >= 1", name);
            }
            if source.fetch_timeout_secs == 0 {
                bail!("sources.{}.fetch_timeout_secs must be > 0", name);
            }
            if let SourceKind::HttpDump(http) = &source.kind {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    bail!("sources.{}.url must be an http(s) URL, got '{}'", name, http.url);
                }
            }
        }

        Ok(())
    }

    /// Cadence, quota and initial-window settings for the run decision.
    pub fn policy(&self) -> OrchestrationPolicy {
        let mut cadence_days = HashMap::new();
        let mut daily_quota = HashMap::new();
        for (name, source) in &self.sources {
            if let Some(days) = source.cadence_days {
                cadence_days.insert(name.clone(), days);
            }
            daily_quota.insert(name.clone(), source.daily_quota);
        }
        OrchestrationPolicy {
            project_start: self.orchestration.project_start,
            initial_collection_days: self.orchestration.initial_collection_days,
            default_cadence_days: self.orchestration.default_cadence_days,
            cadence_days,
            daily_quota,
        }
    }

    /// Record filters in application order.
    pub fn filter_registry(&self) -> FilterRegistry {
        let mut registry = FilterRegistry::new();
        if self.filters.min_chars > 0 {
            registry.register(Box::new(MinLengthFilter {
                min_chars: self.filters.min_chars,
            }));
        }
        if let Some(day) = self.filters.since {
            let since = day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
            registry.register(Box::new(SinceFilter { since }));
        }
        registry
    }
}

/// Source names become directory and file names.
fn validate_source_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        bail!(
            "invalid source name '{}': use letters, digits, '-' or '_'",
            name
        );
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
