//! Core data models shared by the ledger, deduplication engine, and
//! orchestrator.
//!
//! These types describe what the control plane knows about each tracked
//! resource ([`CrawlRecord`]), the cleaned text that flows out of a source
//! ([`CleanRecord`]), and the per-run bookkeeping that drives cadence
//! decisions ([`RunRecord`]).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata flag on the row that stores a dump's upstream validators.
pub const UPSTREAM_METADATA_KEY: &str = "upstream";

/// Lifecycle state of a tracked resource.
///
/// ```text
/// discovered ──▶ fetched ──▶ processed
///     │             │            │
///     └──▶ failed ◀─┘            ▼
///                   └──────▶ duplicate
/// ```
///
/// `processed`, `duplicate` and `failed` are terminal. Leaving a terminal
/// state always re-enters at `discovered`, either through a forced
/// reprocess or (for `failed` only) through rediscovery on a later run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Discovered,
    Fetched,
    Processed,
    Duplicate,
    Failed,
}

impl CrawlState {
    pub const ALL: [CrawlState; 5] = [
        CrawlState::Discovered,
        CrawlState::Fetched,
        CrawlState::Processed,
        CrawlState::Duplicate,
        CrawlState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlState::Discovered => "discovered",
            CrawlState::Fetched => "fetched",
            CrawlState::Processed => "processed",
            CrawlState::Duplicate => "duplicate",
            CrawlState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlState::Processed | CrawlState::Duplicate | CrawlState::Failed
        )
    }

    /// Whether a record in this state has been fully handled and must not be
    /// fetched again unless forced.
    pub fn is_settled(&self) -> bool {
        matches!(self, CrawlState::Processed | CrawlState::Duplicate)
    }

    /// Whether the state machine permits moving from `self` to `next`
    /// without a forced reset.
    ///
    /// Self-transitions on `fetched` and `failed` are allowed so that
    /// validator refreshes and repeated failure reports stay idempotent.
    pub fn can_transition_to(&self, next: CrawlState) -> bool {
        use CrawlState::*;
        matches!(
            (self, next),
            (Discovered, Fetched)
                | (Discovered, Failed)
                | (Fetched, Fetched)
                | (Fetched, Processed)
                | (Fetched, Failed)
                | (Fetched, Duplicate)
                | (Processed, Duplicate)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(CrawlState::Discovered),
            "fetched" => Ok(CrawlState::Fetched),
            "processed" => Ok(CrawlState::Processed),
            "duplicate" => Ok(CrawlState::Duplicate),
            "failed" => Ok(CrawlState::Failed),
            other => anyhow::bail!("unknown crawl state: '{}'", other),
        }
    }
}

/// One tracked resource: a URL, corpus identifier, or file checksum key.
///
/// `(source, key)` is unique. Rows are only physically removed by an
/// administrative reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRecord {
    pub key: String,
    pub source: String,
    pub state: CrawlState,
    pub discovered_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub http_status: Option<u16>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub text_hash: Option<String>,
    pub minhash_signature: Option<Vec<u32>>,
    pub output_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Source-specific extras (e.g. `"checksum"` for local files).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CrawlRecord {
    /// A freshly discovered record with no fetch history.
    pub fn discovered(source: &str, key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            source: source.to_string(),
            state: CrawlState::Discovered,
            discovered_at: now,
            fetched_at: None,
            processed_at: None,
            http_status: None,
            etag: None,
            last_modified: None,
            text_hash: None,
            minhash_signature: None,
            output_id: None,
            error_message: None,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        }
    }

    /// The content checksum stored in `metadata["checksum"]`, if any.
    pub fn checksum(&self) -> Option<&str> {
        self.metadata.get("checksum").and_then(|v| v.as_str())
    }

    /// Rows holding a whole dump's validators rather than an item; left out
    /// of state counts.
    pub fn is_upstream_marker(&self) -> bool {
        self.metadata.contains_key(UPSTREAM_METADATA_KEY)
    }

    pub fn conditional_headers(&self) -> ConditionalHeaders {
        ConditionalHeaders {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

/// HTTP validators from the last successful fetch of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ConditionalHeaders {
    /// `true` when neither validator is known and a full fetch is required.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Record counts per [`CrawlState`] for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub discovered: u64,
    pub fetched: u64,
    pub processed: u64,
    pub duplicate: u64,
    pub failed: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: CrawlState, n: u64) {
        match state {
            CrawlState::Discovered => self.discovered += n,
            CrawlState::Fetched => self.fetched += n,
            CrawlState::Processed => self.processed += n,
            CrawlState::Duplicate => self.duplicate += n,
            CrawlState::Failed => self.failed += n,
        }
    }

    pub fn get(&self, state: CrawlState) -> u64 {
        match state {
            CrawlState::Discovered => self.discovered,
            CrawlState::Fetched => self.fetched,
            CrawlState::Processed => self.processed,
            CrawlState::Duplicate => self.duplicate,
            CrawlState::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.discovered + self.fetched + self.processed + self.duplicate + self.failed
    }
}

/// A cleaned text record produced by a source's process step.
///
/// `fields` carries any additional hashable attributes a source exposes;
/// `text` and `url` are addressable by those names in `hash_fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub key: String,
    pub text: String,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl CleanRecord {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Look up a hashable field by name. Unknown names yield `None`.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "text" => Some(self.text.as_str()),
            "url" => self.url.as_deref(),
            "key" => Some(self.key.as_str()),
            other => self.fields.get(other).map(|s| s.as_str()),
        }
    }
}

/// Terminal status of one source within an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "skipped" => Ok(RunStatus::Skipped),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: '{}'", other),
        }
    }
}

/// A completed pipeline run for one source, as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub metrics: serde_json::Value,
}
