//! Extension traits for sources and output sinks.
//!
//! A [`Source`] is an upstream collaborator: it discovers candidate keys,
//! fetches raw bytes and turns them into a [`CleanRecord`]. It never
//! touches the ledger; the orchestrator decides what gets fetched and
//! reconciles every outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              SourceRegistry              │
//! │  ┌──────────┐ ┌─────────┐ ┌───────────┐ │
//! │  │filesystem│ │  jsonl  │ │ http_dump │ │
//! │  └──────────┘ └─────────┘ └───────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!      Orchestrator: probe → discover → fetch → process
//!                ▼
//!           RecordSink (JSONL)
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use corpus_ledger_core::models::{CleanRecord, ConditionalHeaders};

use crate::config::{Config, SourceKind};

/// One resource a source could fetch.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    /// Ledger key, unique within the source.
    pub key: String,
    /// Resume point after this candidate has been consumed.
    pub offset: u64,
    /// Content checksum when known before fetching (local files).
    pub checksum: Option<String>,
    /// Merged into the ledger record's metadata at discovery.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Raw content already in hand (streamed or dump-embedded items).
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryRequest {
    /// Offset to start reading from (a checkpoint's `last_offset`).
    pub resume_offset: u64,
    /// Maximum candidates to return.
    pub limit: Option<usize>,
}

/// Validators and content hash of a dump-style upstream resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamState {
    pub validators: ConditionalHeaders,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub candidates: Vec<Candidate>,
    /// Where the next batch starts.
    pub next_offset: u64,
    /// `true` only when the upstream has nothing left, never merely
    /// because `limit` was reached.
    pub exhausted: bool,
    pub upstream: Option<UpstreamState>,
}

/// Raw bytes plus HTTP metadata.
#[derive(Debug, Clone, Default)]
pub struct FetchedResource {
    pub http_status: Option<u16>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The stored validators still match.
    NotModified,
    Fetched(FetchedResource),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    NotModified,
    /// Changed (or unknown); carries any validators the probe saw.
    Changed(ConditionalHeaders),
}

/// A configured upstream source.
///
/// # Lifecycle
///
/// 1. [`probe`](Source::probe): only when [`upstream_key`](Source::upstream_key)
///    is set and validators are stored; `NotModified` ends the run early.
/// 2. [`discover`](Source::discover): called in batches until exhausted
///    or a limit is hit.
/// 3. [`fetch`](Source::fetch): per candidate that passed discovery-stage
///    dedup and quota, under the source's timeout.
/// 4. [`process`](Source::process): `Ok(None)` means nothing extractable.
#[async_trait]
pub trait Source: Send + Sync {
    /// Configured instance name (the `[sources.<name>]` key).
    fn name(&self) -> &str;

    /// One-line description for `corpus sources`.
    fn description(&self) -> &str;

    /// Kind identifier (`"filesystem"`, `"jsonl"`, `"http_dump"`, ...).
    fn kind(&self) -> &str {
        "custom"
    }

    /// Whether offsets are stable across runs, so a checkpoint can resume
    /// the stream.
    fn resumable(&self) -> bool {
        false
    }

    /// Ledger key of the single upstream resource behind a dump-style
    /// source; its validators drive the existence probe.
    fn upstream_key(&self) -> Option<String> {
        None
    }

    async fn probe(&self, _headers: &ConditionalHeaders) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome::Changed(ConditionalHeaders::default()))
    }

    async fn discover(&self, request: &DiscoveryRequest) -> Result<Discovery>;

    async fn fetch(&self, candidate: &Candidate, headers: &ConditionalHeaders)
        -> Result<FetchOutcome>;

    async fn process(
        &self,
        candidate: &Candidate,
        fetched: &FetchedResource,
    ) -> Result<Option<CleanRecord>>;
}

/// Destination for unique records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Durably write `record`; returns its output id.
    async fn write(&self, source: &str, record: &CleanRecord, text_hash: &str) -> Result<String>;
}

/// Ordered registry of sources, built once at startup.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// A registry holding every source declared in the config, in name
    /// order.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::source_fs::FilesystemSource;
        use crate::source_http::HttpDumpSource;
        use crate::source_jsonl::JsonlSource;

        let mut registry = Self::new();
        for (name, cfg) in &config.sources {
            let source: Arc<dyn Source> = match &cfg.kind {
                SourceKind::Filesystem(fs) => Arc::new(FilesystemSource::new(name.clone(), fs.clone())),
                SourceKind::Jsonl(jsonl) => Arc::new(JsonlSource::new(name.clone(), jsonl.clone())),
                SourceKind::HttpDump(http) => Arc::new(HttpDumpSource::new(
                    name.clone(),
                    http.clone(),
                    cfg.fetch_timeout_secs,
                )?),
            };
            registry.register(source);
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn Source>] {
        &self.sources
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Source>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
