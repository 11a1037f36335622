//! Multi-source orchestration.
//!
//! Runs every selected source concurrently, each in its own task:
//!
//! ```text
//! decide (cadence) → lock → probe → discover → dedup(key, checksum)
//!     → quota → fetch → process → filter → dedup(exact, near) → write
//! ```
//!
//! The ledger is consulted before any fetch and updated after every stage,
//! so an interrupted run loses at most the item in flight. A failure in one
//! source never stops the others; the report lists every source with its
//! status and metrics.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use corpus_ledger_core::dedup::{DedupEngine, Verdict};
use corpus_ledger_core::filters::FilterRegistry;
use corpus_ledger_core::ledger::{LedgerError, LedgerService};
use corpus_ledger_core::models::{ConditionalHeaders, RunRecord, RunStatus, UPSTREAM_METADATA_KEY};
use corpus_ledger_core::policy::{OrchestrationPolicy, RunDecision, SkipReason};
use corpus_ledger_core::quota::QuotaTracker;

use crate::checkpoint::{CheckpointManager, CheckpointTracker, StreamEnd};
use crate::config::Config;
use crate::db;
use crate::index_store::{load_index_or_warn, save_index};
use crate::report::{RunReport, SourceMetrics, SourceOutcome};
use crate::traits::{
    Candidate, DiscoveryRequest, FetchOutcome, ProbeOutcome, RecordSink, Source, SourceRegistry,
    UpstreamState,
};
use crate::writer::JsonlSink;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INDEX_FILE: &str = "near_duplicate_index.json";

/// Which sources to run and how.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only these sources; empty means all.
    pub only: Vec<String>,
    pub exclude: Vec<String>,
    /// Per-source cap on discovered candidates for this run.
    pub limits: HashMap<String, u64>,
    /// Bypass cadence, known-key skips and conditional requests.
    pub force: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    ledger: Arc<LedgerService>,
    registry: Arc<SourceRegistry>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<CheckpointManager>,
    filters: Arc<FilterRegistry>,
    policy: Arc<OrchestrationPolicy>,
    dedup: Arc<Mutex<DedupEngine>>,
}

/// Why the item loop stopped.
enum Stop {
    End(StreamEnd),
    QuotaHit,
    Interrupted,
}

/// How one candidate left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Settled,
    Failed,
}

/// Mutable state of one source's run.
struct SourceRun {
    name: String,
    run_id: String,
    force: bool,
    today: NaiveDate,
    fetch_timeout: Duration,
    quota: QuotaTracker,
    known: HashSet<String>,
    /// Keys taken through the pipeline by this run, whatever the outcome.
    handled: HashSet<String>,
    tracker: Option<CheckpointTracker>,
    metrics: SourceMetrics,
}

impl SourceRun {
    async fn advance(&mut self, resume_offset: u64) -> Result<()> {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.advance(resume_offset).await?;
        }
        Ok(())
    }
}

impl Orchestrator {
    pub fn new(
        config: Config,
        ledger: Arc<LedgerService>,
        registry: SourceRegistry,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let engine = DedupEngine::new(config.dedup.engine.clone())?;
        Ok(Self {
            checkpoints: Arc::new(CheckpointManager::new(config.staging.root.clone())),
            filters: Arc::new(config.filter_registry()),
            policy: Arc::new(config.policy()),
            config: Arc::new(config),
            ledger,
            registry: Arc::new(registry),
            sink,
            dedup: Arc::new(Mutex::new(engine)),
        })
    }

    /// Open the ledger, build every configured source and the JSONL sink.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let ledger = db::open_ledger(config).await?;
        let registry = SourceRegistry::from_config(config)?;
        let sink = Arc::new(JsonlSink::new(config.output.dir.clone()));
        Self::new(config.clone(), ledger, registry, sink)
    }

    /// Replace the cadence and quota settings derived from the config.
    pub fn with_policy(mut self, policy: OrchestrationPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Resolve `opts` against the registry, in registry order.
    fn select(&self, opts: &RunOptions) -> Result<Vec<Arc<dyn Source>>> {
        let names = opts
            .only
            .iter()
            .chain(opts.exclude.iter())
            .chain(opts.limits.keys());
        for name in names {
            if self.registry.find(name).is_none() {
                bail!(
                    "Unknown source: '{}'. Available: {}",
                    name,
                    self.registry.names().join(", ")
                );
            }
        }

        Ok(self
            .registry
            .sources()
            .iter()
            .filter(|s| opts.only.is_empty() || opts.only.iter().any(|n| n == s.name()))
            .filter(|s| !opts.exclude.iter().any(|n| n == s.name()))
            .cloned()
            .collect())
    }

    /// Run the selected sources concurrently until each finishes, or until
    /// `shutdown` flips to `true`.
    pub async fn run(&self, opts: &RunOptions, shutdown: watch::Receiver<bool>) -> Result<RunReport> {
        let selected = self.select(opts)?;
        let started_at = self.ledger.now();
        self.prepare_dedup().await;

        let mut tasks = JoinSet::new();
        for source in &selected {
            let this = self.clone();
            let source = source.clone();
            let limit = opts.limits.get(source.name()).copied();
            let force = opts.force;
            let shutdown = shutdown.clone();
            tasks.spawn(async move { this.run_source(source, limit, force, shutdown).await });
        }

        let mut outcomes = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    outcomes.insert(outcome.source.clone(), outcome);
                }
                Err(e) => error!(error = %e, "Source pipeline task panicked"),
            }
        }

        let sources = selected
            .iter()
            .map(|s| {
                outcomes
                    .remove(s.name())
                    .unwrap_or_else(|| SourceOutcome::failed(s.name(), "pipeline panicked"))
            })
            .collect();

        self.persist_index().await;

        Ok(RunReport {
            started_at,
            finished_at: self.ledger.now(),
            sources,
        })
    }

    /// Where the near-duplicate index lives between runs; defaults to the
    /// staging root.
    fn index_path(&self) -> Option<PathBuf> {
        if !self.config.dedup.engine.minhash_enabled {
            return None;
        }
        Some(
            self.config
                .dedup
                .index_path
                .clone()
                .unwrap_or_else(|| self.config.staging.root.join(DEFAULT_INDEX_FILE)),
        )
    }

    async fn prepare_dedup(&self) {
        let mut engine = self.dedup.lock().await;
        if let Some(path) = self.index_path() {
            load_index_or_warn(&mut engine, &path).await;
        }
        let hashes = self.ledger.recent_text_hashes(engine.config().cache_size).await;
        engine.warm_exact(hashes);
        debug!(hashes = engine.exact_len(), "Warmed exact-duplicate cache");
    }

    async fn persist_index(&self) {
        let Some(path) = self.index_path() else {
            return;
        };
        let engine = self.dedup.lock().await;
        if let Err(e) = save_index(&engine, &path).await {
            warn!(path = %path.display(), error = %e, "Failed to save near-duplicate index");
        }
    }

    async fn run_source(
        &self,
        source: Arc<dyn Source>,
        limit: Option<u64>,
        force: bool,
        shutdown: watch::Receiver<bool>,
    ) -> SourceOutcome {
        let name = source.name().to_string();
        let started_at = self.ledger.now();

        let last = match self.ledger.get_last_successful_run(&name).await {
            Ok(last) => last,
            Err(e) => {
                error!(source = %name, error = %e, "Cannot read run history");
                return SourceOutcome::failed(&name, format!("ledger unavailable: {}", e));
            }
        };
        let decision = self.policy.should_run_source(&name, started_at, last, force);
        let run_reason = match decision {
            RunDecision::Skip(skip) => {
                info!(source = %name, decision = %decision, "Skipping source");
                return SourceOutcome::skipped(&name, skip.as_str());
            }
            RunDecision::Run(reason) => reason,
        };

        match self.ledger.acquire_source_lock(&name).await {
            Ok(true) => {}
            Ok(false) => {
                info!(source = %name, "Source is locked by another run");
                return SourceOutcome::skipped(&name, SkipReason::ConcurrentRunActive.as_str());
            }
            Err(e) => {
                error!(source = %name, error = %e, "Cannot acquire source lock");
                return SourceOutcome::failed(&name, format!("lock unavailable: {}", e));
            }
        }
        info!(source = %name, reason = run_reason.as_str(), "Running source");
        let heartbeat = self.spawn_heartbeat(&name);

        let today = started_at.date_naive();
        let quota_limit = self.policy.quota_for(&name);
        let mut run = SourceRun {
            run_id: Uuid::new_v4().to_string(),
            force,
            today,
            fetch_timeout: Duration::from_secs(
                self.config
                    .sources
                    .get(&name)
                    .map(|s| s.fetch_timeout_secs)
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            quota: QuotaTracker::new(quota_limit, self.ledger.quota_used(&name, today).await),
            known: HashSet::new(),
            handled: HashSet::new(),
            tracker: None,
            metrics: SourceMetrics {
                quota_limit,
                ..SourceMetrics::default()
            },
            name: name.clone(),
        };

        let result = self.execute(source.as_ref(), &mut run, limit, &shutdown).await;
        heartbeat.abort();
        run.metrics.quota_used = run.quota.used();

        let (status, reason) = match &result {
            Ok(()) if run.metrics.interrupted => (RunStatus::Failed, "interrupted".to_string()),
            Ok(()) if run.metrics.upstream_unchanged => {
                (RunStatus::Success, "upstream_unchanged".to_string())
            }
            Ok(()) => (RunStatus::Success, run_reason.as_str().to_string()),
            Err(e) => (RunStatus::Failed, format!("{:#}", e)),
        };
        match &result {
            Ok(()) => info!(
                source = %name,
                status = status.as_str(),
                fetched = run.metrics.fetched,
                processed = run.metrics.processed,
                duplicates = run.metrics.exact_duplicates + run.metrics.near_duplicates,
                failed = run.metrics.failed,
                quota_hit = run.metrics.quota_hit,
                "Source finished"
            ),
            Err(_) => error!(source = %name, error = %reason, "Source failed"),
        }

        let record = RunRecord {
            run_id: run.run_id.clone(),
            source: name.clone(),
            started_at,
            finished_at: self.ledger.now(),
            status,
            reason: Some(reason.clone()),
            metrics: serde_json::to_value(&run.metrics).unwrap_or_default(),
        };
        if let Err(e) = self.ledger.record_run(&record).await {
            warn!(source = %name, error = %e, "Failed to record run outcome");
        }
        if let Err(e) = self.ledger.release_source_lock(&name).await {
            warn!(source = %name, error = %e, "Failed to release source lock");
        }

        SourceOutcome {
            source: name,
            status,
            reason: Some(reason),
            run_id: Some(run.run_id),
            metrics: run.metrics,
        }
    }

    /// Keep the source lock alive while the pipeline runs.
    fn spawn_heartbeat(&self, source: &str) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let source = source.to_string();
        let period = (ledger.lock_ttl() / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ledger.heartbeat_source_lock(&source).await {
                    Ok(true) => debug!(source = %source, "Lock heartbeat"),
                    Ok(false) => warn!(source = %source, "Source lock was lost"),
                    Err(e) => warn!(source = %source, error = %e, "Lock heartbeat failed"),
                }
            }
        })
    }

    async fn execute(
        &self,
        source: &dyn Source,
        run: &mut SourceRun,
        limit: Option<u64>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let upstream_key = source.upstream_key();
        if let Some(key) = upstream_key.as_deref() {
            if !run.force && self.upstream_unchanged(source, key).await {
                run.metrics.upstream_unchanged = true;
                return Ok(());
            }
        }

        run.tracker = self.open_tracker(source, run).await;
        if !run.force {
            run.known = self.ledger.get_processed_keys(&run.name, None).await;
        }

        let mut upstream = None;
        let stop = match self.consume(source, run, limit, &mut upstream, shutdown).await {
            Ok(stop) => stop,
            Err(e) => {
                if let Some(tracker) = run.tracker.as_mut() {
                    if let Err(flush_err) = tracker.flush().await {
                        warn!(source = %run.name, error = %flush_err, "Failed to save checkpoint");
                    }
                }
                return Err(e);
            }
        };

        match stop {
            Stop::End(end) => {
                if let Some(tracker) = run.tracker.as_mut() {
                    tracker.finish(end).await?;
                }
                if end == StreamEnd::Exhausted
                    && run.metrics.failed == 0
                    && run.metrics.conflicts == 0
                {
                    if let (Some(key), Some(state)) = (upstream_key.as_deref(), upstream) {
                        self.remember_upstream(&run.name, key, &state).await?;
                    }
                }
            }
            Stop::QuotaHit | Stop::Interrupted => {
                if let Some(tracker) = run.tracker.as_mut() {
                    tracker.flush().await?;
                }
            }
        }
        Ok(())
    }

    /// `true` when the upstream answered a conditional probe with "not
    /// modified". Without stored validators there is nothing to probe.
    async fn upstream_unchanged(&self, source: &dyn Source, key: &str) -> bool {
        let name = source.name();
        let headers = self.ledger.get_conditional_headers(name, key).await;
        if headers.is_empty() {
            return false;
        }
        match source.probe(&headers).await {
            Ok(ProbeOutcome::NotModified) => {
                info!(source = name, "Upstream not modified since last run");
                true
            }
            Ok(ProbeOutcome::Changed(_)) => false,
            Err(e) => {
                warn!(source = name, error = %e, "Upstream probe failed, running anyway");
                false
            }
        }
    }

    /// Store the dump's validators so the next run can probe it.
    async fn remember_upstream(&self, source: &str, key: &str, state: &UpstreamState) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert(UPSTREAM_METADATA_KEY.to_string(), true.into());
        self.ledger.record_discovery(source, key, metadata, true).await?;
        self.ledger
            .mark_fetched(
                source,
                key,
                Some(200),
                state.validators.etag.as_deref(),
                state.validators.last_modified.as_deref(),
            )
            .await?;
        self.ledger
            .mark_processed(source, key, &state.content_hash, None, None)
            .await?;
        Ok(())
    }

    /// Checkpoint tracking for resumable sources. Without a checkpoint, a
    /// completion marker's final offset starts a new lineage.
    async fn open_tracker(&self, source: &dyn Source, run: &mut SourceRun) -> Option<CheckpointTracker> {
        if !source.resumable() {
            return None;
        }
        let name = source.name();
        let every = self.config.orchestration.checkpoint_every;
        if run.force {
            return Some(CheckpointTracker::new(
                self.checkpoints.clone(),
                name,
                every,
                None,
                0,
                &run.run_id,
            ));
        }

        if let Some(checkpoint) = self.checkpoints.load(name).await {
            info!(
                source = name,
                offset = checkpoint.last_offset,
                run_id = %checkpoint.run_id,
                "Resuming from checkpoint"
            );
            run.metrics.resumed_from_offset = Some(checkpoint.last_offset);
            return Some(CheckpointTracker::new(
                self.checkpoints.clone(),
                name,
                every,
                Some(&checkpoint),
                0,
                &run.run_id,
            ));
        }

        let start = match self.checkpoints.completion(name).await {
            Some(marker) => {
                debug!(source = name, offset = marker.final_offset, "Continuing after completed extraction");
                run.metrics.resumed_from_offset = Some(marker.final_offset);
                marker.final_offset
            }
            None => 0,
        };
        Some(CheckpointTracker::new(
            self.checkpoints.clone(),
            name,
            every,
            None,
            start,
            &run.run_id,
        ))
    }

    async fn consume(
        &self,
        source: &dyn Source,
        run: &mut SourceRun,
        limit: Option<u64>,
        upstream: &mut Option<UpstreamState>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Stop> {
        let batch = self.config.orchestration.checkpoint_every.max(1);
        let mut offset = run.tracker.as_ref().map(|t| t.last_offset()).unwrap_or(0);
        let mut remaining = limit;

        loop {
            if remaining == Some(0) {
                return Ok(Stop::End(StreamEnd::LimitReached));
            }
            if run.quota.is_exhausted() {
                run.metrics.quota_hit = true;
                run.quota.log_status(&run.name);
                info!(source = %run.name, "Daily quota already used, stopping before discovery");
                return Ok(Stop::QuotaHit);
            }
            let want = remaining.map_or(batch, |r| r.min(batch));
            let discovery = source
                .discover(&DiscoveryRequest {
                    resume_offset: offset,
                    limit: Some(want as usize),
                })
                .await
                .context("discovery failed")?;
            if discovery.upstream.is_some() {
                *upstream = discovery.upstream.clone();
            }
            let found = discovery.candidates.len() as u64;
            run.metrics.candidates += found;
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(found);
            }
            debug!(source = %run.name, offset, found, "Discovered batch");

            for candidate in &discovery.candidates {
                if !run.known.contains(&candidate.key) && !run.handled.contains(&candidate.key) {
                    self.ledger
                        .record_discovery(&run.name, &candidate.key, candidate.metadata.clone(), run.force)
                        .await?;
                }
            }

            let mut item_start = offset;
            for (idx, candidate) in discovery.candidates.iter().enumerate() {
                let start = std::mem::replace(&mut item_start, candidate.offset);
                if *shutdown.borrow() {
                    info!(source = %run.name, "Shutdown requested, stopping source");
                    run.metrics.interrupted = true;
                    return Ok(Stop::Interrupted);
                }

                if run.known.contains(&candidate.key) || run.handled.contains(&candidate.key) {
                    run.metrics.skipped_known += 1;
                    run.advance(candidate.offset).await?;
                    continue;
                }

                if !run.force {
                    let copied = self.is_copy_of_settled(run, candidate).await;
                    match item_conflict(run, &candidate.key, copied)? {
                        Some(true) => {
                            run.metrics.exact_duplicates += 1;
                            run.handled.insert(candidate.key.clone());
                            run.advance(candidate.offset).await?;
                            continue;
                        }
                        Some(false) => {}
                        None => {
                            run.handled.insert(candidate.key.clone());
                            run.advance(candidate.offset).await?;
                            continue;
                        }
                    }
                }

                if !run.quota.try_consume() {
                    run.metrics.quota_hit = true;
                    run.metrics.items_remaining = discovery.candidates[idx..]
                        .iter()
                        .filter(|c| !run.known.contains(&c.key) && !run.handled.contains(&c.key))
                        .count() as u64;
                    run.quota.log_status(&run.name);
                    info!(
                        source = %run.name,
                        remaining = run.metrics.items_remaining,
                        "Daily quota reached, stopping source"
                    );
                    return Ok(Stop::QuotaHit);
                }
                self.ledger.add_quota_usage(&run.name, run.today, 1).await?;

                let handled = self.handle_item(source, run, candidate).await;
                let handled = item_conflict(run, &candidate.key, handled)?;
                run.handled.insert(candidate.key.clone());
                if handled == Some(Handled::Failed) {
                    // Resume no later than this item so the next run retries it.
                    if let Some(tracker) = run.tracker.as_mut() {
                        tracker.hold(start);
                    }
                }
                run.advance(candidate.offset).await?;
            }

            if let Some(tracker) = run.tracker.as_mut() {
                tracker.skip_to(discovery.next_offset);
            }
            if discovery.exhausted {
                return Ok(Stop::End(StreamEnd::Exhausted));
            }
            if discovery.candidates.is_empty() && discovery.next_offset <= offset {
                bail!("source made no progress at offset {}", offset);
            }
            offset = discovery.next_offset;
        }
    }

    /// Content already settled under another key: settle this key as a
    /// duplicate without reading it.
    async fn is_copy_of_settled(&self, run: &SourceRun, candidate: &Candidate) -> Result<bool> {
        let Some(checksum) = candidate.checksum.as_deref() else {
            return Ok(false);
        };
        let Some(existing) = self.ledger.check_file_checksum(checksum, &run.name).await? else {
            return Ok(false);
        };
        if existing.key == candidate.key || !existing.state.is_settled() {
            return Ok(false);
        }

        debug!(source = %run.name, key = %candidate.key, original = %existing.key, "Content already collected");
        let hash = existing.text_hash.unwrap_or_else(|| checksum.to_string());
        self.ledger
            .mark_fetched(&run.name, &candidate.key, None, None, None)
            .await?;
        self.ledger
            .mark_duplicate(&run.name, &candidate.key, &hash)
            .await?;
        Ok(true)
    }

    /// Fetch, process, filter, dedup and write one candidate, reconciling
    /// each outcome with the ledger. Per-item failures are recorded on the
    /// item; only ledger errors propagate.
    async fn handle_item(
        &self,
        source: &dyn Source,
        run: &mut SourceRun,
        candidate: &Candidate,
    ) -> Result<Handled> {
        let name = run.name.as_str();
        let key = candidate.key.as_str();

        let prior = self.ledger.get_record(name, key).await?;
        let headers = match &prior {
            Some(record) if !run.force && record.text_hash.is_some() => record.conditional_headers(),
            _ => ConditionalHeaders::default(),
        };

        let fetched = match tokio::time::timeout(run.fetch_timeout, source.fetch(candidate, &headers)).await {
            Ok(Ok(FetchOutcome::Fetched(fetched))) => fetched,
            Ok(Ok(FetchOutcome::NotModified)) => {
                self.ledger
                    .mark_fetched(
                        name,
                        key,
                        Some(304),
                        headers.etag.as_deref(),
                        headers.last_modified.as_deref(),
                    )
                    .await?;
                let hash = prior.and_then(|r| r.text_hash).unwrap_or_default();
                self.ledger.mark_duplicate(name, key, &hash).await?;
                run.metrics.not_modified += 1;
                return Ok(Handled::Settled);
            }
            Ok(Err(e)) => {
                return self
                    .fail_item(name, key, &format!("fetch failed: {:#}", e), &mut run.metrics)
                    .await;
            }
            Err(_) => {
                let message = format!("fetch timed out after {}s", run.fetch_timeout.as_secs());
                return self.fail_item(name, key, &message, &mut run.metrics).await;
            }
        };
        run.metrics.fetched += 1;
        self.ledger
            .mark_fetched(
                name,
                key,
                fetched.http_status,
                fetched.etag.as_deref(),
                fetched.last_modified.as_deref(),
            )
            .await?;

        let record = match source.process(candidate, &fetched).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(source = name, key, "Nothing extractable");
                let hash = hex::encode(Sha256::digest(&fetched.body));
                self.ledger.mark_processed(name, key, &hash, None, None).await?;
                run.metrics.filtered += 1;
                return Ok(Handled::Settled);
            }
            Err(e) => {
                return self
                    .fail_item(name, key, &format!("process failed: {:#}", e), &mut run.metrics)
                    .await;
            }
        };

        let rejected_by = self.filters.rejected_by(&record);
        let mut engine = self.dedup.lock().await;
        let signature = engine.signature(&record);

        if let Some(filter) = rejected_by {
            drop(engine);
            debug!(source = name, key, filter, "Record filtered");
            self.ledger
                .mark_processed(name, key, &signature.text_hash, None, None)
                .await?;
            run.metrics.filtered += 1;
            return Ok(Handled::Settled);
        }

        match engine.classify(&signature) {
            Verdict::ExactDuplicate => {
                drop(engine);
                self.ledger.mark_duplicate(name, key, &signature.text_hash).await?;
                run.metrics.exact_duplicates += 1;
            }
            Verdict::NearDuplicate { of, similarity } => {
                drop(engine);
                debug!(source = name, key, of = %of, similarity, "Near duplicate");
                self.ledger.mark_duplicate(name, key, &signature.text_hash).await?;
                run.metrics.near_duplicates += 1;
            }
            Verdict::Unique => match self.sink.write(name, &record, &signature.text_hash).await {
                Ok(output_id) => {
                    engine.commit(&signature);
                    drop(engine);
                    self.ledger
                        .mark_processed(
                            name,
                            key,
                            &signature.text_hash,
                            Some(&output_id),
                            signature.minhash.as_ref().map(|m| m.values()),
                        )
                        .await?;
                    run.metrics.processed += 1;
                }
                Err(e) => {
                    engine.forget(&signature.text_hash);
                    drop(engine);
                    return self
                        .fail_item(name, key, &format!("write failed: {:#}", e), &mut run.metrics)
                        .await;
                }
            },
        }
        Ok(Handled::Settled)
    }

    async fn fail_item(
        &self,
        source: &str,
        key: &str,
        message: &str,
        metrics: &mut SourceMetrics,
    ) -> Result<Handled> {
        warn!(source, key, error = message, "Item failed");
        self.ledger.mark_failed(source, key, message).await?;
        metrics.failed += 1;
        Ok(Handled::Failed)
    }
}

/// Turn a ledger transition conflict on one item into that item's outcome
/// (`None`) so the rest of the stream still runs. Other errors propagate.
fn item_conflict<T>(run: &mut SourceRun, key: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => match e.downcast_ref::<LedgerError>() {
            Some(LedgerError::InvalidTransition { from, to, .. }) => {
                warn!(source = %run.name, key, %from, %to, "Record changed state during the run, leaving it");
                run.metrics.conflicts += 1;
                Ok(None)
            }
            _ => Err(e),
        },
    }
}
