//! HTTP dump source: one JSON Lines document behind a URL.
//!
//! The dump's validators are remembered on a ledger record keyed by the
//! URL. Before discovery the orchestrator sends them in a `HEAD` probe; a
//! `304 Not Modified` ends the run without downloading anything.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use corpus_ledger_core::models::{CleanRecord, ConditionalHeaders};

use crate::config::{HttpDumpSourceConfig, JsonlFields};
use crate::source_jsonl::{inline_payload, line_candidate, process_line};
use crate::traits::{
    Candidate, Discovery, DiscoveryRequest, FetchOutcome, FetchedResource, ProbeOutcome, Source,
    UpstreamState,
};

struct Dump {
    body: String,
    upstream: UpstreamState,
}

pub struct HttpDumpSource {
    name: String,
    description: String,
    config: HttpDumpSourceConfig,
    fields: JsonlFields,
    client: reqwest::Client,
    dump: Mutex<Option<Dump>>,
}

impl HttpDumpSource {
    pub fn new(name: String, config: HttpDumpSourceConfig, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("corpus-ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let description = format!("JSON Lines dump at {}", config.url);
        let fields = config.fields();
        Ok(Self {
            name,
            description,
            config,
            fields,
            client,
            dump: Mutex::new(None),
        })
    }

    async fn download(&self) -> Result<Dump> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.config.url))?
            .error_for_status()?;

        let validators = validators_from(response.headers());
        let body = response.text().await?;
        let content_hash = hex::encode(Sha256::digest(body.as_bytes()));

        info!(source = %self.name, bytes = body.len(), "Downloaded dump");
        Ok(Dump {
            body,
            upstream: UpstreamState {
                validators,
                content_hash,
            },
        })
    }
}

fn validators_from(headers: &HeaderMap) -> ConditionalHeaders {
    let get = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ConditionalHeaders {
        etag: get(ETAG),
        last_modified: get(LAST_MODIFIED),
    }
}

#[async_trait]
impl Source for HttpDumpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &str {
        "http_dump"
    }

    fn upstream_key(&self) -> Option<String> {
        Some(self.config.url.clone())
    }

    async fn probe(&self, headers: &ConditionalHeaders) -> Result<ProbeOutcome> {
        let mut request = self.client.head(&self.config.url);
        if let Some(etag) = &headers.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(lm) = &headers.last_modified {
            request = request.header(IF_MODIFIED_SINCE, lm.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(source = %self.name, error = %e, "HEAD probe failed, assuming changed");
                return Ok(ProbeOutcome::Changed(ConditionalHeaders::default()));
            }
        };
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(source = %self.name, "Dump not modified");
            return Ok(ProbeOutcome::NotModified);
        }
        Ok(ProbeOutcome::Changed(validators_from(response.headers())))
    }

    async fn discover(&self, request: &DiscoveryRequest) -> Result<Discovery> {
        let mut cached = self.dump.lock().await;
        if request.resume_offset == 0 || cached.is_none() {
            *cached = Some(self.download().await?);
        }
        let dump = cached.as_ref().context("dump not downloaded")?;

        let mut discovery = Discovery {
            next_offset: request.resume_offset,
            upstream: Some(dump.upstream.clone()),
            exhausted: true,
            ..Discovery::default()
        };
        for (idx, line) in dump.body.lines().enumerate() {
            let line_no = idx as u64 + 1;
            if line_no <= request.resume_offset {
                continue;
            }
            if let Some(limit) = request.limit {
                if discovery.candidates.len() >= limit {
                    discovery.exhausted = false;
                    break;
                }
            }
            discovery.next_offset = line_no;
            if let Some(candidate) = line_candidate(&self.name, line_no, line, &self.fields) {
                discovery.candidates.push(candidate);
            }
        }
        Ok(discovery)
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        _headers: &ConditionalHeaders,
    ) -> Result<FetchOutcome> {
        inline_payload(candidate)
    }

    async fn process(
        &self,
        _candidate: &Candidate,
        fetched: &FetchedResource,
    ) -> Result<Option<CleanRecord>> {
        process_line(&fetched.body, &self.fields)
    }
}
