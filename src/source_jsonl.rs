//! JSON Lines file source.
//!
//! Each non-blank line is one item. Offsets count consumed lines, so a
//! checkpoint's `last_offset` is the number of lines a restart skips. Blank
//! and malformed lines advance the offset but produce no candidate.
//!
//! Keys come from the configured id field (string or integer). A line
//! without one is keyed by the hash of its content: `sha256:<16 hex>`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use corpus_ledger_core::models::{CleanRecord, ConditionalHeaders};

use crate::config::{JsonlFields, JsonlSourceConfig};
use crate::traits::{
    Candidate, Discovery, DiscoveryRequest, FetchOutcome, FetchedResource, Source,
};

pub struct JsonlSource {
    name: String,
    description: String,
    config: JsonlSourceConfig,
    fields: JsonlFields,
}

impl JsonlSource {
    pub fn new(name: String, config: JsonlSourceConfig) -> Self {
        let description = format!("JSON Lines file {}", config.path.display());
        let fields = config.fields();
        Self {
            name,
            description,
            config,
            fields,
        }
    }
}

#[async_trait]
impl Source for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &str {
        "jsonl"
    }

    fn resumable(&self) -> bool {
        true
    }

    async fn discover(&self, request: &DiscoveryRequest) -> Result<Discovery> {
        let file = tokio::fs::File::open(&self.config.path)
            .await
            .with_context(|| format!("Failed to open {}", self.config.path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut line_no: u64 = 0;
        let mut discovery = Discovery {
            next_offset: request.resume_offset,
            ..Discovery::default()
        };

        loop {
            if let Some(limit) = request.limit {
                if discovery.candidates.len() >= limit {
                    return Ok(discovery);
                }
            }
            let Some(line) = lines.next_line().await? else {
                discovery.exhausted = true;
                return Ok(discovery);
            };
            line_no += 1;
            if line_no <= request.resume_offset {
                continue;
            }
            discovery.next_offset = line_no;
            if let Some(candidate) = line_candidate(&self.name, line_no, &line, &self.fields) {
                discovery.candidates.push(candidate);
            }
        }
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

/// Build a candidate from line `line_no` (1-based). Blank lines yield
/// `None` silently; malformed ones with a warning.
pub(crate) fn line_candidate(
    source: &str,
    line_no: u64,
    line: &str,
    fields: &JsonlFields,
) -> Option<Candidate> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            warn!(source, line = line_no, "Skipping line: not a JSON object");
            return None;
        }
        Err(e) => {
            warn!(source, line = line_no, error = %e, "Skipping malformed JSON line");
            return None;
        }
    };

    let key = item_key(&value, trimmed, fields);
    let mut metadata = serde_json::Map::new();
    metadata.insert("line".to_string(), Value::from(line_no));

    Some(Candidate {
        key,
        offset: line_no,
        checksum: None,
        metadata,
        payload: Some(trimmed.as_bytes().to_vec()),
    })
}

fn item_key(value: &Value, raw: &str, fields: &JsonlFields) -> String {
    match value.get(&fields.id_field) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            let digest = hex::encode(Sha256::digest(raw.as_bytes()));
            format!("sha256:{}", &digest[..16])
        }
    }
}

/// A line's bytes were captured at discovery; fetching just hands them back.
pub(crate) fn inline_payload(candidate: &Candidate) -> Result<FetchOutcome> {
    let Some(body) = &candidate.payload else {
        bail!("no payload captured for '{}'", candidate.key);
    };
    Ok(FetchOutcome::Fetched(FetchedResource {
        body: body.clone(),
        ..FetchedResource::default()
    }))
}

/// Parse one JSON line into a [`CleanRecord`]. `Ok(None)` when the text
/// field is missing or blank.
pub(crate) fn process_line(body: &[u8], fields: &JsonlFields) -> Result<Option<CleanRecord>> {
    let value: Value = serde_json::from_slice(body).context("invalid JSON payload")?;
    let Value::Object(map) = &value else {
        bail!("payload is not a JSON object");
    };

    let text = match map.get(&fields.text_field) {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        _ => return Ok(None),
    };

    let key = item_key(&value, &String::from_utf8_lossy(body), fields);
    let mut record = CleanRecord::new(key, text);

    if let Some(url_field) = &fields.url_field {
        if let Some(Value::String(url)) = map.get(url_field) {
            record.url = Some(url.clone());
        }
    }
    if let Some(ts_field) = &fields.timestamp_field {
        record.timestamp = map.get(ts_field).and_then(parse_timestamp);
    }

    for (name, v) in map {
        if name == &fields.text_field {
            continue;
        }
        let rendered = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        record.fields.insert(name.clone(), rendered);
    }

    Ok(Some(record))
}

/// RFC 3339 strings or Unix seconds; anything else is treated as absent.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fields() -> JsonlFields {
        JsonlSourceConfig {
            path: "unused".into(),
            id_field: "id".into(),
            text_field: "text".into(),
            url_field: Some("url".into()),
            timestamp_field: Some("timestamp".into()),
        }
        .fields()
    }

    fn source_for(content: &str) -> (NamedTempFile, JsonlSource) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let config = JsonlSourceConfig {
            path: file.path().to_path_buf(),
            id_field: "id".into(),
            text_field: "text".into(),
            url_field: Some("url".into()),
            timestamp_field: Some("timestamp".into()),
        };
        (file, JsonlSource::new("lines".into(), config))
    }

    #[tokio::test]
    async fn test_discover_skips_blank_and_malformed_lines() {
        let (_file, source) = source_for(
            "{\"id\":\"a\",\"text\":\"one\"}\n\nnot json\n{\"id\":2,\"text\":\"two\"}\n",
        );
        let discovery = source
            .discover(&DiscoveryRequest::default())
            .await
            .unwrap();

        let keys: Vec<_> = discovery.candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "2"]);
        assert_eq!(discovery.candidates[1].offset, 4);
        assert_eq!(discovery.next_offset, 4);
        assert!(discovery.exhausted);
    }

    #[tokio::test]
    async fn test_discover_resumes_and_respects_limit() {
        let content: String = (1..=5)
            .map(|i| format!("{{\"id\":\"k{}\",\"text\":\"t\"}}\n", i))
            .collect();
        let (_file, source) = source_for(&content);

        let first = source
            .discover(&DiscoveryRequest {
                resume_offset: 0,
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(first.candidates.len(), 2);
        assert_eq!(first.next_offset, 2);
        assert!(!first.exhausted);

        let rest = source
            .discover(&DiscoveryRequest {
                resume_offset: first.next_offset,
                limit: None,
            })
            .await
            .unwrap();
        let keys: Vec<_> = rest.candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["k3", "k4", "k5"]);
        assert!(rest.exhausted);
    }

    #[test]
    fn test_missing_id_uses_content_hash() {
        let candidate = line_candidate("s", 1, "{\"text\":\"hello\"}", &fields()).unwrap();
        assert!(candidate.key.starts_with("sha256:"));
        assert_eq!(candidate.key.len(), "sha256:".len() + 16);
        let again = line_candidate("s", 9, "{\"text\":\"hello\"}", &fields()).unwrap();
        assert_eq!(candidate.key, again.key);
    }

    #[test]
    fn test_process_line_extracts_fields() {
        let body = br#"{"id":"x","text":"body text","url":"https://e.com/x","timestamp":"2024-03-01T12:00:00Z","lang":"en","score":3}"#;
        let record = process_line(body, &fields()).unwrap().unwrap();
        assert_eq!(record.key, "x");
        assert_eq!(record.text, "body text");
        assert_eq!(record.url.as_deref(), Some("https://e.com/x"));
        assert_eq!(
            record.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(record.field("lang"), Some("en"));
        assert_eq!(record.field("score"), Some("3"));
    }

    #[test]
    fn test_process_line_without_text_is_empty() {
        assert!(process_line(br#"{"id":"x"}"#, &fields()).unwrap().is_none());
        assert!(process_line(br#"{"id":"x","text":"  "}"#, &fields())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unparseable_timestamp_is_absent() {
        let record = process_line(br#"{"text":"t","timestamp":"yesterday"}"#, &fields())
            .unwrap()
            .unwrap();
        assert!(record.timestamp.is_none());
        let record = process_line(br#"{"text":"t","timestamp":1700000000}"#, &fields())
            .unwrap()
            .unwrap();
        assert_eq!(record.timestamp.unwrap().timestamp(), 1_700_000_000);
    }
}
