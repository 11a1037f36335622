//! JSON Lines output sink.
//!
//! Unique records are appended to `<dir>/<source>.jsonl`, one object per
//! line, each with a fresh UUID as its output id. A record is reported
//! written only after its line has been synced to disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use corpus_ledger_core::models::CleanRecord;

use crate::traits::RecordSink;

#[derive(Serialize)]
struct OutputLine<'a> {
    id: &'a str,
    source: &'a str,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    text: &'a str,
    text_hash: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a BTreeMap<String, String>>,
    written_at: String,
}

pub struct JsonlSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn output_path(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", source))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn write(&self, source: &str, record: &CleanRecord, text_hash: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let line = OutputLine {
            id: &id,
            source,
            key: &record.key,
            url: record.url.as_deref(),
            timestamp: record.timestamp.map(|ts| ts.to_rfc3339()),
            text: &record.text,
            text_hash,
            fields: (!record.fields.is_empty()).then_some(&record.fields),
            written_at: Utc::now().to_rfc3339(),
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let path = self.output_path(source);
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", self.dir.display()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open output file: {}", path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_data().await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlSink::new(tmp.path().join("out"));

        let mut record = CleanRecord::new("k1", "first text");
        record.url = Some("https://example.com/1".into());
        let id1 = sink.write("news", &record, "h1").await.unwrap();
        let id2 = sink
            .write("news", &CleanRecord::new("k2", "second"), "h2")
            .await
            .unwrap();
        assert_ne!(id1, id2);

        let content = std::fs::read_to_string(sink.output_path("news")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], id1.as_str());
        assert_eq!(lines[0]["url"], "https://example.com/1");
        assert_eq!(lines[1]["text_hash"], "h2");
        assert!(lines[1].get("url").is_none());
    }
}
