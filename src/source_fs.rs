//! Local directory source.
//!
//! Walks `root` recursively, keeping files that match `include_globs` and
//! none of `exclude_globs` (plus `.git`, `target` and `node_modules`).
//! Paths are sorted so offsets are stable within a run.
//!
//! The content checksum is part of the key (`<relative path>@<16 hex>`),
//! so editing a file yields a new key and the new version is collected,
//! while an identical copy under another path is caught by the ledger's
//! checksum lookup before any read.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::WalkDir;

use corpus_ledger_core::models::{CleanRecord, ConditionalHeaders};

use crate::config::FilesystemSourceConfig;
use crate::traits::{
    Candidate, Discovery, DiscoveryRequest, FetchOutcome, FetchedResource, Source,
};

#[derive(Debug, Clone)]
struct FileEntry {
    relative: String,
    checksum: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

pub struct FilesystemSource {
    name: String,
    description: String,
    config: FilesystemSourceConfig,
    listing: Mutex<Option<Vec<FileEntry>>>,
}

impl FilesystemSource {
    pub fn new(name: String, config: FilesystemSourceConfig) -> Self {
        let description = format!("Files under {}", config.root.display());
        Self {
            name,
            description,
            config,
            listing: Mutex::new(None),
        }
    }

    fn absolute(&self, candidate: &Candidate) -> PathBuf {
        let relative = candidate
            .metadata
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(&candidate.key);
        self.config.root.join(relative)
    }
}

#[async_trait]
impl Source for FilesystemSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &str {
        "filesystem"
    }

    async fn discover(&self, request: &DiscoveryRequest) -> Result<Discovery> {
        let mut listing = self.listing.lock().await;
        if request.resume_offset == 0 || listing.is_none() {
            let config = self.config.clone();
            let entries = tokio::task::spawn_blocking(move || scan(&config))
                .await
                .context("filesystem scan panicked")??;
            *listing = Some(entries);
        }
        let entries = listing.as_deref().unwrap_or_default();

        let start = (request.resume_offset as usize).min(entries.len());
        let end = match request.limit {
            Some(limit) => start.saturating_add(limit).min(entries.len()),
            None => entries.len(),
        };

        let candidates = entries[start..end]
            .iter()
            .enumerate()
            .map(|(i, entry)| to_candidate(entry, (start + i + 1) as u64))
            .collect();

        Ok(Discovery {
            candidates,
            next_offset: end as u64,
            exhausted: end == entries.len(),
            upstream: None,
        })
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        _headers: &ConditionalHeaders,
    ) -> Result<FetchOutcome> {
        let path = self.absolute(candidate);
        let body = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(FetchOutcome::Fetched(FetchedResource {
            body,
            ..FetchedResource::default()
        }))
    }

    async fn process(
        &self,
        candidate: &Candidate,
        fetched: &FetchedResource,
    ) -> Result<Option<CleanRecord>> {
        let text = String::from_utf8_lossy(&fetched.body);
        if text.trim().is_empty() {
            return Ok(None);
        }

        let path = self.absolute(candidate);
        let mut record = CleanRecord::new(candidate.key.clone(), text.into_owned());
        record.url = Some(format!("file://{}", path.display()));
        record.timestamp = candidate
            .metadata
            .get("modified")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if let Some(relative) = candidate.metadata.get("path").and_then(Value::as_str) {
            record.fields.insert("path".to_string(), relative.to_string());
        }
        if let Some(title) = path.file_name() {
            record
                .fields
                .insert("title".to_string(), title.to_string_lossy().to_string());
        }
        Ok(Some(record))
    }
}

fn to_candidate(entry: &FileEntry, offset: u64) -> Candidate {
    let mut metadata = serde_json::Map::new();
    metadata.insert("path".to_string(), Value::from(entry.relative.clone()));
    metadata.insert("checksum".to_string(), Value::from(entry.checksum.clone()));
    metadata.insert("size".to_string(), Value::from(entry.size));
    if let Some(modified) = entry.modified {
        metadata.insert("modified".to_string(), Value::from(modified.to_rfc3339()));
    }
    Candidate {
        key: format!("{}@{}", entry.relative, &entry.checksum[..16]),
        offset,
        checksum: Some(entry.checksum.clone()),
        metadata,
        payload: None,
    }
}

fn scan(config: &FilesystemSourceConfig) -> Result<Vec<FileEntry>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Filesystem source root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        entries.push(file_entry(path, rel_str)?);
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

fn file_entry(path: &Path, relative: String) -> Result<FileEntry> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    Ok(FileEntry {
        relative,
        checksum: hex::encode(Sha256::digest(&bytes)),
        size: metadata.len(),
        modified,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_for(root: &Path) -> FilesystemSource {
        FilesystemSource::new(
            "docs".into(),
            FilesystemSourceConfig {
                root: root.to_path_buf(),
                include_globs: vec!["**/*.md".into(), "**/*.txt".into()],
                exclude_globs: vec!["**/drafts/**".into()],
                follow_symlinks: false,
            },
        )
    }

    #[tokio::test]
    async fn test_discover_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("guide")).unwrap();
        std::fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        std::fs::write(tmp.path().join("b.md"), "bravo").unwrap();
        std::fs::write(tmp.path().join("guide/a.txt"), "alpha").unwrap();
        std::fs::write(tmp.path().join("drafts/c.md"), "charlie").unwrap();
        std::fs::write(tmp.path().join("image.png"), "png").unwrap();

        let source = source_for(tmp.path());
        let discovery = source.discover(&DiscoveryRequest::default()).await.unwrap();

        let paths: Vec<_> = discovery
            .candidates
            .iter()
            .map(|c| c.metadata["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["b.md", "guide/a.txt"]);
        assert!(discovery.exhausted);
        assert!(discovery.candidates[0].key.starts_with("b.md@"));
        assert_eq!(discovery.candidates[1].offset, 2);
    }

    #[tokio::test]
    async fn test_edit_changes_key() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("note.md"), "first").unwrap();
        let source = source_for(tmp.path());
        let before = source.discover(&DiscoveryRequest::default()).await.unwrap();

        std::fs::write(tmp.path().join("note.md"), "second").unwrap();
        let after = source.discover(&DiscoveryRequest::default()).await.unwrap();

        assert_ne!(before.candidates[0].key, after.candidates[0].key);
        assert_ne!(before.candidates[0].checksum, after.candidates[0].checksum);
    }

    #[tokio::test]
    async fn test_batches_by_offset() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(tmp.path().join(format!("f{}.md", i)), format!("file {}", i)).unwrap();
        }
        let source = source_for(tmp.path());

        let first = source
            .discover(&DiscoveryRequest {
                resume_offset: 0,
                limit: Some(3),
            })
            .await
            .unwrap();
        assert_eq!(first.candidates.len(), 3);
        assert!(!first.exhausted);

        let second = source
            .discover(&DiscoveryRequest {
                resume_offset: first.next_offset,
                limit: Some(3),
            })
            .await
            .unwrap();
        assert_eq!(second.candidates.len(), 2);
        assert!(second.exhausted);
        assert_eq!(second.next_offset, 5);
    }

    #[tokio::test]
    async fn test_fetch_and_process() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("readme.md"), "# Title\n\nBody").unwrap();
        std::fs::write(tmp.path().join("empty.md"), "   \n").unwrap();
        let source = source_for(tmp.path());
        let discovery = source.discover(&DiscoveryRequest::default()).await.unwrap();

        let mut texts = Vec::new();
        for candidate in &discovery.candidates {
            let FetchOutcome::Fetched(fetched) = source
                .fetch(candidate, &ConditionalHeaders::default())
                .await
                .unwrap()
            else {
                panic!("local files are always fetched");
            };
            texts.push(source.process(candidate, &fetched).await.unwrap());
        }

        assert!(texts[0].is_none());
        let record = texts[1].as_ref().unwrap();
        assert_eq!(record.text, "# Title\n\nBody");
        assert_eq!(record.field("path"), Some("readme.md"));
        assert!(record.url.as_deref().unwrap().starts_with("file://"));
        assert!(record.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_missing_root_errors() {
        let tmp = TempDir::new().unwrap();
        let source = source_for(&tmp.path().join("absent"));
        assert!(source.discover(&DiscoveryRequest::default()).await.is_err());
    }
}
