//! Near-duplicate index persistence.
//!
//! The LSH index is saved as a JSON snapshot (signatures only; buckets are
//! rebuilt on load) using the same write-temp-then-rename sequence as
//! checkpoints, so a crash mid-save leaves the previous index intact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use corpus_ledger_core::dedup::lsh::{LshIndex, LshSnapshot};
use corpus_ledger_core::dedup::DedupEngine;

/// Write the engine's LSH index to `path`.
pub async fn save_index(engine: &DedupEngine, path: &Path) -> Result<()> {
    let snapshot = engine.index().snapshot();
    let bytes = serde_json::to_vec(&snapshot)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create index directory: {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to commit index: {}", path.display()))?;

    info!(path = %path.display(), documents = snapshot.documents.len(), "Saved near-duplicate index");
    Ok(())
}

/// Replace the engine's LSH index with the one stored at `path`.
///
/// Returns `Ok(false)` when no index file exists. A snapshot built with
/// different `num_perm`/`rows_per_band` is an error.
pub async fn load_index(engine: &mut DedupEngine, path: &Path) -> Result<bool> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read index: {}", path.display()))
        }
    };
    let snapshot: LshSnapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("Corrupt index file: {}", path.display()))?;
    let params = engine.config().lsh_params()?;
    let index = LshIndex::from_snapshot(snapshot, params)?;
    let documents = index.len();
    engine.replace_index(index)?;

    info!(path = %path.display(), documents, "Loaded near-duplicate index");
    Ok(true)
}

/// [`load_index`] that degrades to an empty index with a warning.
pub async fn load_index_or_warn(engine: &mut DedupEngine, path: &Path) {
    if let Err(e) = load_index(engine, path).await {
        warn!(path = %path.display(), error = %e, "Near-duplicate index unusable, starting empty");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpus_ledger_core::dedup::minhash::MinHashSignature;
    use corpus_ledger_core::dedup::DedupConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_index_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut engine = DedupEngine::new(DedupConfig::default()).unwrap();
        let loaded = load_index(&mut engine, &tmp.path().join("none.json"))
            .await
            .unwrap();
        assert!(!loaded);
    }

    #[tokio::test]
    async fn test_near_duplicate_found_after_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lsh.json");

        let original: Vec<u32> = (0..128).collect();
        let mut engine = DedupEngine::new(DedupConfig::default()).unwrap();
        engine.add_document("doc-a", MinHashSignature(original.clone()));
        save_index(&engine, &path).await.unwrap();

        // 116 of 128 slots agree: estimated Jaccard ~0.906.
        let mut edited = original;
        for slot in edited.iter_mut().take(12) {
            *slot += 1000;
        }
        let edited = MinHashSignature(edited);

        let mut fresh = DedupEngine::new(DedupConfig::default()).unwrap();
        assert!(!fresh.is_near_duplicate(&edited, 0.85));
        assert!(load_index(&mut fresh, &path).await.unwrap());
        assert!(fresh.is_near_duplicate(&edited, 0.85));
        assert!(!fresh.is_near_duplicate(&edited, 0.95));
    }

    #[tokio::test]
    async fn test_mismatched_params_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lsh.json");

        let small = DedupConfig {
            num_perm: 64,
            ..DedupConfig::default()
        };
        let mut engine = DedupEngine::new(small).unwrap();
        engine.add_document("a", MinHashSignature(vec![7; 64]));
        save_index(&engine, &path).await.unwrap();

        let mut other = DedupEngine::new(DedupConfig::default()).unwrap();
        assert!(load_index(&mut other, &path).await.is_err());
        load_index_or_warn(&mut other, &path).await;
        assert!(other.index().is_empty());
    }
}
