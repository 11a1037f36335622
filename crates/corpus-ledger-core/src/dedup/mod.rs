//! Two-tier content deduplication.
//!
//! Exact duplicates are caught by a bounded LRU of SHA-256 text hashes
//! ([`cache::ExactHashCache`]). Near duplicates are caught by MinHash
//! signatures ([`minhash`]) queried through a banded LSH index ([`lsh`]).
//!
//! The engine is synchronous and owned by one orchestrator pass; it holds
//! no locks. The exact tier is a cache: test-and-insert happens in one call,
//! and [`DedupEngine::forget`] rolls an insertion back when the output
//! write for that record fails.

pub mod cache;
pub mod lsh;
pub mod minhash;

use anyhow::{bail, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::models::CleanRecord;

use cache::ExactHashCache;
use lsh::{LshIndex, LshParams};
use minhash::{MinHashSignature, MinHasher};

/// Dedup engine settings, deserialized from the `[dedup]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_minhash_enabled")]
    pub minhash_enabled: bool,
    #[serde(default = "default_num_perm")]
    pub num_perm: usize,
    #[serde(default = "default_rows_per_band")]
    pub rows_per_band: usize,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_hash_fields")]
    pub hash_fields: Vec<String>,
}

fn default_cache_size() -> usize {
    100_000
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_minhash_enabled() -> bool {
    true
}

fn default_num_perm() -> usize {
    128
}

fn default_rows_per_band() -> usize {
    4
}

fn default_shingle_size() -> usize {
    5
}

fn default_seed() -> u64 {
    42
}

fn default_hash_fields() -> Vec<String> {
    vec!["text".to_string(), "url".to_string()]
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            similarity_threshold: default_similarity_threshold(),
            minhash_enabled: default_minhash_enabled(),
            num_perm: default_num_perm(),
            rows_per_band: default_rows_per_band(),
            shingle_size: default_shingle_size(),
            seed: default_seed(),
            hash_fields: default_hash_fields(),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            bail!("dedup.cache_size must be > 0");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!("dedup.similarity_threshold must be within [0.0, 1.0]");
        }
        if self.shingle_size == 0 {
            bail!("dedup.shingle_size must be > 0");
        }
        if self.hash_fields.is_empty() {
            bail!("dedup.hash_fields must name at least one field");
        }
        self.lsh_params()?;
        Ok(())
    }

    pub fn lsh_params(&self) -> Result<LshParams> {
        LshParams::new(self.num_perm, self.rows_per_band)
    }
}

/// Content identity of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Hex SHA-256 over the configured hash fields.
    pub text_hash: String,
    /// Present when near-duplicate detection is enabled.
    pub minhash: Option<MinHashSignature>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Unique,
    ExactDuplicate,
    NearDuplicate { of: String, similarity: f64 },
}

impl Verdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Verdict::Unique)
    }

    /// Ledger reason string for a duplicate verdict.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Verdict::Unique => None,
            Verdict::ExactDuplicate => Some("exact_duplicate"),
            Verdict::NearDuplicate { .. } => Some("near_duplicate"),
        }
    }
}

pub struct DedupEngine {
    config: DedupConfig,
    exact: ExactHashCache,
    hasher: Option<MinHasher>,
    index: LshIndex,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Result<Self> {
        config.validate()?;
        let params = config.lsh_params()?;
        let hasher = config
            .minhash_enabled
            .then(|| MinHasher::new(config.num_perm, config.shingle_size, config.seed));
        Ok(Self {
            exact: ExactHashCache::new(config.cache_size),
            hasher,
            index: LshIndex::new(params),
            config,
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Signature over the configured `hash_fields`.
    pub fn signature(&self, record: &CleanRecord) -> Signature {
        self.compute_signature(record, &self.config.hash_fields)
    }

    /// Signature over an explicit field list.
    ///
    /// Each field contributes `name 0x1F value 0x1E`; an absent field
    /// contributes `name 0x1F 0x00 0x1E` so "missing" and "empty" differ.
    pub fn compute_signature(&self, record: &CleanRecord, hash_fields: &[String]) -> Signature {
        let mut hasher = Sha256::new();
        for field in hash_fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
            match record.field(field) {
                Some(value) => hasher.update(value.as_bytes()),
                None => hasher.update([0x00]),
            }
            hasher.update([0x1e]);
        }
        Signature {
            text_hash: hex::encode(hasher.finalize()),
            minhash: self.hasher.as_ref().and_then(|h| h.signature(&record.text)),
        }
    }

    /// Test-and-insert against the exact-hash tier.
    pub fn is_exact_duplicate(&mut self, text_hash: &str) -> bool {
        self.exact.is_exact_duplicate(text_hash)
    }

    pub fn is_near_duplicate(&self, signature: &MinHashSignature, threshold: f64) -> bool {
        self.index.query(signature, threshold).is_some()
    }

    /// Closest indexed document above the configured threshold.
    pub fn nearest(&self, signature: &MinHashSignature) -> Option<(String, f64)> {
        self.index
            .query(signature, self.config.similarity_threshold)
    }

    /// Index a kept document for future near-duplicate queries.
    pub fn add_document(&mut self, text_hash: &str, signature: MinHashSignature) -> bool {
        self.index.insert(text_hash, signature)
    }

    /// Classify a record: exact tier first (inserting on miss), then the
    /// near tier. Does not index the record; call [`commit`](Self::commit)
    /// once its output is durable.
    pub fn classify(&mut self, signature: &Signature) -> Verdict {
        if self.is_exact_duplicate(&signature.text_hash) {
            return Verdict::ExactDuplicate;
        }
        if let Some(minhash) = &signature.minhash {
            if let Some((of, similarity)) = self.nearest(minhash) {
                return Verdict::NearDuplicate { of, similarity };
            }
        }
        Verdict::Unique
    }

    /// Record a kept document in the near-duplicate index.
    pub fn commit(&mut self, signature: &Signature) {
        if let Some(minhash) = &signature.minhash {
            self.add_document(&signature.text_hash, minhash.clone());
        }
    }

    /// Undo the exact-tier insertion made by [`classify`](Self::classify).
    pub fn forget(&mut self, text_hash: &str) {
        self.exact.remove(text_hash);
    }

    /// Seed the exact tier from hashes ordered most-recent-first.
    pub fn warm_exact<I>(&mut self, most_recent_first: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.exact.warm(most_recent_first);
    }

    pub fn exact_len(&self) -> usize {
        self.exact.len()
    }

    pub fn index(&self) -> &LshIndex {
        &self.index
    }

    /// Replace the near-duplicate index, e.g. with one loaded from disk.
    pub fn replace_index(&mut self, index: LshIndex) -> Result<()> {
        if index.params() != self.index.params() {
            bail!(
                "index parameters {:?} do not match engine {:?}",
                index.params(),
                self.index.params()
            );
        }
        self.index = index;
        Ok(())
    }
}
