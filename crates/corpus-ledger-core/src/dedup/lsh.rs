//! Banded locality-sensitive hashing index over MinHash signatures.
//!
//! A signature of `num_perm` values is cut into `bands` bands of
//! `rows_per_band` rows. Two documents become candidates when any band
//! hashes to the same bucket; candidates are then verified with the full
//! signature. The index is append-only within a run and can be snapshotted
//! so near-duplicate detection spans runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::minhash::MinHashSignature;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Banding layout. `rows_per_band` must divide `num_perm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshParams {
    pub num_perm: usize,
    pub rows_per_band: usize,
}

impl LshParams {
    pub fn new(num_perm: usize, rows_per_band: usize) -> Result<Self> {
        if num_perm == 0 || rows_per_band == 0 {
            bail!("num_perm and rows_per_band must be positive");
        }
        if num_perm % rows_per_band != 0 {
            bail!(
                "rows_per_band ({}) must divide num_perm ({})",
                rows_per_band,
                num_perm
            );
        }
        Ok(Self {
            num_perm,
            rows_per_band,
        })
    }

    pub fn bands(&self) -> usize {
        self.num_perm / self.rows_per_band
    }
}

/// Serializable form of an [`LshIndex`]. Buckets are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LshSnapshot {
    pub version: u32,
    pub params: LshParams,
    pub documents: BTreeMap<String, MinHashSignature>,
}

#[derive(Debug, Clone)]
pub struct LshIndex {
    params: LshParams,
    signatures: HashMap<String, MinHashSignature>,
    buckets: HashMap<(usize, u64), Vec<String>>,
}

impl LshIndex {
    pub fn new(params: LshParams) -> Self {
        Self {
            params,
            signatures: HashMap::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn params(&self) -> LshParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.signatures.contains_key(id)
    }

    /// Add a document. Returns `false` (and changes nothing) when `id` is
    /// already indexed or the signature has the wrong length.
    pub fn insert(&mut self, id: &str, signature: MinHashSignature) -> bool {
        if self.signatures.contains_key(id) {
            return false;
        }
        if signature.len() != self.params.num_perm {
            tracing::warn!(
                id,
                expected = self.params.num_perm,
                got = signature.len(),
                "signature length mismatch, not indexed"
            );
            return false;
        }
        for band in 0..self.params.bands() {
            let key = (band, self.band_hash(&signature, band));
            self.buckets.entry(key).or_default().push(id.to_string());
        }
        self.signatures.insert(id.to_string(), signature);
        true
    }

    /// Ids sharing at least one band bucket with `signature`.
    pub fn candidates(&self, signature: &MinHashSignature) -> HashSet<&str> {
        let mut out = HashSet::new();
        if signature.len() != self.params.num_perm {
            return out;
        }
        for band in 0..self.params.bands() {
            let key = (band, self.band_hash(signature, band));
            if let Some(ids) = self.buckets.get(&key) {
                out.extend(ids.iter().map(String::as_str));
            }
        }
        out
    }

    /// Best verified candidate whose estimated similarity exceeds
    /// `threshold`, as `(id, similarity)`.
    pub fn query(&self, signature: &MinHashSignature, threshold: f64) -> Option<(String, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for id in self.candidates(signature) {
            let Some(existing) = self.signatures.get(id) else {
                continue;
            };
            let sim = signature.jaccard(existing);
            if sim > threshold && best.map(|(_, b)| sim > b).unwrap_or(true) {
                best = Some((id, sim));
            }
        }
        best.map(|(id, sim)| (id.to_string(), sim))
    }

    pub fn snapshot(&self) -> LshSnapshot {
        LshSnapshot {
            version: SNAPSHOT_VERSION,
            params: self.params,
            documents: self
                .signatures
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rebuild an index from a snapshot taken with `expected` parameters.
    pub fn from_snapshot(snapshot: LshSnapshot, expected: LshParams) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "unsupported index snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        if snapshot.params != expected {
            bail!(
                "index snapshot parameters {:?} do not match configured {:?}",
                snapshot.params,
                expected
            );
        }
        let mut index = Self::new(expected);
        for (id, sig) in snapshot.documents {
            index.insert(&id, sig);
        }
        Ok(index)
    }

    fn band_hash(&self, signature: &MinHashSignature, band: usize) -> u64 {
        let start = band * self.params.rows_per_band;
        let rows = &signature.values()[start..start + self.params.rows_per_band];
        // FNV-1a over the band's little-endian bytes.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for v in rows {
            for byte in v.to_le_bytes() {
                h ^= byte as u64;
                h = h.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LshParams {
        LshParams::new(100, 4).unwrap()
    }

    fn base_sig() -> MinHashSignature {
        MinHashSignature((0..100u32).map(|i| i * 7919 + 13).collect())
    }

    /// Alter exactly `n` positions spread across the signature.
    fn altered(sig: &MinHashSignature, n: usize) -> MinHashSignature {
        let mut values = sig.values().to_vec();
        let step = values.len() / n.max(1);
        for k in 0..n {
            values[k * step] = values[k * step].wrapping_add(1_000_003);
        }
        MinHashSignature(values)
    }

    #[test]
    fn test_params_validation() {
        assert!(LshParams::new(128, 4).is_ok());
        assert!(LshParams::new(128, 5).is_err());
        assert!(LshParams::new(0, 4).is_err());
        assert_eq!(LshParams::new(128, 4).unwrap().bands(), 32);
    }

    #[test]
    fn test_query_finds_similar_document() {
        let mut index = LshIndex::new(params());
        let original = base_sig();
        assert!(index.insert("doc-1", original.clone()));

        let near = altered(&original, 10);
        assert!((near.jaccard(&original) - 0.9).abs() < 1e-9);

        let (id, sim) = index.query(&near, 0.85).expect("near duplicate");
        assert_eq!(id, "doc-1");
        assert!(sim > 0.85);

        assert!(index.query(&near, 0.95).is_none());
    }

    #[test]
    fn test_dissimilar_document_not_returned() {
        let mut index = LshIndex::new(params());
        index.insert("doc-1", base_sig());
        let other = MinHashSignature((0..100u32).map(|i| i * 31 + 5_000_000).collect());
        assert!(index.query(&other, 0.5).is_none());
    }

    #[test]
    fn test_insert_is_append_only() {
        let mut index = LshIndex::new(params());
        assert!(index.insert("doc-1", base_sig()));
        assert!(!index.insert("doc-1", altered(&base_sig(), 50)));
        assert_eq!(index.len(), 1);
        assert!(!index.insert("bad", MinHashSignature(vec![1, 2, 3])));
        assert!(!index.contains("bad"));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_queries() {
        let mut index = LshIndex::new(params());
        index.insert("doc-1", base_sig());
        let json = serde_json::to_string(&index.snapshot()).unwrap();

        let snapshot: LshSnapshot = serde_json::from_str(&json).unwrap();
        let restored = LshIndex::from_snapshot(snapshot, params()).unwrap();
        assert_eq!(restored.len(), 1);
        let (id, _) = restored.query(&altered(&base_sig(), 10), 0.85).unwrap();
        assert_eq!(id, "doc-1");
    }

    #[test]
    fn test_snapshot_param_mismatch_rejected() {
        let index = LshIndex::new(params());
        let snapshot = index.snapshot();
        let err = LshIndex::from_snapshot(snapshot, LshParams::new(128, 4).unwrap());
        assert!(err.is_err());
    }
}
