//! MinHash signatures over word shingles.
//!
//! Each text is reduced to its set of `k`-word shingles. Every shingle is
//! hashed once (first 4 bytes of SHA-256), then passed through `num_perm`
//! universal hash functions `(a·x + b) mod (2⁶¹ − 1)` truncated to 32 bits.
//! Position `i` of the signature is the minimum of permutation `i` over all
//! shingles. The fraction of equal positions between two signatures is an
//! unbiased estimate of the Jaccard similarity of their shingle sets.
//!
//! Coefficients are derived from a seed with splitmix64, so signatures
//! computed in different runs (or processes) with the same
//! `(num_perm, shingle_size, seed)` are comparable.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MERSENNE_PRIME: u64 = (1 << 61) - 1;
const MAX_HASH: u64 = (1 << 32) - 1;

/// A fixed-length MinHash signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinHashSignature(pub Vec<u32>);

impl MinHashSignature {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    /// Estimated Jaccard similarity. Signatures of different lengths are
    /// not comparable and score `0.0`.
    pub fn jaccard(&self, other: &MinHashSignature) -> f64 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let equal = self
            .0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a == b)
            .count();
        equal as f64 / self.0.len() as f64
    }
}

impl From<Vec<u32>> for MinHashSignature {
    fn from(values: Vec<u32>) -> Self {
        Self(values)
    }
}

/// Deterministic signature generator.
#[derive(Debug, Clone)]
pub struct MinHasher {
    shingle_size: usize,
    a: Vec<u64>,
    b: Vec<u64>,
}

impl MinHasher {
    pub fn new(num_perm: usize, shingle_size: usize, seed: u64) -> Self {
        let mut state = seed;
        let mut a = Vec::with_capacity(num_perm);
        let mut b = Vec::with_capacity(num_perm);
        for _ in 0..num_perm {
            a.push(1 + splitmix64(&mut state) % (MERSENNE_PRIME - 1));
            b.push(splitmix64(&mut state) % MERSENNE_PRIME);
        }
        Self {
            shingle_size: shingle_size.max(1),
            a,
            b,
        }
    }

    pub fn num_perm(&self) -> usize {
        self.a.len()
    }

    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    /// Compute the signature of `text`, or `None` when it has no words.
    ///
    /// Two word-less texts share no shingles, so they get no signature to
    /// compare.
    pub fn signature(&self, text: &str) -> Option<MinHashSignature> {
        let shingles = shingle_hashes(text, self.shingle_size);
        if shingles.is_empty() {
            return None;
        }
        let mut mins = vec![u32::MAX; self.a.len()];
        for shingle in shingles {
            for (i, slot) in mins.iter_mut().enumerate() {
                let v = self.permute(i, shingle);
                if v < *slot {
                    *slot = v;
                }
            }
        }
        Some(MinHashSignature(mins))
    }

    fn permute(&self, i: usize, x: u64) -> u32 {
        let v = (self.a[i] as u128 * x as u128 + self.b[i] as u128) % MERSENNE_PRIME as u128;
        (v as u64 & MAX_HASH) as u32
    }
}

/// Base hashes of the distinct `k`-word shingles of `text`.
///
/// Words are whitespace-separated and lowercased. A text shorter than `k`
/// words is a single shingle.
fn shingle_hashes(text: &str, k: usize) -> HashSet<u64> {
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words.is_empty() {
        return HashSet::new();
    }
    if words.len() <= k {
        return std::iter::once(base_hash(&words.join(" "))).collect();
    }
    words
        .windows(k)
        .map(|window| base_hash(&window.join(" ")))
        .collect()
}

fn base_hash(shingle: &str) -> u64 {
    let digest = Sha256::digest(shingle.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_text(words: usize) -> Vec<String> {
        (0..words).map(|i| format!("word{}", i)).collect()
    }

    #[test]
    fn test_deterministic_across_instances() {
        let a = MinHasher::new(64, 5, 42);
        let b = MinHasher::new(64, 5, 42);
        let text = "the quick brown fox jumps over the lazy dog";
        assert_eq!(a.signature(text), b.signature(text));
    }

    #[test]
    fn test_seed_changes_signature() {
        let a = MinHasher::new(64, 5, 1);
        let b = MinHasher::new(64, 5, 2);
        let text = long_text(40).join(" ");
        assert_ne!(a.signature(&text), b.signature(&text));
    }

    #[test]
    fn test_identical_text_scores_one() {
        let hasher = MinHasher::new(128, 5, 42);
        let text = long_text(100).join(" ");
        let s1 = hasher.signature(&text).unwrap();
        let s2 = hasher.signature(&text.to_uppercase()).unwrap();
        assert_eq!(s1.jaccard(&s2), 1.0);
    }

    #[test]
    fn test_one_word_change_in_long_text_is_similar() {
        let hasher = MinHasher::new(128, 5, 42);
        let mut words = long_text(400);
        let original = words.join(" ");
        words[200] = "CHANGED".to_string();
        let edited = words.join(" ");
        // 5 of ~396 shingles differ: true Jaccard is about 0.975.
        let sim = hasher
            .signature(&original)
            .unwrap()
            .jaccard(&hasher.signature(&edited).unwrap());
        assert!(sim > 0.85, "similarity {}", sim);
    }

    #[test]
    fn test_unrelated_texts_score_low() {
        let hasher = MinHasher::new(128, 5, 42);
        let a: String = (0..200).map(|i| format!("alpha{} ", i)).collect();
        let b: String = (0..200).map(|i| format!("beta{} ", i)).collect();
        let sim = hasher.signature(&a).unwrap().jaccard(&hasher.signature(&b).unwrap());
        assert!(sim < 0.2, "similarity {}", sim);
    }

    #[test]
    fn test_short_text_is_one_shingle() {
        assert_eq!(shingle_hashes("two words", 5).len(), 1);
        assert_eq!(shingle_hashes("   ", 5).len(), 0);
        assert_eq!(shingle_hashes("a b c d e f", 5).len(), 2);
    }

    #[test]
    fn test_wordless_text_has_no_signature() {
        let hasher = MinHasher::new(64, 5, 42);
        assert!(hasher.signature("").is_none());
        assert!(hasher.signature(" \n\t ").is_none());
        assert!(hasher.signature("one").is_some());
    }

    #[test]
    fn test_length_mismatch_scores_zero() {
        let a = MinHashSignature(vec![1, 2, 3]);
        let b = MinHashSignature(vec![1, 2]);
        assert_eq!(a.jaccard(&b), 0.0);
    }
}
