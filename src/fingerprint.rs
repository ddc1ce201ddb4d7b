//! Locality-sensitive fingerprints for near-duplicate detection.
//!
//! Three views of an article are derived from the same normalized text:
//! a 64-bit SimHash (Hamming distance <= 3 flags very-near duplicates),
//! a 128-slot MinHash signature (slot agreement estimates Jaccard), and
//! 20 LSH band hashes over the signature (a single band collision is a
//! cheap recall indicator). All hashing is self-contained FNV-1a so the
//! stored values stay bit-identical across processes, restarts, and
//! toolchain upgrades.

use std::collections::{HashMap, HashSet};

pub const SIMHASH_BITS: usize = 64;
pub const MINHASH_PERMUTATIONS: usize = 128;
pub const LSH_BANDS: usize = 20;
pub const LSH_ROWS_PER_BAND: usize = 6;
pub const SHINGLE_SIZE: usize = 5;

/// Articles within this Hamming distance are exact-duplicate candidates.
pub const SIMHASH_MAX_HAMMING: u32 = 3;

/// Seed for the MinHash permutation family. Changing it invalidates every
/// stored signature and requires a full reindex.
const MINHASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut state = FNV_OFFSET;
    for &b in bytes {
        state ^= b as u64;
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

fn fnv1a_pair(seed: u64, value: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&seed.to_le_bytes());
    buf[8..].copy_from_slice(&value.to_le_bytes());
    fnv1a(&buf)
}

/// The computed fingerprint of one article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleFingerprint {
    pub simhash: u64,
    pub minhash: Vec<u64>,
    pub band_hashes: Vec<u64>,
}

/// Stateless fingerprint generator with a baked-in permutation family.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    seeds: Vec<u64>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        let mut seeds = Vec::with_capacity(MINHASH_PERMUTATIONS);
        let mut rng_state = MINHASH_SEED;
        for _ in 0..MINHASH_PERMUTATIONS {
            // LCG seed derivation: deterministic and cheap.
            rng_state = rng_state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            seeds.push(rng_state);
        }
        Self { seeds }
    }

    /// Fingerprint raw article text. Identical normalized text yields
    /// bit-identical output.
    pub fn fingerprint(&self, text: &str) -> ArticleFingerprint {
        let normalized = normalize(text);
        let counts = shingle_counts(&normalized);
        let simhash = simhash_weighted(&counts);
        let minhash = self.minhash(counts.keys().map(String::as_str));
        let band_hashes = band_hashes(&minhash);
        ArticleFingerprint {
            simhash,
            minhash,
            band_hashes,
        }
    }

    /// MinHash signature over distinct shingles.
    pub fn minhash<'a>(&self, shingles: impl Iterator<Item = &'a str>) -> Vec<u64> {
        let mut mins = vec![u64::MAX; MINHASH_PERMUTATIONS];
        for shingle in shingles {
            let base = fnv1a(shingle.as_bytes());
            for (i, &seed) in self.seeds.iter().enumerate() {
                let h = fnv1a_pair(seed, base);
                if h < mins[i] {
                    mins[i] = h;
                }
            }
        }
        mins
    }
}

/// Lowercase, collapse whitespace runs to single spaces, and strip
/// punctuation. Alphanumerics survive, which keeps CJK intact.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// All contiguous 5-character windows of the normalized text, with
/// occurrence counts. Texts shorter than one window produce no shingles.
pub fn shingle_counts(normalized: &str) -> HashMap<String, u32> {
    let chars: Vec<char> = normalized.chars().collect();
    let mut counts = HashMap::new();
    if chars.len() < SHINGLE_SIZE {
        return counts;
    }
    for window in chars.windows(SHINGLE_SIZE) {
        let shingle: String = window.iter().collect();
        *counts.entry(shingle).or_insert(0) += 1;
    }
    counts
}

/// Distinct shingles of the normalized text, the set the exact Jaccard
/// verifier operates on.
pub fn shingle_set(normalized: &str) -> HashSet<String> {
    shingle_counts(normalized).into_keys().collect()
}

/// SimHash weighted by shingle frequency.
fn simhash_weighted(counts: &HashMap<String, u32>) -> u64 {
    let mut acc = [0i64; SIMHASH_BITS];
    for (shingle, count) in counts {
        let bits = fnv1a(shingle.as_bytes());
        let weight = *count as i64;
        for (i, slot) in acc.iter_mut().enumerate() {
            if (bits >> i) & 1 == 1 {
                *slot += weight;
            } else {
                *slot -= weight;
            }
        }
    }
    let mut out = 0u64;
    for (i, slot) in acc.iter().enumerate() {
        if *slot > 0 {
            out |= 1u64 << i;
        }
    }
    out
}

/// 20 band hashes over the first 120 signature slots (20 bands x 6 rows;
/// the final 8 slots are unused by banding). The band index is mixed into
/// each hash so equal slot values in different bands cannot collide.
pub fn band_hashes(minhash: &[u64]) -> Vec<u64> {
    let mut bands = Vec::with_capacity(LSH_BANDS);
    for band_no in 0..LSH_BANDS {
        let start = band_no * LSH_ROWS_PER_BAND;
        let mut buf = Vec::with_capacity(8 * (LSH_ROWS_PER_BAND + 1));
        buf.extend_from_slice(&(band_no as u64).to_le_bytes());
        for slot in &minhash[start..start + LSH_ROWS_PER_BAND] {
            buf.extend_from_slice(&slot.to_le_bytes());
        }
        bands.push(fnv1a(&buf));
    }
    bands
}

/// Hamming distance between two SimHash values (XOR + popcount).
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// The four 16-bit chunks of a SimHash. With Hamming distance <= 3, at
/// least one chunk is equal (pigeonhole), which is what the gateway's
/// chunk-equality index exploits.
pub fn simhash_chunks(h: u64) -> [u16; 4] {
    [
        (h & 0xFFFF) as u16,
        ((h >> 16) & 0xFFFF) as u16,
        ((h >> 32) & 0xFFFF) as u16,
        ((h >> 48) & 0xFFFF) as u16,
    ]
}
