//! Exact Jaccard verification over 5-gram shingle sets.
//!
//! Recall is calibrated to over-return; this stage filters candidates with
//! the exact similarity and a hard CPU budget. Shingle sets are rebuilt on
//! demand from the stored title and content, the same text the ingest path
//! fingerprints, rather than persisted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::db::Database;
use crate::error::CoreError;
use crate::fingerprint::{normalize, shingle_set};
use crate::recall::Candidate;
use crate::settings::SETTINGS;
use crate::TARGET_WORKER;

/// Similarity at or above this is a match.
pub const JACCARD_THRESHOLD: f64 = 0.80;

/// Candidates dropped because the verification budget ran out.
pub static VERIFIER_TRUNCATED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// A candidate that passed exact verification.
#[derive(Debug, Clone)]
pub struct VerifiedMatch {
    pub article_id: String,
    pub cluster_id: Option<String>,
    pub score: f64,
}

#[derive(Debug)]
pub struct VerifyOutcome {
    /// Matches with J >= 0.80, sorted by score descending.
    pub matches: Vec<VerifiedMatch>,
    /// True when the wall-clock budget expired before all candidates were
    /// scored; the caller downgrades to a tentative terminal state.
    pub timed_out: bool,
}

/// Exact Jaccard over two shingle sets. Sets smaller than two shingles
/// never match anything.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Score candidates in proxy-rank order until all are processed or the
/// budget (candidate count or wall time) runs out.
pub async fn verify_candidates(
    db: &Database,
    article_id: &str,
    shingles: &HashSet<String>,
    candidates: &[Candidate],
) -> Result<VerifyOutcome, CoreError> {
    let started = Instant::now();
    let budget = Duration::from_millis(SETTINGS.verifier_budget_ms);
    let max_candidates = SETTINGS.verifier_max_candidates;

    let mut matches = Vec::new();
    let mut timed_out = false;
    let mut processed = 0usize;

    for candidate in candidates {
        // Cooperative cancellation checkpoint between candidates.
        if processed >= max_candidates || started.elapsed() >= budget {
            let dropped = (candidates.len() - processed) as u64;
            VERIFIER_TRUNCATED_TOTAL.fetch_add(dropped, Ordering::Relaxed);
            timed_out = started.elapsed() >= budget;
            warn!(
                target: TARGET_WORKER,
                "Verifier budget exhausted for {}: {} of {} candidates dropped",
                article_id, dropped, candidates.len()
            );
            break;
        }
        processed += 1;

        let Some(text) = db.get_article_text(&candidate.article_id).await? else {
            continue;
        };
        let candidate_shingles = shingle_set(&normalize(&text));
        let score = jaccard(shingles, &candidate_shingles);
        if score >= JACCARD_THRESHOLD {
            matches.push(VerifiedMatch {
                article_id: candidate.article_id.clone(),
                cluster_id: candidate.cluster_id.clone(),
                score,
            });
        }
    }

    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.article_id.cmp(&b.article_id))
    });
    debug!(
        target: TARGET_WORKER,
        "Verified {} candidates for {}: {} matches", processed, article_id, matches.len()
    );
    Ok(VerifyOutcome { matches, timed_out })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn jaccard_exact_values() {
        let a = set(&["aa", "bb", "cc", "dd"]);
        let b = set(&["aa", "bb", "cc", "ee"]);
        // 3 shared of 5 distinct.
        assert!((jaccard(&a, &b) - 0.6).abs() < 1e-12);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn empty_or_singleton_sets_never_match() {
        let a = set(&["aa", "bb"]);
        assert_eq!(jaccard(&a, &HashSet::new()), 0.0);
        assert_eq!(jaccard(&set(&["aa"]), &a), 0.0);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn threshold_comparison_is_inclusive() {
        // 4 shared of exactly 5 distinct = 0.80 must match.
        let a = set(&["aa", "bb", "cc", "dd"]);
        let b = set(&["aa", "bb", "cc", "dd", "ee"]);
        assert!(jaccard(&a, &b) >= JACCARD_THRESHOLD);
    }
}
