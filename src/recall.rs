//! Candidate recall: a bounded, ranked union of the SimHash near-match
//! lookup and the LSH band-collision lookup.

use std::collections::HashMap;

use tracing::debug;

use crate::db::article::CandidateMeta;
use crate::db::Database;
use crate::error::CoreError;
use crate::fingerprint::{self, SIMHASH_MAX_HAMMING};
use crate::settings::SETTINGS;
use crate::types::{StoredFingerprint, STATE_DELETED};
use crate::TARGET_WORKER;

/// One recall candidate, ranked by its cheap proxy score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub article_id: String,
    pub cluster_id: Option<String>,
    /// Number of LSH bands shared with the query article.
    pub matching_bands: i64,
    /// SimHash Hamming distance to the query article.
    pub hamming: u32,
}

/// Recall candidates for `article_id`, most promising first, capped at the
/// configured limit. Deleted articles are excluded, and no single cluster
/// contributes more than the per-cluster cap.
pub async fn recall_candidates(
    db: &Database,
    article_id: &str,
    fp: &StoredFingerprint,
) -> Result<Vec<Candidate>, CoreError> {
    let bands = fingerprint::band_hashes(&fp.minhash);
    let lookup_limit = (SETTINGS.recall_limit * 4) as i64;

    let (simhash_hits, band_hits) = tokio::join!(
        db.find_by_simhash(fp.simhash, SIMHASH_MAX_HAMMING, lookup_limit),
        db.find_by_lsh_bands(&bands, lookup_limit),
    );
    let simhash_hits = simhash_hits?;
    let band_hits = band_hits?;

    // Union the two result sets by article id.
    let mut band_counts: HashMap<String, i64> = HashMap::new();
    for (id, matches) in band_hits {
        band_counts.insert(id, matches);
    }
    for (id, _) in &simhash_hits {
        band_counts.entry(id.clone()).or_insert(0);
    }
    band_counts.remove(article_id);

    if band_counts.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = band_counts.keys().cloned().collect();
    let meta = db.candidate_meta(&ids).await?;

    let ranked = rank_candidates(fp.simhash, &band_counts, &meta);
    debug!(
        target: TARGET_WORKER,
        "Recall for {}: {} raw, {} ranked", article_id, band_counts.len(), ranked.len()
    );
    Ok(ranked)
}

/// Pure ranking step: proxy score is matching-band count (desc), tie-broken
/// by SimHash closeness (asc) then article id (asc) for determinism. A
/// per-cluster cap keeps one large cluster from monopolizing the budget.
pub fn rank_candidates(
    query_simhash: u64,
    band_counts: &HashMap<String, i64>,
    meta: &[CandidateMeta],
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = meta
        .iter()
        .filter(|m| m.state != STATE_DELETED)
        .map(|m| Candidate {
            article_id: m.article_id.clone(),
            cluster_id: m.cluster_id.clone(),
            matching_bands: band_counts.get(&m.article_id).copied().unwrap_or(0),
            hamming: fingerprint::hamming(query_simhash, m.simhash),
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.matching_bands
            .cmp(&a.matching_bands)
            .then(a.hamming.cmp(&b.hamming))
            .then(a.article_id.cmp(&b.article_id))
    });

    let mut per_cluster: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(SETTINGS.recall_limit);
    for candidate in candidates {
        if let Some(cluster_id) = &candidate.cluster_id {
            let seen = per_cluster.entry(cluster_id.clone()).or_insert(0);
            if *seen >= SETTINGS.per_cluster_cap {
                continue;
            }
            *seen += 1;
        }
        out.push(candidate);
        if out.len() >= SETTINGS.recall_limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, cluster: Option<&str>, simhash: u64) -> CandidateMeta {
        CandidateMeta {
            article_id: id.to_string(),
            cluster_id: cluster.map(String::from),
            state: 1,
            simhash,
            version: 1,
        }
    }

    #[test]
    fn ranking_prefers_more_band_matches_then_closer_simhash() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), 2);
        counts.insert("b".to_string(), 5);
        counts.insert("c".to_string(), 5);

        let metas = vec![
            meta("a", None, 0b0),
            meta("b", None, 0b1111), // hamming 4 from query 0
            meta("c", None, 0b1),    // hamming 1 from query 0
        ];
        let ranked = rank_candidates(0, &counts, &metas);
        let ids: Vec<&str> = ranked.iter().map(|c| c.article_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn deleted_articles_are_excluded() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), 3);
        let mut m = meta("a", None, 0);
        m.state = STATE_DELETED;
        assert!(rank_candidates(0, &counts, &[m]).is_empty());
    }

    #[test]
    fn per_cluster_cap_limits_one_cluster() {
        let mut counts = HashMap::new();
        let mut metas = Vec::new();
        for i in 0..6 {
            let id = format!("c{i}");
            counts.insert(id.clone(), 10 - i as i64);
            metas.push(meta(&id, Some("cluster_x"), 0));
        }
        counts.insert("solo".to_string(), 1);
        metas.push(meta("solo", None, 0));

        let ranked = rank_candidates(0, &counts, &metas);
        let from_x = ranked
            .iter()
            .filter(|c| c.cluster_id.as_deref() == Some("cluster_x"))
            .count();
        assert_eq!(from_x, SETTINGS.per_cluster_cap);
        assert!(ranked.iter().any(|c| c.article_id == "solo"));
    }

    #[test]
    fn ties_break_on_article_id_for_determinism() {
        let mut counts = HashMap::new();
        counts.insert("b".to_string(), 1);
        counts.insert("a".to_string(), 1);
        let metas = vec![meta("b", None, 0), meta("a", None, 0)];
        let ranked = rank_candidates(0, &counts, &metas);
        assert_eq!(ranked[0].article_id, "a");
    }
}
