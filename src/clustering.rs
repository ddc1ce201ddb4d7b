//! Cluster state machine and assignment.
//!
//! This module is the only writer of cluster documents. Two contracts hold
//! under concurrent ingestion:
//!
//! - Single-winner assignment: an article reaches exactly one terminal
//!   state and is never observable in two clusters. Unclustered matches
//!   are claimed with a version-checked conditional write.
//! - Monotone cluster state: size shrinks only via explicit removal, the
//!   centroid is an elementwise running minimum, and `last_updated` never
//!   moves backwards.
//!
//! Clusters sharing a verified match are never merged automatically;
//! Jaccard is not transitive and merging would let transitively-dissimilar
//! articles share a cluster. A `merge_candidate` log line records the
//! situation for manual review.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::db::cluster::ClusterWrite;
use crate::db::Database;
use crate::error::CoreError;
use crate::fingerprint::normalize;
use crate::types::{Article, Cluster, ClusterStatus, StoredFingerprint, TopTerm};
use crate::verifier::VerifiedMatch;
use crate::TARGET_WORKER;

/// Version-conflict retries before surfacing CLUSTER_CONFLICT for requeue.
pub const MAX_ASSIGN_ATTEMPTS: u32 = 5;

/// Number of terms kept on a cluster document.
pub const MAX_TOP_TERMS: usize = 10;

/// Terminal state decided for one article.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Matched { cluster_id: String, score: f64 },
    Unique,
}

/// Decide and persist the terminal state for `article` given its verified
/// matches. The match set is fixed; cluster membership of the matches is
/// re-read on every attempt so concurrent assignments converge.
pub async fn assign_article(
    db: &Database,
    article: &Article,
    fp: &StoredFingerprint,
    matches: &[VerifiedMatch],
) -> Result<Assignment, CoreError> {
    if matches.is_empty() {
        let assignment = finalize_unique(db, &article.article_id).await?;
        if assignment == Assignment::Unique {
            info!(target: TARGET_WORKER, "article {} -> unique", article.article_id);
        }
        return Ok(assignment);
    }

    let match_ids: Vec<String> = matches.iter().map(|m| m.article_id.clone()).collect();

    for attempt in 1..=MAX_ASSIGN_ATTEMPTS {
        // Fresh membership view; verified scores never change.
        let meta = db.candidate_meta(&match_ids).await?;
        let live: HashMap<&str, (Option<&str>, i64)> = meta
            .iter()
            .filter(|m| m.state != crate::types::STATE_DELETED)
            .map(|m| (m.article_id.as_str(), (m.cluster_id.as_deref(), m.version)))
            .collect();

        // Matches deleted since verification no longer count.
        let usable: Vec<&VerifiedMatch> = matches
            .iter()
            .filter(|m| live.contains_key(m.article_id.as_str()))
            .collect();
        if usable.is_empty() {
            let assignment = finalize_unique(db, &article.article_id).await?;
            if assignment == Assignment::Unique {
                info!(target: TARGET_WORKER, "article {} -> unique (matches gone)", article.article_id);
            }
            return Ok(assignment);
        }

        let mut clustered: Vec<(&VerifiedMatch, &str)> = Vec::new();
        let mut unclustered: Vec<(&VerifiedMatch, i64)> = Vec::new();
        for &m in &usable {
            match live[m.article_id.as_str()] {
                (Some(cluster_id), _) => clustered.push((m, cluster_id)),
                (None, version) => unclustered.push((m, version)),
            }
        }

        let outcome = if clustered.is_empty() {
            found_cluster(db, article, fp, &unclustered).await?
        } else {
            append_to_best(db, article, fp, &clustered).await?
        };

        match outcome {
            Some(assignment) => return Ok(assignment),
            None => {
                debug!(
                    target: TARGET_WORKER,
                    "assignment attempt {}/{} for {} hit a version conflict, retrying",
                    attempt, MAX_ASSIGN_ATTEMPTS, article.article_id
                );
            }
        }
    }

    Err(CoreError::ClusterConflict {
        attempts: MAX_ASSIGN_ATTEMPTS,
    })
}

/// Case |C| = 0: every usable match is itself unclustered. Found a new
/// cluster from the current article plus whichever matches we win the
/// claim race for. Returns None to request a retry.
async fn found_cluster(
    db: &Database,
    article: &Article,
    fp: &StoredFingerprint,
    unclustered: &[(&VerifiedMatch, i64)],
) -> Result<Option<Assignment>, CoreError> {
    let cluster_id = format!("cluster_{}", article.article_id);
    let now = Utc::now();

    // Claim peers best-score-first; losers were grabbed by a concurrent
    // assignment and will surface as clustered on the retry pass.
    let mut claimed: Vec<&VerifiedMatch> = Vec::new();
    let mut order: Vec<(&VerifiedMatch, i64)> = unclustered.to_vec();
    order.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));
    for (m, version) in order {
        if db
            .try_claim_for_cluster(&m.article_id, &cluster_id, m.score, version)
            .await?
        {
            claimed.push(m);
        }
    }
    if claimed.is_empty() {
        return Ok(None);
    }

    let claimed_ids: Vec<String> = claimed.iter().map(|m| m.article_id.clone()).collect();
    let signatures = db.member_signatures(&claimed_ids).await?;
    let mut centroid = fp.minhash.clone();
    for (_, minhash, _, _) in &signatures {
        elementwise_min(&mut centroid, minhash);
    }

    // Representative: the highest-similarity peer, with its admission score
    // cached for bounded recomputation on later appends.
    let representative = claimed[0];

    let mut article_ids = claimed_ids.clone();
    article_ids.push(article.article_id.clone());

    // A previous life of this article may have founded a document with the
    // same id (recheck of a founder, redelivered job). Fold the members
    // into it instead of creating a second document.
    let write = match db.get_cluster(&cluster_id).await? {
        Some(existing) => {
            let mut member_ids = existing.article_ids.clone();
            for id in &article_ids {
                if !member_ids.contains(id) {
                    member_ids.push(id.clone());
                }
            }
            elementwise_min(&mut centroid, &existing.centroid_minhash);
            db.update_cluster_members(
                &cluster_id,
                &member_ids,
                &existing.representative_article_id,
                existing.representative_avg_jaccard,
                &centroid,
                &existing.top_terms,
                now,
                existing.version,
            )
            .await?
        }
        None => {
            let top_terms = top_terms_for(db, &representative.article_id).await?;
            db.create_cluster(&Cluster {
                cluster_id: cluster_id.clone(),
                article_ids,
                size: (claimed.len() + 1) as i64,
                representative_article_id: representative.article_id.clone(),
                representative_avg_jaccard: representative.score,
                centroid_minhash: centroid,
                top_terms,
                last_updated: now,
                created_at: now,
                version: 1,
            })
            .await?
        }
    };
    if write == ClusterWrite::VersionConflict {
        return Ok(None);
    }

    let score = claimed[0].score;
    if let Some(lost) = finalize_matched(db, article, &cluster_id, score).await? {
        return Ok(Some(lost));
    }
    info!(
        target: TARGET_WORKER,
        "article {} -> matched(cluster {}, score {:.4}, founded with {} peers)",
        article.article_id, cluster_id, score, claimed.len()
    );
    Ok(Some(Assignment::Matched { cluster_id, score }))
}

/// Guarded `unique` write. If a concurrent assignment claimed the article
/// into a cluster first, that claim is the terminal state.
async fn finalize_unique(db: &Database, article_id: &str) -> Result<Assignment, CoreError> {
    if db
        .finalize_article(article_id, None, ClusterStatus::Unique, None)
        .await?
    {
        return Ok(Assignment::Unique);
    }
    stored_assignment(db, article_id).await
}

/// Guarded `matched` write for the in-flight article. Returns the winning
/// assignment when a concurrent claim into a different cluster got there
/// first; the member entry appended to `cluster_id` is backed out so the
/// article stays observable in exactly one cluster.
async fn finalize_matched(
    db: &Database,
    article: &Article,
    cluster_id: &str,
    score: f64,
) -> Result<Option<Assignment>, CoreError> {
    if db
        .finalize_article(
            &article.article_id,
            Some(cluster_id),
            ClusterStatus::Matched,
            Some(score),
        )
        .await?
    {
        return Ok(None);
    }
    warn!(
        target: TARGET_WORKER,
        "article {} was claimed concurrently; yielding cluster {}", article.article_id, cluster_id
    );
    remove_from_cluster(db, &article.article_id, cluster_id).await?;
    Ok(Some(stored_assignment(db, &article.article_id).await?))
}

async fn stored_assignment(db: &Database, article_id: &str) -> Result<Assignment, CoreError> {
    let Some(stored) = db.get_article(article_id).await? else {
        return Ok(Assignment::Unique);
    };
    match (stored.cluster_id, stored.similarity_score) {
        (Some(cluster_id), Some(score)) => Ok(Assignment::Matched { cluster_id, score }),
        _ => Ok(Assignment::Unique),
    }
}

/// Cases |C| = 1 and |C| >= 2: append to the cluster of the best-scoring
/// clustered match. Never merges. Returns None to request a retry.
async fn append_to_best(
    db: &Database,
    article: &Article,
    fp: &StoredFingerprint,
    clustered: &[(&VerifiedMatch, &str)],
) -> Result<Option<Assignment>, CoreError> {
    let mut by_score: Vec<&(&VerifiedMatch, &str)> = clustered.iter().collect();
    by_score.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));
    let (best, target_id) = *by_score[0];

    let distinct: Vec<&str> = {
        let mut ids: Vec<&str> = clustered.iter().map(|(_, c)| *c).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };
    if distinct.len() >= 2 {
        warn!(
            target: TARGET_WORKER,
            merge_candidate = true,
            article_id = %article.article_id,
            winner = %target_id,
            clusters = ?distinct,
            "article matches multiple clusters; admitting to best-scoring only"
        );
    }

    let Some(cluster) = db.get_cluster(target_id).await? else {
        // Article rows point at a cluster document that is gone; rebuild it
        // from the surviving members before retrying.
        rebuild_cluster(db, target_id).await?;
        return Ok(None);
    };

    // Fold in verified matches that point at the target but fell out of
    // its member list (an interrupted founding write), plus the current
    // article itself.
    let mut article_ids = cluster.article_ids.clone();
    let mut missing_members: Vec<String> = Vec::new();
    for (m, c) in clustered {
        if *c == target_id && !article_ids.iter().any(|id| id == &m.article_id) {
            article_ids.push(m.article_id.clone());
            missing_members.push(m.article_id.clone());
        }
    }
    let already_member = article_ids.iter().any(|id| id == &article.article_id);
    if already_member && missing_members.is_empty() {
        // Redelivered job: nothing to write on the document.
        if let Some(lost) = finalize_matched(db, article, target_id, best.score).await? {
            return Ok(Some(lost));
        }
        return Ok(Some(Assignment::Matched {
            cluster_id: target_id.to_string(),
            score: best.score,
        }));
    }
    if !already_member {
        article_ids.push(article.article_id.clone());
    }

    let mut centroid = cluster.centroid_minhash.clone();
    elementwise_min(&mut centroid, &fp.minhash);
    if !missing_members.is_empty() {
        for (_, minhash, _, _) in &db.member_signatures(&missing_members).await? {
            elementwise_min(&mut centroid, minhash);
        }
    }

    // Representative moves only if the newcomer's measured average beats
    // the cached average of the current representative.
    let in_target: Vec<f64> = clustered
        .iter()
        .filter(|(_, c)| *c == target_id)
        .map(|(m, _)| m.score)
        .collect();
    let newcomer_avg = in_target.iter().sum::<f64>() / in_target.len() as f64;

    let (rep_id, rep_avg, top_terms) = if newcomer_avg > cluster.representative_avg_jaccard {
        let terms = top_terms_for(db, &article.article_id).await?;
        (article.article_id.clone(), newcomer_avg, terms)
    } else {
        (
            cluster.representative_article_id.clone(),
            cluster.representative_avg_jaccard,
            cluster.top_terms.clone(),
        )
    };

    let write = db
        .update_cluster_members(
            target_id,
            &article_ids,
            &rep_id,
            rep_avg,
            &centroid,
            &top_terms,
            Utc::now(),
            cluster.version,
        )
        .await?;
    if write == ClusterWrite::VersionConflict {
        return Ok(None);
    }

    if let Some(lost) = finalize_matched(db, article, target_id, best.score).await? {
        return Ok(Some(lost));
    }
    info!(
        target: TARGET_WORKER,
        "article {} -> matched(cluster {}, score {:.4})",
        article.article_id, target_id, best.score
    );
    Ok(Some(Assignment::Matched {
        cluster_id: target_id.to_string(),
        score: best.score,
    }))
}

/// Remove an article from its cluster (deletion or post-recheck move).
/// The cluster document is deleted once its membership drains to zero.
pub async fn remove_from_cluster(
    db: &Database,
    article_id: &str,
    cluster_id: &str,
) -> Result<(), CoreError> {
    for _attempt in 1..=MAX_ASSIGN_ATTEMPTS {
        let Some(cluster) = db.get_cluster(cluster_id).await? else {
            return Ok(());
        };
        if !cluster.article_ids.iter().any(|id| id == article_id) {
            return Ok(());
        }

        let remaining: Vec<String> = cluster
            .article_ids
            .iter()
            .filter(|id| id.as_str() != article_id)
            .cloned()
            .collect();

        if remaining.is_empty() {
            if db.delete_cluster(cluster_id, cluster.version).await? == ClusterWrite::Applied {
                info!(target: TARGET_WORKER, "cluster {} drained and deleted", cluster_id);
                return Ok(());
            }
            continue;
        }

        // The running-minimum centroid cannot be decremented, so rebuild it
        // from the surviving members.
        let signatures = db.member_signatures(&remaining).await?;
        let mut centroid: Vec<u64> = Vec::new();
        for (_, minhash, _, _) in &signatures {
            if centroid.is_empty() {
                centroid = minhash.clone();
            } else {
                elementwise_min(&mut centroid, minhash);
            }
        }

        let (rep_id, rep_avg, top_terms) = if cluster.representative_article_id == article_id {
            // Re-elect: best admission score, earliest publish, lowest id.
            let mut members = signatures.clone();
            members.sort_by(|a, b| {
                let score_a = a.3.unwrap_or(0.0);
                let score_b = b.3.unwrap_or(0.0);
                score_b
                    .total_cmp(&score_a)
                    .then(a.2.cmp(&b.2))
                    .then(a.0.cmp(&b.0))
            });
            let new_rep = &members[0];
            let terms = top_terms_for(db, &new_rep.0).await?;
            (new_rep.0.clone(), new_rep.3.unwrap_or(0.0), terms)
        } else {
            (
                cluster.representative_article_id.clone(),
                cluster.representative_avg_jaccard,
                cluster.top_terms.clone(),
            )
        };

        let write = db
            .update_cluster_members(
                cluster_id,
                &remaining,
                &rep_id,
                rep_avg,
                &centroid,
                &top_terms,
                Utc::now(),
                cluster.version,
            )
            .await?;
        if write == ClusterWrite::Applied {
            info!(target: TARGET_WORKER, "article {} removed from cluster {}", article_id, cluster_id);
            return Ok(());
        }
    }
    Err(CoreError::ClusterConflict {
        attempts: MAX_ASSIGN_ATTEMPTS,
    })
}

/// Recreate a missing cluster document from the articles that still point
/// at it. Only reached when a cluster row vanished underneath its members.
async fn rebuild_cluster(db: &Database, cluster_id: &str) -> Result<(), CoreError> {
    let members = db.articles_by_cluster(cluster_id).await?;
    if members.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = members.iter().map(|a| a.article_id.clone()).collect();
    let signatures = db.member_signatures(&ids).await?;
    let mut centroid: Vec<u64> = Vec::new();
    for (_, minhash, _, _) in &signatures {
        if centroid.is_empty() {
            centroid = minhash.clone();
        } else {
            elementwise_min(&mut centroid, minhash);
        }
    }
    let rep = members
        .iter()
        .max_by(|a, b| {
            let sa = a.similarity_score.unwrap_or(0.0);
            let sb = b.similarity_score.unwrap_or(0.0);
            sa.total_cmp(&sb)
                .then(b.publish_time.cmp(&a.publish_time))
                .then(b.article_id.cmp(&a.article_id))
        })
        .expect("members is non-empty");
    let now = Utc::now();
    let cluster = Cluster {
        cluster_id: cluster_id.to_string(),
        article_ids: ids,
        size: members.len() as i64,
        representative_article_id: rep.article_id.clone(),
        representative_avg_jaccard: rep.similarity_score.unwrap_or(0.0),
        centroid_minhash: centroid,
        top_terms: extract_top_terms(&format!("{} {}", rep.title, rep.content)),
        last_updated: now,
        created_at: now,
        version: 1,
    };
    warn!(target: TARGET_WORKER, "rebuilt missing cluster document {}", cluster_id);
    db.create_cluster(&cluster).await?;
    Ok(())
}

async fn top_terms_for(db: &Database, article_id: &str) -> Result<Vec<TopTerm>, CoreError> {
    let Some(article) = db.get_article(article_id).await? else {
        return Ok(Vec::new());
    };
    Ok(extract_top_terms(&format!(
        "{} {}",
        article.title, article.content
    )))
}

/// Word-frequency top terms over normalized text, weights summing to 1.
pub fn extract_top_terms(text: &str) -> Vec<TopTerm> {
    let normalized = normalize(text);
    let mut freq: HashMap<&str, u32> = HashMap::new();
    for word in normalized.split_whitespace() {
        if word.chars().count() > 1 {
            *freq.entry(word).or_insert(0) += 1;
        }
    }
    let mut sorted: Vec<(&str, u32)> = freq.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    sorted.truncate(MAX_TOP_TERMS);

    let total: u32 = sorted.iter().map(|(_, f)| f).sum();
    if total == 0 {
        return Vec::new();
    }
    sorted
        .into_iter()
        .map(|(term, f)| TopTerm {
            term: term.to_string(),
            weight: ((f as f64 / total as f64) * 1000.0).round() / 1000.0,
        })
        .collect()
}

fn elementwise_min(acc: &mut [u64], other: &[u64]) {
    for (slot, v) in acc.iter_mut().zip(other.iter()) {
        if *v < *slot {
            *slot = *v;
        }
    }
}
