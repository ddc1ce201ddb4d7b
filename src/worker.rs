//! Ingestion workers: claim similarity jobs from the shared queue and run
//! the per-article path (fingerprint -> recall -> verify -> assign).
//!
//! No in-memory lock is held across a gateway call; every cross-worker
//! coordination point is a version-checked write in the gateway. Workers
//! never panic the pool: a failing job is retried with backoff or moved to
//! the dead-letter table, and the loop continues.

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::clustering::{assign_article, remove_from_cluster, Assignment};
use crate::db::Database;
use crate::error::CoreError;
use crate::fingerprint::{normalize, shingle_set, Fingerprinter};
use crate::recall::recall_candidates;
use crate::settings::SETTINGS;
use crate::types::{ClusterStatus, Job, JobType, StoredFingerprint};
use crate::verifier::verify_candidates;
use crate::TARGET_WORKER;

pub async fn worker_loop(worker_id: usize, db: Database) {
    let fingerprinter = Fingerprinter::new();
    info!(target: TARGET_WORKER, "Worker {}: starting", worker_id);

    loop {
        match db.claim_job(SETTINGS.queue_visibility_secs).await {
            Ok(Some(job)) => {
                if let Err(e) = handle_job(&db, &fingerprinter, &job).await {
                    // Queue bookkeeping itself failed; the claim expires on
                    // its own and the job is redelivered.
                    error!(
                        target: TARGET_WORKER,
                        "Worker {}: queue error on job {}: {}", worker_id, job.id, e
                    );
                    sleep(Duration::from_millis(SETTINGS.queue_poll_ms)).await;
                }
            }
            Ok(None) => {
                sleep(Duration::from_millis(SETTINGS.queue_poll_ms)).await;
            }
            Err(e) => {
                error!(target: TARGET_WORKER, "Worker {}: failed to claim job: {}", worker_id, e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Run one job and settle it with the queue: ack on success, nack with
/// backoff on transient failure, dead-letter on permanent failure or
/// exhausted retries.
async fn handle_job(
    db: &Database,
    fingerprinter: &Fingerprinter,
    job: &Job,
) -> Result<(), sqlx::Error> {
    match process_job(db, fingerprinter, job).await {
        Ok(()) => db.ack_job(job.id).await,
        Err(e) if e.is_transient() => {
            if job.attempt >= SETTINGS.queue_max_attempts {
                db.dead_letter_job(job, &format!("retries exhausted: {}", e))
                    .await
            } else {
                let delay = backoff_secs(job.attempt);
                warn!(
                    target: TARGET_WORKER,
                    "Job {} for {} failed (attempt {}), retrying in {}s: {}",
                    job.id, job.article_id, job.attempt, delay, e
                );
                db.nack_job(job.id, delay).await
            }
        }
        Err(e) => db.dead_letter_job(job, &e.to_string()).await,
    }
}

/// Exponential backoff: base 1s, factor 2, capped at 60s, with up to 20%
/// positive jitter to spread retry storms.
fn backoff_secs(attempt: i64) -> i64 {
    let exp = (attempt - 1).clamp(0, 6) as u32;
    let base = (1i64 << exp).min(60);
    let jitter_cap = (base / 5).max(1);
    base + rand::rng().random_range(0..=jitter_cap)
}

/// The per-article path of the ingestion pipeline.
pub async fn process_job(
    db: &Database,
    fingerprinter: &Fingerprinter,
    job: &Job,
) -> Result<(), CoreError> {
    let Some((article, stored_fp)) = db.get_article_with_fingerprint(&job.article_id).await? else {
        return Err(CoreError::ArticleNotFound(job.article_id.clone()));
    };

    let is_recheck = job.job_type == JobType::Recheck;
    if article.cluster_status != ClusterStatus::Pending && !is_recheck {
        // Redelivered or duplicate submission; the terminal state stands.
        return Ok(());
    }

    let previous_cluster = article.cluster_id.clone();
    let full_text = format!("{} {}", article.title, article.content);

    let fp = if is_recheck {
        // Recompute features so a recheck observes the current content.
        let fresh = fingerprinter.fingerprint(&full_text);
        db.update_fingerprint(&article.article_id, &fresh).await?;
        StoredFingerprint {
            simhash: fresh.simhash,
            minhash: fresh.minhash,
        }
    } else {
        stored_fp
    };

    let shingles = shingle_set(&normalize(&full_text));
    if shingles.is_empty() {
        if db
            .finalize_article(&article.article_id, None, ClusterStatus::Unique, None)
            .await?
        {
            info!(target: TARGET_WORKER, "article {} -> unique (no shingles)", article.article_id);
            settle_previous_cluster(db, &article.article_id, previous_cluster.as_deref(), None)
                .await?;
        }
        return Ok(());
    }

    let candidates = recall_candidates(db, &article.article_id, &fp).await?;
    let outcome = verify_candidates(db, &article.article_id, &shingles, &candidates).await?;

    if outcome.timed_out && outcome.matches.is_empty() {
        // Resource exhaustion is not an error: downgrade to a tentative
        // terminal and re-examine shortly.
        if db
            .finalize_article(&article.article_id, None, ClusterStatus::Unique, None)
            .await?
        {
            db.enqueue_job(
                JobType::Recheck,
                &article.article_id,
                SETTINGS.recheck_delay_secs,
            )
            .await?;
            info!(
                target: TARGET_WORKER,
                "article {} -> unique (verifier timeout, recheck scheduled)", article.article_id
            );
            settle_previous_cluster(db, &article.article_id, previous_cluster.as_deref(), None)
                .await?;
        }
        return Ok(());
    }

    let assignment = assign_article(db, &article, &fp, &outcome.matches).await?;

    let new_cluster = match &assignment {
        Assignment::Matched { cluster_id, .. } => Some(cluster_id.as_str()),
        Assignment::Unique => None,
    };
    settle_previous_cluster(
        db,
        &article.article_id,
        previous_cluster.as_deref(),
        new_cluster,
    )
    .await?;

    Ok(())
}

/// After a recheck writes its new terminal state, drop the tentatively
/// retained membership in the old cluster if the assignment moved.
async fn settle_previous_cluster(
    db: &Database,
    article_id: &str,
    previous: Option<&str>,
    current: Option<&str>,
) -> Result<(), CoreError> {
    if let Some(old) = previous {
        if current != Some(old) {
            remove_from_cluster(db, article_id, old).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::article::NewArticle;
    use crate::db::core::test_database;
    use crate::types::ArticleTag;
    use chrono::{TimeZone, Utc};

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_secs(1);
            assert!((1..=2).contains(&first));
            let fifth = backoff_secs(5);
            assert!((16..=20).contains(&fifth));
            let deep = backoff_secs(40);
            assert!(deep <= 72, "cap plus jitter exceeded: {deep}");
        }
    }

    /// Distinct, non-repeating words so shingle sets do not collapse.
    fn words(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("word{i:03}")).collect()
    }

    /// Replace `count` words starting at `from` with markers unique to
    /// `tag`, producing a controlled shingle overlap with the base text.
    fn perturbed(base: &[String], from: usize, count: usize, tag: &str) -> String {
        let mut out = base.to_vec();
        for (k, slot) in out.iter_mut().skip(from).take(count).enumerate() {
            *slot = format!("{tag}{k:03}x");
        }
        out.join(" ")
    }

    // A shared non-empty title: candidate shingles must be rebuilt from the
    // same title+content text as the query side, so an exact duplicate
    // scores exactly 1.0 only when both sides include the title.
    fn article(id: &str, content: &str, publish_secs: i64) -> NewArticle {
        NewArticle {
            article_id: id.to_string(),
            title: "evening news roundup".to_string(),
            content: content.to_string(),
            publish_time: Utc.timestamp_opt(1_700_000_000 + publish_secs, 0).unwrap(),
            source: "unit-test".to_string(),
            state: 1,
            top: 0,
            tags: vec![ArticleTag {
                id: 1,
                name: "news".to_string(),
            }],
            topic: vec![],
        }
    }

    async fn submit(db: &Database, fper: &Fingerprinter, new: &NewArticle) {
        let fp = fper.fingerprint(&format!("{} {}", new.title, new.content));
        db.upsert_article(new, &fp).await.unwrap();
    }

    fn ingest_job(article_id: &str) -> Job {
        Job {
            id: 1,
            job_type: JobType::Ingest,
            article_id: article_id.to_string(),
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    fn recheck_job(article_id: &str) -> Job {
        Job {
            job_type: JobType::Recheck,
            ..ingest_job(article_id)
        }
    }

    #[tokio::test]
    async fn unique_article_gets_no_cluster() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let base = words(150);

        submit(&db, &fper, &article("a1", &base.join(" "), 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();

        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Unique);
        assert_eq!(a1.cluster_id, None);
        assert_eq!(a1.similarity_score, None);
    }

    #[tokio::test]
    async fn exact_duplicate_founds_a_cluster_with_the_original() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let text = words(150).join(" ");

        submit(&db, &fper, &article("a1", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        submit(&db, &fper, &article("a2", &text, 60)).await;
        process_job(&db, &fper, &ingest_job("a2")).await.unwrap();

        let a2 = db.get_article("a2").await.unwrap().unwrap();
        assert_eq!(a2.cluster_status, ClusterStatus::Matched);
        assert_eq!(a2.similarity_score, Some(1.0));
        let cluster_id = a2.cluster_id.unwrap();

        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Matched);
        assert_eq!(a1.cluster_id.as_deref(), Some(cluster_id.as_str()));

        let cluster = db.get_cluster(&cluster_id).await.unwrap().unwrap();
        assert_eq!(cluster.article_ids, vec!["a1", "a2"]);
        assert_eq!(cluster.size, 2);
        assert_eq!(cluster.representative_article_id, "a1");
    }

    #[tokio::test]
    async fn near_duplicate_at_threshold_appends() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let base = words(150);
        let text = base.join(" ");

        submit(&db, &fper, &article("a1", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        submit(&db, &fper, &article("a2", &text, 60)).await;
        process_job(&db, &fper, &ingest_job("a2")).await.unwrap();

        // ~10 of 150 words changed: Jaccard well above 0.80, below 1.0.
        let near = perturbed(&base, 60, 10, "edit");
        submit(&db, &fper, &article("a3", &near, 120)).await;
        process_job(&db, &fper, &ingest_job("a3")).await.unwrap();

        let a3 = db.get_article("a3").await.unwrap().unwrap();
        assert_eq!(a3.cluster_status, ClusterStatus::Matched);
        let score = a3.similarity_score.unwrap();
        assert!(score >= 0.80 && score < 1.0, "score {score}");

        let cluster = db.get_cluster(&a3.cluster_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(cluster.size, 3);
        assert_eq!(cluster.article_ids, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn below_threshold_neighbor_stays_unique() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let base = words(150);

        submit(&db, &fper, &article("a1", &base.join(" "), 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();

        // ~35 of 150 words changed: recall still finds a1, verify rejects.
        let neighbor = perturbed(&base, 40, 35, "other");
        submit(&db, &fper, &article("a4", &neighbor, 60)).await;
        process_job(&db, &fper, &ingest_job("a4")).await.unwrap();

        let a4 = db.get_article("a4").await.unwrap().unwrap();
        assert_eq!(a4.cluster_status, ClusterStatus::Unique);
        assert_eq!(a4.cluster_id, None);
        // a1's state is untouched.
        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Unique);
    }

    #[tokio::test]
    async fn two_cluster_conflict_admits_to_best_only() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let base = words(150);

        // a1 in cluster C1, a7 in cluster C2; a5 matches a7 more closely.
        let a1_text = perturbed(&base, 10, 13, "left");
        let a7_text = perturbed(&base, 100, 7, "right");

        submit(&db, &fper, &article("a1", &a1_text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        submit(&db, &fper, &article("a1b", &a1_text, 30)).await;
        process_job(&db, &fper, &ingest_job("a1b")).await.unwrap();
        submit(&db, &fper, &article("a7", &a7_text, 60)).await;
        process_job(&db, &fper, &ingest_job("a7")).await.unwrap();
        submit(&db, &fper, &article("a7b", &a7_text, 90)).await;
        process_job(&db, &fper, &ingest_job("a7b")).await.unwrap();

        let c1 = db.get_article("a1").await.unwrap().unwrap().cluster_id.unwrap();
        let c2 = db.get_article("a7").await.unwrap().unwrap().cluster_id.unwrap();
        assert_ne!(c1, c2);

        submit(&db, &fper, &article("a5", &base.join(" "), 120)).await;
        process_job(&db, &fper, &ingest_job("a5")).await.unwrap();

        let a5 = db.get_article("a5").await.unwrap().unwrap();
        assert_eq!(a5.cluster_id.as_deref(), Some(c2.as_str()));

        // C1 is untouched by the conflicting match.
        let c1_doc = db.get_cluster(&c1).await.unwrap().unwrap();
        assert_eq!(c1_doc.size, 2);
        let c2_doc = db.get_cluster(&c2).await.unwrap().unwrap();
        assert_eq!(c2_doc.size, 3);
    }

    #[tokio::test]
    async fn resubmission_is_idempotent() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let text = words(150).join(" ");

        submit(&db, &fper, &article("a1", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        let first = db.get_article("a1").await.unwrap().unwrap();

        // Same (article_id, content) again, job and all.
        submit(&db, &fper, &article("a1", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        let second = db.get_article("a1").await.unwrap().unwrap();

        assert_eq!(first.cluster_status, second.cluster_status);
        assert_eq!(first.cluster_id, second.cluster_id);
        assert_eq!(first.similarity_score, second.similarity_score);
        let clusters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clusters")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(clusters, 0);
    }

    #[tokio::test]
    async fn concurrent_appends_converge_on_one_cluster() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let text = words(150).join(" ");

        submit(&db, &fper, &article("x", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("x")).await.unwrap();

        submit(&db, &fper, &article("n1", &text, 60)).await;
        submit(&db, &fper, &article("n2", &text, 90)).await;

        let db1 = db.clone();
        let db2 = db.clone();
        let t1 = tokio::spawn(async move {
            process_job(&db1, &Fingerprinter::new(), &ingest_job("n1")).await
        });
        let t2 = tokio::spawn(async move {
            process_job(&db2, &Fingerprinter::new(), &ingest_job("n2")).await
        });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let x = db.get_article("x").await.unwrap().unwrap();
        let n1 = db.get_article("n1").await.unwrap().unwrap();
        let n2 = db.get_article("n2").await.unwrap().unwrap();
        let cluster_id = x.cluster_id.unwrap();
        assert_eq!(n1.cluster_id.as_deref(), Some(cluster_id.as_str()));
        assert_eq!(n2.cluster_id.as_deref(), Some(cluster_id.as_str()));

        let cluster = db.get_cluster(&cluster_id).await.unwrap().unwrap();
        assert_eq!(cluster.size, 3);

        // No duplicate cluster was created.
        let clusters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clusters")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(clusters, 1);
    }

    #[tokio::test]
    async fn empty_content_is_unique() {
        let db = test_database().await;
        let fper = Fingerprinter::new();

        let mut empty = article("a1", "", 0);
        empty.title = String::new();
        submit(&db, &fper, &empty).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();

        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Unique);
    }

    #[tokio::test]
    async fn missing_article_is_a_permanent_error() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let err = process_job(&db, &fper, &ingest_job("ghost")).await.unwrap_err();
        assert!(matches!(err, CoreError::ArticleNotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn recheck_reprocesses_a_terminal_article() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let text = words(150).join(" ");

        // a1 settled unique before a2 existed.
        submit(&db, &fper, &article("a1", &text, 0)).await;
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();

        // A plain ingest job for a terminal article short-circuits.
        process_job(&db, &fper, &ingest_job("a1")).await.unwrap();
        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Unique);

        // a2 arrives and pulls a1 into its cluster.
        submit(&db, &fper, &article("a2", &text, 60)).await;
        process_job(&db, &fper, &ingest_job("a2")).await.unwrap();

        // A recheck of a1 converges on the same cluster.
        db.set_pending_for_recheck("a1").await.unwrap();
        process_job(&db, &fper, &recheck_job("a1")).await.unwrap();

        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Matched);
        let cluster = db.get_cluster(&a1.cluster_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(cluster.size, 2);
        assert!(cluster.article_ids.contains(&"a1".to_string()));
    }
}
