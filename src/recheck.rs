//! Recheck controller: re-enqueues articles for recomputation with a
//! per-article cooldown and a per-caller rate limit.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::CoreError;
use crate::settings::SETTINGS;
use crate::types::JobType;
use crate::TARGET_API;

#[derive(Debug)]
pub struct RecheckReceipt {
    pub accepted: bool,
    pub job_id: String,
    /// Articles actually enqueued (missing or cooling-down ids are skipped).
    pub enqueued: usize,
}

#[derive(Default)]
struct ControllerState {
    /// Caller key -> (minute bucket, requests seen in that bucket).
    rate: HashMap<String, (i64, u32)>,
    /// Day stamp and counter behind the job id scheme.
    job_day: String,
    job_counter: u32,
}

pub struct RecheckController {
    db: Database,
    state: Mutex<ControllerState>,
}

impl RecheckController {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Enqueue recheck jobs for the given articles.
    ///
    /// The rate limit is enforced per caller key before any work happens;
    /// the cooldown is enforced per article and silently skips ids that
    /// were rechecked too recently. Returns a receipt with a job id of the
    /// form `recheck_{yyyymmdd}_{0000}`.
    pub async fn request_recheck(
        &self,
        article_ids: &[String],
        caller: &str,
    ) -> Result<RecheckReceipt, CoreError> {
        if article_ids.is_empty() {
            return Err(CoreError::InvalidArgument(
                "article_ids must be non-empty".into(),
            ));
        }

        let job_id = {
            let mut state = self.state.lock().await;

            let now = Utc::now();
            let minute = now.timestamp() / 60;
            let entry = state.rate.entry(caller.to_string()).or_insert((minute, 0));
            if entry.0 != minute {
                *entry = (minute, 0);
            }
            if entry.1 >= SETTINGS.recheck_rate_per_minute {
                return Err(CoreError::RecheckRateLimited);
            }
            entry.1 += 1;

            let day = now.format("%Y%m%d").to_string();
            if state.job_day != day {
                state.job_day = day;
                state.job_counter = 0;
            }
            state.job_counter += 1;
            format!("recheck_{}_{:04}", state.job_day, state.job_counter)
        };

        let cooldown = ChronoDuration::seconds(SETTINGS.recheck_cooldown_secs);
        let mut enqueued = 0usize;

        for article_id in article_ids {
            let Some(_article) = self.db.get_article(article_id).await? else {
                debug!(target: TARGET_API, "recheck: skipping unknown article {}", article_id);
                continue;
            };

            if let Some(last) = self.db.last_recheck_at(article_id).await? {
                if Utc::now() - last < cooldown {
                    debug!(target: TARGET_API, "recheck: {} still cooling down", article_id);
                    continue;
                }
            }

            // Back to pending; the existing membership stays tentatively in
            // place until the worker writes the new terminal state.
            self.db.set_pending_for_recheck(article_id).await?;
            self.db
                .enqueue_job(JobType::Recheck, article_id, 0)
                .await?;
            self.db.record_recheck(article_id).await?;
            enqueued += 1;
        }

        info!(
            target: TARGET_API,
            "recheck {} accepted: {}/{} articles enqueued", job_id, enqueued, article_ids.len()
        );
        Ok(RecheckReceipt {
            accepted: true,
            job_id,
            enqueued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::article::NewArticle;
    use crate::db::core::test_database;
    use crate::fingerprint::Fingerprinter;
    use crate::types::ClusterStatus;

    #[test]
    fn job_id_format_is_dated_and_counted() {
        let day = Utc::now().format("%Y%m%d").to_string();
        let job_id = format!("recheck_{}_{:04}", day, 7u32);
        assert!(job_id.starts_with("recheck_"));
        assert_eq!(job_id.len(), "recheck_".len() + 8 + 1 + 4);
    }

    async fn seed_article(db: &Database, id: &str) {
        let article = NewArticle {
            article_id: id.to_string(),
            title: "t".to_string(),
            content: "content that is long enough to produce shingles".to_string(),
            publish_time: Utc::now(),
            source: "unit-test".to_string(),
            state: 1,
            top: 0,
            tags: vec![],
            topic: vec![],
        };
        let fp = Fingerprinter::new().fingerprint(&article.content);
        db.upsert_article(&article, &fp).await.unwrap();
    }

    #[tokio::test]
    async fn recheck_enqueues_and_resets_to_pending() {
        let db = test_database().await;
        seed_article(&db, "a1").await;
        db.update_article_assignment("a1", None, ClusterStatus::Unique, None)
            .await
            .unwrap();

        let controller = RecheckController::new(db.clone());
        let receipt = controller
            .request_recheck(&["a1".to_string()], "manual_review")
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.enqueued, 1);
        assert!(receipt.job_id.starts_with("recheck_"));

        let a1 = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(a1.cluster_status, ClusterStatus::Pending);
        assert_eq!(db.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cooldown_skips_recently_rechecked_articles() {
        let db = test_database().await;
        seed_article(&db, "a1").await;
        let controller = RecheckController::new(db.clone());

        let first = controller
            .request_recheck(&["a1".to_string()], "manual_review")
            .await
            .unwrap();
        assert_eq!(first.enqueued, 1);

        // Within the cooldown window the article is silently skipped.
        let second = controller
            .request_recheck(&["a1".to_string()], "manual_review")
            .await
            .unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(db.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_articles_are_skipped_not_errors() {
        let db = test_database().await;
        let controller = RecheckController::new(db.clone());
        let receipt = controller
            .request_recheck(&["ghost".to_string()], "manual_review")
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.enqueued, 0);
    }

    #[tokio::test]
    async fn per_caller_rate_limit_kicks_in() {
        let db = test_database().await;
        let controller = RecheckController::new(db.clone());

        for _ in 0..SETTINGS.recheck_rate_per_minute {
            controller
                .request_recheck(&["ghost".to_string()], "hot-caller")
                .await
                .unwrap();
        }
        let err = controller
            .request_recheck(&["ghost".to_string()], "hot-caller")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RecheckRateLimited));

        // A different caller still has budget.
        assert!(controller
            .request_recheck(&["ghost".to_string()], "other-caller")
            .await
            .is_ok());
    }
}
