use chrono::{Duration as ChronoDuration, Utc};
use sqlx::Row;
use tracing::{debug, error, instrument};

use super::core::Database;
use crate::types::{Job, JobType};
use crate::TARGET_DB;

impl Database {
    /// Enqueue a similarity job. `delay_secs` defers visibility, which the
    /// worker uses for the post-timeout recheck.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn enqueue_job(
        &self,
        job_type: JobType,
        article_id: &str,
        delay_secs: i64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let available_at = now + ChronoDuration::seconds(delay_secs);
        sqlx::query(
            r#"
            INSERT INTO jobs (job_type, article_id, enqueued_at, attempt, available_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
        )
        .bind(job_type.as_str())
        .bind(article_id)
        .bind(now)
        .bind(available_at)
        .execute(self.pool())
        .await?;
        debug!(target: TARGET_DB, "Enqueued {} job for article {}", job_type.as_str(), article_id);
        Ok(())
    }

    /// Claim the oldest visible job. The claim pushes `available_at` past
    /// the visibility window, so a worker that dies mid-job loses the claim
    /// and the job is redelivered (at-least-once semantics).
    #[instrument(target = "db_query", level = "debug", skip(self))]
    pub async fn claim_job(&self, visibility_secs: i64) -> Result<Option<Job>, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, job_type, article_id, enqueued_at, attempt FROM jobs
            WHERE available_at <= ?1
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.get("id");
        let claimed_until = now + ChronoDuration::seconds(visibility_secs);
        let result = sqlx::query(
            "UPDATE jobs SET available_at = ?1, attempt = attempt + 1 WHERE id = ?2 AND available_at <= ?3",
        )
        .bind(claimed_until)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            // Another worker won the claim between SELECT and UPDATE.
            tx.commit().await?;
            return Ok(None);
        }
        tx.commit().await?;

        let job_type: String = row.get("job_type");
        Ok(Some(Job {
            id,
            job_type: JobType::parse(&job_type),
            article_id: row.get("article_id"),
            enqueued_at: row.get("enqueued_at"),
            attempt: row.get::<i64, _>("attempt") + 1,
        }))
    }

    /// Acknowledge (delete) a completed job.
    pub async fn ack_job(&self, job_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Negative-acknowledge: make the job visible again after `delay_secs`.
    pub async fn nack_job(&self, job_id: i64, delay_secs: i64) -> Result<(), sqlx::Error> {
        let available_at = Utc::now() + ChronoDuration::seconds(delay_secs);
        sqlx::query("UPDATE jobs SET available_at = ?1 WHERE id = ?2")
            .bind(available_at)
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Move a job to the dead-letter table with a reason. The payload keeps
    /// the queue message's JSON wire shape for later inspection.
    #[instrument(target = "db_query", level = "info", skip(self, job))]
    pub async fn dead_letter_job(&self, job: &Job, reason: &str) -> Result<(), sqlx::Error> {
        let payload =
            serde_json::to_string(job).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        sqlx::query("INSERT INTO dead_letter (payload, reason, failed_at) VALUES (?1, ?2, ?3)")
            .bind(&payload)
            .bind(reason)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        error!(target: TARGET_DB, "Dead-lettered job {} for article {}: {}", job.id, job.article_id, reason);
        Ok(())
    }

    /// Number of dead-lettered jobs, reported by the health probe.
    pub async fn dead_letter_depth(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letter")
            .fetch_one(self.pool())
            .await
    }

    /// Last recheck time for an article, if any.
    pub async fn last_recheck_at(
        &self,
        article_id: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar::<_, chrono::DateTime<Utc>>(
            "SELECT last_recheck_at FROM recheck_log WHERE article_id = ?",
        )
        .bind(article_id)
        .fetch_optional(self.pool())
        .await
    }

    /// Record that a recheck was accepted for an article.
    pub async fn record_recheck(&self, article_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO recheck_log (article_id, last_recheck_at) VALUES (?1, ?2)
            ON CONFLICT(article_id) DO UPDATE SET last_recheck_at = excluded.last_recheck_at
            "#,
        )
        .bind(article_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
