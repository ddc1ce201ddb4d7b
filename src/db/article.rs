use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument};

use super::core::{Database, DbLockErrorExt};
use crate::fingerprint::{self, ArticleFingerprint};
use crate::types::{Article, ArticleTag, ArticleTopic, ClusterStatus, StoredFingerprint};
use crate::TARGET_DB;

/// Input payload for an article upsert, as received from the API.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub article_id: String,
    pub title: String,
    pub content: String,
    pub publish_time: DateTime<Utc>,
    pub source: String,
    pub state: i64,
    pub top: i64,
    pub tags: Vec<ArticleTag>,
    pub topic: Vec<ArticleTopic>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// First sighting; the article was written with `pending` status.
    Inserted,
    /// Metadata refreshed on an existing article. Carries the stored
    /// cluster id so the caller can react to a deletion transition.
    Updated { cluster_id: Option<String> },
    /// The id exists with different content; nothing was written.
    ContentMismatch,
}

/// Candidate row surfaced by the fingerprint lookups.
#[derive(Debug, Clone)]
pub struct CandidateMeta {
    pub article_id: String,
    pub cluster_id: Option<String>,
    pub state: i64,
    pub simhash: u64,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ArticleSearchFilter {
    pub page: i64,
    pub page_size: i64,
    pub sort: Option<String>,
    pub state: Option<i64>,
    pub top: Option<i64>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tag_id: Option<String>,
    pub topic_ids: Vec<String>,
}

fn article_from_row(row: &SqliteRow) -> Result<Article, sqlx::Error> {
    let tags: Vec<ArticleTag> =
        serde_json::from_str(row.get::<String, _>("tags").as_str()).unwrap_or_default();
    let topic: Vec<ArticleTopic> =
        serde_json::from_str(row.get::<String, _>("topic").as_str()).unwrap_or_default();
    let status: String = row.get("cluster_status");
    Ok(Article {
        article_id: row.get("article_id"),
        title: row.get("title"),
        content: row.get("content"),
        publish_time: row.get("publish_time"),
        source: row.get("source"),
        state: row.get("state"),
        top: row.get("top"),
        tags,
        topic,
        cluster_id: row.get("cluster_id"),
        cluster_status: ClusterStatus::parse(&status),
        similarity_score: row.get("similarity_score"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    })
}

impl Database {
    /// Idempotent upsert keyed on `article_id`.
    ///
    /// A new id inserts the full document plus its band rows with
    /// `pending` status. A known id with identical content refreshes the
    /// mutable metadata but never touches the terminal cluster state. A
    /// known id with different content writes nothing.
    #[instrument(target = "db_query", level = "info", skip(self, article, fp))]
    pub async fn upsert_article(
        &self,
        article: &NewArticle,
        fp: &ArticleFingerprint,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let mut backoff = 100; // initial delay in milliseconds
        let max_retries = 5;

        for attempt in 1..=max_retries {
            match self.upsert_article_once(article, fp).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_database_lock_error() => {
                    info!(target: TARGET_DB, "Database is locked, waiting {}ms before retrying attempt {}/{}: {}", backoff, attempt, max_retries, article.article_id);
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = backoff.saturating_mul(2);
                    if attempt == max_retries {
                        let random_jitter = rand::rng().random_range(0..200);
                        backoff += random_jitter;
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
                Err(err) => {
                    error!(target: TARGET_DB, "Failed to upsert article {}: {}", article.article_id, err);
                    return Err(err);
                }
            }
        }

        Err(sqlx::Error::Protocol(
            "Maximum retries exceeded for upserting article".into(),
        ))
    }

    async fn upsert_article_once(
        &self,
        article: &NewArticle,
        fp: &ArticleFingerprint,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query("SELECT content, cluster_id FROM articles WHERE article_id = ?")
            .bind(&article.article_id)
            .fetch_optional(&mut *tx)
            .await?;

        let tags_json = serde_json::to_string(&article.tags)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let topic_json = serde_json::to_string(&article.topic)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let tag_ids: Vec<String> = article.tags.iter().map(|t| t.id.to_string()).collect();
        let topic_ids: Vec<String> = article.topic.iter().map(|t| t.id.clone()).collect();
        let tag_ids_json =
            serde_json::to_string(&tag_ids).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let topic_ids_json =
            serde_json::to_string(&topic_ids).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        if let Some(row) = existing {
            let stored_content: String = row.get("content");
            if stored_content != article.content {
                debug!(target: TARGET_DB, "Rejecting content change on upsert: {}", article.article_id);
                return Ok(UpsertOutcome::ContentMismatch);
            }

            sqlx::query(
                r#"
                UPDATE articles
                SET title = ?1, publish_time = ?2, source = ?3, state = ?4, top = ?5,
                    tags = ?6, topic = ?7, tag_ids = ?8, topic_ids = ?9,
                    updated_at = ?10, version = version + 1
                WHERE article_id = ?11
                "#,
            )
            .bind(&article.title)
            .bind(article.publish_time)
            .bind(&article.source)
            .bind(article.state)
            .bind(article.top)
            .bind(&tags_json)
            .bind(&topic_json)
            .bind(&tag_ids_json)
            .bind(&topic_ids_json)
            .bind(now)
            .bind(&article.article_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            debug!(target: TARGET_DB, "Article metadata refreshed: {}", article.article_id);
            return Ok(UpsertOutcome::Updated {
                cluster_id: row.get("cluster_id"),
            });
        }

        let minhash_json = serde_json::to_string(&fp.minhash)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let chunks = fingerprint::simhash_chunks(fp.simhash);

        sqlx::query(
            r#"
            INSERT INTO articles (
                article_id, title, content, publish_time, source, state, top,
                tags, topic, tag_ids, topic_ids,
                cluster_id, cluster_status, similarity_score,
                simhash, simhash_c0, simhash_c1, simhash_c2, simhash_c3,
                minhash, version, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                    NULL, 'pending', NULL, ?12, ?13, ?14, ?15, ?16, ?17, 1, ?18, ?18)
            "#,
        )
        .bind(&article.article_id)
        .bind(&article.title)
        .bind(&article.content)
        .bind(article.publish_time)
        .bind(&article.source)
        .bind(article.state)
        .bind(article.top)
        .bind(&tags_json)
        .bind(&topic_json)
        .bind(&tag_ids_json)
        .bind(&topic_ids_json)
        .bind(fp.simhash as i64)
        .bind(chunks[0] as i64)
        .bind(chunks[1] as i64)
        .bind(chunks[2] as i64)
        .bind(chunks[3] as i64)
        .bind(&minhash_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (band_no, band_hash) in fp.band_hashes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO article_bands (article_id, band_no, band_hash) VALUES (?1, ?2, ?3)",
            )
            .bind(&article.article_id)
            .bind(band_no as i64)
            .bind(*band_hash as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(target: TARGET_DB, "Article inserted: {}", article.article_id);
        Ok(UpsertOutcome::Inserted)
    }

    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn get_article(&self, article_id: &str) -> Result<Option<Article>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM articles WHERE article_id = ?")
            .bind(article_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    pub async fn get_article_with_fingerprint(
        &self,
        article_id: &str,
    ) -> Result<Option<(Article, StoredFingerprint)>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM articles WHERE article_id = ?")
            .bind(article_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        let article = article_from_row(&row)?;
        let minhash: Vec<u64> =
            serde_json::from_str(row.get::<String, _>("minhash").as_str()).unwrap_or_default();
        let fp = StoredFingerprint {
            simhash: row.get::<i64, _>("simhash") as u64,
            minhash,
        };
        Ok(Some((article, fp)))
    }

    /// Fingerprintable text of an article, title and content concatenated
    /// the same way the ingest path builds it. Used for on-demand shingle
    /// reconstruction in the verifier.
    pub async fn get_article_text(
        &self,
        article_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT title, content FROM articles WHERE article_id = ?")
            .bind(article_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|row| {
            format!(
                "{} {}",
                row.get::<String, _>("title"),
                row.get::<String, _>("content")
            )
        }))
    }

    /// Article ids whose stored SimHash is within `max_hamming` of `simhash`.
    ///
    /// The index narrows on 16-bit chunk equality (pigeonhole guarantees a
    /// shared chunk at distance <= 3); the exact distance check runs here.
    #[instrument(target = "db_query", level = "debug", skip(self))]
    pub async fn find_by_simhash(
        &self,
        simhash: u64,
        max_hamming: u32,
        limit: i64,
    ) -> Result<Vec<(String, u32)>, sqlx::Error> {
        let chunks = fingerprint::simhash_chunks(simhash);
        let rows = sqlx::query(
            r#"
            SELECT article_id, simhash FROM articles
            WHERE simhash_c0 = ?1 OR simhash_c1 = ?2 OR simhash_c2 = ?3 OR simhash_c3 = ?4
            LIMIT ?5
            "#,
        )
        .bind(chunks[0] as i64)
        .bind(chunks[1] as i64)
        .bind(chunks[2] as i64)
        .bind(chunks[3] as i64)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut hits = Vec::new();
        for row in rows {
            let candidate = row.get::<i64, _>("simhash") as u64;
            let distance = fingerprint::hamming(simhash, candidate);
            if distance <= max_hamming {
                hits.push((row.get("article_id"), distance));
            }
        }
        Ok(hits)
    }

    /// Article ids sharing at least one LSH band hash, with the number of
    /// matching bands per article, most collisions first.
    #[instrument(target = "db_query", level = "debug", skip(self, bands))]
    pub async fn find_by_lsh_bands(
        &self,
        bands: &[u64],
        limit: i64,
    ) -> Result<Vec<(String, i64)>, sqlx::Error> {
        if bands.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT article_id, COUNT(*) AS matching_bands FROM article_bands WHERE band_hash IN (",
        );
        let mut separated = builder.separated(", ");
        for band in bands {
            separated.push_bind(*band as i64);
        }
        separated.push_unseparated(") ");
        builder.push("GROUP BY article_id ORDER BY matching_bands DESC, article_id ASC LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("article_id"), row.get("matching_bands")))
            .collect())
    }

    /// Cluster membership, state, and SimHash for a set of candidate ids.
    pub async fn candidate_meta(
        &self,
        article_ids: &[String],
    ) -> Result<Vec<CandidateMeta>, sqlx::Error> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT article_id, cluster_id, state, simhash, version FROM articles WHERE article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in article_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| CandidateMeta {
                article_id: row.get("article_id"),
                cluster_id: row.get("cluster_id"),
                state: row.get("state"),
                simhash: row.get::<i64, _>("simhash") as u64,
                version: row.get("version"),
            })
            .collect())
    }

    /// Write an article's terminal assignment unconditionally. Reserved for
    /// flows that own the article outright (deletion, removal cleanup, test
    /// seeding); in-flight pipeline writes go through [`finalize_article`].
    ///
    /// [`finalize_article`]: Database::finalize_article
    pub async fn update_article_assignment(
        &self,
        article_id: &str,
        cluster_id: Option<&str>,
        status: ClusterStatus,
        score: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE articles
            SET cluster_id = ?1, cluster_status = ?2, similarity_score = ?3,
                updated_at = ?4, version = version + 1
            WHERE article_id = ?5
            "#,
        )
        .bind(cluster_id)
        .bind(status.as_str())
        .bind(score)
        .bind(Utc::now())
        .bind(article_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal-state write for an article that is still `pending`.
    ///
    /// A concurrent claim into a cluster flips the article to `matched`
    /// first and must win; this write then applies zero rows and the caller
    /// accepts the stored state instead. Re-applying the same matched
    /// cluster (redelivered job) still succeeds.
    pub async fn finalize_article(
        &self,
        article_id: &str,
        cluster_id: Option<&str>,
        status: ClusterStatus,
        score: Option<f64>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET cluster_id = ?1, cluster_status = ?2, similarity_score = ?3,
                updated_at = ?4, version = version + 1
            WHERE article_id = ?5
              AND (cluster_status = 'pending' OR (?1 IS NOT NULL AND cluster_id = ?1))
            "#,
        )
        .bind(cluster_id)
        .bind(status.as_str())
        .bind(score)
        .bind(Utc::now())
        .bind(article_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Claim a not-yet-clustered article for `cluster_id`. Succeeds only if
    /// the article is still unclustered at the expected version, which is
    /// what keeps one article from landing in two clusters.
    pub async fn try_claim_for_cluster(
        &self,
        article_id: &str,
        cluster_id: &str,
        score: f64,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET cluster_id = ?1, cluster_status = 'matched', similarity_score = ?2,
                updated_at = ?3, version = version + 1
            WHERE article_id = ?4 AND cluster_id IS NULL AND version = ?5
            "#,
        )
        .bind(cluster_id)
        .bind(score)
        .bind(Utc::now())
        .bind(article_id)
        .bind(expected_version)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Reset an article to `pending` for a recheck. The previous cluster
    /// membership is retained until the new terminal state is written.
    pub async fn set_pending_for_recheck(&self, article_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE articles
            SET cluster_status = 'pending', updated_at = ?1, version = version + 1
            WHERE article_id = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(article_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Replace an article's stored fingerprint (recheck after content-bearing
    /// reprocessing). Rewrites the band rows in the same transaction.
    pub async fn update_fingerprint(
        &self,
        article_id: &str,
        fp: &ArticleFingerprint,
    ) -> Result<(), sqlx::Error> {
        let minhash_json = serde_json::to_string(&fp.minhash)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let chunks = fingerprint::simhash_chunks(fp.simhash);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            UPDATE articles
            SET simhash = ?1, simhash_c0 = ?2, simhash_c1 = ?3, simhash_c2 = ?4,
                simhash_c3 = ?5, minhash = ?6, updated_at = ?7, version = version + 1
            WHERE article_id = ?8
            "#,
        )
        .bind(fp.simhash as i64)
        .bind(chunks[0] as i64)
        .bind(chunks[1] as i64)
        .bind(chunks[2] as i64)
        .bind(chunks[3] as i64)
        .bind(&minhash_json)
        .bind(Utc::now())
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM article_bands WHERE article_id = ?")
            .bind(article_id)
            .execute(&mut *tx)
            .await?;
        for (band_no, band_hash) in fp.band_hashes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO article_bands (article_id, band_no, band_hash) VALUES (?1, ?2, ?3)",
            )
            .bind(article_id)
            .bind(band_no as i64)
            .bind(*band_hash as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All articles assigned to a cluster, newest first.
    pub async fn articles_by_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<Article>, sqlx::Error> {
        let rows =
            sqlx::query("SELECT * FROM articles WHERE cluster_id = ? ORDER BY publish_time DESC")
                .bind(cluster_id)
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(article_from_row).collect()
    }

    /// MinHash signatures plus ordering metadata for cluster members, used
    /// when a centroid or representative must be rebuilt after a removal.
    pub async fn member_signatures(
        &self,
        article_ids: &[String],
    ) -> Result<Vec<(String, Vec<u64>, DateTime<Utc>, Option<f64>)>, sqlx::Error> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT article_id, minhash, publish_time, similarity_score FROM articles WHERE article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in article_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let minhash: Vec<u64> =
                    serde_json::from_str(row.get::<String, _>("minhash").as_str())
                        .unwrap_or_default();
                (
                    row.get("article_id"),
                    minhash,
                    row.get("publish_time"),
                    row.get("similarity_score"),
                )
            })
            .collect())
    }

    /// Metadata-filtered article search backing the query API.
    #[instrument(target = "db_query", level = "debug", skip(self, filter))]
    pub async fn search_articles(
        &self,
        filter: &ArticleSearchFilter,
    ) -> Result<(Vec<Article>, i64), sqlx::Error> {
        fn apply_filters<'a>(
            builder: &mut QueryBuilder<'a, sqlx::Sqlite>,
            filter: &'a ArticleSearchFilter,
        ) {
            if let Some(state) = filter.state {
                builder.push(" AND state = ").push_bind(state);
            }
            if let Some(top) = filter.top {
                builder.push(" AND top = ").push_bind(top);
            }
            if let Some(title) = &filter.title {
                builder
                    .push(" AND title LIKE ")
                    .push_bind(format!("%{}%", title));
            }
            if let Some(source) = &filter.source {
                builder.push(" AND source = ").push_bind(source);
            }
            if let Some(start) = filter.start_time {
                builder.push(" AND publish_time >= ").push_bind(start);
            }
            if let Some(end) = filter.end_time {
                builder.push(" AND publish_time <= ").push_bind(end);
            }
            if let Some(tag_id) = &filter.tag_id {
                builder
                    .push(" AND tag_ids LIKE ")
                    .push_bind(format!("%\"{}\"%", tag_id));
            }
            for topic_id in &filter.topic_ids {
                builder
                    .push(" AND topic_ids LIKE ")
                    .push_bind(format!("%\"{}\"%", topic_id));
            }
        }

        let mut count_builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM articles WHERE 1 = 1");
        apply_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(self.pool())
            .await?
            .get("total");

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM articles WHERE 1 = 1");
        apply_filters(&mut builder, filter);

        // Sort fields are whitelisted; anything unknown falls back to the
        // default ordering.
        let (sort_field, sort_dir) = match filter.sort.as_deref() {
            Some("publish_time:asc") => ("publish_time", "ASC"),
            Some("created_at:desc") => ("created_at", "DESC"),
            Some("created_at:asc") => ("created_at", "ASC"),
            Some("updated_at:desc") => ("updated_at", "DESC"),
            Some("updated_at:asc") => ("updated_at", "ASC"),
            _ => ("publish_time", "DESC"),
        };
        builder.push(format!(" ORDER BY {} {}", sort_field, sort_dir));

        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 100);
        builder.push(" LIMIT ").push_bind(page_size);
        builder.push(" OFFSET ").push_bind((page - 1) * page_size);

        let rows = builder.build().fetch_all(self.pool()).await?;
        let articles = rows
            .iter()
            .map(article_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((articles, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::core::test_database;
    use crate::fingerprint::Fingerprinter;

    pub(crate) fn sample_article(id: &str, content: &str) -> NewArticle {
        NewArticle {
            article_id: id.to_string(),
            title: format!("title of {id}"),
            content: content.to_string(),
            publish_time: Utc::now(),
            source: "unit-test".to_string(),
            state: 1,
            top: 0,
            tags: vec![ArticleTag {
                id: 7,
                name: "economy".to_string(),
            }],
            topic: vec![],
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_article_id() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let article = sample_article("a1", "some article content long enough to shingle");
        let fp = fper.fingerprint(&article.content);

        assert_eq!(
            db.upsert_article(&article, &fp).await.unwrap(),
            UpsertOutcome::Inserted
        );
        // Same content: metadata refresh, no state reset.
        assert!(matches!(
            db.upsert_article(&article, &fp).await.unwrap(),
            UpsertOutcome::Updated { .. }
        ));

        let stored = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(stored.cluster_status, crate::types::ClusterStatus::Pending);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn upsert_rejects_changed_content() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let article = sample_article("a1", "original content for the article body");
        let fp = fper.fingerprint(&article.content);
        db.upsert_article(&article, &fp).await.unwrap();

        let mut changed = sample_article("a1", "completely different content after the fact");
        changed.title = article.title.clone();
        let fp2 = fper.fingerprint(&changed.content);
        assert_eq!(
            db.upsert_article(&changed, &fp2).await.unwrap(),
            UpsertOutcome::ContentMismatch
        );
    }

    #[tokio::test]
    async fn simhash_lookup_finds_near_matches() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let content = "the quick brown fox jumps over the lazy dog again and again";
        let article = sample_article("a1", content);
        let fp = fper.fingerprint(content);
        db.upsert_article(&article, &fp).await.unwrap();

        let hits = db.find_by_simhash(fp.simhash, 3, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], ("a1".to_string(), 0));

        // A flipped high bit is still within distance 3.
        let near = fp.simhash ^ (1u64 << 63);
        let hits = db.find_by_simhash(near, 3, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 1);
    }

    #[tokio::test]
    async fn band_lookup_counts_matching_bands() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let content = "shared text body used for locality sensitive hashing checks";
        let article = sample_article("a1", content);
        let fp = fper.fingerprint(content);
        db.upsert_article(&article, &fp).await.unwrap();

        let hits = db.find_by_lsh_bands(&fp.band_hashes, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a1");
        assert_eq!(hits[0].1, crate::fingerprint::LSH_BANDS as i64);

        // Disjoint hashes collide with nothing.
        let none = db.find_by_lsh_bands(&[1, 2, 3], 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn claim_requires_unclustered_article_at_expected_version() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let article = sample_article("a1", "content that is long enough for shingles");
        let fp = fper.fingerprint(&article.content);
        db.upsert_article(&article, &fp).await.unwrap();

        // Stale version loses.
        assert!(!db.try_claim_for_cluster("a1", "cluster_x", 0.9, 99).await.unwrap());
        // Correct version wins once.
        assert!(db.try_claim_for_cluster("a1", "cluster_x", 0.9, 1).await.unwrap());
        // Already clustered: no second winner.
        assert!(!db.try_claim_for_cluster("a1", "cluster_y", 0.9, 2).await.unwrap());

        let stored = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(stored.cluster_id.as_deref(), Some("cluster_x"));
        assert_eq!(stored.similarity_score, Some(0.9));
    }

    #[tokio::test]
    async fn finalize_yields_to_a_concurrent_claim() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let article = sample_article("a1", "pending article content awaiting assignment");
        db.upsert_article(&article, &fper.fingerprint(&article.content))
            .await
            .unwrap();

        // Another worker claims the article while its own job is in flight.
        assert!(db.try_claim_for_cluster("a1", "cluster_x", 0.9, 1).await.unwrap());

        // The late unique write loses.
        assert!(!db
            .finalize_article("a1", None, crate::types::ClusterStatus::Unique, None)
            .await
            .unwrap());
        let stored = db.get_article("a1").await.unwrap().unwrap();
        assert_eq!(stored.cluster_id.as_deref(), Some("cluster_x"));

        // Re-applying the same cluster (redelivery) still succeeds...
        assert!(db
            .finalize_article(
                "a1",
                Some("cluster_x"),
                crate::types::ClusterStatus::Matched,
                Some(0.9)
            )
            .await
            .unwrap());
        // ...but a different cluster does not.
        assert!(!db
            .finalize_article(
                "a1",
                Some("cluster_y"),
                crate::types::ClusterStatus::Matched,
                Some(0.95)
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn search_filters_by_state_and_tag() {
        let db = test_database().await;
        let fper = Fingerprinter::new();
        let mut visible = sample_article("a1", "first article body content for search");
        visible.state = 1;
        let mut hidden = sample_article("a2", "second article body content for search");
        hidden.state = 0;
        hidden.tags = vec![];
        db.upsert_article(&visible, &fper.fingerprint(&visible.content))
            .await
            .unwrap();
        db.upsert_article(&hidden, &fper.fingerprint(&hidden.content))
            .await
            .unwrap();

        let filter = ArticleSearchFilter {
            page: 1,
            page_size: 20,
            state: Some(1),
            ..Default::default()
        };
        let (articles, total) = db.search_articles(&filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(articles[0].article_id, "a1");

        let filter = ArticleSearchFilter {
            page: 1,
            page_size: 20,
            tag_id: Some("7".to_string()),
            ..Default::default()
        };
        let (articles, _) = db.search_articles(&filter).await.unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].article_id, "a1");
    }
}
