use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::Database;
use crate::types::{Cluster, TopTerm};
use crate::TARGET_DB;

/// Outcome of a version-checked cluster write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterWrite {
    Applied,
    /// The stored version no longer matches `expected_version`; the caller
    /// must re-read and recompute before retrying.
    VersionConflict,
}

fn cluster_from_row(row: &SqliteRow) -> Result<Cluster, sqlx::Error> {
    let article_ids: Vec<String> =
        serde_json::from_str(row.get::<String, _>("article_ids").as_str()).unwrap_or_default();
    let centroid_minhash: Vec<u64> =
        serde_json::from_str(row.get::<String, _>("centroid_minhash").as_str()).unwrap_or_default();
    let top_terms: Vec<TopTerm> =
        serde_json::from_str(row.get::<String, _>("top_terms").as_str()).unwrap_or_default();
    Ok(Cluster {
        cluster_id: row.get("cluster_id"),
        article_ids,
        size: row.get("size"),
        representative_article_id: row.get("representative_article_id"),
        representative_avg_jaccard: row.get("representative_avg_jaccard"),
        centroid_minhash,
        top_terms,
        last_updated: row.get("last_updated"),
        created_at: row.get("created_at"),
        version: row.get("version"),
    })
}

impl Database {
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM clusters WHERE cluster_id = ?")
            .bind(cluster_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    /// Insert a brand-new cluster document at version 1. Fails if the id
    /// already exists, which a caller treats like a version conflict.
    #[instrument(target = "db_query", level = "info", skip(self, cluster))]
    pub async fn create_cluster(&self, cluster: &Cluster) -> Result<ClusterWrite, sqlx::Error> {
        let article_ids = serde_json::to_string(&cluster.article_ids)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let centroid = serde_json::to_string(&cluster.centroid_minhash)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let top_terms = serde_json::to_string(&cluster.top_terms)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO clusters (
                cluster_id, article_ids, size, representative_article_id,
                representative_avg_jaccard, centroid_minhash, top_terms,
                version, created_at, last_updated
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)
            "#,
        )
        .bind(&cluster.cluster_id)
        .bind(&article_ids)
        .bind(cluster.size)
        .bind(&cluster.representative_article_id)
        .bind(cluster.representative_avg_jaccard)
        .bind(&centroid)
        .bind(&top_terms)
        .bind(cluster.created_at)
        .bind(cluster.last_updated)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            debug!(target: TARGET_DB, "Created cluster {} with {} members", cluster.cluster_id, cluster.size);
            Ok(ClusterWrite::Applied)
        } else {
            Ok(ClusterWrite::VersionConflict)
        }
    }

    /// Replace a cluster's membership-derived fields, guarded by
    /// `expected_version`. Used for both appends and removals; the caller
    /// supplies the fully recomputed document.
    #[instrument(target = "db_query", level = "info", skip(self, article_ids, centroid_minhash, top_terms))]
    pub async fn update_cluster_members(
        &self,
        cluster_id: &str,
        article_ids: &[String],
        representative_article_id: &str,
        representative_avg_jaccard: f64,
        centroid_minhash: &[u64],
        top_terms: &[TopTerm],
        last_updated: DateTime<Utc>,
        expected_version: i64,
    ) -> Result<ClusterWrite, sqlx::Error> {
        let ids_json =
            serde_json::to_string(article_ids).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let centroid_json = serde_json::to_string(centroid_minhash)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let terms_json =
            serde_json::to_string(top_terms).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET article_ids = ?1, size = ?2, representative_article_id = ?3,
                representative_avg_jaccard = ?4, centroid_minhash = ?5,
                top_terms = ?6, last_updated = ?7, version = version + 1
            WHERE cluster_id = ?8 AND version = ?9
            "#,
        )
        .bind(&ids_json)
        .bind(article_ids.len() as i64)
        .bind(representative_article_id)
        .bind(representative_avg_jaccard)
        .bind(&centroid_json)
        .bind(&terms_json)
        .bind(last_updated)
        .bind(cluster_id)
        .bind(expected_version)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(ClusterWrite::Applied)
        } else {
            debug!(target: TARGET_DB, "Version conflict updating cluster {} at v{}", cluster_id, expected_version);
            Ok(ClusterWrite::VersionConflict)
        }
    }

    /// Delete a cluster document, guarded by `expected_version`. Only legal
    /// when the membership has drained to zero.
    pub async fn delete_cluster(
        &self,
        cluster_id: &str,
        expected_version: i64,
    ) -> Result<ClusterWrite, sqlx::Error> {
        let result = sqlx::query("DELETE FROM clusters WHERE cluster_id = ?1 AND version = ?2")
            .bind(cluster_id)
            .bind(expected_version)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 1 {
            debug!(target: TARGET_DB, "Deleted empty cluster {}", cluster_id);
            Ok(ClusterWrite::Applied)
        } else {
            Ok(ClusterWrite::VersionConflict)
        }
    }

    /// Queue depth, exposed as the backpressure signal on the health probe.
    pub async fn queue_depth(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs")
            .fetch_one(self.pool())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::core::test_database;

    fn sample_cluster(id: &str, members: &[&str]) -> Cluster {
        let now = Utc::now();
        Cluster {
            cluster_id: id.to_string(),
            article_ids: members.iter().map(|m| m.to_string()).collect(),
            size: members.len() as i64,
            representative_article_id: members[0].to_string(),
            representative_avg_jaccard: 0.9,
            centroid_minhash: vec![5; 128],
            top_terms: vec![],
            last_updated: now,
            created_at: now,
            version: 1,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let db = test_database().await;
        let cluster = sample_cluster("cluster_a1", &["a1", "a2"]);
        assert_eq!(
            db.create_cluster(&cluster).await.unwrap(),
            ClusterWrite::Applied
        );

        let stored = db.get_cluster("cluster_a1").await.unwrap().unwrap();
        assert_eq!(stored.article_ids, vec!["a1", "a2"]);
        assert_eq!(stored.size, 2);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.centroid_minhash.len(), 128);
    }

    #[tokio::test]
    async fn duplicate_create_reports_conflict() {
        let db = test_database().await;
        let cluster = sample_cluster("cluster_a1", &["a1"]);
        db.create_cluster(&cluster).await.unwrap();
        assert_eq!(
            db.create_cluster(&cluster).await.unwrap(),
            ClusterWrite::VersionConflict
        );
    }

    #[tokio::test]
    async fn stale_version_update_is_rejected() {
        let db = test_database().await;
        let cluster = sample_cluster("cluster_a1", &["a1"]);
        db.create_cluster(&cluster).await.unwrap();

        let members = vec!["a1".to_string(), "a2".to_string()];
        // Version 1 applies and bumps to 2.
        let write = db
            .update_cluster_members("cluster_a1", &members, "a1", 0.9, &[3; 128], &[], Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(write, ClusterWrite::Applied);

        // Replaying against the stale version must fail.
        let write = db
            .update_cluster_members("cluster_a1", &members, "a1", 0.9, &[3; 128], &[], Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(write, ClusterWrite::VersionConflict);

        let stored = db.get_cluster("cluster_a1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.size, 2);
    }

    #[tokio::test]
    async fn delete_requires_matching_version() {
        let db = test_database().await;
        let cluster = sample_cluster("cluster_a1", &["a1"]);
        db.create_cluster(&cluster).await.unwrap();

        assert_eq!(
            db.delete_cluster("cluster_a1", 5).await.unwrap(),
            ClusterWrite::VersionConflict
        );
        assert_eq!(
            db.delete_cluster("cluster_a1", 1).await.unwrap(),
            ClusterWrite::Applied
        );
        assert!(db.get_cluster("cluster_a1").await.unwrap().is_none());
    }
}
