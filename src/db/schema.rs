use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                article_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                publish_time TEXT NOT NULL,
                source TEXT NOT NULL,
                state INTEGER NOT NULL,
                top INTEGER NOT NULL,
                tags TEXT NOT NULL,
                topic TEXT NOT NULL,
                tag_ids TEXT NOT NULL,
                topic_ids TEXT NOT NULL,
                cluster_id TEXT,
                cluster_status TEXT NOT NULL DEFAULT 'pending',
                similarity_score REAL,
                simhash INTEGER NOT NULL,
                simhash_c0 INTEGER NOT NULL,
                simhash_c1 INTEGER NOT NULL,
                simhash_c2 INTEGER NOT NULL,
                simhash_c3 INTEGER NOT NULL,
                minhash TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_cluster_id ON articles (cluster_id);
            CREATE INDEX IF NOT EXISTS idx_articles_cluster_status ON articles (cluster_status);
            CREATE INDEX IF NOT EXISTS idx_articles_publish_time ON articles (publish_time);
            CREATE INDEX IF NOT EXISTS idx_articles_source ON articles (source);
            CREATE INDEX IF NOT EXISTS idx_articles_state_top ON articles (state, top);
            -- 16-bit chunk indices back the pigeonhole lookup for Hamming <= 3.
            CREATE INDEX IF NOT EXISTS idx_articles_simhash_c0 ON articles (simhash_c0);
            CREATE INDEX IF NOT EXISTS idx_articles_simhash_c1 ON articles (simhash_c1);
            CREATE INDEX IF NOT EXISTS idx_articles_simhash_c2 ON articles (simhash_c2);
            CREATE INDEX IF NOT EXISTS idx_articles_simhash_c3 ON articles (simhash_c3);

            -- One row per LSH band; the band index is mixed into band_hash.
            CREATE TABLE IF NOT EXISTS article_bands (
                article_id TEXT NOT NULL,
                band_no INTEGER NOT NULL,
                band_hash INTEGER NOT NULL,
                PRIMARY KEY (article_id, band_no),
                FOREIGN KEY (article_id) REFERENCES articles (article_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_article_bands_hash ON article_bands (band_hash);

            CREATE TABLE IF NOT EXISTS clusters (
                cluster_id TEXT PRIMARY KEY,
                article_ids TEXT NOT NULL,
                size INTEGER NOT NULL,
                representative_article_id TEXT NOT NULL,
                representative_avg_jaccard REAL NOT NULL DEFAULT 0,
                centroid_minhash TEXT NOT NULL,
                top_terms TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_last_updated ON clusters (last_updated);

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                article_id TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                available_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_available_at ON jobs (available_at);

            CREATE TABLE IF NOT EXISTS dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recheck_log (
                article_id TEXT PRIMARY KEY,
                last_recheck_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Schema initialized");
        Ok(())
    }
}
