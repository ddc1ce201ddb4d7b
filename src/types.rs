use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Article `state` values as submitted by the ingestion API.
pub const STATE_INVISIBLE: i64 = 0;
pub const STATE_VISIBLE: i64 = 1;
pub const STATE_DELETED: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Pending,
    Matched,
    Unique,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Matched => "matched",
            ClusterStatus::Unique => "unique",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "matched" => ClusterStatus::Matched,
            "unique" => ClusterStatus::Unique,
            _ => ClusterStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleTag {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleTopic {
    pub id: String,
    pub name: String,
}

/// An article document as stored in the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub article_id: String,
    pub title: String,
    #[serde(skip_serializing)]
    pub content: String,
    pub publish_time: DateTime<Utc>,
    pub source: String,
    pub state: i64,
    pub top: i64,
    pub tags: Vec<ArticleTag>,
    pub topic: Vec<ArticleTopic>,
    pub cluster_id: Option<String>,
    pub cluster_status: ClusterStatus,
    pub similarity_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub version: i64,
}

/// The locality-sensitive fingerprint stored next to an article.
#[derive(Debug, Clone)]
pub struct StoredFingerprint {
    pub simhash: u64,
    pub minhash: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopTerm {
    pub term: String,
    pub weight: f64,
}

/// A cluster document. `version` backs the optimistic concurrency
/// contract: every mutating write checks it and bumps it by one.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub article_ids: Vec<String>,
    pub size: i64,
    pub representative_article_id: String,
    #[serde(skip_serializing)]
    pub representative_avg_jaccard: f64,
    #[serde(skip_serializing)]
    pub centroid_minhash: Vec<u64>,
    pub top_terms: Vec<TopTerm>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Ingest,
    Recheck,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ingest => "ingest",
            JobType::Recheck => "recheck",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "recheck" => JobType::Recheck,
            _ => JobType::Ingest,
        }
    }
}

/// A claimed queue message. Redelivered at least once if the worker dies
/// before acknowledging, so every consumer must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(skip)]
    pub id: i64,
    pub job_type: JobType,
    pub article_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: i64,
}
