//! HTTP query and ingestion surface.
//!
//! Every response carries a `trace_id`; every error uses the envelope
//! `{"error":{"code","message"},"trace_id"}`. The API layer never touches
//! cluster state directly: submissions go through the gateway and the
//! queue, and workers do the rest.

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clustering::remove_from_cluster;
use crate::db::article::{ArticleSearchFilter, NewArticle, UpsertOutcome};
use crate::db::Database;
use crate::error::CoreError;
use crate::fingerprint::Fingerprinter;
use crate::recheck::RecheckController;
use crate::settings::SETTINGS;
use crate::types::{
    Article, ArticleTag, ArticleTopic, ClusterStatus, JobType, STATE_DELETED, STATE_INVISIBLE,
};
use crate::verifier::VERIFIER_TRUNCATED_TOTAL;
use crate::TARGET_API;

pub const MAX_CONTENT_CHARS: usize = 200_000;
pub const MAX_RECHECK_BATCH: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
    pub recheck: Arc<RecheckController>,
    pub fingerprinter: Arc<Fingerprinter>,
}

/// Main API loop, setting up and running the axum server.
pub async fn api_loop(state: ApiState) -> Result<()> {
    let app = Router::new()
        .route("/api/v1/articles", post(submit_article))
        .route("/api/v1/articles/recheck", post(recheck_articles))
        .route("/api/v1/articles/{id}", get(get_article))
        .route("/api/v1/articles/{id}/similar", get(get_similar_articles))
        .route("/api/v1/clusters", get(search_clusters))
        .route("/api/v1/clusters/{id}", get(get_cluster))
        .route("/api/v1/system/health", get(system_health))
        .with_state(state);

    let addr = SETTINGS.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(target: TARGET_API, "API server running on http://{}", addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Error envelope with a trace id, rendered for every failure path.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    trace_id: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: String, trace_id: &str) -> Self {
        Self {
            status,
            code,
            message,
            trace_id: trace_id.to_string(),
        }
    }

    fn from_core(err: CoreError, trace_id: &str) -> Self {
        if matches!(err, CoreError::Storage(_) | CoreError::Internal(_)) {
            error!(target: TARGET_API, "trace {}: {}", trace_id, err);
        }
        Self {
            status: err.http_status(),
            code: err.code(),
            message: err.to_string(),
            trace_id: trace_id.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message },
            "trace_id": self.trace_id,
        });
        (self.status, Json(body)).into_response()
    }
}

fn trace_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Deserialize)]
struct SubmitArticleRequest {
    article_id: String,
    title: String,
    content: String,
    publish_time: DateTime<Utc>,
    source: String,
    state: i64,
    top: i64,
    tags: Vec<ArticleTag>,
    topic: Vec<ArticleTopic>,
}

async fn submit_article(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitArticleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    if payload.article_id.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "article_id must be non-empty".into(),
            &trace,
        ));
    }
    if payload.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            format!("content exceeds maximum length of {} characters", MAX_CONTENT_CHARS),
            &trace,
        ));
    }
    if !(STATE_INVISIBLE..=STATE_DELETED).contains(&payload.state) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            format!("state must be 0, 1 or 2, got {}", payload.state),
            &trace,
        ));
    }
    if !(0..=1).contains(&payload.top) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            format!("top must be 0 or 1, got {}", payload.top),
            &trace,
        ));
    }

    let article = NewArticle {
        article_id: payload.article_id.clone(),
        title: payload.title,
        content: payload.content,
        publish_time: payload.publish_time,
        source: payload.source,
        state: payload.state,
        top: payload.top,
        tags: payload.tags,
        topic: payload.topic,
    };
    let fp = state
        .fingerprinter
        .fingerprint(&format!("{} {}", article.title, article.content));

    let outcome = state
        .db
        .upsert_article(&article, &fp)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?;

    match outcome {
        UpsertOutcome::Inserted => {
            state
                .db
                .enqueue_job(JobType::Ingest, &article.article_id, 0)
                .await
                .map_err(|e| ApiError::from_core(e.into(), &trace))?;
        }
        UpsertOutcome::Updated { cluster_id } => {
            // A deletion transition drains the article out of its cluster.
            if article.state == STATE_DELETED {
                if let Some(cluster_id) = cluster_id {
                    remove_from_cluster(&state.db, &article.article_id, &cluster_id)
                        .await
                        .map_err(|e| ApiError::from_core(e, &trace))?;
                    state
                        .db
                        .update_article_assignment(
                            &article.article_id,
                            None,
                            ClusterStatus::Unique,
                            None,
                        )
                        .await
                        .map_err(|e| ApiError::from_core(e.into(), &trace))?;
                    warn!(target: TARGET_API, "article {} deleted and removed from {}", article.article_id, cluster_id);
                }
            }
        }
        UpsertOutcome::ContentMismatch => {
            return Err(ApiError::from_core(
                CoreError::ArticleAlreadyExists(article.article_id),
                &trace,
            ));
        }
    }

    Ok(Json(json!({})))
}

#[derive(Serialize)]
struct ArticleResponse {
    article: Article,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster: Option<crate::types::Cluster>,
    trace_id: String,
}

async fn get_article(
    State(state): State<ApiState>,
    Path(article_id): Path<String>,
) -> Result<Json<ArticleResponse>, ApiError> {
    let trace = trace_id();

    let article = state
        .db
        .get_article(&article_id)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?
        .ok_or_else(|| ApiError::from_core(CoreError::ArticleNotFound(article_id.clone()), &trace))?;

    let cluster = match &article.cluster_id {
        Some(cluster_id) if article.cluster_status == ClusterStatus::Matched => state
            .db
            .get_cluster(cluster_id)
            .await
            .map_err(|e| ApiError::from_core(e.into(), &trace))?,
        _ => None,
    };

    Ok(Json(ArticleResponse {
        article,
        cluster,
        trace_id: trace,
    }))
}

#[derive(Serialize)]
struct SimilarArticleSummary {
    article_id: String,
    title: String,
    similarity_score: f64,
}

async fn get_similar_articles(
    State(state): State<ApiState>,
    Path(article_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    let article = state
        .db
        .get_article(&article_id)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?
        .ok_or_else(|| ApiError::from_core(CoreError::ArticleNotFound(article_id.clone()), &trace))?;

    if article.cluster_status == ClusterStatus::Pending {
        return Err(ApiError::from_core(
            CoreError::ClusterPending(article_id),
            &trace,
        ));
    }
    let Some(cluster_id) = article.cluster_id else {
        return Err(ApiError::from_core(
            CoreError::ClusterNotFound(format!("article {} has no cluster", article_id)),
            &trace,
        ));
    };

    let members = state
        .db
        .articles_by_cluster(&cluster_id)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?;
    let articles: Vec<SimilarArticleSummary> = members
        .into_iter()
        .filter(|a| a.article_id != article_id)
        .map(|a| SimilarArticleSummary {
            article_id: a.article_id,
            title: a.title,
            similarity_score: a.similarity_score.unwrap_or(0.0),
        })
        .collect();

    Ok(Json(json!({
        "cluster_id": cluster_id,
        "articles": articles,
        "trace_id": trace,
    })))
}

#[derive(Debug, Deserialize)]
struct ClusterQuery {
    #[serde(default)]
    include_articles: bool,
}

async fn get_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<String>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    if !cluster_id.starts_with("cluster_") || cluster_id.len() <= "cluster_".len() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            format!("invalid cluster_id: {}", cluster_id),
            &trace,
        ));
    }

    let cluster = state
        .db
        .get_cluster(&cluster_id)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?
        .ok_or_else(|| ApiError::from_core(CoreError::ClusterNotFound(cluster_id.clone()), &trace))?;

    let articles = if query.include_articles {
        Some(
            state
                .db
                .articles_by_cluster(&cluster_id)
                .await
                .map_err(|e| ApiError::from_core(e.into(), &trace))?,
        )
    } else {
        None
    };

    Ok(Json(json!({
        "cluster": cluster,
        "articles": articles,
        "trace_id": trace,
    })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    sort: Option<String>,
    state: Option<i64>,
    top: Option<i64>,
    title: Option<String>,
    source: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    tag_id: Option<String>,
    /// Comma-separated topic ids.
    topic: Option<String>,
}

async fn search_clusters(
    State(state): State<ApiState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    let filter = ArticleSearchFilter {
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(20),
        sort: query.sort,
        state: query.state,
        top: query.top,
        title: query.title,
        source: query.source,
        start_time: query.start_time,
        end_time: query.end_time,
        tag_id: query.tag_id,
        topic_ids: query
            .topic
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    };

    let (articles, total) = state
        .db
        .search_articles(&filter)
        .await
        .map_err(|e| ApiError::from_core(e.into(), &trace))?;

    let mut items = Vec::with_capacity(articles.len());
    for article in &articles {
        // The article's own id leads the list; cluster mates follow. An
        // unclustered article yields a one-element list.
        let mut similar_article_ids = vec![article.article_id.clone()];
        if let Some(cluster_id) = &article.cluster_id {
            if let Some(cluster) = state
                .db
                .get_cluster(cluster_id)
                .await
                .map_err(|e| ApiError::from_core(e.into(), &trace))?
            {
                similar_article_ids.extend(
                    cluster
                        .article_ids
                        .into_iter()
                        .filter(|id| id != &article.article_id),
                );
            }
        }
        items.push(json!({
            "article_id": article.article_id,
            "similar_article_ids": similar_article_ids,
        }));
    }

    let page_size = filter.page_size.clamp(1, 100);
    let total_pages = (total + page_size - 1) / page_size;
    Ok(Json(json!({
        "items": items,
        "pagination": {
            "page": filter.page.max(1),
            "page_size": page_size,
            "total": total,
            "total_pages": total_pages,
        },
        "trace_id": trace,
    })))
}

#[derive(Debug, Deserialize)]
struct RecheckRequest {
    article_ids: Vec<String>,
    #[serde(default = "default_recheck_reason")]
    reason: String,
}

fn default_recheck_reason() -> String {
    "manual_review".to_string()
}

async fn recheck_articles(
    State(state): State<ApiState>,
    Json(payload): Json<RecheckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    if payload.article_ids.is_empty() || payload.article_ids.len() > MAX_RECHECK_BATCH {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            format!("article_ids must contain 1 to {} entries", MAX_RECHECK_BATCH),
            &trace,
        ));
    }
    if payload.article_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "article_ids must not contain blank entries".into(),
            &trace,
        ));
    }

    let receipt = state
        .recheck
        .request_recheck(&payload.article_ids, &payload.reason)
        .await
        .map_err(|e| ApiError::from_core(e, &trace))?;

    Ok(Json(json!({
        "accepted": receipt.accepted,
        "job_id": receipt.job_id,
        "trace_id": trace,
    })))
}

async fn system_health(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = trace_id();

    let database_ok = state.db.ping().await;
    let queue_depth = state.db.queue_depth().await.unwrap_or(-1);
    let dead_letters = state.db.dead_letter_depth().await.unwrap_or(-1);

    let database = if database_ok { "pass" } else { "fail" };
    let queue = if queue_depth < 0 {
        "fail"
    } else if queue_depth > SETTINGS.queue_warn_depth {
        "warn"
    } else {
        "pass"
    };
    let worker = if dead_letters < 0 {
        "fail"
    } else if dead_letters > 0 {
        "warn"
    } else {
        "pass"
    };

    let components = [database, queue, worker];
    let status = if components.contains(&"fail") {
        "fail"
    } else if components.contains(&"warn") {
        "warn"
    } else {
        "pass"
    };

    Ok(Json(json!({
        "status": status,
        "components": {
            "database": database,
            "queue": queue,
            "worker": worker,
        },
        "queue_depth": queue_depth,
        "verifier_truncated_total": VERIFIER_TRUNCATED_TOTAL.load(Ordering::Relaxed),
        "timestamp": Utc::now(),
        "trace_id": trace,
    })))
}
