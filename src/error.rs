use axum::http::StatusCode;

/// Error surface of the clustering core.
///
/// Workers recover `ClusterConflict` and transient `Storage` errors locally;
/// everything else propagates to the API edge where it is rendered as the
/// standard error envelope with a trace id.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("article not found: {0}")]
    ArticleNotFound(String),
    #[error("article already exists with different content: {0}")]
    ArticleAlreadyExists(String),
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),
    #[error("article similarity is still pending: {0}")]
    ClusterPending(String),
    #[error("cluster version conflict persisted after {attempts} attempts")]
    ClusterConflict { attempts: u32 },
    #[error("recheck rate limit exceeded")]
    RecheckRateLimited,
    #[error("storage unavailable")]
    Storage(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code used in the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CoreError::ArticleNotFound(_) => "ARTICLE_NOT_FOUND",
            CoreError::ArticleAlreadyExists(_) => "ARTICLE_ALREADY_EXISTS",
            CoreError::ClusterNotFound(_) => "CLUSTER_NOT_FOUND",
            CoreError::ClusterPending(_) => "CLUSTER_PENDING",
            CoreError::ClusterConflict { .. } => "CLUSTER_CONFLICT",
            CoreError::RecheckRateLimited => "RECHECK_RATE_LIMITED",
            CoreError::Storage(_) => "UPSTREAM_UNAVAILABLE",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::ArticleNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::ArticleAlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::ClusterPending(_) => StatusCode::NOT_FOUND,
            CoreError::ClusterConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::RecheckRateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient errors are retried by the worker with backoff instead of
    /// being dead-lettered.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(_) | CoreError::ClusterConflict { .. }
        )
    }
}
