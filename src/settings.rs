use once_cell::sync::Lazy;
use std::env;

/// Process-wide configuration, read once at startup and never mutated.
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub host: String,
    pub port: u16,
    /// Number of parallel ingestion workers.
    pub worker_count: usize,
    /// Maximum candidates returned by recall.
    pub recall_limit: usize,
    /// Maximum candidates admitted from a single cluster during recall.
    pub per_cluster_cap: usize,
    /// Maximum candidates the verifier will score per article.
    pub verifier_max_candidates: usize,
    /// Wall-clock budget for verification, in milliseconds.
    pub verifier_budget_ms: u64,
    /// How long a claimed job stays invisible before redelivery.
    pub queue_visibility_secs: i64,
    /// Attempts before a job is dead-lettered.
    pub queue_max_attempts: i64,
    /// Idle poll interval for workers when the queue is empty.
    pub queue_poll_ms: u64,
    /// Queue depth above which health reports `warn`.
    pub queue_warn_depth: i64,
    /// Per-article recheck cooldown, in seconds.
    pub recheck_cooldown_secs: i64,
    /// Rechecks accepted per caller per minute.
    pub recheck_rate_per_minute: u32,
    /// Delay before the recheck enqueued after a verifier timeout.
    pub recheck_delay_secs: i64,
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "newswatch.db".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8000),
            worker_count: env_parse("WORKER_COUNT", 8),
            recall_limit: env_parse("RECALL_LIMIT", 50),
            per_cluster_cap: env_parse("RECALL_PER_CLUSTER_CAP", 3),
            verifier_max_candidates: env_parse("VERIFIER_MAX_CANDIDATES", 20),
            verifier_budget_ms: env_parse("VERIFIER_BUDGET_MS", 50),
            queue_visibility_secs: env_parse("QUEUE_VISIBILITY_SECS", 30),
            queue_max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 5),
            queue_poll_ms: env_parse("QUEUE_POLL_MS", 500),
            queue_warn_depth: env_parse("QUEUE_WARN_DEPTH", 1000),
            recheck_cooldown_secs: env_parse("RECHECK_COOLDOWN_SECS", 300),
            recheck_rate_per_minute: env_parse("RECHECK_RATE_PER_MINUTE", 60),
            recheck_delay_secs: env_parse("RECHECK_DELAY_SECS", 60),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
