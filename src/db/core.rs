use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::str::FromStr;
use tokio::sync::OnceCell;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::settings::SETTINGS;
use crate::TARGET_DB;

/// The Index Gateway: the only shared mutable state in the process.
/// All cross-worker coordination runs through version-checked writes here.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// Helper method to check if an sqlx error is a database lock error
pub trait DbLockErrorExt {
    fn is_database_lock_error(&self) -> bool;
}

impl DbLockErrorExt for sqlx::Error {
    fn is_database_lock_error(&self) -> bool {
        match self {
            sqlx::Error::Database(err) => err
                .code()
                .map_or(false, |c| c == "5" || c == "6" || c == "261"),
            _ => false,
        }
    }
}

impl Database {
    #[instrument(target = "db_query", level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_url);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_url))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        // Initialize schema
        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    pub async fn instance() -> &'static Database {
        static INSTANCE: OnceCell<Database> = OnceCell::const_new();

        INSTANCE
            .get_or_init(|| async {
                Database::new(&SETTINGS.database_path)
                    .await
                    .expect("Failed to initialize database")
            })
            .await
    }

    /// Cheap liveness probe used by the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(self.pool()).await.is_ok()
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let path = std::env::temp_dir().join(format!("newswatch-test-{}.db", uuid::Uuid::new_v4()));
    Database::new(path.to_str().expect("utf-8 temp path"))
        .await
        .expect("test database")
}
