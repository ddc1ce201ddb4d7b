// Re-export the Database struct and other public items
pub mod article;
pub mod cluster;
pub mod core;
mod queue;
mod schema;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
pub use sqlx::Row;
