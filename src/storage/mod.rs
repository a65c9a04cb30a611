//! SQLite storage for provider catalog rows, usage history, credentials
//! and credit accounts.
//!
//! All timestamps are unix seconds. Usage history is bucketed by epoch hour.

pub mod accounts;
pub mod providers;
pub mod sub_providers;
pub mod usage;

pub use accounts::Account;
pub use providers::ProviderRow;
pub use sub_providers::SubProvider;
pub use usage::UsageTotals;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Initialize the SQLite connection pool and run migrations.
///
/// The database file is created automatically if it doesn't exist.
/// WAL journal mode is used for concurrent read/write performance.
pub async fn init_pool(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    // Apply embedded migrations
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// Open a migrated in-memory database.
///
/// Every SQLite in-memory connection is its own database, so the pool is
/// pinned to a single connection that never expires.
pub async fn init_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Epoch hour containing the unix timestamp `secs`.
pub fn epoch_hour(secs: i64) -> i64 {
    secs.div_euclid(3600)
}
