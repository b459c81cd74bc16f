//! Execution store for Lockstep.
//!
//! Provides repository traits with two implementations: PostgreSQL for
//! production and an in-memory store for tests and local development.
//! Every cross-build invariant (serial admission, sequence names, single
//! latest interceptible build) is enforced here, at the store boundary.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use repo::*;

pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations complete");
    Ok(())
}
