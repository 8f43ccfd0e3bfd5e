//! Control-database access.
//!
//! One process-wide `PgPool`; each job acquires a single connection at
//! pipeline start and runs every mutating write inside one outer
//! transaction on it. All statements are prefixed with the
//! environment-supplied schema namespace.

pub mod models;
pub mod store;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use store::Store;

/// Connect the process-wide control pool.
pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect control database")
}
