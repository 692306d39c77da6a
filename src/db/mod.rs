//! Database connection management
//!
//! One pool serves the lock store and the directory adapter; both borrow it
//! through cheap clones.

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::AppConfig;
use crate::lock::{PgDirectory, PgLockStore};

/// Tables the lock core cannot run without
const REQUIRED_TABLES: [&str; 3] = ["rules", "locks", "dataset_locks"];

/// PostgreSQL connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Connect using `postgres_url` and `max_connections` of the config
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let url = config
            .postgres_url
            .as_deref()
            .context("postgres_url is not configured")?;
        Self::connect(url, config.max_connections)
            .await
            .context("Failed to connect to PostgreSQL")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn lock_store(&self) -> PgLockStore {
        PgLockStore::new(self.pool.clone())
    }

    pub fn directory(&self) -> PgDirectory {
        PgDirectory::new(self.pool.clone())
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Whether the lock tables exist
    pub async fn schema_ready(&self) -> Result<bool, sqlx::Error> {
        for table in REQUIRED_TABLES {
            let present: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
            if !present {
                tracing::warn!(table = table, "Lock table missing");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Extension trait for safe row access with logging
pub trait SafeRow {
    /// Column value, or `None` with an error log when it cannot be decoded
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl SafeRow for sqlx::postgres::PgRow {
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        match self.try_get(column) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(column = column, error = %e, "Failed to read column");
                None
            }
        }
    }
}
