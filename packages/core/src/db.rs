//! SQLite pool construction and schema bootstrap.
//!
//! Migrations under `migrations/` are embedded at compile time and applied
//! every time a pool is created, so both the binary and the tests start
//! from the same schema.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Open a pool for `database_url` and run all pending migrations.
///
/// `sqlite::memory:` databases live inside a single connection, so the pool
/// is pinned to exactly one long-lived connection in that case.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

    tracing::debug!("Database ready at {}", database_url);
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn memory_pool_has_all_tables() {
        let pool = create_pool("sqlite::memory:").await.unwrap();

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();

        for table in ["drivers", "jobs", "maintenances", "metric", "trucks"] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn memory_pool_is_a_single_shared_database() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (job_number, job_date, job_type, job_status)
             VALUES ('J-1', '2025-01-01', 'delivery', 'Completed')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
