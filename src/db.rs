//! SQLite pool construction and embedded migrations.
//!
//! The database is the only state shared between team sessions; every row
//! is keyed by team_id so sessions never contend on the same keys.

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open the database, creating the file and schema if needed.
pub async fn init_pool(db_path: &Path) -> anyhow::Result<SqlitePool> {
    // A bare filename has an empty parent; nothing to create then.
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            team_id TEXT PRIMARY KEY,
            team_name TEXT NOT NULL,
            team_authtoken TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            team_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            user_is_bot INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (team_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            team_id TEXT NOT NULL,
            topic_channel TEXT NOT NULL,
            topic_name TEXT NOT NULL,
            topic_comment TEXT,
            topic_open INTEGER NOT NULL DEFAULT 1,
            UNIQUE (team_id, topic_name)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            team_id TEXT NOT NULL,
            topic_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            vote_value TEXT NOT NULL,
            vote_comment TEXT,
            UNIQUE (team_id, topic_name, user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// In-memory database for tests. A single connection keeps every query on
/// the same in-memory instance.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("memory connect options")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("open in-memory database");
    run_migrations(&pool).await.expect("run migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unusable_database_directory_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = init_pool(&blocker.join("bot.sqlite3")).await.unwrap_err();
        assert!(
            err.to_string().contains("failed to create database directory"),
            "unexpected error: {err:#}"
        );
    }

    #[tokio::test]
    async fn init_creates_schema_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = init_pool(&dir.path().join("bot.sqlite3")).await.unwrap();
        // All four tables are queryable immediately.
        for table in ["teams", "users", "topics", "votes"] {
            sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
        }
    }
}
