//! Persisted per-team roster: known users with their bot/human
//! classification, plus team display-name reconciliation.
//!
//! All writes are best effort; callers log failures and carry on.

use sqlx::{Row, SqlitePool};

use crate::transport::UserInfo;

#[derive(Clone)]
pub struct RosterCache {
    pool: SqlitePool,
}

impl RosterCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one user row. Seeds the roster from the handshake snapshot
    /// and tracks incremental user-change notifications.
    pub async fn update_user(&self, team_id: &str, user: &UserInfo) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (team_id, user_id, user_name, user_is_bot) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (team_id, user_id) \
             DO UPDATE SET user_name = excluded.user_name, \
                           user_is_bot = excluded.user_is_bot",
        )
        .bind(team_id)
        .bind(&user.id)
        .bind(&user.name)
        .bind(user.is_bot)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Reconcile a renamed team. Team rows themselves are created by the
    /// `connect` administrative command, never here.
    pub async fn update_team_name(&self, team_id: &str, name: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE teams SET team_name = ? WHERE team_id = ?")
            .bind(name)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Whether the given user is a bot account. None when the user is not
    /// in the roster yet.
    pub async fn is_bot(&self, team_id: &str, user_id: &str) -> Result<Option<bool>, sqlx::Error> {
        let row = sqlx::query("SELECT user_is_bot FROM users WHERE team_id = ? AND user_id = ?")
            .bind(team_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("user_is_bot")))
    }
}
