//! The vote ledger: recognized commands applied as transactional mutations
//! and queries against the topics and votes tables.
//!
//! Vote values are stored as decimal strings and summed with exact decimal
//! arithmetic; floating point never touches a vote.

use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored vote value {0:?} is not a decimal")]
    BadStoredValue(String),
}

/// Aggregated standing of one open topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTally {
    pub name: String,
    /// Empty string when the topic was proposed without a comment.
    pub comment: String,
    pub votes: i64,
    pub total: Decimal,
}

#[derive(Clone)]
pub struct VoteLedger {
    pool: SqlitePool,
}

impl VoteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a topic. Each call runs in its own transaction; the
    /// transaction rolls back on drop unless committed.
    pub async fn propose_topic(
        &self,
        team_id: &str,
        channel: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO topics (team_id, topic_channel, topic_name, topic_comment) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (team_id, topic_name) \
             DO UPDATE SET topic_channel = excluded.topic_channel, \
                           topic_comment = excluded.topic_comment",
        )
        .bind(team_id)
        .bind(channel)
        .bind(name)
        .bind(comment.filter(|c| !c.is_empty()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a vote, overwriting the user's previous vote on the topic if
    /// one exists. A user holds at most one live vote per topic.
    pub async fn cast_vote(
        &self,
        team_id: &str,
        topic: &str,
        user_id: &str,
        value: Decimal,
        comment: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO votes (team_id, topic_name, user_id, vote_value, vote_comment) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (team_id, topic_name, user_id) \
             DO UPDATE SET vote_value = excluded.vote_value, \
                           vote_comment = excluded.vote_comment",
        )
        .bind(team_id)
        .bind(topic)
        .bind(user_id)
        .bind(value.to_string())
        .bind(comment.filter(|c| !c.is_empty()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close or reopen a topic. Returns false when no such topic exists.
    pub async fn set_topic_open(
        &self,
        team_id: &str,
        name: &str,
        open: bool,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE topics SET topic_open = ? WHERE team_id = ? AND topic_name = ?",
        )
        .bind(open)
        .bind(team_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// All open topics in a channel with their vote counts and exact-decimal
    /// totals, in topic insertion order.
    pub async fn channel_summary(
        &self,
        team_id: &str,
        channel: &str,
    ) -> Result<Vec<TopicTally>, LedgerError> {
        let rows = sqlx::query(
            "SELECT t.topic_name, COALESCE(t.topic_comment, '') AS topic_comment, v.vote_value \
             FROM topics t \
             LEFT JOIN votes v ON v.team_id = t.team_id AND v.topic_name = t.topic_name \
             WHERE t.topic_open AND t.team_id = ? AND t.topic_channel = ? \
             ORDER BY t.rowid",
        )
        .bind(team_id)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        let mut tallies: Vec<TopicTally> = Vec::new();
        for row in rows {
            let name: String = row.get("topic_name");
            if tallies.last().is_none_or(|t| t.name != name) {
                tallies.push(TopicTally {
                    name,
                    comment: row.get("topic_comment"),
                    votes: 0,
                    total: Decimal::ZERO,
                });
            }
            let raw: Option<String> = row.get("vote_value");
            if let (Some(raw), Some(tally)) = (raw, tallies.last_mut()) {
                let value = raw
                    .parse::<Decimal>()
                    .map_err(|_| LedgerError::BadStoredValue(raw))?;
                tally.votes += 1;
                tally.total += value;
            }
        }
        Ok(tallies)
    }
}
