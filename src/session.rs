//! One live session per team.
//!
//! A session owns its connection lifecycle: handshake, roster sync, then a
//! strictly sequential receive loop. Each inbound message is fully handled
//! (classification, persistence, replies) before the next one is read, so
//! there is no intra-team interleaving. Per-message failures are logged and
//! the loop continues; a dropped stream re-enters the connecting state, and
//! only invalid credentials end the session.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::Instrument;

use crate::grammar::{Command, Grammar};
use crate::ledger::{TopicTally, VoteLedger};
use crate::roster::RosterCache;
use crate::transport::{Connection, Connector, Event, Inbound, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Active,
    Terminated,
}

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct Session {
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
    team_id: String,
    token: String,
    reconnect_delay: Duration,
}

impl Session {
    pub fn new(
        pool: SqlitePool,
        connector: Arc<dyn Connector>,
        team_id: String,
        token: String,
    ) -> Self {
        Self {
            pool,
            connector,
            team_id,
            token,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run the session to completion. Never panics outward; every exit path
    /// ends in the Terminated state with a log line saying why.
    pub async fn run(self) {
        let span = tracing::info_span!("session", team_id = %self.team_id);
        self.run_inner().instrument(span).await;
    }

    /// Connect-and-receive loop. A dropped stream or failed handshake goes
    /// back to Connecting after a delay; invalid credentials are the one
    /// terminal exit.
    async fn run_inner(self) {
        loop {
            tracing::info!(state = ?SessionState::Connecting, "opening transport");
            let conn = match self.connector.open(&self.token).await {
                Ok(conn) => conn,
                Err(TransportError::InvalidAuth) => {
                    tracing::error!(state = ?SessionState::Terminated, "invalid credentials");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "handshake failed; reconnecting");
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            let mut active = Active::start(self.pool.clone(), conn).await;
            tracing::info!(
                state = ?SessionState::Active,
                team = %active.team_name,
                bot = %active.bot_name,
                "connected"
            );

            let fatal = loop {
                let event = match active.conn.next_event().await {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "transport stream failed; reconnecting");
                        break false;
                    }
                };
                if active.handle_event(event).await == LoopControl::Stop {
                    break true;
                }
            };
            if fatal {
                tracing::info!(state = ?SessionState::Terminated, "session over");
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

/// Everything an active session needs per event: the live connection, the
/// per-session grammar, and handles into persistent storage.
struct Active {
    conn: Box<dyn Connection>,
    grammar: Grammar,
    ledger: VoteLedger,
    roster: RosterCache,
    team_id: String,
    team_name: String,
    bot_name: String,
}

impl Active {
    /// Sync team name and the roster snapshot, then build the grammar from
    /// the bot's own identity. Roster writes are best effort.
    async fn start(pool: SqlitePool, conn: Box<dyn Connection>) -> Self {
        let ledger = VoteLedger::new(pool.clone());
        let roster = RosterCache::new(pool);
        let hs = conn.handshake().clone();

        if let Err(e) = roster.update_team_name(&hs.team.id, &hs.team.name).await {
            tracing::error!(error = %e, "failed to refresh team in db");
        }
        for user in &hs.users {
            if let Err(e) = roster.update_user(&hs.team.id, user).await {
                tracing::error!(error = %e, user = %user.id, "failed to refresh user in db");
            }
        }

        Active {
            grammar: Grammar::new(&hs.me.id, &hs.me.name),
            conn,
            ledger,
            roster,
            team_id: hs.team.id,
            team_name: hs.team.name,
            bot_name: hs.me.name,
        }
    }

    async fn handle_event(&mut self, event: Event) -> LoopControl {
        match event {
            Event::Hello => tracing::debug!("transport says hello"),
            Event::InvalidAuth => {
                tracing::error!("credentials rejected mid-stream");
                return LoopControl::Stop;
            }
            Event::TransportError { code, msg } => {
                tracing::warn!(code, msg = %msg, "transport error");
            }
            Event::UnmarshalError(detail) => {
                tracing::info!(detail = %detail, "undecodable event");
            }
            Event::UserChanged(user) => {
                if let Err(e) = self.roster.update_user(&self.team_id, &user).await {
                    tracing::error!(error = %e, user = %user.id, "failed to refresh user in db");
                }
            }
            Event::Other(kind) => tracing::debug!(kind = %kind, "ignoring event"),
            Event::Message(msg) => self.handle_message(&msg).await,
        }
        LoopControl::Continue
    }

    async fn handle_message(&mut self, msg: &Inbound) {
        if msg.from_bot {
            tracing::debug!(channel = %msg.channel, "ignoring message; bot subtype");
            return;
        }
        match self.roster.is_bot(&self.team_id, &msg.user).await {
            Ok(Some(true)) => {
                tracing::debug!(user = %msg.user, "ignoring message; from bot");
                return;
            }
            Ok(Some(false)) => {}
            Ok(None) => {
                tracing::debug!(user = %msg.user, "sender not in roster; proceeding");
            }
            Err(e) => {
                tracing::warn!(error = %e, user = %msg.user, "failed to read roster row");
                return;
            }
        }

        match self.grammar.classify(&msg.text) {
            Command::Propose { topic, comment } => {
                tracing::info!(
                    user = %msg.user,
                    channel = %msg.channel,
                    topic = %topic,
                    "saw proposal"
                );
                match self
                    .ledger
                    .propose_topic(&self.team_id, &msg.channel, &topic, comment.as_deref())
                    .await
                {
                    Ok(()) => {
                        self.post(&msg.channel, &format!("Voting is now open on {topic}"))
                            .await;
                    }
                    // Silent on the wire; only the log sees it.
                    Err(e) => tracing::info!(error = %e, topic = %topic, "failed to insert proposal"),
                }
            }
            Command::Vote {
                value,
                topic,
                comment,
            } => {
                tracing::info!(
                    user = %msg.user,
                    channel = %msg.channel,
                    topic = %topic,
                    value = %value,
                    "saw vote"
                );
                if let Err(e) = self
                    .ledger
                    .cast_vote(&self.team_id, &topic, &msg.user, value, comment.as_deref())
                    .await
                {
                    tracing::info!(error = %e, topic = %topic, "failed to insert vote");
                }
            }
            Command::MalformedVote { raw } => {
                tracing::info!(
                    user = %msg.user,
                    channel = %msg.channel,
                    raw = %raw,
                    user_msg = %msg.text,
                    "failed to parse vote value"
                );
            }
            Command::Directed { verb, args } => {
                self.handle_directed(msg, &verb, &args).await;
            }
            Command::DirectedSyntaxError => {
                self.post(
                    &msg.channel,
                    &format!("<@{}>: Syntax error in command", msg.user),
                )
                .await;
            }
            Command::NoMatch => {}
        }
    }

    async fn handle_directed(&mut self, msg: &Inbound, verb: &str, args: &[String]) {
        let prefix = format!("<@{}>: ", msg.user);
        match verb.to_lowercase().as_str() {
            "howdy" => {
                self.post(&msg.channel, &format!("{prefix}Howdy neighbor!")).await;
            }
            "status" if args.is_empty() => {
                match self.ledger.channel_summary(&self.team_id, &msg.channel).await {
                    Ok(tallies) => self.post(&msg.channel, &render_summary(&tallies)).await,
                    Err(e) => tracing::error!(error = %e, "failed to query topics"),
                }
            }
            // status with a topic argument is reserved; say nothing.
            "status" => {}
            "close" | "reopen" => {
                let reopen = verb.eq_ignore_ascii_case("reopen");
                let Some(topic) = args.first() else {
                    self.post(&msg.channel, &format!("{prefix}Usage: {verb} <topic>"))
                        .await;
                    return;
                };
                match self.ledger.set_topic_open(&self.team_id, topic, reopen).await {
                    Ok(true) if reopen => {
                        self.post(&msg.channel, &format!("{prefix}Voting is open again on {topic}"))
                            .await;
                    }
                    Ok(true) => {
                        self.post(&msg.channel, &format!("{prefix}Voting is closed on {topic}"))
                            .await;
                    }
                    Ok(false) => {
                        self.post(&msg.channel, &format!("{prefix}No such topic {topic}"))
                            .await;
                    }
                    Err(e) => tracing::error!(error = %e, topic = %topic, "failed to update topic"),
                }
            }
            _ => {
                let mut echoed = vec![verb.to_string()];
                echoed.extend(args.iter().cloned());
                self.post(
                    &msg.channel,
                    &format!("{prefix}You seem confused; you said `{echoed:?}`"),
                )
                .await;
            }
        }
    }

    /// Replies are fire and forget; a failed send is logged, never retried.
    async fn post(&self, channel: &str, text: &str) {
        if let Err(e) = self.conn.post_message(channel, text).await {
            tracing::info!(error = %e, channel = %channel, "failed to post reply");
        }
    }
}

/// Render the status summary. Exactly "No open topics" when the channel has
/// none, otherwise a header plus one line per topic.
fn render_summary(tallies: &[TopicTally]) -> String {
    if tallies.is_empty() {
        return "No open topics".to_string();
    }
    let mut out = String::from("Vote summary\n");
    for tally in tallies {
        out.push_str(&format!(
            "* {} -- {} ({} votes) | {}\n",
            tally.name, tally.total, tally.votes, tally.comment
        ));
    }
    out
}
