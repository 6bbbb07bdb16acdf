//! Chat transport seam.
//!
//! The session engine talks to the chat service exclusively through the
//! [`Connector`] and [`Connection`] traits, so the concrete provider (and
//! test doubles) stay pluggable. The connection, handshake, and keepalive
//! machinery live behind this boundary.

pub mod slack;

pub use slack::SlackConnector;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid credentials")]
    InvalidAuth,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed by peer")]
    Closed,
}

/// One chat user as the provider reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamInfo {
    pub id: String,
    pub name: String,
}

/// Result of the one-shot identity handshake used by team registration.
#[derive(Debug, Clone)]
pub struct Identity {
    pub team_id: String,
    pub team_name: String,
    pub url: String,
    pub bot_name: String,
}

/// Everything the provider reports at connect time: the team, the bot's
/// own identity, and the full roster snapshot.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub team: TeamInfo,
    pub me: UserInfo,
    pub users: Vec<UserInfo>,
}

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub user: String,
    pub channel: String,
    pub text: String,
    /// Marked by the transport itself (bot subtype or bot id on the wire),
    /// before any roster lookup.
    pub from_bot: bool,
}

/// Inbound transport events the session loop consumes one at a time.
#[derive(Debug, Clone)]
pub enum Event {
    Hello,
    InvalidAuth,
    TransportError { code: i64, msg: String },
    UnmarshalError(String),
    UserChanged(UserInfo),
    Message(Inbound),
    /// Recognized but irrelevant event type (presence, typing, ...).
    Other(String),
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// One-shot identity handshake against the provider, without opening a
    /// live event stream. Used by the `connect` administrative command.
    async fn identify(&self, token: &str) -> Result<Identity, TransportError>;

    /// Full connect: handshake plus a live event stream.
    async fn open(&self, token: &str) -> Result<Box<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn handshake(&self) -> &Handshake;

    /// Next inbound event. Blocks until one arrives; returns an error only
    /// when the stream itself is gone.
    async fn next_event(&mut self) -> Result<Event, TransportError>;

    /// Post a plain-text message to a channel, as the bot user.
    async fn post_message(&self, channel: &str, text: &str) -> Result<(), TransportError>;
}
