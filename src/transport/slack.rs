//! Slack RTM transport.
//!
//! `rtm.start` performs the handshake over HTTPS and hands back a websocket
//! URL plus the team/roster snapshot; events then arrive as JSON frames on
//! the socket. Outbound replies go through `chat.postMessage` so they are
//! attributed to the bot user. The server drops sockets it considers idle,
//! so the client pings whenever no frame has arrived for a while; reconnect
//! policy lives in the session, not here.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::{
    Connection, Connector, Event, Handshake, Identity, Inbound, TeamInfo, TransportError, UserInfo,
};

const DEFAULT_API_BASE: &str = "https://slack.com/api";
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct SlackConnector {
    http: reqwest::Client,
    api_base: String,
}

impl SlackConnector {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Point the connector at a different API host (tests).
    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{}", self.api_base, method))
            .form(params)
            .send()
            .await?;
        Ok(response.json::<T>().await?)
    }

    async fn rtm_start(&self, token: &str) -> Result<(String, Handshake), TransportError> {
        let resp: RtmStartResponse = self.call("rtm.start", &[("token", token)]).await?;
        if !resp.ok {
            return Err(auth_error(resp.error));
        }
        let team = resp
            .team
            .ok_or_else(|| TransportError::Protocol("rtm.start reply missing team".into()))?;
        let me = resp
            .me
            .ok_or_else(|| TransportError::Protocol("rtm.start reply missing self".into()))?;
        let handshake = Handshake {
            team: TeamInfo {
                id: team.id,
                name: team.name,
            },
            me: UserInfo {
                id: me.id,
                name: me.name,
                is_bot: true,
            },
            users: resp.users.into_iter().map(UserInfo::from).collect(),
        };
        Ok((resp.url, handshake))
    }
}

impl Default for SlackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SlackConnector {
    async fn identify(&self, token: &str) -> Result<Identity, TransportError> {
        let resp: AuthTestResponse = self.call("auth.test", &[("token", token)]).await?;
        if !resp.ok {
            return Err(auth_error(resp.error));
        }
        Ok(Identity {
            team_id: resp.team_id,
            team_name: resp.team,
            url: resp.url,
            bot_name: resp.user,
        })
    }

    async fn open(&self, token: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (url, handshake) = self.rtm_start(token).await?;
        let (socket, _) = connect_async(&url).await?;
        Ok(Box::new(SlackConnection {
            http: self.http.clone(),
            api_base: self.api_base.clone(),
            token: token.to_string(),
            handshake,
            socket,
        }))
    }
}

struct SlackConnection {
    http: reqwest::Client,
    api_base: String,
    token: String,
    handshake: Handshake,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for SlackConnection {
    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    async fn next_event(&mut self) -> Result<Event, TransportError> {
        loop {
            let frame = match tokio::time::timeout(PING_INTERVAL, self.socket.next()).await {
                // Nothing heard for a while; ping so the server keeps the
                // socket open, then go back to waiting.
                Err(_) => {
                    self.socket.send(Message::Ping(Bytes::new())).await?;
                    continue;
                }
                Ok(frame) => frame,
            };
            match frame {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(frame))) => return Ok(decode_event(frame.as_str())),
                Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                // Pongs and binary frames carry no events.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let resp: PostMessageResponse = {
            let response = self
                .http
                .post(format!("{}/chat.postMessage", self.api_base))
                .form(&[
                    ("token", self.token.as_str()),
                    ("channel", channel),
                    ("text", text),
                    ("as_user", "true"),
                ])
                .send()
                .await?;
            response.json().await?
        };
        if !resp.ok {
            return Err(TransportError::Protocol(
                resp.error.unwrap_or_else(|| "chat.postMessage failed".into()),
            ));
        }
        Ok(())
    }
}

fn auth_error(error: Option<String>) -> TransportError {
    match error.as_deref() {
        Some("invalid_auth") | Some("not_authed") | Some("account_inactive") => {
            TransportError::InvalidAuth
        }
        Some(other) => TransportError::Protocol(other.to_string()),
        None => TransportError::Protocol("request failed with no error detail".into()),
    }
}

/// Decode one websocket frame into an event. Undecodable frames surface as
/// `UnmarshalError` so the session can log and move on.
fn decode_event(raw: &str) -> Event {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Event::UnmarshalError(e.to_string()),
    };
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    match kind.as_str() {
        "hello" => Event::Hello,
        "invalid_auth" => Event::InvalidAuth,
        "message" => match serde_json::from_value::<WireMessage>(value) {
            Ok(msg) => {
                let from_bot =
                    msg.subtype.as_deref() == Some("bot_message") || msg.bot_id.is_some();
                Event::Message(Inbound {
                    user: msg.user,
                    channel: msg.channel,
                    text: msg.text,
                    from_bot,
                })
            }
            Err(e) => Event::UnmarshalError(e.to_string()),
        },
        "user_change" => match serde_json::from_value::<WireUserChange>(value) {
            Ok(change) => Event::UserChanged(change.user.into()),
            Err(e) => Event::UnmarshalError(e.to_string()),
        },
        "error" => {
            let err = value.get("error").cloned().unwrap_or_default();
            Event::TransportError {
                code: err.get("code").and_then(|c| c.as_i64()).unwrap_or_default(),
                msg: err
                    .get("msg")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        "" => Event::UnmarshalError("event frame has no type".to_string()),
        other => Event::Other(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    team: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    team_id: String,
}

#[derive(Debug, Deserialize)]
struct RtmStartResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: String,
    team: Option<WireTeam>,
    #[serde(rename = "self")]
    me: Option<WireSelf>,
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireTeam {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireSelf {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_bot: bool,
}

impl From<WireUser> for UserInfo {
    fn from(user: WireUser) -> Self {
        UserInfo {
            id: user.id,
            name: user.name,
            is_bot: user.is_bot,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireUserChange {
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    user: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_events() {
        let event = decode_event(
            r#"{"type":"message","user":"U1","channel":"C1","text":"+1 on mytopic"}"#,
        );
        match event {
            Event::Message(msg) => {
                assert_eq!(msg.user, "U1");
                assert_eq!(msg.channel, "C1");
                assert_eq!(msg.text, "+1 on mytopic");
                assert!(!msg.from_bot);
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[test]
    fn bot_subtype_is_flagged_on_the_wire() {
        let event = decode_event(
            r#"{"type":"message","user":"U1","channel":"C1","text":"x","subtype":"bot_message"}"#,
        );
        assert!(matches!(event, Event::Message(Inbound { from_bot: true, .. })));

        let event =
            decode_event(r#"{"type":"message","channel":"C1","text":"x","bot_id":"B9"}"#);
        assert!(matches!(event, Event::Message(Inbound { from_bot: true, .. })));
    }

    #[test]
    fn decodes_user_change_events() {
        let event = decode_event(
            r#"{"type":"user_change","user":{"id":"U2","name":"bob","is_bot":true}}"#,
        );
        match event {
            Event::UserChanged(user) => {
                assert_eq!(user.id, "U2");
                assert_eq!(user.name, "bob");
                assert!(user.is_bot);
            }
            other => panic!("expected user change, got {other:?}"),
        }
    }

    #[test]
    fn decodes_error_and_hello_events() {
        assert!(matches!(decode_event(r#"{"type":"hello"}"#), Event::Hello));
        match decode_event(r#"{"type":"error","error":{"code":2,"msg":"broken"}}"#) {
            Event::TransportError { code, msg } => {
                assert_eq!(code, 2);
                assert_eq!(msg, "broken");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_becomes_unmarshal_error_not_a_crash() {
        assert!(matches!(
            decode_event("not json at all"),
            Event::UnmarshalError(_)
        ));
        assert!(matches!(
            decode_event(r#"{"no_type":true}"#),
            Event::UnmarshalError(_)
        ));
    }

    #[test]
    fn unknown_event_types_are_passed_through_as_other() {
        match decode_event(r#"{"type":"presence_change","user":"U1"}"#) {
            Event::Other(kind) => assert_eq!(kind, "presence_change"),
            other => panic!("expected other, got {other:?}"),
        }
    }

    #[test]
    fn auth_errors_map_to_invalid_auth() {
        assert!(matches!(
            auth_error(Some("invalid_auth".into())),
            TransportError::InvalidAuth
        ));
        assert!(matches!(
            auth_error(Some("ratelimited".into())),
            TransportError::Protocol(_)
        ));
    }
}
