//! Team management and the session supervisor.
//!
//! Administrative operations go through the [`Manager`] capability trait,
//! chosen once at startup: [`LocalManager`] writes straight to storage,
//! [`RemoteManager`] forwards the call to another votebot instance over
//! HTTP. Nothing downstream inspects which variant it holds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::session::Session;
use crate::transport::{Connector, TransportError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
    #[error("remote manager call failed: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTeamRequest {
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTeamResponse {
    pub name: String,
    pub url: String,
    pub bot_name: String,
}

#[async_trait]
pub trait Manager: Send + Sync {
    /// One-shot team registration: identity handshake against the provider,
    /// then upsert the team row. Synchronous and distinct from the
    /// long-running session loop.
    async fn add_team(&self, req: AddTeamRequest) -> Result<AddTeamResponse, ManagerError>;
}

pub struct LocalManager {
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
}

impl LocalManager {
    pub fn new(pool: SqlitePool, connector: Arc<dyn Connector>) -> Self {
        Self { pool, connector }
    }
}

#[async_trait]
impl Manager for LocalManager {
    async fn add_team(&self, req: AddTeamRequest) -> Result<AddTeamResponse, ManagerError> {
        let identity = self.connector.identify(&req.auth_token).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO teams (team_id, team_name, team_authtoken) \
             VALUES (?, ?, ?) \
             ON CONFLICT (team_id) \
             DO UPDATE SET team_name = excluded.team_name, \
                           team_authtoken = excluded.team_authtoken",
        )
        .bind(&identity.team_id)
        .bind(&identity.team_name)
        .bind(&req.auth_token)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            team_id = %identity.team_id,
            team = %identity.team_name,
            "registered team"
        );
        Ok(AddTeamResponse {
            name: identity.team_name,
            url: identity.url,
            bot_name: identity.bot_name,
        })
    }
}

pub struct RemoteManager {
    http: reqwest::Client,
    endpoint: String,
}

impl RemoteManager {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Manager for RemoteManager {
    async fn add_team(&self, req: AddTeamRequest) -> Result<AddTeamResponse, ManagerError> {
        let response = self
            .http
            .post(format!("{}/add_team", self.endpoint))
            .json(&req)
            .send()
            .await
            .map_err(|e| ManagerError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ManagerError::Remote(format!("{status}: {detail}")));
        }
        response
            .json::<AddTeamResponse>()
            .await
            .map_err(|e| ManagerError::Transport(e.into()))
    }
}

/// Start one session per registered team and keep the process alive until
/// externally terminated. Sessions handle their own reconnects; one that
/// terminates (invalid credentials) is not restarted.
pub async fn run_sessions(
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
) -> Result<(), sqlx::Error> {
    let rows = sqlx::query("SELECT team_id, team_authtoken FROM teams")
        .fetch_all(&pool)
        .await?;

    if rows.is_empty() {
        tracing::warn!("no teams registered; run `votebot connect <authtoken>` first");
    }
    for row in rows {
        let team_id: String = row.get("team_id");
        let token: String = row.get("team_authtoken");
        tracing::info!(team_id = %team_id, "spawning session");
        tokio::spawn(Session::new(pool.clone(), connector.clone(), team_id, token).run());
    }

    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::transport::{Connection, Identity};

    struct FixedIdentityConnector {
        identity: Identity,
    }

    #[async_trait]
    impl Connector for FixedIdentityConnector {
        async fn identify(&self, token: &str) -> Result<Identity, TransportError> {
            if token == "bad" {
                return Err(TransportError::InvalidAuth);
            }
            Ok(self.identity.clone())
        }

        async fn open(&self, _token: &str) -> Result<Box<dyn Connection>, TransportError> {
            unimplemented!("registration never opens a live connection")
        }
    }

    fn connector() -> Arc<dyn Connector> {
        Arc::new(FixedIdentityConnector {
            identity: Identity {
                team_id: "T1".to_string(),
                team_name: "testers".to_string(),
                url: "https://testers.example.com/".to_string(),
                bot_name: "votebot".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn add_team_registers_and_reports_identity() {
        let pool = db::memory_pool().await;
        let manager = LocalManager::new(pool.clone(), connector());

        let resp = manager
            .add_team(AddTeamRequest {
                auth_token: "xoxb-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.name, "testers");
        assert_eq!(resp.bot_name, "votebot");

        let row = sqlx::query("SELECT team_name, team_authtoken FROM teams WHERE team_id = 'T1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("team_name"), "testers");
        assert_eq!(row.get::<String, _>("team_authtoken"), "xoxb-1");
    }

    #[tokio::test]
    async fn add_team_twice_refreshes_the_credential() {
        let pool = db::memory_pool().await;
        let manager = LocalManager::new(pool.clone(), connector());

        for token in ["xoxb-1", "xoxb-2"] {
            manager
                .add_team(AddTeamRequest {
                    auth_token: token.to_string(),
                })
                .await
                .unwrap();
        }

        let rows = sqlx::query("SELECT team_authtoken FROM teams")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String, _>("team_authtoken"), "xoxb-2");
    }

    #[tokio::test]
    async fn add_team_surfaces_handshake_failures() {
        let pool = db::memory_pool().await;
        let manager = LocalManager::new(pool.clone(), connector());

        let err = manager
            .add_team(AddTeamRequest {
                auth_token: "bad".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Transport(TransportError::InvalidAuth)
        ));

        // Nothing was written.
        let rows = sqlx::query("SELECT * FROM teams").fetch_all(&pool).await.unwrap();
        assert!(rows.is_empty());
    }

    /// Loopback listener that serves exactly one canned HTTP response and
    /// hands back what it received.
    async fn one_shot_http_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn remote_add_team_round_trip() {
        let (base, server) = one_shot_http_server(
            "200 OK",
            r#"{"name":"testers","url":"https://testers.example.com/","bot_name":"votebot"}"#,
        )
        .await;

        // Trailing slash gets normalized away before the path is appended.
        let manager = RemoteManager::new(format!("{base}/"));
        let resp = manager
            .add_team(AddTeamRequest {
                auth_token: "xoxb-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.name, "testers");
        assert_eq!(resp.bot_name, "votebot");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /add_team HTTP/1.1"));
    }

    #[tokio::test]
    async fn remote_failure_status_becomes_a_readable_error() {
        let (base, _server) = one_shot_http_server(
            "500 Internal Server Error",
            r#"{"error":"database unavailable"}"#,
        )
        .await;

        let manager = RemoteManager::new(base);
        let err = manager
            .add_team(AddTeamRequest {
                auth_token: "xoxb-1".to_string(),
            })
            .await
            .unwrap_err();
        match err {
            ManagerError::Remote(msg) => {
                assert!(msg.contains("500"), "status missing from {msg:?}");
                assert!(msg.contains("database unavailable"), "body missing from {msg:?}");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
