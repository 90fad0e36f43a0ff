//! Authenticated session context.
//!
//! The token is carried explicitly into the HTTP client and the sync
//! channel; nothing is stored globally.

use std::fmt;

use inkpad_core::{Participant, Role};
use serde::{Deserialize, Serialize};

use crate::api::{check_status, http_client};
use crate::config::ClientConfig;
use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Bearer token plus the user it was issued to.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    token: String,
    pub user: UserProfile,
}

impl AuthSession {
    pub fn new(token: impl Into<String>, user: UserProfile) -> Self {
        Self {
            token: token.into(),
            user,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Participant for this user with the given role.
    pub fn participant(&self, role: Role) -> Participant {
        Participant::new(self.user.id.clone(), self.user.name.clone(), role)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    user: UserProfile,
}

/// `POST /auth/login`.
pub async fn login(
    config: &ClientConfig,
    email: &str,
    password: &str,
) -> Result<AuthSession, PersistenceError> {
    let url = config.api_url("/auth/login");
    let response = http_client(config)?
        .post(&url)
        .json(&LoginRequest { email, password })
        .send()
        .await?;
    let body: LoginResponse = check_status("login", response).await?.json().await?;
    log::info!("logged in as {}", body.user.id);
    Ok(AuthSession::new(body.access_token, body.user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
        }
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = AuthSession::new("secret-token", profile());
        let shown = format!("{session:?}");
        assert!(!shown.contains("secret-token"));
        assert_eq!(session.bearer(), "Bearer secret-token");
    }

    #[test]
    fn test_participant_from_session() {
        let session = AuthSession::new("t", profile());
        let participant = session.participant(Role::Viewer);
        assert_eq!(participant.id, "u1");
        assert_eq!(participant.name, "Ada");
        assert!(!participant.can_edit());
    }

    #[tokio::test]
    async fn test_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(serde_json::json!({"email": "ada@example.com", "password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "user": {"id": "u1", "name": "Ada", "email": "ada@example.com"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig {
            api_base_url: server.uri(),
            ..ClientConfig::default()
        };
        let session = login(&config, "ada@example.com", "pw").await.unwrap();
        assert_eq!(session.token(), "tok-1");
        assert_eq!(session.user, profile());
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"message": "Invalid credentials"})),
            )
            .mount(&server)
            .await;

        let config = ClientConfig {
            api_base_url: server.uri(),
            ..ClientConfig::default()
        };
        match login(&config, "a", "b").await {
            Err(PersistenceError::Rejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid credentials");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
