use std::{fmt, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

use crate::{
    error::WaitError,
    waiter::{Deferred, WaiterRegistry},
};

#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: UserId,
    pub token: Token,
}

impl Credentials {
    pub fn new(user_id: UserId, token: Token) -> Self {
        Self { user_id, token }
    }

    pub(crate) fn authorization_header(&self) -> (String, String) {
        (
            "Authorization".to_string(),
            format!("Bearer {}", self.token.expose()),
        )
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh_token(&self, user_id: UserId) -> Result<Token>;
}

pub struct MissingTokenProvider;

#[async_trait]
impl TokenProvider for MissingTokenProvider {
    async fn refresh_token(&self, user_id: UserId) -> Result<Token> {
        Err(anyhow!("no token provider configured for user {}", user_id.0))
    }
}

pub struct StaticTokenProvider {
    token: Token,
}

impl StaticTokenProvider {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn refresh_token(&self, _user_id: UserId) -> Result<Token> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct TokenRequest {
    user_id: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches tokens from `POST {server_url}/token`.
pub struct HttpTokenProvider {
    http: Client,
    server_url: String,
}

impl HttpTokenProvider {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn refresh_token(&self, user_id: UserId) -> Result<Token> {
        let body: TokenResponse = self
            .http
            .post(format!("{}/token", self.server_url))
            .json(&TokenRequest { user_id: user_id.0 })
            .send()
            .await
            .context("token request failed")?
            .error_for_status()?
            .json()
            .await
            .context("invalid token response")?;
        Ok(Token::new(body.token))
    }
}

/// The signed-in user and their current token.
pub struct AuthContext {
    user_id: UserId,
    tokens: WaiterRegistry<Token>,
}

impl AuthContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            tokens: WaiterRegistry::new("token"),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn token(&self) -> Option<Token> {
        self.tokens.current()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.token()
            .map(|token| Credentials::new(self.user_id, token))
    }

    pub fn set_token(&self, token: Token) -> Deferred {
        self.tokens.resolve_all(token)
    }

    pub fn invalidate(&self) {
        self.tokens.invalidate();
    }

    pub fn fail(&self, error: WaitError) -> Deferred {
        self.tokens.fail_all(error)
    }

    pub async fn wait_token(&self, timeout: Duration) -> Result<Token, WaitError> {
        self.tokens.wait(timeout).await
    }
}
