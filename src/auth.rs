use std::{collections::HashSet, env};

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use thiserror::Error;

/// Authenticated principal. The relay only uses it as a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub subject: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unauthorized: missing bearer token")]
    MissingToken,
    #[error("Unauthorized: invalid bearer token")]
    InvalidToken,
}

/// Verifies bearer credentials issued by whatever owns user accounts.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, bearer_token: &str) -> Result<UserIdentity, AuthError>;
}

/// Resolves the caller from the `Authorization` header.
pub async fn authenticate(
    provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<UserIdentity, AuthError> {
    let token = bearer_token(headers)?;
    provider.verify(token).await
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .ok_or(AuthError::MissingToken)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingToken);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Fixed set of accepted tokens, for deployments that front the relay with
/// a separate account service and for local development.
#[derive(Debug, Clone)]
pub struct StaticTokenRegistry {
    valid_tokens: HashSet<String>,
}

impl StaticTokenRegistry {
    pub fn from_env() -> Self {
        let tokens = env::var("RELAY_BEARER_TOKENS").unwrap_or_else(|_| "dev-token".to_owned());
        Self::with_tokens(tokens.split(','))
    }

    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut valid_tokens = tokens
            .into_iter()
            .map(|token| token.as_ref().trim().to_owned())
            .filter(|token| !token.is_empty())
            .collect::<HashSet<_>>();
        if valid_tokens.is_empty() {
            valid_tokens.insert("dev-token".to_owned());
        }

        Self { valid_tokens }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenRegistry {
    async fn verify(&self, bearer_token: &str) -> Result<UserIdentity, AuthError> {
        if !self.valid_tokens.contains(bearer_token) {
            return Err(AuthError::InvalidToken);
        }

        Ok(UserIdentity {
            subject: format!("user_{}", redact_token(bearer_token)),
        })
    }
}

fn redact_token(token: &str) -> String {
    token.chars().take(8).collect()
}
