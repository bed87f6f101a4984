//! OAuth client credentials tokens.
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::settings::ClientCredentials;

/// Tokens are refreshed once they are within this many seconds of expiry.
///
/// This must be larger than the HTTP request timeout.
pub const UNTIL_EXPIRATION_SECS: i64 = 60;

/// Errors that can occur when obtaining a token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token request could not be sent, or its response could not be read.
    #[error("failed to request the token response: {0}")]
    Request(#[from] reqwest::Error),

    /// The identity provider responded with a non-200 status.
    #[error("Cannot obtain token from IDP. Status code={0}")]
    Status(reqwest::StatusCode),

    /// The response body was not a valid token response.
    #[error("failed to decode the token response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An access token and its expiry.
#[derive(Clone, Debug, Deserialize)]
pub struct Token {
    /// The bearer token.
    pub access_token: String,
    /// The lifetime of the token in seconds, as reported by the provider.
    #[serde(default)]
    pub expires_in: i64,
    /// When the token expires.
    #[serde(skip, default = "Utc::now")]
    pub expires_at: DateTime<Utc>,
}

impl Token {
    fn issued_at(mut self, now: DateTime<Utc>) -> Self {
        self.expires_at = now + Duration::seconds(self.expires_in);
        self
    }

    /// Whether the token is empty or expires within [`UNTIL_EXPIRATION_SECS`] of `now`.
    pub fn is_almost_expired(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_empty()
            || now + Duration::seconds(UNTIL_EXPIRATION_SECS) > self.expires_at
    }
}

/// Fetches and caches tokens for a single set of client credentials.
#[derive(Debug)]
pub struct TokenSource {
    http: reqwest::Client,
    credentials: ClientCredentials,
    token: Mutex<Option<Token>>,
}

impl TokenSource {
    /// Create a token source using `http` to contact the token endpoint.
    pub fn new(http: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            token: Mutex::new(None),
        }
    }

    /// The credentials used by this source.
    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// Return a valid access token, fetching a new one if necessary.
    ///
    /// Concurrent callers wait for a single refresh.
    pub async fn access_token(&self) -> Result<String, TokenError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.is_almost_expired(Utc::now())) {
            return Ok(token.access_token.clone());
        }
        let token = self.retrieve().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    #[tracing::instrument(skip(self), fields(token_url = %self.credentials.token_url))]
    async fn retrieve(&self) -> Result<Token, TokenError> {
        debug!("Retrieving token");
        let response = self
            .http
            .post(&self.credentials.token_url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(TokenError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let token = parse_token(&body, Utc::now())?;
        debug!(expires_at = %token.expires_at.to_rfc2822(), "Retrieved token");
        Ok(token)
    }
}

/// Parse a token endpoint response received at `now`.
pub fn parse_token(body: &[u8], now: DateTime<Utc>) -> Result<Token, TokenError> {
    Ok(serde_json::from_slice::<Token>(body)?.issued_at(now))
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn parses_response() {
        let token = parse_token(
            br#"{"access_token": "abc", "expires_in": 300, "token_type": "bearer"}"#,
            now(),
        )
        .unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_at, now() + Duration::seconds(300));
    }

    #[test]
    fn expiry_margin() {
        let token = parse_token(br#"{"access_token": "abc", "expires_in": 300}"#, now()).unwrap();
        assert!(!token.is_almost_expired(now()));
        assert!(!token.is_almost_expired(now() + Duration::seconds(239)));
        assert!(token.is_almost_expired(now() + Duration::seconds(241)));
    }

    #[test]
    fn empty_token_is_expired() {
        let token = parse_token(br#"{"access_token": "", "expires_in": 3600}"#, now()).unwrap();
        assert!(token.is_almost_expired(now()));
    }

    #[test]
    fn invalid_body() {
        assert!(matches!(
            parse_token(b"<html>", now()),
            Err(TokenError::Decode(_))
        ));
    }
}
