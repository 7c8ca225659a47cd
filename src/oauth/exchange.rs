//! Token endpoint client.
//!
//! Exchanges authorization codes and refresh tokens for access tokens. Error text coming
//! back from the token endpoint is logged at debug level only; callers get the OAuth error
//! code (`invalid_grant`, ...) and the HTTP status.

use crate::credentials::{ClientSecret, CredentialRecord};
use crate::error::{Result, TallyError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Tokens issued by one grant.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes reported by the endpoint; empty when it did not report any.
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl TokenGrant {
    /// Builds the record to persist.
    ///
    /// Keeps `previous`'s refresh token when the provider did not rotate it, and falls back to
    /// `requested_scopes` (or the previous scopes) when the response carries none.
    pub fn into_record(
        self,
        previous: Option<&CredentialRecord>,
        requested_scopes: &[String],
    ) -> CredentialRecord {
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        let scopes = if !self.scopes.is_empty() {
            self.scopes
        } else if let Some(previous) = previous.filter(|p| !p.scopes.is_empty()) {
            previous.scopes.clone()
        } else {
            requested_scopes.to_vec()
        };

        CredentialRecord {
            access_token: self.access_token,
            refresh_token,
            expires_at: self.expires_at,
            scopes,
        }
    }
}

/// OAuth 2.0 token endpoint operations.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// `grant_type=authorization_code`. Failures are `AuthorizationExchange`.
    async fn exchange_code(
        &self,
        client: &ClientSecret,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant>;

    /// `grant_type=refresh_token`. Failures are `TokenRefresh`.
    async fn refresh(&self, client: &ClientSecret, refresh_token: &str) -> Result<TokenGrant>;
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error response body
#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    error: String,
}

/// [`TokenEndpoint`] over HTTP, posting form-encoded requests to the client's `token_uri`.
#[derive(Clone, Default)]
pub struct HttpTokenEndpoint {
    http_client: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// Posts `form` to the token endpoint. Errors are plain descriptions; the caller wraps them
    /// in the variant matching the grant type.
    async fn request_token(
        &self,
        token_uri: &str,
        form: &HashMap<&str, &str>,
    ) -> std::result::Result<TokenGrant, String> {
        let response = self
            .http_client
            .post(token_uri)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "Token endpoint request failed");
                "token endpoint unreachable".to_string()
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Token endpoint rejected request");

            let code = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| "unknown_error".to_string());
            return Err(format!("token endpoint returned {} ({})", status.as_u16(), code));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|_| "malformed token response".to_string())?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token grant received"
        );

        let expires_at = match token_response.expires_in {
            Some(seconds) => Some(
                expiry_from_now(seconds).ok_or_else(|| "malformed token response".to_string())?,
            ),
            None => None,
        };

        let scopes = token_response
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at,
            scopes,
        })
    }
}

/// Longest token lifetime accepted from the endpoint.
const MAX_EXPIRES_IN_SECONDS: i64 = i32::MAX as i64;

/// Absolute expiry for an `expires_in` lifetime. None when the lifetime is negative or
/// out of range.
fn expiry_from_now(seconds: i64) -> Option<DateTime<Utc>> {
    if !(0..=MAX_EXPIRES_IN_SECONDS).contains(&seconds) {
        return None;
    }
    Utc::now().checked_add_signed(Duration::try_seconds(seconds)?)
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        client: &ClientSecret,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());

        debug!(token_uri = %client.token_uri, "Exchanging authorization code for token");

        self.request_token(&client.token_uri, &form)
            .await
            .map_err(TallyError::AuthorizationExchange)
    }

    async fn refresh(&self, client: &ClientSecret, refresh_token: &str) -> Result<TokenGrant> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());

        debug!(token_uri = %client.token_uri, "Refreshing access token");

        self.request_token(&client.token_uri, &form)
            .await
            .map_err(TallyError::TokenRefresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> ClientSecret {
        ClientSecret {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
            auth_uri: format!("{}/auth", server.url()),
            token_uri: format!("{}/token", server.url()),
            redirect_uris: vec![],
        }
    }

    fn record(refresh: Option<&str>, scopes: &[&str]) -> CredentialRecord {
        CredentialRecord {
            access_token: "old".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "http://localhost:8888/Callback".into()),
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","expires_in":3600,"scope":"s1 s2","token_type":"Bearer"}"#,
            )
            .create_async()
            .await;

        let endpoint = HttpTokenEndpoint::default();
        let grant = endpoint
            .exchange_code(&client_for(&server), "the-code", "http://localhost:8888/Callback")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(grant.access_token, "at");
        assert_eq!(grant.refresh_token.as_deref(), Some("rt"));
        assert_eq!(grant.scopes, vec!["s1".to_string(), "s2".to_string()]);
        let expires_at = grant.expires_at.unwrap();
        assert!(expires_at > Utc::now() + Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Bad Request: secret detail"}"#)
            .create_async()
            .await;

        let endpoint = HttpTokenEndpoint::default();
        let err = endpoint
            .exchange_code(&client_for(&server), "bad", "http://localhost/cb")
            .await
            .unwrap_err();

        match err {
            TallyError::AuthorizationExchange(msg) => {
                assert!(msg.contains("400"));
                assert!(msg.contains("invalid_grant"));
                assert!(!msg.contains("secret detail"));
            }
            other => panic!("expected AuthorizationExchange, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_is_token_refresh_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let endpoint = HttpTokenEndpoint::default();
        let err = endpoint
            .refresh(&client_for(&server), "expired_refresh")
            .await
            .unwrap_err();

        assert!(matches!(err, TallyError::TokenRefresh(_)));
    }

    #[tokio::test]
    async fn test_malformed_token_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let endpoint = HttpTokenEndpoint::default();
        let err = endpoint
            .refresh(&client_for(&server), "rt")
            .await
            .unwrap_err();

        assert!(matches!(err, TallyError::TokenRefresh(ref m) if m == "malformed token response"));
    }

    #[tokio::test]
    async fn test_out_of_range_expires_in_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","expires_in":10000000000000}"#)
            .create_async()
            .await;

        let endpoint = HttpTokenEndpoint::default();
        let err = endpoint
            .refresh(&client_for(&server), "rt")
            .await
            .unwrap_err();

        assert!(matches!(err, TallyError::TokenRefresh(ref m) if m == "malformed token response"));
    }

    #[test]
    fn test_expiry_from_now_bounds() {
        assert!(expiry_from_now(-1).is_none());
        assert!(expiry_from_now(i64::MAX).is_none());
        assert!(expiry_from_now(MAX_EXPIRES_IN_SECONDS + 1).is_none());

        let expiry = expiry_from_now(MAX_EXPIRES_IN_SECONDS).unwrap();
        assert!(expiry > Utc::now() + Duration::days(365 * 60));
        assert!(expiry_from_now(0).unwrap() <= Utc::now());
    }

    #[test]
    fn test_into_record_keeps_unrotated_refresh_token_and_scopes() {
        let previous = record(Some("old-refresh"), &["gmail.readonly"]);
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        };

        let record = grant.into_record(Some(&previous), &["requested".to_string()]);
        assert_eq!(record.access_token, "new");
        assert_eq!(record.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(record.scopes, vec!["gmail.readonly".to_string()]);
    }

    #[test]
    fn test_into_record_prefers_rotated_token_and_requested_scopes() {
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: Some("rotated".to_string()),
            expires_at: None,
            scopes: vec![],
        };

        let record = grant.into_record(Some(&record(Some("old"), &[])), &["requested".to_string()]);
        assert_eq!(record.refresh_token.as_deref(), Some("rotated"));
        assert_eq!(record.scopes, vec!["requested".to_string()]);
    }
}
