//! Gmail API client session.
//!
//! A [`GmailSession`] holds one access token and is created per counting call by a
//! [`SessionFactory`]. Failures are classified from the HTTP status and the structured Google
//! error body; the body itself is only logged at debug level.

use crate::config::ProviderConfig;
use crate::credentials::CredentialRecord;
use crate::error::{ProviderErrorKind, Result, TallyError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::error::Error as _;
use std::io::ErrorKind;
use tracing::debug;

/// One page of a message listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub message_count: usize,
    /// Continuation cursor. `None` (or empty) on the last page.
    pub next_page_token: Option<String>,
}

/// Paginated message listing.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<MessagePage>;
}

/// Opens a provider session for an authorized credential.
pub trait SessionFactory: Send + Sync {
    fn open(&self, record: &CredentialRecord) -> Box<dyn MailProvider>;
}

/// Gmail `users.messages.list` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    #[allow(dead_code)]
    id: String,
}

/// Google API error envelope
#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

/// Authorized Gmail API session for one call.
pub struct GmailSession {
    access_token: String,
    http_client: Client,
    base_url: String,
    user_id: String,
}

impl GmailSession {
    pub fn new(access_token: String, http_client: Client, base_url: String, user_id: String) -> Self {
        Self {
            access_token,
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id,
        }
    }
}

#[async_trait]
impl MailProvider for GmailSession {
    async fn list_messages(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<MessagePage> {
        let url = format!(
            "{}/gmail/v1/users/{}/messages",
            self.base_url,
            urlencoding::encode(&self.user_id)
        );

        let mut params = vec![("q", query.to_string()), ("maxResults", page_size.to_string())];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Gmail API request failed");
            return Err(TallyError::provider(
                classify_status(status, &body),
                Some(status.as_u16()),
            ));
        }

        let page: ListMessagesResponse = response.json().await.map_err(|e| {
            debug!(error = %e, "Failed to parse Gmail list response");
            transport_error(e)
        })?;

        Ok(MessagePage {
            message_count: page.messages.len(),
            next_page_token: page.next_page_token,
        })
    }
}

/// Builds [`GmailSession`]s sharing one HTTP connection pool.
pub struct GmailSessionFactory {
    http_client: Client,
    base_url: String,
    user_id: String,
}

impl GmailSessionFactory {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http_client: Client, config: &ProviderConfig) -> Self {
        Self {
            http_client,
            base_url: config.api_base_url.clone(),
            user_id: config.user_id.clone(),
        }
    }
}

impl SessionFactory for GmailSessionFactory {
    fn open(&self, record: &CredentialRecord) -> Box<dyn MailProvider> {
        Box::new(GmailSession::new(
            record.access_token.clone(),
            self.http_client.clone(),
            self.base_url.clone(),
            self.user_id.clone(),
        ))
    }
}

/// Classifies a failed Gmail response from its status and structured error body.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    let error = serde_json::from_str::<GoogleErrorBody>(body).ok().map(|b| b.error);

    let rate_limited = error.as_ref().is_some_and(|e| {
        e.status.as_deref() == Some("RESOURCE_EXHAUSTED")
            || e.errors.iter().any(|item| {
                matches!(
                    item.reason.as_deref(),
                    Some(
                        "rateLimitExceeded"
                            | "userRateLimitExceeded"
                            | "quotaExceeded"
                            | "dailyLimitExceeded"
                    )
                )
            })
    });

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimit,
        StatusCode::FORBIDDEN if rate_limited => ProviderErrorKind::RateLimit,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorKind::Auth,
        _ if rate_limited => ProviderErrorKind::RateLimit,
        _ => ProviderErrorKind::Other,
    }
}

/// Maps a transport failure, recognizing closed/reset connections.
fn transport_error(error: reqwest::Error) -> TallyError {
    let disconnected = {
        let mut source = error.source();
        let mut found = false;
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::UnexpectedEof
                ) {
                    found = true;
                    break;
                }
            }
            source = cause.source();
        }
        found
    };

    if disconnected {
        debug!("Gmail connection closed mid-request");
        TallyError::provider(ProviderErrorKind::Disconnected, None)
    } else {
        debug!(error = %error, "Gmail transport error");
        TallyError::provider(ProviderErrorKind::Other, error.status().map(|s| s.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn session(server: &mockito::ServerGuard) -> GmailSession {
        GmailSession::new(
            "test_token".to_string(),
            Client::new(),
            server.url(),
            "me".to_string(),
        )
    }

    #[tokio::test]
    async fn test_list_messages_sends_query_and_parses_page() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_header("authorization", "Bearer test_token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "from:alice@example.com".into()),
                Matcher::UrlEncoded("maxResults".into(), "500".into()),
                Matcher::UrlEncoded("pageToken".into(), "cursor-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"messages":[{"id":"1","threadId":"t"},{"id":"2","threadId":"t"}],"nextPageToken":"cursor-2","resultSizeEstimate":2}"#,
            )
            .create_async()
            .await;

        let page = session(&server)
            .list_messages("from:alice@example.com", 500, Some("cursor-1"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.message_count, 2);
        assert_eq!(page.next_page_token.as_deref(), Some("cursor-2"));
    }

    #[tokio::test]
    async fn test_empty_result_has_no_messages_field() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"resultSizeEstimate":0}"#)
            .create_async()
            .await;

        let page = session(&server).list_messages("from:x@y.z", 500, None).await.unwrap();
        assert_eq!(page, MessagePage { message_count: 0, next_page_token: None });
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_fault() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":{"code":401,"message":"Invalid Credentials","status":"UNAUTHENTICATED"}}"#)
            .create_async()
            .await;

        let err = session(&server).list_messages("q", 500, None).await.unwrap_err();
        assert!(matches!(
            err,
            TallyError::ProviderApi { kind: ProviderErrorKind::Auth, status: Some(401) }
        ));
        assert!(!err.to_string().contains("Invalid Credentials"));
    }

    #[tokio::test]
    async fn test_server_error_is_other() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("backend unavailable")
            .create_async()
            .await;

        let err = session(&server).list_messages("q", 500, None).await.unwrap_err();
        assert!(matches!(
            err,
            TallyError::ProviderApi { kind: ProviderErrorKind::Other, status: Some(503) }
        ));
    }

    #[test]
    fn test_classify_status() {
        let rate_body = r#"{"error":{"code":403,"errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        let denied_body = r#"{"error":{"code":403,"status":"PERMISSION_DENIED","errors":[{"reason":"insufficientPermissions"}]}}"#;

        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), ProviderErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, rate_body), ProviderErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, denied_body), ProviderErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, "not json"), ProviderErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, "{}"), ProviderErrorKind::Other);
        assert_eq!(
            classify_status(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
            ),
            ProviderErrorKind::RateLimit
        );
    }

    #[test]
    fn test_factory_opens_session_with_record_token() {
        let factory = GmailSessionFactory::new(&ProviderConfig::default());
        let record = CredentialRecord {
            access_token: "abc".to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        };
        // Boxed trait object; the token is only observable through requests
        let _session: Box<dyn MailProvider> = factory.open(&record);
    }
}
