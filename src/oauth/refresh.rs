//! Token refresh policy: reuse, refresh, or send the user back through consent.

use super::exchange::TokenEndpoint;
use crate::audit::{self, AuditEvent};
use crate::credentials::{ClientSecret, CredentialRecord};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Outcome of inspecting a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDecision {
    /// Access token is valid past the safety margin.
    Reuse,
    /// Access token is (nearly) expired and a refresh token is available.
    Refresh,
    /// No usable credential: run the authorization-code flow.
    NeedAuth,
}

/// Decides what to do with a loaded credential.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    margin: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl RefreshPolicy {
    pub fn new(margin: Duration) -> Self {
        Self { margin }
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// A record without a reported expiry is reused until the provider rejects it.
    pub fn decide(&self, record: Option<&CredentialRecord>, now: DateTime<Utc>) -> TokenDecision {
        let Some(record) = record else {
            return TokenDecision::NeedAuth;
        };

        match record.remaining_validity(now) {
            None => TokenDecision::Reuse,
            Some(remaining) if remaining > self.margin => TokenDecision::Reuse,
            Some(_) if record.has_refresh_token() => TokenDecision::Refresh,
            Some(_) => TokenDecision::NeedAuth,
        }
    }

    /// Attempts a single refresh of `record`.
    ///
    /// Returns the refreshed record, or `None` when the refresh failed for any reason; the
    /// caller then falls back to re-authorization. Nothing is retried here.
    pub async fn refresh_once(
        &self,
        endpoint: &dyn TokenEndpoint,
        client: &ClientSecret,
        record: &CredentialRecord,
        identity: &str,
    ) -> Option<CredentialRecord> {
        let refresh_token = record.refresh_token.as_deref()?;

        audit::emit(AuditEvent::RefreshAttempted, identity, "started");
        debug!("Refreshing access token ahead of expiry");

        match endpoint.refresh(client, refresh_token).await {
            Ok(grant) => {
                let refreshed = grant.into_record(Some(record), &record.scopes);
                info!(expires_at = ?refreshed.expires_at, "Access token refreshed");
                audit::emit(AuditEvent::RefreshSucceeded, identity, "refreshed");
                Some(refreshed)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, re-authorization required");
                audit::emit(AuditEvent::RefreshFailed, identity, "need_auth");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TallyError};
    use crate::oauth::exchange::TokenGrant;
    use async_trait::async_trait;

    fn record(expires_in: Option<Duration>, refresh: Option<&str>) -> CredentialRecord {
        CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: expires_in.map(|d| Utc::now() + d),
            scopes: vec!["scope".to_string()],
        }
    }

    #[test]
    fn test_decide() {
        let policy = RefreshPolicy::default();
        let now = Utc::now();

        assert_eq!(policy.decide(None, now), TokenDecision::NeedAuth);
        assert_eq!(
            policy.decide(Some(&record(Some(Duration::hours(1)), None)), now),
            TokenDecision::Reuse
        );
        assert_eq!(
            policy.decide(Some(&record(Some(Duration::minutes(2)), Some("rt"))), now),
            TokenDecision::Refresh
        );
        assert_eq!(
            policy.decide(Some(&record(Some(-Duration::hours(1)), Some("rt"))), now),
            TokenDecision::Refresh
        );
        assert_eq!(
            policy.decide(Some(&record(Some(Duration::minutes(2)), None)), now),
            TokenDecision::NeedAuth
        );
        assert_eq!(
            policy.decide(Some(&record(Some(Duration::minutes(2)), Some(" "))), now),
            TokenDecision::NeedAuth
        );
        assert_eq!(policy.decide(Some(&record(None, None)), now), TokenDecision::Reuse);
    }

    #[test]
    fn test_margin_is_configurable() {
        let policy = RefreshPolicy::new(Duration::seconds(30));
        let r = record(Some(Duration::minutes(2)), Some("rt"));
        assert_eq!(policy.decide(Some(&r), Utc::now()), TokenDecision::Reuse);
    }

    struct StaticEndpoint {
        outcome: std::result::Result<(), ()>,
    }

    #[async_trait]
    impl TokenEndpoint for StaticEndpoint {
        async fn exchange_code(&self, _: &ClientSecret, _: &str, _: &str) -> Result<TokenGrant> {
            unreachable!("exchange is not used by the refresh policy")
        }

        async fn refresh(&self, _: &ClientSecret, refresh_token: &str) -> Result<TokenGrant> {
            assert_eq!(refresh_token, "rt");
            match self.outcome {
                Ok(()) => Ok(TokenGrant {
                    access_token: "fresh".to_string(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + Duration::hours(1)),
                    scopes: vec![],
                }),
                Err(()) => Err(TallyError::TokenRefresh("invalid_grant".to_string())),
            }
        }
    }

    fn client() -> ClientSecret {
        ClientSecret {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            auth_uri: "https://a.example/auth".to_string(),
            token_uri: "https://a.example/token".to_string(),
            redirect_uris: vec![],
        }
    }

    #[tokio::test]
    async fn test_refresh_once_success_keeps_refresh_token() {
        let policy = RefreshPolicy::default();
        let endpoint = StaticEndpoint { outcome: Ok(()) };
        let old = record(Some(Duration::minutes(1)), Some("rt"));

        let refreshed = policy
            .refresh_once(&endpoint, &client(), &old, "user")
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "fresh");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("rt"));
        assert_eq!(refreshed.scopes, vec!["scope".to_string()]);
        assert_eq!(policy.decide(Some(&refreshed), Utc::now()), TokenDecision::Reuse);
    }

    #[tokio::test]
    async fn test_refresh_once_failure_yields_none() {
        let policy = RefreshPolicy::default();
        let endpoint = StaticEndpoint { outcome: Err(()) };
        let old = record(Some(Duration::minutes(1)), Some("rt"));

        assert!(policy
            .refresh_once(&endpoint, &client(), &old, "user")
            .await
            .is_none());
    }
}
