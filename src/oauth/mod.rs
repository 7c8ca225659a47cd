//! OAuth 2.0 authorization for the mail provider.
//!
//! Implements the installed-app authorization code flow:
//! 1. Resolve the client secret (upload, else file)
//! 2. Load the stored credential and decide: reuse, refresh, or re-authorize
//! 3. Re-authorization binds a loopback listener, opens the consent URL in a browser,
//!    and waits for the provider to redirect back with a code
//! 4. Exchange the code for tokens, persist them encrypted
//!
//! Refresh and persistence are serialized per identity, so concurrent callers that find
//! the same expiring token refresh it once.

mod browser;
mod callback;
mod exchange;
mod provider;
mod refresh;

pub use browser::{BrowserOpener, LogOnlyBrowser, SystemBrowser};
pub use callback::CallbackListener;
pub use exchange::{HttpTokenEndpoint, TokenEndpoint, TokenGrant};
pub use provider::AuthorizationRequest;
pub use refresh::{RefreshPolicy, TokenDecision};

use crate::audit::{self, AuditEvent};
use crate::config::OAuthConfig;
use crate::credentials::{
    ClientSecret, CredentialRecord, CredentialSourceResolver, EncryptedTokenStore,
};
use crate::error::{Result, TallyError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callback listener and consent parameters.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub callback_host: String,
    pub callback_port: u16,
    pub callback_port_attempts: u16,
    pub callback_path: String,
    pub scopes: Vec<String>,
    pub refresh_margin: chrono::Duration,
}

impl From<&OAuthConfig> for FlowSettings {
    fn from(config: &OAuthConfig) -> Self {
        Self {
            callback_host: config.callback_host.clone(),
            callback_port: config.callback_port,
            callback_port_attempts: config.callback_port_attempts,
            callback_path: config.callback_path.clone(),
            scopes: config.scopes.clone(),
            // Capped at a day
            refresh_margin: chrono::Duration::seconds(config.refresh_margin_seconds.min(86_400) as i64),
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from(&OAuthConfig::default())
    }
}

/// Produces an authorized credential for an identity, running whichever part of the
/// authorization lifecycle is needed.
pub struct AuthorizationFlowController {
    resolver: Arc<CredentialSourceResolver>,
    store: Arc<EncryptedTokenStore>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    opener: Arc<dyn BrowserOpener>,
    settings: FlowSettings,
    policy: RefreshPolicy,
    /// Last authorized record per identity
    cache: RwLock<HashMap<String, CredentialRecord>>,
    /// Per-identity async locks around refresh/authorize + persist
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AuthorizationFlowController {
    pub fn new(
        resolver: Arc<CredentialSourceResolver>,
        store: Arc<EncryptedTokenStore>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        opener: Arc<dyn BrowserOpener>,
        settings: FlowSettings,
    ) -> Self {
        let policy = RefreshPolicy::new(settings.refresh_margin);
        Self {
            resolver,
            store,
            token_endpoint,
            opener,
            settings,
            policy,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<CredentialSourceResolver> {
        &self.resolver
    }

    /// Returns a usable credential for `identity`.
    ///
    /// May block for as long as the user takes to approve access in the browser when no
    /// usable credential exists. A corrupted stored record is discarded and treated as absent.
    ///
    /// # Errors
    /// * `CredentialsNotConfigured` / `InvalidCredentialsFormat` - no usable client secret
    /// * `CallbackPortExhausted` - no callback port could be bound
    /// * `AuthorizationExchange` - the user denied access or the code was rejected
    pub async fn authorize(&self, identity: &str) -> Result<CredentialRecord> {
        if let Some(record) = self.cached(identity) {
            if self.policy.decide(Some(&record), Utc::now()) == TokenDecision::Reuse {
                debug!("Reusing cached credential");
                return Ok(record);
            }
        }

        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        let client = self.resolver.resolve()?;

        // Re-read under the lock: a concurrent caller may have refreshed already
        let existing = self.load_existing(identity)?;

        match self.policy.decide(existing.as_ref(), Utc::now()) {
            TokenDecision::Reuse => {
                if let Some(record) = existing {
                    self.cache_record(identity, &record);
                    return Ok(record);
                }
            }
            TokenDecision::Refresh => {
                if let Some(record) = existing.as_ref() {
                    if let Some(refreshed) = self
                        .policy
                        .refresh_once(self.token_endpoint.as_ref(), &client, record, identity)
                        .await
                    {
                        self.persist(identity, &refreshed)?;
                        return Ok(refreshed);
                    }
                }
            }
            TokenDecision::NeedAuth => {}
        }

        let record = match self.run_consent_flow(&client).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Authorization failed");
                audit::emit(AuditEvent::AuthorizationFailed, identity, error_outcome(&e));
                return Err(e);
            }
        };

        self.persist(identity, &record)?;
        info!(identity = %audit::mask_identity(identity), "Authorization completed");
        audit::emit(AuditEvent::AuthorizationCompleted, identity, "authorized");
        Ok(record)
    }

    /// Loads the stored record, discarding it if it fails integrity checks.
    pub fn load_existing(&self, identity: &str) -> Result<Option<CredentialRecord>> {
        match self.store.get(identity) {
            Ok(record) => Ok(record),
            Err(TallyError::CorruptedRecord { .. }) => {
                warn!(
                    identity = %audit::mask_identity(identity),
                    "Stored credential is corrupted, discarding it"
                );
                self.store.delete(identity)?;
                self.invalidate(identity);
                audit::emit(AuditEvent::CorruptedRecordDiscarded, identity, "need_auth");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Forgets the in-memory copy so the next call re-evaluates the stored record.
    pub fn invalidate(&self, identity: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
    }

    /// Records that the provider rejected `access_token` for `identity`.
    ///
    /// The stored record is marked expired so the next [`authorize`](Self::authorize) refreshes
    /// it, or re-authorizes when there is no refresh token. No-op when the stored token has
    /// already been replaced by a concurrent caller.
    pub async fn reject_access_token(&self, identity: &str, access_token: &str) -> Result<()> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        self.invalidate(identity);

        if let Some(mut record) = self.load_existing(identity)? {
            if record.access_token == access_token {
                record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
                self.store.set(identity, &record)?;
                info!(
                    identity = %audit::mask_identity(identity),
                    "Access token rejected by provider, marked expired"
                );
            }
        }
        Ok(())
    }

    /// Deletes every stored credential and empties the in-memory cache.
    ///
    /// Returns the number of stored records removed.
    pub fn revoke_all(&self) -> Result<usize> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let removed = self.store.clear()?;
        audit::emit(AuditEvent::CredentialCleared, "all", &format!("removed_{}", removed));
        Ok(removed)
    }

    /// Whether a credential is stored for `identity`. Does not validate it.
    pub fn has_credential(&self, identity: &str) -> Result<bool> {
        if self.cached(identity).is_some() {
            return Ok(true);
        }
        Ok(self.store.keys()?.iter().any(|key| key == identity))
    }

    /// NEED_AUTH path: bind, open consent URL, wait, exchange.
    async fn run_consent_flow(&self, client: &ClientSecret) -> Result<CredentialRecord> {
        let listener = CallbackListener::bind(
            &self.settings.callback_host,
            self.settings.callback_port,
            self.settings.callback_port_attempts,
            &self.settings.callback_path,
        )
        .await?;

        let state = Uuid::new_v4().to_string();
        let redirect_uri = listener.redirect_uri().to_string();
        let url = AuthorizationRequest {
            client,
            redirect_uri: &redirect_uri,
            scopes: &self.settings.scopes,
            state: &state,
        }
        .build_url();

        info!(port = listener.port(), "Waiting for user to approve access");
        self.opener.open(&url);

        // Listener is consumed here and closed before the exchange
        let code = listener.wait_for_code(&state).await?;

        let grant = self
            .token_endpoint
            .exchange_code(client, &code, &redirect_uri)
            .await?;

        Ok(grant.into_record(None, &self.settings.scopes))
    }

    fn persist(&self, identity: &str, record: &CredentialRecord) -> Result<()> {
        self.store.set(identity, record)?;
        self.cache_record(identity, record);
        audit::emit(AuditEvent::CredentialStored, identity, "stored");
        Ok(())
    }

    fn cached(&self, identity: &str) -> Option<CredentialRecord> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    fn cache_record(&self, identity: &str, record: &CredentialRecord) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.to_string(), record.clone());
    }

    fn identity_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }
}

fn error_outcome(error: &TallyError) -> &'static str {
    match error {
        TallyError::CallbackPortExhausted { .. } => "port_exhausted",
        TallyError::AuthorizationExchange(_) => "exchange_failed",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthConfig;

    #[test]
    fn test_flow_settings_from_config() {
        let config = OAuthConfig {
            callback_port: 9000,
            refresh_margin_seconds: 60,
            ..OAuthConfig::default()
        };

        let settings = FlowSettings::from(&config);
        assert_eq!(settings.callback_port, 9000);
        assert_eq!(settings.callback_port_attempts, 3);
        assert_eq!(settings.refresh_margin, chrono::Duration::seconds(60));
        assert_eq!(settings.callback_path, "/Callback");
    }

    #[test]
    fn test_error_outcome_tags() {
        assert_eq!(
            error_outcome(&TallyError::CallbackPortExhausted { first: 1, last: 3 }),
            "port_exhausted"
        );
        assert_eq!(
            error_outcome(&TallyError::AuthorizationExchange("x".into())),
            "exchange_failed"
        );
    }
}
