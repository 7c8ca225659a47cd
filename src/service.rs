//! Email counting service: authorization, provider session, and aggregation for one request.

use crate::audit::{self, AuditEvent};
use crate::counting::CountingAggregator;
use crate::error::{ProviderErrorKind, Result, TallyError};
use crate::gmail::SessionFactory;
use crate::oauth::AuthorizationFlowController;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the service's credentials stand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    /// A client secret has been uploaded and is active
    pub uploaded: bool,
    /// The fallback client secret file exists
    pub file_available: bool,
    /// A user credential is stored
    pub authorized: bool,
}

/// Result of clearing credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedCredentials {
    pub upload_cleared: bool,
    pub tokens_removed: usize,
}

pub struct EmailCountService {
    controller: Arc<AuthorizationFlowController>,
    sessions: Arc<dyn SessionFactory>,
    aggregator: CountingAggregator,
    identity: String,
}

impl EmailCountService {
    pub fn new(
        controller: Arc<AuthorizationFlowController>,
        sessions: Arc<dyn SessionFactory>,
        aggregator: CountingAggregator,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            sessions,
            aggregator,
            identity: identity.into(),
        }
    }

    /// Counts messages from `sender` (already validated).
    ///
    /// Authorization may wait for the user's browser approval; cancellation is honored
    /// between page requests.
    pub async fn count_emails(&self, sender: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(TallyError::OperationCancelled);
        }

        let record = self.controller.authorize(&self.identity).await?;
        let session = self.sessions.open(&record);

        match self.aggregator.count(session.as_ref(), sender, cancel).await {
            Ok(count) => Ok(count),
            Err(e) => {
                if let TallyError::ProviderApi { kind, status } = &e {
                    if !e.is_disconnect() {
                        warn!(kind = %kind, status = ?status, "Provider fault while counting");
                        audit::emit(AuditEvent::ProviderFault, &self.identity, kind.as_str());
                    }
                    if *kind == ProviderErrorKind::Auth {
                        if let Err(reject_err) = self
                            .controller
                            .reject_access_token(&self.identity, &record.access_token)
                            .await
                        {
                            warn!(error = %reject_err, "Failed to mark rejected access token");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Validates and activates an uploaded client secret document.
    pub fn upload_client_secret(&self, raw: &str) -> Result<()> {
        self.controller.resolver().upload(raw)
    }

    /// Drops the uploaded client secret and every stored user credential.
    ///
    /// The encryption key file is kept.
    pub fn clear_credentials(&self) -> Result<ClearedCredentials> {
        let upload_cleared = self.controller.resolver().clear_upload();
        let tokens_removed = self.controller.revoke_all()?;

        info!(upload_cleared, tokens_removed, "Credentials cleared");
        Ok(ClearedCredentials {
            upload_cleared,
            tokens_removed,
        })
    }

    pub fn status(&self) -> Result<CredentialStatus> {
        let resolver = self.controller.resolver();
        Ok(CredentialStatus {
            uploaded: resolver.has_upload(),
            file_available: resolver.fallback_available(),
            authorized: self.controller.has_credential(&self.identity)?,
        })
    }
}
