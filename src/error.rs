//! Error taxonomy for the credential lifecycle and the counting path.
//!
//! Every failure carries a stable [`ErrorClass`] so the HTTP layer can map it to a
//! status code without looking at message text. Upstream error bodies never end up
//! in the `Display` output of these variants.

use crate::credentials::CipherError;
use std::fmt;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Classification of a provider API fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Access token rejected or insufficient permission.
    Auth,
    /// Quota or rate limit exceeded.
    RateLimit,
    /// Connection to the provider closed or reset mid-request. Reported as an upstream
    /// fault but logged quietly.
    Disconnected,
    /// Anything else (5xx, malformed body, generic transport failure).
    Other,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Disconnected => "disconnected",
            ProviderErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable classification tag consumed by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller can fix it (bad input, missing configuration).
    Client,
    /// Authentication with the provider failed.
    Auth,
    /// Provider rate limit.
    RateLimit,
    /// Provider failed for another reason.
    Upstream,
    /// Local/environmental failure.
    Server,
    /// The caller went away.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    /// Neither an uploaded client secret nor the fallback file is available.
    #[error(
        "OAuth client credentials are not configured: upload them via POST /api/v1/emails/credentials \
         or place a client secret file at {}",
        file_path.display()
    )]
    CredentialsNotConfigured { file_path: PathBuf },

    /// Client secret document failed structural validation.
    #[error("invalid credentials format: {0}")]
    InvalidCredentialsFormat(String),

    /// Stored ciphertext failed integrity verification or could not be decoded.
    #[error("stored credential record '{key}' is corrupted")]
    CorruptedRecord { key: String },

    /// Identity key is not a safe file name.
    #[error("invalid identity key '{0}'")]
    InvalidIdentity(String),

    /// Local callback listener could not bind any port in the range.
    #[error("no free OAuth callback port in range {first}-{last}")]
    CallbackPortExhausted { first: u16, last: u16 },

    /// Token endpoint rejected the authorization code, or the user denied access.
    #[error("authorization failed: {0}")]
    AuthorizationExchange(String),

    /// Refresh grant failed. Absorbed by the refresh policy (falls back to re-authorization).
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Caller-initiated cancellation.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Classified provider API fault.
    #[error("provider API error ({kind})")]
    ProviderApi {
        kind: ProviderErrorKind,
        status: Option<u16>,
    },

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TallyError {
    pub fn provider(kind: ProviderErrorKind, status: Option<u16>) -> Self {
        TallyError::ProviderApi { kind, status }
    }

    /// Stable classification tag.
    pub fn class(&self) -> ErrorClass {
        match self {
            TallyError::CredentialsNotConfigured { .. }
            | TallyError::InvalidCredentialsFormat(_)
            | TallyError::InvalidIdentity(_) => ErrorClass::Client,
            TallyError::AuthorizationExchange(_) | TallyError::TokenRefresh(_) => ErrorClass::Auth,
            TallyError::OperationCancelled => ErrorClass::Cancelled,
            TallyError::ProviderApi { kind, .. } => match kind {
                ProviderErrorKind::Auth => ErrorClass::Auth,
                ProviderErrorKind::RateLimit => ErrorClass::RateLimit,
                ProviderErrorKind::Disconnected | ProviderErrorKind::Other => ErrorClass::Upstream,
            },
            TallyError::CorruptedRecord { .. }
            | TallyError::CallbackPortExhausted { .. }
            | TallyError::Cipher(_)
            | TallyError::Io(_)
            | TallyError::Serialization(_) => ErrorClass::Server,
        }
    }

    /// True only when the caller cancelled the operation.
    pub fn is_cancellation(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// True when the provider connection dropped mid-request. Not logged as a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TallyError::ProviderApi {
                kind: ProviderErrorKind::Disconnected,
                ..
            }
        )
    }
}
