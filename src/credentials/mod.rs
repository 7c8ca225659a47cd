//! Encrypted credential storage for OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       EncryptedTokenStore                │
//! │  - get / set / delete / clear / keys     │
//! │  - atomic temp-file + rename writes      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per write                │
//! │  - Key file <dir>/.keystore (0600)       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       <dir>/<identity>                   │
//! │  - one ciphertext blob per identity      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The OAuth client secret (as opposed to the user's tokens) is handled by
//! [`CredentialSourceResolver`], which never touches disk except to read the
//! configured fallback file.
//!
//! # Usage
//!
//! ```no_run
//! use mailtally::credentials::{CredentialRecord, EncryptedTokenStore, KeyRecovery};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> mailtally::Result<()> {
//! let store = EncryptedTokenStore::open("tokens", KeyRecovery::Fail)?;
//!
//! let record = CredentialRecord {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     expires_at: Some(Utc::now() + Duration::hours(1)),
//!     scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
//! };
//! store.set("user", &record)?;
//!
//! if let Some(record) = store.get("user")? {
//!     println!("expires at {:?}", record.expires_at);
//! }
//!
//! store.delete("user")?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod secrets;
mod storage;

pub use encryption::{
    decrypt, encrypt, load_or_create_key, validate_key, CipherError, EncryptionKey, KeyOrigin,
    KeyRecovery, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use secrets::{ClientSecret, CredentialSourceResolver, SecretSource};
pub use storage::{EncryptedTokenStore, KEY_FILE_NAME};

/// OAuth credential for one user identity.
///
/// Plain data, independent of any provider SDK. Tokens are redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted to the access token
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CredentialRecord {
    /// Time left before expiry. `None` when the provider did not report an expiry.
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|expires_at| expires_at - now)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.has_refresh_token())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_tokens() {
        let record = CredentialRecord {
            access_token: "super-secret-access".to_string(),
            refresh_token: Some("super-secret-refresh".to_string()),
            expires_at: None,
            scopes: vec![],
        };

        let debug = format!("{:?}", record);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("has_refresh_token: true"));
    }

    #[test]
    fn test_blank_refresh_token_does_not_count() {
        let record = CredentialRecord {
            access_token: "a".to_string(),
            refresh_token: Some("  ".to_string()),
            expires_at: None,
            scopes: vec![],
        };
        assert!(!record.has_refresh_token());
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let record: CredentialRecord = serde_json::from_str(r#"{"access_token":"tok"}"#).unwrap();
        assert_eq!(record.access_token, "tok");
        assert!(record.refresh_token.is_none());
        assert!(record.expires_at.is_none());
        assert!(record.scopes.is_empty());
    }

    #[test]
    fn test_remaining_validity() {
        let now = Utc::now();
        let record = CredentialRecord {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: Some(now + Duration::minutes(10)),
            scopes: vec![],
        };
        assert_eq!(record.remaining_validity(now), Some(Duration::minutes(10)));
    }
}
