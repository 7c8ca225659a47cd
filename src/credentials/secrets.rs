//! OAuth client secret document and the resolver that picks where it comes from.

use crate::audit::{self, AuditEvent};
use crate::error::{Result, TallyError};
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// OAuth client registration used for one authorization attempt.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Google console download format: the registration sits under `installed` or `web`.
#[derive(Deserialize)]
struct WrappedClientSecret {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    /// Parses and validates a client secret JSON document.
    ///
    /// Accepts the `{"installed": {...}}` / `{"web": {...}}` wrappers as well as a bare object.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| TallyError::InvalidCredentialsFormat(format!("not valid JSON: {}", e)))?;

        let secret = if value.get("installed").is_some() || value.get("web").is_some() {
            let wrapped: WrappedClientSecret = serde_json::from_value(value).map_err(invalid_shape)?;
            wrapped.installed.or(wrapped.web).ok_or_else(|| {
                TallyError::InvalidCredentialsFormat("empty 'installed'/'web' section".to_string())
            })?
        } else {
            serde_json::from_value(value).map_err(invalid_shape)?
        };

        secret.validate()?;
        Ok(secret)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("auth_uri", &self.auth_uri),
            ("token_uri", &self.token_uri),
        ] {
            if value.trim().is_empty() {
                return Err(TallyError::InvalidCredentialsFormat(format!(
                    "'{}' must not be empty",
                    name
                )));
            }
        }

        for (name, value) in [("auth_uri", &self.auth_uri), ("token_uri", &self.token_uri)] {
            let url = Url::parse(value).map_err(|_| {
                TallyError::InvalidCredentialsFormat(format!("'{}' is not an absolute URL", name))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(TallyError::InvalidCredentialsFormat(format!(
                    "'{}' must use http or https",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn invalid_shape(e: serde_json::Error) -> TallyError {
    TallyError::InvalidCredentialsFormat(format!("missing or mistyped field: {}", e))
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecret")
            .field("client_id", &audit::mask_identity(&self.client_id))
            .field("client_secret", &"<redacted>")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .field("redirect_uris", &self.redirect_uris)
            .finish()
    }
}

/// Where the active client secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Uploaded,
    File,
}

/// Chooses between an administratively uploaded client secret and the fallback file.
///
/// The uploaded document is owned by this instance and shared by injection; there is no
/// global "current credentials" slot.
pub struct CredentialSourceResolver {
    uploaded: RwLock<Option<ClientSecret>>,
    fallback_path: PathBuf,
}

impl CredentialSourceResolver {
    pub fn new<P: Into<PathBuf>>(fallback_path: P) -> Self {
        Self {
            uploaded: RwLock::new(None),
            fallback_path: fallback_path.into(),
        }
    }

    pub fn fallback_path(&self) -> &Path {
        &self.fallback_path
    }

    /// Validates `raw` and makes it the active client secret.
    ///
    /// An invalid document is rejected and the previous upload (if any) stays active.
    pub fn upload(&self, raw: &str) -> Result<()> {
        let secret = ClientSecret::parse(raw)?;
        *self.uploaded.write().unwrap_or_else(PoisonError::into_inner) = Some(secret);

        info!("Client secret uploaded");
        audit::emit(AuditEvent::ClientSecretUploaded, "client_secret", "accepted");
        Ok(())
    }

    /// Drops the uploaded document. Returns whether one was present.
    pub fn clear_upload(&self) -> bool {
        let had_upload = self
            .uploaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();

        if had_upload {
            audit::emit(AuditEvent::ClientSecretCleared, "client_secret", "cleared");
        }
        had_upload
    }

    pub fn has_upload(&self) -> bool {
        self.uploaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn fallback_available(&self) -> bool {
        self.fallback_path.is_file()
    }

    /// Source `resolve()` would use right now, without reading the file.
    pub fn active_source(&self) -> Option<SecretSource> {
        if self.has_upload() {
            Some(SecretSource::Uploaded)
        } else if self.fallback_available() {
            Some(SecretSource::File)
        } else {
            None
        }
    }

    /// Returns the uploaded document, else the parsed fallback file.
    ///
    /// # Errors
    /// * `CredentialsNotConfigured` - no upload and no fallback file
    /// * `InvalidCredentialsFormat` - the fallback file exists but is not a valid document
    pub fn resolve(&self) -> Result<ClientSecret> {
        if let Some(secret) = self
            .uploaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            debug!("Using uploaded client secret");
            return Ok(secret.clone());
        }

        let raw = match std::fs::read_to_string(&self.fallback_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TallyError::CredentialsNotConfigured {
                    file_path: self.fallback_path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        debug!(path = %self.fallback_path.display(), "Using client secret file");
        ClientSecret::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INSTALLED: &str = r#"{
        "installed": {
            "client_id": "1234.apps.googleusercontent.com",
            "client_secret": "shh",
            "auth_uri": "https://accounts.google.com/o/oauth2/auth",
            "token_uri": "https://oauth2.googleapis.com/token",
            "redirect_uris": ["http://localhost"]
        }
    }"#;

    fn bare(client_id: &str) -> String {
        format!(
            r#"{{"client_id":"{}","client_secret":"s","auth_uri":"https://a.example/auth","token_uri":"https://a.example/token"}}"#,
            client_id
        )
    }

    #[test]
    fn test_parse_installed_wrapper() {
        let secret = ClientSecret::parse(INSTALLED).unwrap();
        assert_eq!(secret.client_id, "1234.apps.googleusercontent.com");
        assert_eq!(secret.token_uri, "https://oauth2.googleapis.com/token");
        assert_eq!(secret.redirect_uris, vec!["http://localhost".to_string()]);
    }

    #[test]
    fn test_parse_web_wrapper_and_bare_object() {
        let web = format!(r#"{{"web": {}}}"#, bare("web-client"));
        assert_eq!(ClientSecret::parse(&web).unwrap().client_id, "web-client");
        assert_eq!(ClientSecret::parse(&bare("bare-client")).unwrap().client_id, "bare-client");
    }

    #[test]
    fn test_parse_rejects_invalid_documents() {
        let cases = [
            "not json".to_string(),
            "{}".to_string(),
            r#"{"installed": {"client_id": "x"}}"#.to_string(),
            bare(""),
            r#"{"client_id":"x","client_secret":"s","auth_uri":"relative/path","token_uri":"https://a/t"}"#
                .to_string(),
            r#"{"client_id":"x","client_secret":"s","auth_uri":"ftp://a/auth","token_uri":"https://a/t"}"#
                .to_string(),
        ];

        for raw in cases {
            assert!(
                matches!(ClientSecret::parse(&raw), Err(TallyError::InvalidCredentialsFormat(_))),
                "document should be rejected: {}",
                raw
            );
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = ClientSecret::parse(INSTALLED).unwrap();
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("shh"));
    }

    #[test]
    fn test_resolve_not_configured() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let resolver = CredentialSourceResolver::new(&path);

        match resolver.resolve() {
            Err(TallyError::CredentialsNotConfigured { file_path }) => assert_eq!(file_path, path),
            other => panic!("expected CredentialsNotConfigured, got {:?}", other),
        }
        assert_eq!(resolver.active_source(), None);
    }

    #[test]
    fn test_upload_takes_precedence_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, bare("from-file")).unwrap();

        let resolver = CredentialSourceResolver::new(&path);
        assert_eq!(resolver.active_source(), Some(SecretSource::File));
        assert_eq!(resolver.resolve().unwrap().client_id, "from-file");

        resolver.upload(&bare("from-upload")).unwrap();
        assert_eq!(resolver.active_source(), Some(SecretSource::Uploaded));
        assert_eq!(resolver.resolve().unwrap().client_id, "from-upload");

        assert!(resolver.clear_upload());
        assert!(!resolver.clear_upload());
        assert_eq!(resolver.resolve().unwrap().client_id, "from-file");
    }

    #[test]
    fn test_invalid_upload_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let resolver = CredentialSourceResolver::new(dir.path().join("missing.json"));

        resolver.upload(&bare("good")).unwrap();
        assert!(matches!(
            resolver.upload("{\"installed\": 5}"),
            Err(TallyError::InvalidCredentialsFormat(_))
        ));
        assert_eq!(resolver.resolve().unwrap().client_id, "good");
    }

    #[test]
    fn test_invalid_fallback_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{ broken").unwrap();

        let resolver = CredentialSourceResolver::new(&path);
        assert!(matches!(
            resolver.resolve(),
            Err(TallyError::InvalidCredentialsFormat(_))
        ));
    }
}
