use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete mailtally configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailTallyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer token required on credential routes. Unset = unrestricted.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Freshness window of the per-sender count cache (seconds, 0 disables it)
    #[serde(default = "default_count_cache_ttl")]
    pub count_cache_ttl_seconds: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_count_cache_ttl() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
            count_cache_ttl_seconds: default_count_cache_ttl(),
        }
    }
}

/// OAuth authorization flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Fallback client secret file, used when nothing was uploaded
    #[serde(default = "default_client_secret_file")]
    pub client_secret_file: PathBuf,
    /// Host name placed in the redirect URI (the listener always binds 127.0.0.1)
    #[serde(default = "default_callback_host")]
    pub callback_host: String,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    /// Consecutive ports tried when the callback port is taken
    #[serde(default = "default_callback_port_attempts")]
    pub callback_port_attempts: u16,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Remaining validity below which a token is refreshed (seconds)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: u64,
    /// Open the authorization URL in the system browser (otherwise it is only logged)
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

fn default_client_secret_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_callback_host() -> String {
    "localhost".to_string()
}

fn default_callback_port() -> u16 {
    8888
}

fn default_callback_port_attempts() -> u16 {
    3
}

fn default_callback_path() -> String {
    "/Callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()]
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_open_browser() -> bool {
    true
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_secret_file: default_client_secret_file(),
            callback_host: default_callback_host(),
            callback_port: default_callback_port(),
            callback_port_attempts: default_callback_port_attempts(),
            callback_path: default_callback_path(),
            scopes: default_scopes(),
            refresh_margin_seconds: default_refresh_margin(),
            open_browser: default_open_browser(),
        }
    }
}

/// Encrypted token store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_tokens_directory")]
    pub tokens_directory: PathBuf,
    /// Identity key the single user's credential is stored under
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Replace an unreadable key file instead of refusing to start
    #[serde(default = "default_regenerate_corrupt_key")]
    pub regenerate_corrupt_key: bool,
}

fn default_tokens_directory() -> PathBuf {
    PathBuf::from("tokens")
}

fn default_identity() -> String {
    "user".to_string()
}

fn default_regenerate_corrupt_key() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tokens_directory: default_tokens_directory(),
            identity: default_identity(),
            regenerate_corrupt_key: default_regenerate_corrupt_key(),
        }
    }
}

/// Mail provider API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_api_base_url() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_user_id() -> String {
    "me".to_string()
}

fn default_page_size() -> u32 {
    500
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_id: default_user_id(),
            page_size: default_page_size(),
        }
    }
}

impl MailTallyConfig {
    /// Applies `MAILTALLY_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAILTALLY_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("MAILTALLY_ADMIN_TOKEN") {
            self.server.admin_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("MAILTALLY_TOKENS_DIR") {
            self.storage.tokens_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("MAILTALLY_CREDENTIALS_FILE") {
            self.oauth.client_secret_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("MAILTALLY_CALLBACK_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.oauth.callback_port = port;
            }
        }
        if let Some(v) = lookup("MAILTALLY_OPEN_BROWSER") {
            if let Ok(b) = v.parse::<bool>() {
                self.oauth.open_browser = b;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<MailTallyConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: MailTallyConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = MailTallyConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.server.count_cache_ttl_seconds, 300);
        assert_eq!(config.oauth.callback_port, 8888);
        assert_eq!(config.oauth.callback_port_attempts, 3);
        assert_eq!(config.oauth.callback_path, "/Callback");
        assert_eq!(config.oauth.refresh_margin_seconds, 300);
        assert_eq!(config.storage.identity, "user");
        assert!(config.storage.regenerate_corrupt_key);
        assert_eq!(config.provider.page_size, 500);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "0.0.0.0:9000"
            admin_token = "secret"
            count_cache_ttl_seconds = 60

            [oauth]
            client_secret_file = "/etc/mailtally/client.json"
            callback_port = 9999
            callback_port_attempts = 5
            scopes = ["a", "b"]
            open_browser = false

            [storage]
            tokens_directory = "/var/lib/mailtally"
            identity = "alice"

            [provider]
            api_base_url = "http://localhost:1234"
            page_size = 100
        "#;

        let config: MailTallyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.oauth.callback_port, 9999);
        assert_eq!(config.oauth.scopes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.oauth.open_browser, false);
        assert_eq!(config.storage.tokens_directory, PathBuf::from("/var/lib/mailtally"));
        assert_eq!(config.provider.api_base_url, "http://localhost:1234");
        assert_eq!(config.provider.user_id, "me"); // Default
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [oauth]
            callback_port = 7777
        "#;

        let config: MailTallyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.oauth.callback_port, 7777);
        assert_eq!(config.oauth.callback_host, "localhost"); // Default
        assert_eq!(config.storage.tokens_directory, PathBuf::from("tokens")); // Default
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MAILTALLY_BIND_ADDR", "0.0.0.0:1"),
            ("MAILTALLY_ADMIN_TOKEN", "tok"),
            ("MAILTALLY_CALLBACK_PORT", "not-a-port"),
            ("MAILTALLY_OPEN_BROWSER", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = MailTallyConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.bind_addr, "0.0.0.0:1");
        assert_eq!(config.server.admin_token.as_deref(), Some("tok"));
        assert_eq!(config.oauth.callback_port, 8888); // Unparseable, ignored
        assert!(!config.oauth.open_browser);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/mailtally.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mailtally.toml"));
    }
}
