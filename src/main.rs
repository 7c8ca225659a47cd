use anyhow::{Context, Result};
use mailtally::api::{create_router, AppState, CountCache};
use mailtally::config::{load_config, MailTallyConfig};
use mailtally::counting::CountingAggregator;
use mailtally::credentials::{CredentialSourceResolver, EncryptedTokenStore, KeyRecovery};
use mailtally::gmail::GmailSessionFactory;
use mailtally::oauth::{
    AuthorizationFlowController, BrowserOpener, FlowSettings, HttpTokenEndpoint, LogOnlyBrowser,
    SystemBrowser,
};
use mailtally::service::EmailCountService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailtally=info,audit=info".into()),
        )
        .init();

    info!("mailtally starting...");

    let mut config = match std::env::var("MAILTALLY_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => MailTallyConfig::default(),
    };
    config.apply_env_overrides();

    info!(
        bind_addr = %config.server.bind_addr,
        tokens_directory = %config.storage.tokens_directory.display(),
        client_secret_file = %config.oauth.client_secret_file.display(),
        callback_port = config.oauth.callback_port,
        admin_token_set = config.server.admin_token.is_some(),
        "Configuration loaded"
    );
    if config.server.admin_token.is_none() {
        warn!("No admin token configured, credential routes are unrestricted");
    }

    let recovery = if config.storage.regenerate_corrupt_key {
        KeyRecovery::Regenerate
    } else {
        KeyRecovery::Fail
    };
    let store = Arc::new(
        EncryptedTokenStore::open(&config.storage.tokens_directory, recovery)
            .context("Failed to initialize encrypted token store")?,
    );

    let resolver = Arc::new(CredentialSourceResolver::new(
        config.oauth.client_secret_file.clone(),
    ));

    let opener: Arc<dyn BrowserOpener> = if config.oauth.open_browser {
        Arc::new(SystemBrowser)
    } else {
        Arc::new(LogOnlyBrowser)
    };

    let controller = Arc::new(AuthorizationFlowController::new(
        resolver,
        store,
        Arc::new(HttpTokenEndpoint::default()),
        opener,
        FlowSettings::from(&config.oauth),
    ));

    let service = Arc::new(EmailCountService::new(
        controller,
        Arc::new(GmailSessionFactory::new(&config.provider)),
        CountingAggregator::new(config.provider.page_size),
        config.storage.identity.clone(),
    ));

    let state = AppState {
        service,
        count_cache: Arc::new(CountCache::new(Duration::from_secs(
            config.server.count_cache_ttl_seconds,
        ))),
        admin_token: config.server.admin_token.clone(),
    };

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "HTTP API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("mailtally stopped");

    Ok(())
}
