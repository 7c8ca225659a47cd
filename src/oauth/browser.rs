//! Hands the authorization URL to the user.

use tracing::{info, warn};

/// Presents the consent URL to whoever has to approve access.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str);
}

/// Opens the system browser, logging the URL as well in case no browser is available.
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) {
        info!(url = %url, "Open this URL to authorize mail access");
        if let Err(e) = webbrowser::open(url) {
            warn!(error = %e, "Could not open a browser, open the URL manually");
        }
    }
}

/// Only logs the URL (headless deployments).
pub struct LogOnlyBrowser;

impl BrowserOpener for LogOnlyBrowser {
    fn open(&self, url: &str) {
        info!(url = %url, "Open this URL to authorize mail access");
    }
}
