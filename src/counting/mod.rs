//! Counting aggregator: total messages from one sender across every result page.

use crate::audit::{self, AuditEvent};
use crate::error::{Result, TallyError};
use crate::gmail::MailProvider;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default page size (the Gmail API maximum).
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Builds the provider search query for messages sent by `sender`.
pub fn sender_query(sender: &str) -> String {
    format!("from:{}", sender)
}

/// Paginates a sender query and sums the page sizes.
#[derive(Debug, Clone, Copy)]
pub struct CountingAggregator {
    page_size: u32,
}

impl Default for CountingAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl CountingAggregator {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.clamp(1, DEFAULT_PAGE_SIZE),
        }
    }

    /// Counts messages from `sender`, stopping only when the provider returns no cursor.
    ///
    /// Read-only: calling it twice without provider-side changes returns the same total.
    ///
    /// # Errors
    /// * `OperationCancelled` - `cancel` fired before or during a page request
    /// * `ProviderApi` - classified provider fault, including a dropped provider connection
    pub async fn count(
        &self,
        provider: &dyn MailProvider,
        sender: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let query = sender_query(sender);
        let masked = audit::mask_email(sender);

        let mut total: u64 = 0;
        let mut pages: u32 = 0;
        let mut page_token: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                info!(sender = %masked, pages, "Count cancelled by caller");
                audit::emit(AuditEvent::AggregationCancelled, sender, "cancelled");
                return Err(TallyError::OperationCancelled);
            }

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(sender = %masked, pages, "Count cancelled during page request");
                    audit::emit(AuditEvent::AggregationCancelled, sender, "cancelled");
                    return Err(TallyError::OperationCancelled);
                }
                page = provider.list_messages(&query, self.page_size, page_token.as_deref()) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_disconnect() => {
                    info!(sender = %masked, pages, "Provider connection closed during count");
                    audit::emit(AuditEvent::AggregationCancelled, sender, "disconnected");
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            pages += 1;
            total += page.message_count as u64;
            debug!(page = pages, page_count = page.message_count, total, "Counted page");

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        info!(sender = %masked, total, pages, "Count complete");
        Ok(total)
    }
}
