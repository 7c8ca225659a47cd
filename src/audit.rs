//! Discrete audit events for the credential lifecycle and the counting path.
//!
//! Events go to the `audit` tracing target with a fixed field set (`event`, `identity`,
//! `outcome`, `timestamp`) so a subscriber can route them separately from service logs.
//! Identities and sender addresses are always masked before they reach a field.

use chrono::Utc;
use tracing::{info, warn};

/// Named audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    ClientSecretUploaded,
    ClientSecretCleared,
    CredentialStored,
    CredentialCleared,
    CorruptedRecordDiscarded,
    AuthorizationCompleted,
    AuthorizationFailed,
    RefreshAttempted,
    RefreshSucceeded,
    RefreshFailed,
    AggregationCancelled,
    ProviderFault,
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::ClientSecretUploaded => "client_secret_uploaded",
            AuditEvent::ClientSecretCleared => "client_secret_cleared",
            AuditEvent::CredentialStored => "credential_stored",
            AuditEvent::CredentialCleared => "credential_cleared",
            AuditEvent::CorruptedRecordDiscarded => "corrupted_record_discarded",
            AuditEvent::AuthorizationCompleted => "authorization_completed",
            AuditEvent::AuthorizationFailed => "authorization_failed",
            AuditEvent::RefreshAttempted => "refresh_attempted",
            AuditEvent::RefreshSucceeded => "refresh_succeeded",
            AuditEvent::RefreshFailed => "refresh_failed",
            AuditEvent::AggregationCancelled => "aggregation_cancelled",
            AuditEvent::ProviderFault => "provider_fault",
        }
    }

    /// Faults are emitted at WARN, everything else (cancellation included) at INFO.
    fn is_fault(&self) -> bool {
        matches!(
            self,
            AuditEvent::CorruptedRecordDiscarded
                | AuditEvent::AuthorizationFailed
                | AuditEvent::RefreshFailed
                | AuditEvent::ProviderFault
        )
    }
}

/// Emits `event` for `identity` (masked here) with a short outcome tag.
pub fn emit(event: AuditEvent, identity: &str, outcome: &str) {
    let identity = mask_identity(identity);
    let timestamp = Utc::now().to_rfc3339();

    if event.is_fault() {
        warn!(
            target: "audit",
            event = event.name(),
            identity = %identity,
            outcome,
            timestamp = %timestamp,
            "audit"
        );
    } else {
        info!(
            target: "audit",
            event = event.name(),
            identity = %identity,
            outcome,
            timestamp = %timestamp,
            "audit"
        );
    }
}

/// Masks an email address for logs: `su****@example.com`.
///
/// Local parts of one or two characters become `**@domain`.
pub fn mask_email(email: &str) -> String {
    let email = email.trim();
    if email.is_empty() {
        return "[EMPTY]".to_string();
    }

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            if local.chars().count() <= 2 {
                format!("**@{}", domain)
            } else {
                let prefix: String = local.chars().take(2).collect();
                format!("{}****@{}", prefix, domain)
            }
        }
        _ => "[INVALID_EMAIL]".to_string(),
    }
}

/// Masks an identity key or other short secret: `***` up to eight characters,
/// otherwise the first and last four around `***`.
pub fn mask_identity(identity: &str) -> String {
    let chars: Vec<char> = identity.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("sunny@example.com"), "su****@example.com");
        assert_eq!(mask_email("ab@example.com"), "**@example.com");
        assert_eq!(mask_email("a@x.io"), "**@x.io");
        assert_eq!(mask_email("   "), "[EMPTY]");
        assert_eq!(mask_email("no-at-sign"), "[INVALID_EMAIL]");
        assert_eq!(mask_email("@example.com"), "[INVALID_EMAIL]");
    }

    #[test]
    fn test_mask_identity() {
        assert_eq!(mask_identity("user"), "***");
        assert_eq!(mask_identity("12345678"), "***");
        assert_eq!(mask_identity("abcd-secret-wxyz"), "abcd***wxyz");
    }

    #[test]
    fn test_event_names_are_snake_case() {
        assert_eq!(AuditEvent::AggregationCancelled.name(), "aggregation_cancelled");
        assert_eq!(AuditEvent::CorruptedRecordDiscarded.name(), "corrupted_record_discarded");
        assert!(!AuditEvent::AggregationCancelled.is_fault());
        assert!(AuditEvent::ProviderFault.is_fault());
    }
}
