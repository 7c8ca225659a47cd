use std::fmt;

/// Longest address accepted (RFC 5321 path limit).
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Validation errors for sender addresses
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Empty,
    TooLong(usize),
    NonAscii,
    InvalidCharacter(char),
    MissingAt,
    MultipleAt,
    InvalidLocalPart,
    InvalidDomain,
    IpLiteralDomain,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Empty => write!(f, "senderEmail is required"),
            ValidationError::TooLong(len) => write!(
                f,
                "senderEmail must be at most {} characters, got {}",
                MAX_EMAIL_LENGTH, len
            ),
            ValidationError::NonAscii => write!(f, "senderEmail must contain ASCII characters only"),
            ValidationError::InvalidCharacter(c) => {
                write!(f, "senderEmail contains invalid character '{}'", c.escape_default())
            }
            ValidationError::MissingAt => write!(f, "senderEmail must contain '@'"),
            ValidationError::MultipleAt => write!(f, "senderEmail must contain exactly one '@'"),
            ValidationError::InvalidLocalPart => write!(
                f,
                "senderEmail local part must not be empty or start, end, or repeat '.'"
            ),
            ValidationError::InvalidDomain => {
                write!(f, "senderEmail domain must contain a '.' between non-empty labels")
            }
            ValidationError::IpLiteralDomain => {
                write!(f, "senderEmail domain must not be an IP address")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a sender address and returns it trimmed.
///
/// Validation rules:
/// - Non-empty after trimming, at most 254 characters, ASCII only
/// - No whitespace, quotes, parentheses, or other search-syntax characters
/// - Exactly one '@'
/// - Local part: no leading/trailing '.', no ".."
/// - Domain: dotted, non-empty labels, not an IP literal
pub fn validate_sender(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim();

    if email.is_empty() {
        return Err(ValidationError::Empty);
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong(email.len()));
    }
    if !email.is_ascii() {
        return Err(ValidationError::NonAscii);
    }
    if let Some(c) = email.chars().find(|c| !is_allowed_char(*c)) {
        return Err(ValidationError::InvalidCharacter(c));
    }

    let (local, domain) = match email.split_once('@') {
        Some((_, domain)) if domain.contains('@') => return Err(ValidationError::MultipleAt),
        Some(parts) => parts,
        None => return Err(ValidationError::MissingAt),
    };

    if local.is_empty() || local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(ValidationError::InvalidLocalPart);
    }

    if domain.starts_with('[') || is_ipv4(domain) {
        return Err(ValidationError::IpLiteralDomain);
    }
    if !domain.contains('.') || domain.split('.').any(|label| !is_valid_label(label)) {
        return Err(ValidationError::InvalidDomain);
    }

    Ok(email.to_string())
}

/// Characters allowed anywhere in the address. Excludes anything Gmail search treats as syntax.
fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '%' | '+' | '-' | '\'' | '[' | ']')
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_ipv4(domain: &str) -> bool {
    domain.parse::<std::net::Ipv4Addr>().is_ok()
}
