// Error taxonomy
pub mod error;

// Audit events and log masking
pub mod audit;

// Configuration
pub mod config;

// Encrypted token store and client secret resolution
pub mod credentials;

// OAuth authorization flow and refresh policy
pub mod oauth;

// Gmail API session
pub mod gmail;

// Paginated counting
pub mod counting;

// Counting service
pub mod service;

// HTTP API
pub mod api;

pub use error::{ErrorClass, ProviderErrorKind, Result, TallyError};
