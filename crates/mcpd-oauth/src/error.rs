//! OAuth error types.

use thiserror::Error;

/// Result type for OAuth operations.
pub type OAuthResult<T> = Result<T, OAuthError>;

/// Errors from the OAuth subsystem.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Dynamic client registration failed. Surfaced to the user; never
    /// silently downgraded to unauthenticated access.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Authorization code exchange failed.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Refresh grant failed.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// No stored credentials and no way to mint them non-interactively.
    #[error("No credentials for server: {0}")]
    NoCredentials(String),

    /// The redirect callback was missing or inconsistent (bad state,
    /// missing code, provider-reported error).
    #[error("Authorization callback invalid: {0}")]
    InvalidCallback(String),

    /// Credential file could not be read or written.
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Network failure talking to the authorization server.
    #[error("OAuth network error: {0}")]
    Network(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dynamic client registration failures, kept distinct so callers can
/// report exactly what the authorization server objected to.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Could not reach the registration endpoint.
    #[error("Registration request failed: {0}")]
    Network(String),

    /// The authorization server rejected the registration.
    #[error("Registration rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The registration response could not be parsed.
    #[error("Malformed registration response: {0}")]
    Malformed(String),
}
