//! OAuth 2.1 subsystem for MCP servers.
//!
//! Metadata discovery with conventional fallbacks, dynamic client
//! registration, PKCE authorization with a loopback redirect listener,
//! and single-flighted token refresh over a file-backed credential
//! store. [`OAuthService`] implements the client crate's
//! `CredentialProvider`, so connections pick up and refresh tokens
//! transparently.

pub mod callback;
pub mod discovery;
pub mod error;
pub mod pkce;
pub mod registration;
pub mod service;
pub mod storage;

pub use callback::{redirect_uri, CallbackServer, CALLBACK_PATH, CALLBACK_PORT};
pub use discovery::{AuthServerMetadata, MetadataDiscovery, WELL_KNOWN_PATH};
pub use error::{OAuthError, OAuthResult, RegistrationError};
pub use pkce::{derive_challenge, generate_state, PkceChallenge, CODE_CHALLENGE_METHOD};
pub use registration::{ClientMetadata, ClientRegistration};
pub use service::{build_authorize_url, OAuthService, PendingAuthorization, TokenResponse};
pub use storage::{CredentialStore, ServerCredentials, StoredTokens};
