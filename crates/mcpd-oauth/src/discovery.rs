//! OAuth authorization server metadata discovery (RFC 8414).
//!
//! Fetches the well-known metadata document for a server's origin. Any
//! failure — network, HTTP error, malformed document, missing required
//! fields — falls back to conventional default endpoint paths so a
//! connection attempt is never blocked on discovery alone.

use crate::error::{OAuthError, OAuthResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Well-known path for authorization server metadata.
pub const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

/// How long a discovered document stays cached.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Resolved authorization server endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub scopes_supported: Option<Vec<String>>,
    pub code_challenge_methods_supported: Option<Vec<String>>,
    pub grant_types_supported: Option<Vec<String>>,
    /// False when this came from the fallback defaults rather than a
    /// served document.
    pub discovered: bool,
}

/// Raw wire shape; everything optional so a partial document can still
/// be diagnosed rather than failing deserialization wholesale.
#[derive(Debug, Deserialize)]
struct RawMetadata {
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    registration_endpoint: Option<String>,
    scopes_supported: Option<Vec<String>>,
    code_challenge_methods_supported: Option<Vec<String>>,
    grant_types_supported: Option<Vec<String>>,
}

impl AuthServerMetadata {
    /// Conventional defaults for servers that publish no metadata.
    pub fn fallback(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
            scopes_supported: None,
            code_challenge_methods_supported: None,
            grant_types_supported: None,
            discovered: false,
        }
    }

    /// Check the metadata against what this client requires.
    ///
    /// Returns whether the server is compliant plus a list of missing
    /// requirements for diagnostics.
    pub fn validate_compliance(&self) -> (bool, Vec<String>) {
        let mut missing = Vec::new();

        if !self.discovered {
            missing.push("metadata document not served (using default paths)".to_string());
        }
        match &self.code_challenge_methods_supported {
            Some(methods) if methods.iter().any(|m| m == "S256") => {}
            Some(_) => missing.push("PKCE S256 not advertised".to_string()),
            None => missing.push("code_challenge_methods_supported not advertised".to_string()),
        }
        if let Some(grants) = &self.grant_types_supported {
            if !grants.iter().any(|g| g == "authorization_code") {
                missing.push("authorization_code grant not advertised".to_string());
            }
            if !grants.iter().any(|g| g == "refresh_token") {
                missing.push("refresh_token grant not advertised".to_string());
            }
        }
        if self.registration_endpoint.is_none() {
            missing.push("registration_endpoint not advertised".to_string());
        }

        (missing.is_empty(), missing)
    }
}

struct CachedMetadata {
    metadata: AuthServerMetadata,
    fetched_at: Instant,
}

/// Discovers and caches authorization server metadata per origin.
pub struct MetadataDiscovery {
    client: reqwest::Client,
    cache: RwLock<HashMap<String, CachedMetadata>>,
    ttl: Duration,
}

impl Default for MetadataDiscovery {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl MetadataDiscovery {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
            ttl: DISCOVERY_CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve endpoints for the origin of `server_url`, consulting the
    /// cache first.
    pub async fn discover(&self, server_url: &str) -> OAuthResult<AuthServerMetadata> {
        let origin = origin_of(server_url)?;

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&origin) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.metadata.clone());
                }
            }
        }

        let metadata = self.fetch(&origin).await;
        self.cache.write().await.insert(
            origin,
            CachedMetadata {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    /// Drop any cached entry for the origin of `server_url`.
    pub async fn invalidate(&self, server_url: &str) {
        if let Ok(origin) = origin_of(server_url) {
            self.cache.write().await.remove(&origin);
        }
    }

    async fn fetch(&self, origin: &str) -> AuthServerMetadata {
        let url = format!("{origin}{WELL_KNOWN_PATH}");
        debug!(%url, "Fetching authorization server metadata");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "Metadata fetch failed, using default endpoints");
                return AuthServerMetadata::fallback(origin);
            }
        };

        if !response.status().is_success() {
            debug!(%url, status = %response.status(), "No metadata document, using default endpoints");
            return AuthServerMetadata::fallback(origin);
        }

        let raw: RawMetadata = match response.json().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%url, error = %e, "Malformed metadata document, using default endpoints");
                return AuthServerMetadata::fallback(origin);
            }
        };

        let (Some(authorization_endpoint), Some(token_endpoint)) =
            (raw.authorization_endpoint, raw.token_endpoint)
        else {
            warn!(%url, "Metadata document missing required endpoints, using default endpoints");
            return AuthServerMetadata::fallback(origin);
        };

        AuthServerMetadata {
            authorization_endpoint,
            token_endpoint,
            registration_endpoint: raw.registration_endpoint,
            scopes_supported: raw.scopes_supported,
            code_challenge_methods_supported: raw.code_challenge_methods_supported,
            grant_types_supported: raw.grant_types_supported,
            discovered: true,
        }
    }
}

/// Scheme + host + port of a URL, the base all OAuth paths hang off.
pub fn origin_of(server_url: &str) -> OAuthResult<String> {
    let url = Url::parse(server_url)
        .map_err(|e| OAuthError::InvalidCallback(format!("Invalid server URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| OAuthError::InvalidCallback("Server URL has no host".to_string()))?;
    let mut origin = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    Ok(origin)
}
