//! File-backed credential storage.
//!
//! One JSON file maps server ids to their OAuth material (registration
//! plus tokens). Access is cached in memory and the file is written
//! with owner-only permissions.

use crate::error::{OAuthError, OAuthResult};
use crate::registration::ClientRegistration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Seconds of remaining lifetime below which a token counts as stale.
const EXPIRY_SKEW_SECS: u64 = 60;

/// Tokens stored with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp when the access token expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl StoredTokens {
    /// Whether the access token is still usable, with a safety skew.
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > unix_now() + EXPIRY_SKEW_SECS,
        }
    }
}

/// Everything stored for one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCredentials {
    /// Server URL these credentials belong to. Mismatch invalidates.
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientRegistration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<StoredTokens>,
}

/// Thread-safe credential file, keyed by server id.
pub struct CredentialStore {
    path: PathBuf,
    cache: RwLock<Option<HashMap<String, ServerCredentials>>>,
}

impl CredentialStore {
    /// Store at the default location under the local data directory.
    pub fn new() -> OAuthResult<Self> {
        let path = default_credentials_path()
            .ok_or_else(|| OAuthError::Storage("No data directory available".to_string()))?;
        Ok(Self::with_path(path))
    }

    /// Store at a custom path. Used by tests.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn get(&self, server_id: &str) -> OAuthResult<Option<ServerCredentials>> {
        let all = self.all().await?;
        Ok(all.get(server_id).cloned())
    }

    pub async fn set(&self, server_id: &str, credentials: ServerCredentials) -> OAuthResult<()> {
        let mut all = self.all().await?;
        all.insert(server_id.to_string(), credentials);
        self.write_all(&all).await?;
        *self.cache.write().await = None;
        Ok(())
    }

    /// Remove a server's credentials. Returns whether anything existed.
    pub async fn remove(&self, server_id: &str) -> OAuthResult<bool> {
        let mut all = self.all().await?;
        let existed = all.remove(server_id).is_some();
        if existed {
            self.write_all(&all).await?;
            *self.cache.write().await = None;
        }
        Ok(existed)
    }

    pub async fn all(&self) -> OAuthResult<HashMap<String, ServerCredentials>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_all().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    async fn read_all(&self) -> OAuthResult<HashMap<String, ServerCredentials>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        // Parse entries individually so one corrupt record does not
        // take every server's credentials down with it.
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        let mut result = HashMap::new();
        for (key, value) in raw {
            match serde_json::from_value::<ServerCredentials>(value) {
                Ok(credentials) => {
                    result.insert(key, credentials);
                }
                Err(e) => {
                    warn!(server_id = %key, error = %e, "Skipping invalid credential entry");
                }
            }
        }
        Ok(result)
    }

    async fn write_all(&self, data: &HashMap<String, ServerCredentials>) -> OAuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    OAuthError::Storage(format!(
                        "Failed to set permissions on {:?}: {e}",
                        self.path
                    ))
                })?;
        }

        debug!(path = ?self.path, "Wrote credential file");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Default credential file location.
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("mcpd").join("oauth.json"))
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
