//! OAuth orchestration.
//!
//! Ties discovery, registration, PKCE, the callback listener, and the
//! credential store into one flow per server. Token refresh is
//! single-flighted per server id; a server's whole OAuth footprint is
//! removed together by [`OAuthService::forget_server`].

use crate::callback::{redirect_uri, CallbackServer};
use crate::discovery::{AuthServerMetadata, MetadataDiscovery};
use crate::error::{OAuthError, OAuthResult};
use crate::pkce::{generate_state, PkceChallenge, CODE_CHALLENGE_METHOD};
use crate::registration::{self, ClientMetadata, ClientRegistration};
use crate::storage::{unix_now, CredentialStore, ServerCredentials, StoredTokens};
use async_trait::async_trait;
use mcpd_client::{CredentialProvider, McpError, McpResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

/// An authorization attempt in progress: the URL to open in a browser
/// plus the secrets needed to finish the exchange.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub server_id: String,
    pub server_url: String,
    /// Authorization URL for the user's browser.
    pub url: String,
    /// CSRF state; the redirect must echo it.
    pub state: String,
    verifier: String,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
}

/// Per-server OAuth orchestration over a shared credential store.
pub struct OAuthService {
    http: reqwest::Client,
    discovery: MetadataDiscovery,
    store: CredentialStore,
    client_name: String,
    scope: Option<String>,
    refresh_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OAuthService {
    pub fn new(store: CredentialStore) -> Self {
        let http = reqwest::Client::new();
        Self {
            discovery: MetadataDiscovery::new(http.clone()),
            http,
            store,
            client_name: "mcpd".to_string(),
            scope: None,
            refresh_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Discover endpoints and report compliance diagnostics.
    pub async fn inspect(&self, server_url: &str) -> OAuthResult<(AuthServerMetadata, Vec<String>)> {
        let metadata = self.discovery.discover(server_url).await?;
        let (ok, missing) = metadata.validate_compliance();
        if !ok {
            debug!(server_url, ?missing, "Authorization server compliance gaps");
        }
        Ok((metadata, missing))
    }

    /// Start an authorization attempt: discover, register if needed,
    /// generate PKCE material, and build the URL for the browser.
    pub async fn begin_authorization(
        &self,
        server_id: &str,
        server_url: &str,
    ) -> OAuthResult<PendingAuthorization> {
        let metadata = self.discovery.discover(server_url).await?;
        let (compliant, missing) = metadata.validate_compliance();
        if !compliant {
            warn!(server_id, ?missing, "Proceeding despite compliance gaps");
        }

        let client = self
            .ensure_registration(server_id, server_url, &metadata)
            .await?;

        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let url = build_authorize_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &redirect_uri(),
            self.scope.as_deref(),
            &state,
            &pkce.challenge,
        );

        Ok(PendingAuthorization {
            server_id: server_id.to_string(),
            server_url: server_url.to_string(),
            url,
            state,
            verifier: pkce.verifier,
            token_endpoint: metadata.token_endpoint,
            client_id: client.client_id,
            client_secret: client.client_secret,
        })
    }

    /// Exchange the redirect's authorization code and persist tokens.
    pub async fn complete_authorization(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> OAuthResult<()> {
        let redirect = redirect_uri();
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect.as_str()),
            ("client_id", pending.client_id.as_str()),
            ("code_verifier", pending.verifier.as_str()),
        ];
        if let Some(secret) = &pending.client_secret {
            params.push(("client_secret", secret));
        }

        let response = self.http.post(&pending.token_endpoint).form(&params).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenExchange(body));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::TokenExchange(format!("Invalid token response: {e}")))?;

        self.save_tokens(&pending.server_id, &pending.server_url, tokens, None)
            .await?;
        info!(server_id = %pending.server_id, "Authorization complete");
        Ok(())
    }

    /// Run the interactive flow end to end: the caller opens
    /// `pending.url` in a browser, the callback listener resolves the
    /// redirect, and the code is exchanged.
    pub async fn finish_with_callback(
        &self,
        pending: &PendingAuthorization,
        callback: &CallbackServer,
    ) -> OAuthResult<()> {
        let code = callback.wait_for_code(&pending.state).await?;
        self.complete_authorization(pending, &code).await
    }

    /// Current access token for a server, refreshing if stale.
    pub async fn current_access_token(&self, server_id: &str) -> OAuthResult<String> {
        let credentials = self
            .store
            .get(server_id)
            .await?
            .ok_or_else(|| OAuthError::NoCredentials(server_id.to_string()))?;
        match &credentials.tokens {
            Some(tokens) if tokens.is_fresh() => Ok(tokens.access_token.clone()),
            Some(tokens) if tokens.refresh_token.is_some() => self.refresh(server_id).await,
            _ => Err(OAuthError::NoCredentials(server_id.to_string())),
        }
    }

    /// Refresh a server's access token. Single-flighted: concurrent
    /// callers wait for the in-progress refresh and share its result.
    pub async fn refresh(&self, server_id: &str) -> OAuthResult<String> {
        let gate = {
            let mut gates = self.refresh_gates.lock().await;
            gates
                .entry(server_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // Another caller may have finished the refresh while we waited.
        if let Some(credentials) = self.store.get(server_id).await? {
            if let Some(tokens) = &credentials.tokens {
                if tokens.is_fresh() {
                    return Ok(tokens.access_token.clone());
                }
            }
        }

        self.perform_refresh(server_id).await
    }

    async fn perform_refresh(&self, server_id: &str) -> OAuthResult<String> {
        let credentials = self
            .store
            .get(server_id)
            .await?
            .ok_or_else(|| OAuthError::NoCredentials(server_id.to_string()))?;
        let server_url = credentials
            .server_url
            .clone()
            .ok_or_else(|| OAuthError::NoCredentials(server_id.to_string()))?;
        let client = credentials
            .client
            .clone()
            .ok_or_else(|| OAuthError::NoCredentials(server_id.to_string()))?;
        let refresh_token = credentials
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.refresh_token.clone())
            .ok_or_else(|| {
                OAuthError::TokenRefresh(format!("No refresh token for {server_id}"))
            })?;

        let metadata = self.discovery.discover(&server_url).await?;

        debug!(server_id, "Refreshing access token");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenRefresh(body));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::TokenRefresh(format!("Invalid refresh response: {e}")))?;

        let access = tokens.access_token.clone();
        self.save_tokens(server_id, &server_url, tokens, Some(refresh_token))
            .await?;
        Ok(access)
    }

    /// Remove a server's registration, tokens, and cached discovery
    /// together. One store write, so callers never observe a partial
    /// removal.
    pub async fn forget_server(&self, server_id: &str) -> OAuthResult<()> {
        if let Some(credentials) = self.store.get(server_id).await? {
            if let Some(client) = &credentials.client {
                registration::delete(&self.http, client).await;
            }
            if let Some(server_url) = &credentials.server_url {
                self.discovery.invalidate(server_url).await;
            }
        }
        self.store.remove(server_id).await?;
        self.refresh_gates.lock().await.remove(server_id);
        info!(server_id, "Forgot server credentials");
        Ok(())
    }

    /// Full server removal: drop the connection (cancelling anything
    /// pending), then the client registration and token set. One call
    /// from the caller's side, no partially-removed server.
    pub async fn remove_server(
        &self,
        client: &mcpd_client::McpClient,
        server_id: &str,
    ) -> OAuthResult<()> {
        client.remove_server(server_id).await;
        self.forget_server(server_id).await
    }

    /// Reuse a stored registration when valid, otherwise register a new
    /// client dynamically.
    async fn ensure_registration(
        &self,
        server_id: &str,
        server_url: &str,
        metadata: &AuthServerMetadata,
    ) -> OAuthResult<ClientRegistration> {
        if let Some(credentials) = self.store.get(server_id).await? {
            if credentials.server_url.as_deref() == Some(server_url) {
                if let Some(client) = credentials.client {
                    if client.is_valid() {
                        return Ok(client);
                    }
                    debug!(server_id, "Stored client registration expired");
                }
            }
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            OAuthError::NoCredentials(format!(
                "Server {server_id} advertises no registration endpoint and no client is configured"
            ))
        })?;

        let mut client_metadata = ClientMetadata::public(self.client_name.clone(), redirect_uri());
        client_metadata.scope = self.scope.clone();
        let client = registration::register(&self.http, endpoint, &client_metadata).await?;

        let mut credentials = self.store.get(server_id).await?.unwrap_or_default();
        credentials.server_url = Some(server_url.to_string());
        credentials.client = Some(client.clone());
        self.store.set(server_id, credentials).await?;

        Ok(client)
    }

    async fn save_tokens(
        &self,
        server_id: &str,
        server_url: &str,
        tokens: TokenResponse,
        previous_refresh: Option<String>,
    ) -> OAuthResult<()> {
        let mut credentials = self.store.get(server_id).await?.unwrap_or_default();
        credentials.server_url = Some(server_url.to_string());
        credentials.tokens = Some(StoredTokens {
            access_token: tokens.access_token,
            // Servers may rotate the refresh token or omit it; keep the
            // old one when omitted.
            refresh_token: tokens.refresh_token.or(previous_refresh),
            expires_at: tokens.expires_in.map(|secs| unix_now() + secs),
            scope: tokens.scope,
        });
        self.store.set(server_id, credentials).await
    }
}

/// Build the authorization request URL.
pub fn build_authorize_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method={}",
        authorization_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
        CODE_CHALLENGE_METHOD,
    );
    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    url
}

#[async_trait]
impl CredentialProvider for OAuthService {
    async fn access_token(&self, server_id: &str) -> McpResult<Option<String>> {
        match self.current_access_token(server_id).await {
            Ok(token) => Ok(Some(token)),
            Err(OAuthError::NoCredentials(_)) => Ok(None),
            Err(e) => Err(McpError::auth(e.to_string())),
        }
    }

    async fn refresh_access_token(&self, server_id: &str) -> McpResult<String> {
        self.refresh(server_id)
            .await
            .map_err(|e| McpError::auth(e.to_string()))
    }
}
