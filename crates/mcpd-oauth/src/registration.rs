//! Dynamic client registration (RFC 7591/7592).

use crate::error::RegistrationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Client metadata sent to the registration endpoint.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub client_name: String,
    pub client_uri: Option<String>,
    pub redirect_uris: Vec<String>,
    /// `none` for public clients, `client_secret_post` when a secret is
    /// expected back.
    pub token_endpoint_auth_method: String,
    pub scope: Option<String>,
}

impl ClientMetadata {
    /// Metadata for a public (PKCE-only) client.
    pub fn public(client_name: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            client_uri: None,
            redirect_uris: vec![redirect_uri.into()],
            token_endpoint_auth_method: "none".to_string(),
            scope: None,
        }
    }

    fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "client_name": self.client_name,
            "redirect_uris": self.redirect_uris,
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": self.token_endpoint_auth_method,
        });
        if let Some(uri) = &self.client_uri {
            body["client_uri"] = json!(uri);
        }
        if let Some(scope) = &self.scope {
            body["scope"] = json!(scope);
        }
        body
    }
}

/// A registered client, as returned by the authorization server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    /// Unix timestamp; zero means the secret never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    /// Management token for later update/delete (RFC 7592).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_client_uri: Option<String>,
}

impl ClientRegistration {
    /// Whether the registration is still usable.
    pub fn is_valid(&self) -> bool {
        match self.client_secret_expires_at {
            None | Some(0) => true,
            Some(expires_at) => expires_at > unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Register a new client at the given endpoint.
pub async fn register(
    client: &reqwest::Client,
    registration_endpoint: &str,
    metadata: &ClientMetadata,
) -> Result<ClientRegistration, RegistrationError> {
    debug!(endpoint = registration_endpoint, "Registering OAuth client");

    let response = client
        .post(registration_endpoint)
        .json(&metadata.to_body())
        .send()
        .await
        .map_err(|e| RegistrationError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RegistrationError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let registration: ClientRegistration = response
        .json()
        .await
        .map_err(|e| RegistrationError::Malformed(e.to_string()))?;

    info!(client_id = %registration.client_id, "Registered OAuth client");
    Ok(registration)
}

/// Update an existing registration via its management endpoint
/// (RFC 7592). Requires the registration access token issued at
/// registration time.
pub async fn update(
    client: &reqwest::Client,
    registration: &ClientRegistration,
    metadata: &ClientMetadata,
) -> Result<ClientRegistration, RegistrationError> {
    let (Some(uri), Some(token)) = (
        &registration.registration_client_uri,
        &registration.registration_access_token,
    ) else {
        return Err(RegistrationError::Malformed(
            "Registration has no management credentials".to_string(),
        ));
    };

    let mut body = metadata.to_body();
    body["client_id"] = json!(registration.client_id);

    let response = client
        .put(uri)
        .header("Authorization", format!("Bearer {token}"))
        .json(&body)
        .send()
        .await
        .map_err(|e| RegistrationError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RegistrationError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let updated: ClientRegistration = response
        .json()
        .await
        .map_err(|e| RegistrationError::Malformed(e.to_string()))?;
    info!(client_id = %updated.client_id, "Updated OAuth client registration");
    Ok(updated)
}

/// Delete a registration using its management credentials. Best-effort:
/// servers without RFC 7592 support are skipped quietly.
pub async fn delete(client: &reqwest::Client, registration: &ClientRegistration) {
    let (Some(uri), Some(token)) = (
        &registration.registration_client_uri,
        &registration.registration_access_token,
    ) else {
        debug!(
            client_id = %registration.client_id,
            "No management credentials, skipping remote deregistration"
        );
        return;
    };

    match client
        .delete(uri)
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!(client_id = %registration.client_id, "Deleted OAuth client registration");
        }
        Ok(response) => {
            warn!(
                client_id = %registration.client_id,
                status = %response.status(),
                "Server refused registration deletion"
            );
        }
        Err(e) => {
            warn!(client_id = %registration.client_id, error = %e, "Registration deletion failed");
        }
    }
}
