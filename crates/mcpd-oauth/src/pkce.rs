//! PKCE challenge generation (RFC 7636, S256 only).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// The only challenge method this client offers.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// A PKCE verifier/challenge pair for one authorization attempt.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Random secret kept locally until token exchange.
    pub verifier: String,
    /// SHA-256 of the verifier, sent with the authorization request.
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a fresh verifier and its derived challenge.
    pub fn generate() -> Self {
        let verifier = random_urlsafe(32);
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Compute the S256 challenge for a verifier.
pub fn derive_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate the CSRF state parameter for an authorization request.
pub fn generate_state() -> String {
    random_urlsafe(16)
}

fn random_urlsafe(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let raw: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&raw)
}
