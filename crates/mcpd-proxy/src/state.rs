//! Shared state and configuration for the proxy HTTP surface.

use std::sync::Arc;

use crate::process::ProcessTable;

/// Default listen address. Clients default to the same port.
pub const DEFAULT_BIND: &str = "127.0.0.1:8632";

/// Runtime configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on, `host:port`.
    pub bind: String,
    /// Bearer/x-api-key secret. `None` disables key checks entirely.
    pub api_key: Option<String>,
    /// Origins allowed to skip the API key. An entry ending in `:`
    /// matches any port on that host.
    pub trusted_origins: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            api_key: None,
            trusted_origins: vec![
                "http://localhost:".to_string(),
                "http://127.0.0.1:".to_string(),
            ],
        }
    }
}

impl ProxyConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// True when the request `Origin` is allowed without a key.
    pub fn is_trusted_origin(&self, origin: &str) -> bool {
        self.trusted_origins.iter().any(|entry| {
            if let Some(host) = entry.strip_suffix(':') {
                origin == host || origin.starts_with(entry.as_str())
            } else {
                origin == entry
            }
        })
    }
}

/// State threaded through every route handler.
#[derive(Clone)]
pub struct ProxyState {
    pub processes: Arc<ProcessTable>,
    pub config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            processes: ProcessTable::new(),
            config: Arc::new(config),
        }
    }
}
