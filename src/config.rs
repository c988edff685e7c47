//! Server configuration.
//!
//! Plain data assembled by whoever embeds the engine (the bundled binary
//! builds it from CLI flags); parsing config files is someone else's job.

use std::path::PathBuf;

/// Network-layer settings for one server instance.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the listener binds, e.g. `127.0.0.1:15432`.
    pub listen_addr: String,
    /// PEM certificate chain; TLS is offered only when both paths are
    /// present.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key.
    pub tls_key: Option<PathBuf>,
    /// Execution pool size.
    pub workers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:15432".to_string(),
            tls_cert: None,
            tls_key: None,
            workers: 4,
        }
    }
}

impl NetworkConfig {
    /// Whether the configuration asks for TLS.
    pub fn tls_configured(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
