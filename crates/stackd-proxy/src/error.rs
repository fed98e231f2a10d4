//! Proxy error types.

use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// A listener socket could not be bound.
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Certificate or key material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The route exists but its target is not healthy.
    #[error("Service '{service}' is not available")]
    TargetUnavailable { service: String },

    /// The upstream service could not be reached or broke the exchange.
    #[error("Upstream error for '{service}': {message}")]
    Upstream { service: String, message: String },

    /// Two route entries claim the same listener port.
    #[error("Listener port {port} is claimed by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for ProxyError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
