//! TLS termination material for proxy listeners.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{ProxyError, Result};

/// Load a PEM certificate chain and private key into a server config.
///
/// ALPN only advertises `http/1.1`; external listeners never speak HTTP/2.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect())
        .map_err(|e| {
            ProxyError::Tls(format!(
                "Failed to read cert {}: {}",
                cert_path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        ProxyError::Tls(format!("Failed to read key {}: {}", key_path.display(), e))
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "TLS material loaded"
    );
    Ok(Arc::new(config))
}

pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    load_server_config(cert_path, key_path).map(TlsAcceptor::from)
}
