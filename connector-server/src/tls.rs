//! TLS plumbing
//!
//! Inbound: `axum::serve::Listener` for TLS-wrapped TCP connections when the
//! connector API itself is served over HTTPS.
//! Outbound: the client certificate presented to FHIR servers that require
//! mutual TLS.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use connector_core::{ConnectorError, Result};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::config::MtlsSettings;

/// A TLS-wrapped TCP listener that implements `axum::serve::Listener`.
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(tcp: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { tcp, acceptor }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<tokio::net::TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.tcp.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("TCP accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            match self.acceptor.accept(stream).await {
                Ok(tls_stream) => return (tls_stream, addr),
                Err(e) => {
                    tracing::warn!("TLS handshake failed from {}: {}", addr, e);
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Load the API's own certificate and key, returning a `TlsAcceptor`.
pub fn load_tls_acceptor(
    cert_path: &str,
    key_path: &str,
) -> std::result::Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("Failed to open cert file '{}': {}", cert_path, e))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("Failed to open key file '{}': {}", key_path, e))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("Failed to parse certificates: {}", e))?;
    if certs.is_empty() {
        return Err("No certificates found in cert file".into());
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| format!("Failed to parse private key: {}", e))?
        .ok_or("No private key found in key file")?;

    // ring and aws-lc-rs may both be in the tree via reqwest, so pick one
    let config = tokio_rustls::rustls::ServerConfig::builder_with_provider(Arc::new(
        tokio_rustls::rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| format!("TLS protocol error: {}", e))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| format!("Invalid TLS configuration: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client certificate, key and optional CA for mutual TLS
#[derive(Clone)]
pub struct MtlsCredentials {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for MtlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsCredentials")
            .field("has_ca", &self.ca_pem.is_some())
            .finish_non_exhaustive()
    }
}

impl MtlsCredentials {
    /// Build from PEM text, checking that it actually holds a certificate and a key
    pub fn from_pem(cert_pem: Vec<u8>, key_pem: Vec<u8>, ca_pem: Option<Vec<u8>>) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| mtls_error(format!("Failed to parse certificate: {}", e)))?;
        if certs.is_empty() {
            return Err(mtls_error("No certificates found in mutual TLS certificate"));
        }
        rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| mtls_error(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| mtls_error("No private key found in mutual TLS key"))?;

        Ok(Self {
            cert_pem,
            key_pem,
            ca_pem: ca_pem.filter(|ca| !ca.is_empty()),
        })
    }

    /// Load from the configured files, falling back to base64 `MTLS_CERT`,
    /// `MTLS_KEY` and `MTLS_CA` environment variables
    pub fn load(settings: &MtlsSettings) -> Result<Self> {
        let cert = read_pem_source(&settings.cert_file, "MTLS_CERT")?.ok_or_else(|| {
            mtls_error(
                "Mutual TLS certificate not found in keys directory and MTLS_CERT environment variable is not set",
            )
        })?;
        let key = read_pem_source(&settings.key_file, "MTLS_KEY")?.ok_or_else(|| {
            mtls_error(
                "Mutual TLS key not found in keys directory and MTLS_KEY environment variable is not set",
            )
        })?;
        let ca = read_pem_source(&settings.ca_file, "MTLS_CA")?;
        Self::from_pem(cert, key, ca)
    }

    /// Certificate chain followed by the key, the form reqwest expects
    pub fn identity(&self) -> Result<reqwest::Identity> {
        let mut pem = self.cert_pem.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.key_pem);
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| mtls_error(format!("Invalid client identity: {}", e)))
    }

    pub fn ca_certificate(&self) -> Result<Option<reqwest::Certificate>> {
        self.ca_pem
            .as_deref()
            .map(|pem| {
                reqwest::Certificate::from_pem(pem)
                    .map_err(|e| mtls_error(format!("Invalid CA certificate: {}", e)))
            })
            .transpose()
    }
}

/// Whether mutual TLS credentials can be loaded without error
pub fn mtls_available(settings: &MtlsSettings) -> bool {
    let file_pair = settings.cert_file.exists() && settings.key_file.exists();
    let env_pair = std::env::var("MTLS_CERT").is_ok() && std::env::var("MTLS_KEY").is_ok();
    file_pair || env_pair
}

fn read_pem_source(path: &Path, env_var: &str) -> Result<Option<Vec<u8>>> {
    if path.exists() {
        return std::fs::read(path)
            .map(Some)
            .map_err(|e| mtls_error(format!("Failed to read {}: {}", path.display(), e)));
    }
    match std::env::var(env_var) {
        Ok(encoded) => STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(|e| mtls_error(format!("{} is not valid base64: {}", env_var, e))),
        Err(_) => Ok(None),
    }
}

fn mtls_error(message: impl Into<String>) -> ConnectorError {
    ConnectorError::Transport(message.into())
}
