//! TLS certificate management for the HTTPS listener, §4.13.
//!
//! Three sources, tried in order at start-up: an operator-supplied
//! cert/key pair on disk, a cert loaded from [`TlsCertRepo`], or (for
//! local development and the default config) a self-signed certificate
//! generated on the fly with `rcgen`. ACME is out of scope for this
//! crate — `handle_acme_challenge` exists as the seam a deployment's HTTP
//! router wires up, but ships with no challenge solver.

use crate::config::TlsConfig;
use crate::persistence::{StoredCert, TlsCertRepo};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("reading cert file {0}: {1}")]
    ReadCert(String, std::io::Error),
    #[error("reading key file {0}: {1}")]
    ReadKey(String, std::io::Error),
    #[error("no private key found in key file")]
    NoKeyFound,
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("rustls config error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Produces the `rustls::ServerConfig` the HTTPS listener accepts
/// connections with, and knows how to keep it current.
#[async_trait]
pub trait CertManager: Send + Sync {
    async fn tls_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError>;
    /// Returns a challenge response body if this manager recognizes the
    /// token, for wiring into `/.well-known/acme-challenge/{token}`.
    async fn handle_acme_challenge(&self, token: &str) -> Option<String>;
    async fn start_renewal(&self, _cancel: tokio_util::sync::CancellationToken) {}
    async fn stop(&self) {}
}

/// Loads a fixed cert/key pair from disk once at start-up. No renewal.
pub struct StaticCertManager {
    config: Arc<rustls::ServerConfig>,
}

impl StaticCertManager {
    pub fn load(tls: &TlsConfig) -> Result<Self, TlsError> {
        let cert_path = tls.cert_file.as_ref().expect("cert_file required for static TLS");
        let key_path = tls.key_file.as_ref().expect("key_file required for static TLS");

        let cert_bytes = std::fs::read(cert_path)
            .map_err(|e| TlsError::ReadCert(cert_path.display().to_string(), e))?;
        let key_bytes = std::fs::read(key_path)
            .map_err(|e| TlsError::ReadKey(key_path.display().to_string(), e))?;

        Ok(Self { config: Arc::new(build_server_config(cert_bytes, key_bytes)?) })
    }
}

#[async_trait]
impl CertManager for StaticCertManager {
    async fn tls_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        Ok(self.config.clone())
    }

    async fn handle_acme_challenge(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Generates a self-signed certificate for `domain` (and `*.{domain}`) at
/// start-up and serves it unchanged for the process lifetime. Used when
/// no cert/key pair is configured — fine for development or for agents
/// that pin the server's fingerprint out of band, not for a public
/// browser-facing deployment.
pub struct SelfSignedCertManager {
    config: Arc<rustls::ServerConfig>,
}

impl SelfSignedCertManager {
    pub fn generate(base_domain: &str) -> Result<Self, TlsError> {
        let subject_alt_names =
            vec![base_domain.to_string(), format!("*.{base_domain}")];
        let cert = rcgen::generate_simple_self_signed(subject_alt_names)
            .map_err(|e| TlsError::Generation(e.to_string()))?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert_der)],
                PrivateKeyDer::try_from(key_der).map_err(|_| TlsError::NoKeyFound)?,
            )?;
        Ok(Self { config: Arc::new(config) })
    }
}

#[async_trait]
impl CertManager for SelfSignedCertManager {
    async fn tls_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        Ok(self.config.clone())
    }

    async fn handle_acme_challenge(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Loads a cert from a [`TlsCertRepo`] at start-up, with no renewal of
/// its own — a deployment that wants real renewal should drive `store`
/// through its own ACME client and restart, or implement a repo-backed
/// `CertManager` with `start_renewal`.
pub struct RepoCertManager {
    config: Arc<rustls::ServerConfig>,
}

impl RepoCertManager {
    pub async fn load(repo: &dyn TlsCertRepo, domain: &str) -> Result<Self, TlsError> {
        let stored: StoredCert = repo
            .find(domain)
            .await
            .ok_or_else(|| TlsError::Generation(format!("no certificate stored for {domain}")))?;
        Ok(Self { config: Arc::new(build_server_config(stored.cert_pem, stored.key_pem)?) })
    }
}

#[async_trait]
impl CertManager for RepoCertManager {
    async fn tls_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        Ok(self.config.clone())
    }

    async fn handle_acme_challenge(&self, _token: &str) -> Option<String> {
        None
    }
}

fn build_server_config(
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
) -> Result<rustls::ServerConfig, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).filter_map(Result::ok).collect();
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| TlsError::ReadKey("<in-memory>".into(), e))?
        .ok_or(TlsError::NoKeyFound)?;

    Ok(rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?)
}
