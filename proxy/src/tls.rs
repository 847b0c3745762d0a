//! TLS for client-facing and upstream connections
//!
//! `TlsAcceptor` upgrades a client connection after it sent an SSLRequest;
//! `TlsConnector` upgrades the gateway's connection to an upstream server.
//! Both work on any [`BoxedStream`] and return a boxed stream again, so the
//! rest of the gateway never has to know whether a connection is encrypted.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::stream::BoxedStream;

/// TLS-specific errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load certificate from file
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad {
        /// Path to the certificate file
        path: PathBuf,
        /// Reason for the failure
        reason: String,
    },

    /// Failed to load private key from file
    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad {
        /// Path to the key file
        path: PathBuf,
        /// Reason for the failure
        reason: String,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    fn cert_load(path: &Path, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn key_load(path: &Path, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Server-side TLS for client connections
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build an acceptor from a PEM certificate chain and private key
    pub fn new(certificate: &Path, key: &Path) -> Result<Self, TlsError> {
        let certs = load_certificates(certificate)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(certificate, "no certificates found in file"));
        }
        let key = load_private_key(key)?;

        let server_config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Perform the server side of the TLS handshake
    pub async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TlsError> {
        let tls = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

/// Client-side TLS for upstream connections
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector that verifies the upstream against a CA bundle
    pub fn with_ca(ca_certificate: &Path) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certificates(ca_certificate)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::cert_load(ca_certificate, e.to_string()))?;
        }

        let client_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("Failed to set protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Build a connector that accepts any upstream certificate
    ///
    /// PostgreSQL servers commonly run with self-signed certificates and the
    /// `sslmode=require` convention only asks for encryption, not identity.
    pub fn new_insecure() -> Result<Self, TlsError> {
        let client_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("Failed to set protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Perform the client side of the TLS handshake
    pub async fn connect(&self, stream: BoxedStream, server_name: &str) -> Result<BoxedStream, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::Config(format!("Invalid server name: {}", server_name)))?;

        let tls = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

/// Load a PEM certificate chain
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Load the first private key (RSA, PKCS8 or EC) from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
