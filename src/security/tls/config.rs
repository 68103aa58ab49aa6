//! Certificate loading and TLS acceptor construction for the forwarding
//! endpoint
//!
//! Peers share one certificate: the server presents it, and with mutual TLS
//! the same certificate is the trust root for client certificates.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::{
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use tokio_rustls::TlsAcceptor;

use crate::config::PeerForwarderConfig;
use crate::error::TlsError;

#[derive(Debug, Clone)]
pub struct PeerTlsConfig {
    /// Certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Private key (PEM)
    pub key_path: PathBuf,
    /// Require and verify client certificates
    pub require_client_cert: bool,
}

impl PeerTlsConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        PeerTlsConfig {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
            require_client_cert: false,
        }
    }

    pub fn require_client_cert(mut self, require: bool) -> Self {
        self.require_client_cert = require;
        self
    }

    /// `None` when `ssl` is off
    pub fn from_config(config: &PeerForwarderConfig) -> Option<Self> {
        config.ssl.then(|| {
            PeerTlsConfig::new(&config.ssl_certificate_file, &config.ssl_key_file)
                .require_client_cert(config.uses_mutual_tls())
        })
    }

    fn load_certs(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let read_error = |source: std::io::Error| TlsError::CertificateRead {
            path: self.cert_path.clone(),
            source,
        };
        let file = File::open(&self.cert_path).map_err(read_error)?;
        let chain = certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_error)?;

        if chain.is_empty() {
            return Err(TlsError::NoCertificates {
                path: self.cert_path.clone(),
            });
        }
        Ok(chain)
    }

    fn load_private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let read_error = |source: std::io::Error| TlsError::PrivateKeyRead {
            path: self.key_path.clone(),
            source,
        };
        let file = File::open(&self.key_path).map_err(read_error)?;
        private_key(&mut BufReader::new(file))
            .map_err(read_error)?
            .ok_or_else(|| TlsError::NoPrivateKey {
                path: self.key_path.clone(),
            })
    }

    fn client_roots(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in self.load_certs()? {
            roots.add(cert).map_err(|e| TlsError::InvalidCertificate {
                reason: e.to_string(),
            })?;
        }
        Ok(roots)
    }

    pub fn build_acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let provider: Arc<CryptoProvider> = Arc::new(ring::default_provider());
        let chain = self.load_certs()?;
        let key = self.load_private_key()?;
        let config_error = |e: tokio_rustls::rustls::Error| TlsError::Config {
            reason: e.to_string(),
        };

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(config_error)?;

        let config = if self.require_client_cert {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(self.client_roots()?), provider)
                    .build()
                    .map_err(|e| TlsError::Config {
                        reason: e.to_string(),
                    })?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
                .map_err(config_error)?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .map_err(config_error)?
        };

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Raw certificate PEM, used by peer clients as their trust root
    pub fn certificate_pem(&self) -> Result<Vec<u8>, TlsError> {
        read_file(&self.cert_path).map_err(|source| TlsError::CertificateRead {
            path: self.cert_path.clone(),
            source,
        })
    }

    /// Certificate followed by private key, the client identity for mutual TLS
    pub fn identity_pem(&self) -> Result<Vec<u8>, TlsError> {
        let mut pem = self.certificate_pem()?;
        let key = read_file(&self.key_path).map_err(|source| TlsError::PrivateKeyRead {
            path: self.key_path.clone(),
            source,
        })?;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&key);
        Ok(pem)
    }
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}
