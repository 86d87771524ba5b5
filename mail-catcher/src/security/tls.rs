//! Server-side TLS configuration
//!
//! Both protocol servers only ever upgrade an existing plaintext connection
//! (`STARTTLS` for SMTP, `STLS` for POP3); there is no implicit-TLS port.

use crate::error::{MailError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Certificate and key shared by every upgraded connection of a server
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Loads a PEM certificate chain and a PKCS#8 private key.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!(path = ?cert_path.as_ref(), "Loading TLS certificate");

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(MailError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))
            .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;
        if keys.is_empty() {
            return Err(MailError::Tls("No private key found in file".to_string()));
        }

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(keys.remove(0)),
            )
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Loads the pair named by a server's configuration, if TLS is enabled.
    pub fn from_config(
        enabled: bool,
        cert_path: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Option<Self>> {
        if !enabled {
            return Ok(None);
        }
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key).map(Some),
            _ => Err(MailError::Config(
                "TLS enabled without certificate and key paths".to_string(),
            )),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server_config))
    }
}

/// Writes a self-signed certificate and key for `domain` as PEM files.
///
/// For development and tests only.
pub fn generate_self_signed_cert<P: AsRef<Path>>(
    domain: &str,
    cert_output: P,
    key_output: P,
) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName, SanType};

    info!(domain, "Generating self-signed certificate");

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        SanType::DnsName(domain.to_string()),
        SanType::DnsName(format!("*.{}", domain)),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))?;
    let pem = cert
        .serialize_pem()
        .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;

    std::fs::write(cert_output.as_ref(), pem)
        .map_err(|e| MailError::Tls(format!("Failed to write certificate: {}", e)))?;
    std::fs::write(key_output.as_ref(), cert.serialize_private_key_pem())
        .map_err(|e| MailError::Tls(format!("Failed to write private key: {}", e)))?;

    Ok(())
}
