use mail_catcher::config::{Config, StorageKind};
use mail_catcher::security::tls::generate_self_signed_cert;
use mail_catcher::server::Services;
use rustls::{ClientConfig, RootCertStore, ServerName};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// A running mail catcher on ephemeral localhost ports, backed by a file
/// store in a temporary directory.
pub struct TestEnv {
    pub services: Services,
    pub cancel: CancellationToken,
    pub dir: TempDir,
}

impl TestEnv {
    /// Start with the default test configuration
    pub async fn start() -> Self {
        Self::start_with(|_, _| {}).await
    }

    /// Start after letting `customize` adjust the configuration. It also
    /// gets the temp directory, e.g. to place certificates in.
    pub async fn start_with<F>(customize: F) -> Self
    where
        F: FnOnce(&mut Config, &Path),
    {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = Config::default();
        config.smtp.listen_addr = "127.0.0.1:0".to_string();
        config.smtp.domain = "catcher.test".to_string();
        config.pop3.listen_addr = "127.0.0.1:0".to_string();
        config.pop3.domain = "catcher.test".to_string();
        config.storage.kind = StorageKind::File;
        config.storage.path = dir.path().join("mail").to_string_lossy().into_owned();
        customize(&mut config, dir.path());

        let mut services = Services::build(config).expect("Failed to build services");
        let cancel = CancellationToken::new();
        services
            .start(cancel.clone())
            .await
            .expect("Failed to start services");

        Self {
            services,
            cancel,
            dir,
        }
    }

    pub fn smtp_addr(&self) -> SocketAddr {
        self.services.smtp_addr().expect("SMTP not started")
    }

    pub fn pop3_addr(&self) -> SocketAddr {
        self.services.pop3_addr().expect("POP3 not started")
    }

    /// Cancel everything and wait for it to stop
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        assert!(
            self.services.drain(Duration::from_secs(5)).await,
            "Services did not drain"
        );
    }
}

/// Writes a self-signed `localhost` certificate into `dir`
pub fn generate_tls_files(dir: &Path) -> (PathBuf, PathBuf) {
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    generate_self_signed_cert("localhost", &cert, &key).expect("Failed to generate certificate");
    (cert, key)
}

/// A client connector trusting only the certificate at `cert_path`
pub fn connector_for(cert_path: &Path) -> TlsConnector {
    let pem = std::fs::read(cert_path).expect("Failed to read certificate");
    let mut roots = RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut pem.as_slice()).expect("Bad certificate PEM") {
        roots
            .add(&rustls::Certificate(der))
            .expect("Failed to trust certificate");
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub fn localhost() -> ServerName {
    ServerName::try_from("localhost").expect("valid server name")
}

/// Generate a unique subject suffix for testing
pub fn generate_test_id() -> String {
    format!("test_{}", chrono::Utc::now().timestamp_millis())
}
