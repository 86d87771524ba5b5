use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub mailbox_naming: MailboxNaming,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub storage: StorageConfig,
    pub hub: HubConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

/// How a recipient address is turned into a mailbox name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxNaming {
    /// `user+ext@example.com` is stored in `user`
    #[default]
    Local,
    /// `user+ext@example.com` is stored in `user@example.com`
    Full,
    /// `user+ext@example.com` is stored in `example.com`
    Domain,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub domain: String,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    pub default_accept: bool,
    pub accept_domains: Vec<String>,
    pub reject_domains: Vec<String>,
    pub default_store: bool,
    pub store_domains: Vec<String>,
    pub discard_domains: Vec<String>,
    pub reject_origin_domains: Vec<String>,
    /// Mail for this domain is always accepted and never stored (load testing)
    pub discard_only_domain: Option<String>,
    pub timeout_secs: u64,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Pop3Config {
    pub listen_addr: String,
    pub domain: String,
    pub timeout_secs: u64,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub path: String,
    /// Zero disables the retention scanner
    pub retention_period_secs: u64,
    pub retention_sleep_ms: u64,
    /// Zero disables the per-mailbox cap
    pub mailbox_msg_cap: usize,
    /// Memory store only, zero disables
    pub max_total_kb: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub history: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Lower-cases every domain list so policy lookups can compare directly.
    pub fn normalize(&mut self) {
        let lower = |list: &mut Vec<String>| {
            for domain in list.iter_mut() {
                *domain = domain.trim().to_lowercase();
            }
        };
        lower(&mut self.smtp.accept_domains);
        lower(&mut self.smtp.reject_domains);
        lower(&mut self.smtp.store_domains);
        lower(&mut self.smtp.discard_domains);
        lower(&mut self.smtp.reject_origin_domains);
        if let Some(domain) = self.smtp.discard_only_domain.as_mut() {
            *domain = domain.trim().to_lowercase();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.kind == StorageKind::File && self.storage.path.trim().is_empty() {
            return Err(MailError::Config(
                "storage.path is required for the file store".to_string(),
            ));
        }
        if self.smtp.tls_enabled
            && (self.smtp.tls_cert_path.is_none() || self.smtp.tls_key_path.is_none())
        {
            return Err(MailError::Config(
                "smtp.tls_enabled requires tls_cert_path and tls_key_path".to_string(),
            ));
        }
        if self.pop3.tls_enabled
            && (self.pop3.tls_cert_path.is_none() || self.pop3.tls_key_path.is_none())
        {
            return Err(MailError::Config(
                "pop3.tls_enabled requires tls_cert_path and tls_key_path".to_string(),
            ));
        }
        Ok(())
    }
}

impl SmtpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Pop3Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StorageConfig {
    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    pub fn retention_sleep(&self) -> Duration {
        Duration::from_millis(self.retention_sleep_ms)
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn default_domain() -> String {
    let host = gethostname::gethostname().to_string_lossy().to_lowercase();
    if host.is_empty() {
        "mailcatcher".to_string()
    } else {
        host
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2500".to_string(),
            domain: default_domain(),
            max_recipients: 200,
            max_message_bytes: 10_240_000,
            default_accept: true,
            accept_domains: Vec::new(),
            reject_domains: Vec::new(),
            default_store: true,
            store_domains: Vec::new(),
            discard_domains: Vec::new(),
            reject_origin_domains: Vec::new(),
            discard_only_domain: None,
            timeout_secs: 300,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1100".to_string(),
            domain: default_domain(),
            timeout_secs: 600,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: "/tmp/mail-catcher".to_string(),
            retention_period_secs: 24 * 60 * 60,
            retention_sleep_ms: 50,
            mailbox_msg_cap: 500,
            max_total_kb: 0,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history: 30,
            queue_capacity: 100,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
