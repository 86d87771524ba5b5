//! Address policy
//!
//! Turns SMTP envelope addresses into mailbox names and decides, per domain,
//! whether mail is accepted and whether it is stored.

pub mod address;

pub use address::{
    match_wildcards, parse_email_address, parse_mailbox_name, split_address, validate_domain_part,
};

use crate::config::{MailboxNaming, SmtpConfig};
use crate::error::{MailError, Result};

/// Address policy built from the SMTP configuration
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    naming: MailboxNaming,
    config: SmtpConfig,
}

/// A parsed `RCPT TO` address with its policy decisions attached
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    /// The address as given by the client
    pub address: String,
    /// Everything before `@`, including any `+extension`
    pub local_part: String,
    pub domain: String,
    /// Canonical mailbox name under the configured naming mode
    pub mailbox: String,
    accept: bool,
    store: bool,
}

impl Recipient {
    pub fn should_accept(&self) -> bool {
        self.accept
    }

    pub fn should_store(&self) -> bool {
        self.store
    }
}

/// A parsed `MAIL FROM` address
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub address: String,
    pub local_part: String,
    pub domain: String,
    accept: bool,
}

impl Origin {
    pub fn should_accept(&self) -> bool {
        self.accept
    }
}

impl AddressPolicy {
    pub fn new(naming: MailboxNaming, config: SmtpConfig) -> Self {
        Self { naming, config }
    }

    pub fn naming(&self) -> MailboxNaming {
        self.naming
    }

    /// Extracts the mailbox name from a full or partial address.
    pub fn extract_mailbox(&self, address: &str) -> Result<String> {
        if self.naming == MailboxNaming::Domain {
            return address::extract_domain_mailbox(address);
        }

        let (local, domain) = split_address(address)?;
        let local = parse_mailbox_name(&local)?;

        match self.naming {
            MailboxNaming::Local => Ok(local),
            _ if domain.is_empty() => Ok(local),
            _ => {
                if !validate_domain_part(&domain) {
                    return Err(MailError::InvalidAddress(format!(
                        "domain part {:?} in {:?} failed validation",
                        domain, address
                    )));
                }
                Ok(format!("{}@{}", local, domain))
            }
        }
    }

    /// Parses a `RCPT TO` argument into a [`Recipient`].
    pub fn new_recipient(&self, address: &str) -> Result<Recipient> {
        let (local_part, domain) = parse_email_address(address)?;
        let mailbox = self.extract_mailbox(address)?;
        Ok(Recipient {
            address: address.to_string(),
            accept: self.should_accept_domain(&domain),
            store: self.should_store_domain(&domain),
            local_part,
            domain,
            mailbox,
        })
    }

    /// Parses a `MAIL FROM` argument into an [`Origin`].
    ///
    /// The null reverse-path is recorded as `unspecified` and always accepted.
    pub fn parse_origin(&self, address: &str) -> Result<Origin> {
        if address.is_empty() || address == "unspecified" {
            return Ok(Origin {
                address: "unspecified".to_string(),
                local_part: String::new(),
                domain: String::new(),
                accept: true,
            });
        }

        let (local_part, domain) = parse_email_address(address)?;
        Ok(Origin {
            address: address.to_string(),
            accept: self.should_accept_origin_domain(&domain),
            local_part,
            domain,
        })
    }

    /// Whether mail destined for `domain` is accepted.
    pub fn should_accept_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        if self.is_discard_only(&domain) {
            return true;
        }
        if self.config.default_accept {
            !self.config.reject_domains.contains(&domain)
        } else {
            self.config.accept_domains.contains(&domain)
        }
    }

    /// Whether accepted mail destined for `domain` is written to storage.
    pub fn should_store_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        if self.is_discard_only(&domain) {
            return false;
        }
        if self.config.default_store {
            !self.config.discard_domains.contains(&domain)
        } else {
            self.config.store_domains.contains(&domain)
        }
    }

    /// Whether mail from `domain` is accepted at all.
    pub fn should_accept_origin_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        !self
            .config
            .reject_origin_domains
            .iter()
            .any(|pattern| match_wildcards(pattern, &domain))
    }

    fn is_discard_only(&self, domain: &str) -> bool {
        self.config.discard_only_domain.as_deref() == Some(domain)
    }
}
