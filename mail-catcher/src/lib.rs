//! mail-catcher: disposable mailboxes for testing mail-sending software
//!
//! Accepts mail for any address over SMTP, stores it in a mailbox named
//! after the recipient, and serves it back over POP3. Old messages are
//! expired by a background scanner.
//!
//! # Example
//!
//! ```no_run
//! use mail_catcher::config::Config;
//! use mail_catcher::server::Services;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut services = Services::build(Config::default())?;
//!     let cancel = CancellationToken::new();
//!     services.start(cancel.clone()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     cancel.cancel();
//!     services.drain(Duration::from_secs(15)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`smtp`]: mail acceptance
//! - [`pop3`]: mail retrieval
//! - [`policy`]: address parsing and domain rules
//! - [`message`]: delivery coordinator between sessions and storage
//! - [`storage`]: file and memory stores, retention
//! - [`hub`]: stored/deleted notifications
//! - [`extension`]: hooks into sessions and storage
//! - [`metrics`]: connection, delivery and retention counters
//! - [`server`]: service lifecycle

pub mod config;
pub mod error;
pub mod extension;
pub mod hub;
pub mod message;
pub mod metrics;
pub mod net;
pub mod policy;
pub mod pop3;
pub mod security;
pub mod server;
pub mod smtp;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
pub use server::Services;
