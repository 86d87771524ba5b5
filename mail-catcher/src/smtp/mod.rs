//! SMTP acceptance (RFC 5321 subset)
//!
//! - [`server`]: accept loop and session tracking
//! - [`session`]: per-connection state machine
//! - [`commands`]: command line and argument parsing

pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::{SessionContext, SmtpSession, SmtpState};
