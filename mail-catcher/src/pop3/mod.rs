//! POP3 retrieval
//!
//! Clients log in with any password and see a snapshot of their mailbox
//! taken at login. Deletions are held in the session and only reach storage
//! when the client QUITs from the TRANSACTION state.

pub mod commands;
pub mod server;
pub mod session;
pub mod snapshot;

pub use commands::Pop3Command;
pub use server::Pop3Server;
pub use session::{Pop3Session, Pop3State, SessionContext};
pub use snapshot::Snapshot;
