//! Transport security for the STARTTLS and STLS upgrades

pub mod tls;

pub use tls::TlsConfig;
