//! Message types and the delivery coordinator

pub mod manager;
pub mod types;

pub use manager::MessageManager;
pub use types::{Address, Delivery, InboundMessage, MessageMetadata};
