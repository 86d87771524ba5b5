use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A mailbox address with an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "\"{}\" <{}>", name, self.address),
            _ => write!(f, "<{}>", self.address),
        }
    }
}

/// Everything known about a stored message except its content.
///
/// This is also the payload of "message stored" events; "message deleted"
/// events only carry `mailbox` and `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub mailbox: String,
    pub id: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub size: u64,
    #[serde(default)]
    pub seen: bool,
}

/// A message on its way into storage, before the destination mailboxes are final
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub mailboxes: Vec<String>,
    pub from: Address,
    pub to: Vec<Address>,
    pub subject: String,
    pub size: u64,
}

/// Input to `Store::add_message`. The store assigns `id` and `size`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub meta: MessageMetadata,
    pub source: Vec<u8>,
}

impl Delivery {
    pub fn new(meta: MessageMetadata, source: Vec<u8>) -> Self {
        Self { meta, source }
    }

    pub fn mailbox(&self) -> &str {
        &self.meta.mailbox
    }
}
