//! Delivery coordinator
//!
//! Sits between the protocol sessions and storage: decides which mailboxes
//! receive an accepted message, stamps each copy with its trace header and
//! announces what was stored.

use super::{Address, Delivery, InboundMessage, MessageMetadata};
use crate::error::Result;
use crate::extension::ExtensionHost;
use crate::policy::{AddressPolicy, Origin, Recipient};
use crate::storage::{Message, Store};
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct MessageManager {
    policy: Arc<AddressPolicy>,
    store: Arc<dyn Store>,
    extensions: Arc<ExtensionHost>,
}

/// Header values taken from the message itself
struct ParsedHeaders {
    from: Option<Address>,
    to: Vec<Address>,
    subject: Option<String>,
}

impl MessageManager {
    pub fn new(
        policy: Arc<AddressPolicy>,
        store: Arc<dyn Store>,
        extensions: Arc<ExtensionHost>,
    ) -> Self {
        Self {
            policy,
            store,
            extensions,
        }
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Stores one copy of `source` per destination mailbox.
    ///
    /// `received_header` is the first line of the trace header; the
    /// per-mailbox `for` clause and timestamp are appended here. The first
    /// storage failure aborts the delivery and is returned.
    pub fn deliver(
        &self,
        from: &Origin,
        recipients: &[Recipient],
        received_header: &str,
        source: &[u8],
    ) -> Result<()> {
        let headers = parse_headers(source);
        let now = Utc::now();

        let mut mailboxes: Vec<String> = Vec::new();
        for recipient in recipients.iter().filter(|r| r.should_store()) {
            if !mailboxes.contains(&recipient.mailbox) {
                mailboxes.push(recipient.mailbox.clone());
            }
        }

        let inbound = InboundMessage {
            mailboxes,
            from: headers
                .from
                .unwrap_or_else(|| Address::new(from.address.clone())),
            to: if headers.to.is_empty() {
                recipients
                    .iter()
                    .map(|r| Address::new(r.address.clone()))
                    .collect()
            } else {
                headers.to
            },
            subject: headers.subject.unwrap_or_default(),
            size: source.len() as u64,
        };

        let inbound = match self.extensions.events.before_message_stored.emit(&inbound) {
            Some(replaced) => {
                debug!(mailboxes = ?replaced.mailboxes, "Extension replaced destination");
                replaced
            }
            None => inbound,
        };

        if inbound.mailboxes.is_empty() {
            debug!(from = %from.address, "No recipient stores mail, message discarded");
            return Ok(());
        }

        for mailbox in &inbound.mailboxes {
            let mut content = trace_header(received_header, mailbox, now).into_bytes();
            content.extend_from_slice(source);

            let meta = MessageMetadata {
                mailbox: mailbox.clone(),
                id: String::new(),
                from: inbound.from.clone(),
                to: inbound.to.clone(),
                date: now,
                subject: inbound.subject.clone(),
                size: 0,
                seen: false,
            };

            let size = content.len() as u64;
            let mut stored = meta.clone();
            let id = self.store.add_message(Delivery::new(meta, content))?;
            info!(mailbox = %mailbox, id = %id, size, "Message delivered");

            stored.id = id;
            stored.size = size;
            self.extensions.events.after_message_stored.emit(stored);
        }
        Ok(())
    }

    /// Metadata of every message in the mailbox, oldest first.
    pub fn get_metadata(&self, mailbox: &str) -> Result<Vec<MessageMetadata>> {
        Ok(self
            .store
            .get_messages(mailbox)?
            .into_iter()
            .map(Message::into_metadata)
            .collect())
    }

    pub fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        self.store.get_message(mailbox, id)
    }

    /// Raw content of a message, exactly as stored.
    pub fn source(&self, mailbox: &str, id: &str) -> Result<Vec<u8>> {
        self.store.get_message(mailbox, id)?.source()
    }

    pub fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        self.store.mark_seen(mailbox, id)
    }

    pub fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        self.store.remove_message(mailbox, id)
    }

    pub fn purge_messages(&self, mailbox: &str) -> Result<()> {
        self.store.purge_messages(mailbox)
    }

    pub fn mailbox_for_address(&self, address: &str) -> Result<String> {
        self.policy.extract_mailbox(address)
    }
}

fn trace_header(received_header: &str, mailbox: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}  for <{}>; {}\r\n",
        received_header,
        mailbox,
        now.format("%a, %d %b %Y %H:%M:%S %z (UTC)")
    )
}

fn parse_headers(source: &[u8]) -> ParsedHeaders {
    let Some(parsed) = MessageParser::default().parse(source) else {
        warn!("Unable to parse message headers, using envelope");
        return ParsedHeaders {
            from: None,
            to: Vec::new(),
            subject: None,
        };
    };

    let from = parsed
        .from()
        .and_then(|f| f.first())
        .and_then(convert_address);

    let to = match parsed.to() {
        Some(mail_parser::Address::List(list)) => list.iter().filter_map(convert_address).collect(),
        Some(mail_parser::Address::Group(groups)) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .filter_map(convert_address)
            .collect(),
        None => Vec::new(),
    };

    let subject = parsed.subject().map(|s| s.to_string());

    ParsedHeaders { from, to, subject }
}

fn convert_address(addr: &mail_parser::Addr) -> Option<Address> {
    let address = addr.address().filter(|a| !a.is_empty())?;
    Some(match addr.name().filter(|n| !n.is_empty()) {
        Some(name) => Address::with_name(name, address),
        None => Address::new(address),
    })
}
