//! Message storage
//!
//! Two backends implement [`Store`]:
//! - [`file::FileStore`]: one sharded directory per mailbox, with a JSON index
//!   and one `.raw` file per message
//! - [`memory::MemoryStore`]: everything in process memory, for tests and
//!   throwaway deployments
//!
//! Every backend reports a missing mailbox or message as
//! [`MailError::NotFound`](crate::error::MailError::NotFound) and emits an
//! `after_message_deleted` event for each message it drops.

pub mod file;
pub mod id;
pub mod lock;
pub mod memory;
pub mod retention;

pub use file::FileStore;
pub use id::{IdGenerator, SequenceIdGenerator};
pub use lock::HashLockTable;
pub use memory::MemoryStore;
pub use retention::{RetentionScanner, ScanSummary};

use crate::config::{StorageConfig, StorageKind};
use crate::error::{MailError, Result};
use crate::extension::ExtensionHost;
use crate::message::{Delivery, MessageMetadata};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

/// Reserved message id resolving to the most recently added message
pub const LATEST_ID: &str = "latest";

pub trait Store: Send + Sync {
    /// Stores the delivery. Its `id` and `size` are ignored and assigned here.
    fn add_message(&self, delivery: Delivery) -> Result<String>;

    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message>;

    /// All messages of the mailbox, oldest first. Unknown mailboxes are empty.
    fn get_messages(&self, mailbox: &str) -> Result<Vec<Message>>;

    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()>;

    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()>;

    fn purge_messages(&self, mailbox: &str) -> Result<()>;

    /// Calls `visitor` with the messages of each mailbox until it returns false.
    ///
    /// No lock is held while the visitor runs, so it may mutate the store.
    fn visit_mailboxes(&self, visitor: &mut dyn FnMut(&[Message]) -> bool) -> Result<()>;
}

/// Where the content of a stored message lives
#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// A stored message: metadata plus a handle on its raw content
#[derive(Debug, Clone)]
pub struct Message {
    meta: MessageMetadata,
    source: Source,
}

impl Message {
    pub(crate) fn on_disk(meta: MessageMetadata, path: PathBuf) -> Self {
        Self {
            meta,
            source: Source::File(path),
        }
    }

    pub(crate) fn in_memory(meta: MessageMetadata, source: Arc<[u8]>) -> Self {
        Self {
            meta,
            source: Source::Memory(source),
        }
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.meta
    }

    pub fn into_metadata(self) -> MessageMetadata {
        self.meta
    }

    pub fn mailbox(&self) -> &str {
        &self.meta.mailbox
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.meta.date
    }

    pub fn subject(&self) -> &str {
        &self.meta.subject
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn seen(&self) -> bool {
        self.meta.seen
    }

    /// Reads the raw message, exactly as it was delivered.
    pub fn source(&self) -> Result<Vec<u8>> {
        match &self.source {
            Source::Memory(bytes) => Ok(bytes.to_vec()),
            Source::File(path) => std::fs::read(path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MailError::NotFound(format!(
                    "{}/{}",
                    self.meta.mailbox, self.meta.id
                )),
                _ => MailError::Io(e),
            }),
        }
    }
}

/// Hex SHA-256 digest of a mailbox name, used for shard paths and lock lookup
pub fn hash_mailbox_name(mailbox: &str) -> String {
    format!("{:x}", Sha256::digest(mailbox.as_bytes()))
}

/// Builds the configured store.
pub fn from_config(
    config: &StorageConfig,
    ids: Arc<dyn IdGenerator>,
    extensions: Arc<ExtensionHost>,
) -> Result<Arc<dyn Store>> {
    match config.kind {
        StorageKind::File => Ok(Arc::new(FileStore::new(
            &config.path,
            config.mailbox_msg_cap,
            ids,
            extensions,
        )?)),
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new(
            config.mailbox_msg_cap,
            config.max_total_kb * 1024,
            extensions,
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the backend test suites

    use super::*;
    use crate::message::Address;
    use chrono::Duration;

    pub fn delivery(mailbox: &str, subject: &str) -> Delivery {
        dated_delivery(mailbox, subject, Utc::now())
    }

    pub fn dated_delivery(mailbox: &str, subject: &str, date: DateTime<Utc>) -> Delivery {
        let source = format!(
            "From: sender@example.com\r\nTo: {}@example.com\r\nSubject: {}\r\n\r\nBody of {}\r\n",
            mailbox, subject, subject
        );
        Delivery::new(
            MessageMetadata {
                mailbox: mailbox.to_string(),
                id: String::new(),
                from: Address::new("sender@example.com"),
                to: vec![Address::new(format!("{}@example.com", mailbox))],
                date,
                subject: subject.to_string(),
                size: 0,
                seen: false,
            },
            source.into_bytes(),
        )
    }

    pub fn hours_ago(hours: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(hours)
    }

    /// Contract checks every backend must pass
    pub fn store_suite(store: &dyn Store) {
        // Empty mailbox
        assert!(store.get_messages("empty").unwrap().is_empty());
        assert!(store.get_message("empty", "nope").unwrap_err().is_not_found());
        assert!(store.get_message("empty", LATEST_ID).unwrap_err().is_not_found());

        // Receipt order and distinct ids
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.add_message(delivery("order", &format!("subject {}", n))).unwrap());
        }
        let listed = store.get_messages("order").unwrap();
        assert_eq!(listed.iter().map(|m| m.id().to_string()).collect::<Vec<_>>(), ids);
        for (n, m) in listed.iter().enumerate() {
            assert_eq!(m.subject(), format!("subject {}", n));
            assert_eq!(m.mailbox(), "order");
            assert!(m.size() > 0);
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());

        // Content and latest
        let latest = store.get_message("order", LATEST_ID).unwrap();
        assert_eq!(latest.id(), ids[4]);
        let source = String::from_utf8(latest.source().unwrap()).unwrap();
        assert!(source.contains("Subject: subject 4"));
        assert_eq!(latest.size(), source.len() as u64);

        // Seen flag
        assert!(!store.get_message("order", &ids[1]).unwrap().seen());
        store.mark_seen("order", &ids[1]).unwrap();
        assert!(store.get_message("order", &ids[1]).unwrap().seen());
        assert!(store.mark_seen("order", "missing").unwrap_err().is_not_found());

        // Removal
        store.remove_message("order", &ids[2]).unwrap();
        assert!(store.get_message("order", &ids[2]).unwrap_err().is_not_found());
        assert_eq!(store.get_messages("order").unwrap().len(), 4);
        assert!(store.remove_message("order", &ids[2]).unwrap_err().is_not_found());

        // Visiting sees every mailbox once
        store.add_message(delivery("other", "x")).unwrap();
        let mut visited = Vec::new();
        store
            .visit_mailboxes(&mut |messages| {
                visited.push((messages[0].mailbox().to_string(), messages.len()));
                true
            })
            .unwrap();
        visited.sort();
        assert_eq!(visited, vec![("order".to_string(), 4), ("other".to_string(), 1)]);

        // Visiting stops early
        let mut calls = 0;
        store
            .visit_mailboxes(&mut |_| {
                calls += 1;
                false
            })
            .unwrap();
        assert_eq!(calls, 1);

        // Purge
        store.purge_messages("order").unwrap();
        assert!(store.get_messages("order").unwrap().is_empty());
        store.purge_messages("never-existed").unwrap();
    }

    /// Per-mailbox cap of three evicts the oldest messages
    pub fn cap_suite(store: &dyn Store) {
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.add_message(delivery("capped", &format!("{}", n))).unwrap());
            assert!(store.get_messages("capped").unwrap().len() <= 3);
        }
        let kept: Vec<String> = store
            .get_messages("capped")
            .unwrap()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(kept, ids[2..].to_vec());
    }
}
