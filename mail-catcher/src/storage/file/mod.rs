//! File-backed message store
//!
//! Layout under the configured path:
//!
//! ```text
//! <path>/mail/<h[0..3]>/<h[0..6]>/<h>/index.json
//! <path>/mail/<h[0..3]>/<h[0..6]>/<h>/<id>.raw
//! ```
//!
//! where `h` is the hex SHA-256 of the mailbox name. The index is the commit
//! point: a message exists iff the index lists it.

mod mailbox;

use self::mailbox::FileMailbox;
use super::{hash_mailbox_name, HashLockTable, IdGenerator, Message, Store};
use crate::error::Result;
use crate::extension::ExtensionHost;
use crate::message::{Delivery, MessageMetadata};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info};

pub use self::mailbox::INDEX_FILE_NAME;

pub struct FileStore {
    mail_path: PathBuf,
    locks: HashLockTable,
    message_cap: usize,
    ids: Arc<dyn IdGenerator>,
    extensions: Arc<ExtensionHost>,
}

impl FileStore {
    /// Opens (creating if needed) the store rooted at `path`.
    ///
    /// A `message_cap` of zero disables the per-mailbox cap.
    pub fn new<P: AsRef<Path>>(
        path: P,
        message_cap: usize,
        ids: Arc<dyn IdGenerator>,
        extensions: Arc<ExtensionHost>,
    ) -> Result<Self> {
        let mail_path = path.as_ref().join("mail");
        if !mail_path.is_dir() {
            fs::create_dir_all(&mail_path).map_err(|e| {
                error!(path = ?mail_path, "Error creating dir: {}", e);
                e
            })?;
        }
        info!(path = ?mail_path, "File store opened");

        Ok(Self {
            mail_path,
            locks: HashLockTable::new(),
            message_cap,
            ids,
            extensions,
        })
    }

    pub fn mail_path(&self) -> &Path {
        &self.mail_path
    }

    /// Directory of the named mailbox, whether or not it exists yet.
    pub fn mailbox_path(&self, mailbox: &str) -> PathBuf {
        self.mailbox(mailbox).path().to_path_buf()
    }

    fn mailbox(&self, name: &str) -> FileMailbox<'_> {
        FileMailbox::new(self, name.to_string(), hash_mailbox_name(name))
    }

    fn emit_deleted(&self, meta: &MessageMetadata) {
        self.extensions
            .events
            .after_message_deleted
            .emit(meta.clone());
    }

    /// Evicts the oldest messages until there is room for one more.
    fn enforce_cap(&self, mb: &mut FileMailbox<'_>) {
        if self.message_cap == 0 {
            return;
        }
        while mb.messages.len() >= self.message_cap {
            info!(mailbox = %mb.name, cap = self.message_cap, "Mailbox over configured message cap");
            let oldest = mb.messages[0].id.clone();
            if let Err(e) = mb.remove_message(&oldest) {
                error!(mailbox = %mb.name, id = %oldest, "Error deleting message: {}", e);
                break;
            }
        }
    }
}

impl Store for FileStore {
    fn add_message(&self, delivery: Delivery) -> Result<String> {
        let mut mb = self.mailbox(delivery.mailbox());
        let _guard = self
            .locks
            .get(&mb.hash)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        mb.load()?;
        self.enforce_cap(&mut mb);

        let Delivery { mut meta, source } = delivery;
        let id = self.ids.next_id(meta.date)?;
        mb.create_dir()?;

        let raw_path = mb.raw_path(&id);
        if let Err(e) = fs::write(&raw_path, &source) {
            let _ = fs::remove_file(&raw_path);
            return Err(e.into());
        }

        meta.id = id.clone();
        meta.size = source.len() as u64;
        meta.seen = false;
        mb.messages.push(meta);
        if let Err(e) = mb.write_index() {
            mb.messages.pop();
            let _ = fs::remove_file(&raw_path);
            return Err(e);
        }

        debug!(mailbox = %mb.name, id = %id, "Message stored");
        Ok(id)
    }

    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        let mut mb = self.mailbox(mailbox);
        let _guard = self
            .locks
            .get(&mb.hash)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        mb.get_message(id)
    }

    fn get_messages(&self, mailbox: &str) -> Result<Vec<Message>> {
        let mut mb = self.mailbox(mailbox);
        let _guard = self
            .locks
            .get(&mb.hash)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        mb.get_messages()
    }

    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let mut mb = self.mailbox(mailbox);
        let _guard = self
            .locks
            .get(&mb.hash)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        mb.load()?;
        let not_found = mb.not_found(id);
        let message = mb
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(not_found)?;
        if message.seen {
            return Ok(());
        }
        message.seen = true;
        mb.write_index()
    }

    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let mut mb = self.mailbox(mailbox);
        let _guard = self
            .locks
            .get(&mb.hash)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        mb.remove_message(id).map(|_| ())
    }

    fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let mut mb = self.mailbox(mailbox);
        let _guard = self
            .locks
            .get(&mb.hash)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for meta in mb.purge()? {
            self.emit_deleted(&meta);
        }
        Ok(())
    }

    fn visit_mailboxes(&self, visitor: &mut dyn FnMut(&[Message]) -> bool) -> Result<()> {
        for level1 in read_dir_names(&self.mail_path)? {
            let level1_path = self.mail_path.join(&level1);
            for level2 in read_dir_names(&level1_path)? {
                for hash in read_dir_names(&level1_path.join(&level2))? {
                    if !is_mailbox_dir(&level1, &level2, &hash) {
                        debug!(name = %hash, "Skipping unexpected directory in store");
                        continue;
                    }
                    let messages = {
                        let mut mb = FileMailbox::new(self, String::new(), hash);
                        let _guard = self
                            .locks
                            .get(&mb.hash)
                            .read()
                            .unwrap_or_else(PoisonError::into_inner);
                        mb.get_messages()?
                    };
                    if messages.is_empty() {
                        continue;
                    }
                    if !visitor(&messages) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// True if `hash` is a mailbox hash filed under its own shard directories.
fn is_mailbox_dir(level1: &str, level2: &str, hash: &str) -> bool {
    hash.len() == 64
        && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && hash[0..3] == *level1
        && hash[0..6] == *level2
}

/// Sorted names of the subdirectories of `path`. A vanished directory is empty.
fn read_dir_names(path: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
