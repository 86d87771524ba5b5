//! On-disk representation of a single mailbox
//!
//! Callers must hold the mailbox's lock from the store's lock table for the
//! whole lifetime of a [`FileMailbox`]: a read lock for reads, the write lock
//! for anything that rewrites the index.

use super::FileStore;
use crate::error::{MailError, Result};
use crate::message::MessageMetadata;
use crate::storage::{Message, LATEST_ID};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Name of the index file in each mailbox directory
pub const INDEX_FILE_NAME: &str = "index.json";

/// Suffix of a raw message file
pub const RAW_SUFFIX: &str = "raw";

#[derive(Serialize, Deserialize)]
struct IndexFile {
    mailbox: String,
    messages: Vec<MessageMetadata>,
}

pub(super) struct FileMailbox<'a> {
    store: &'a FileStore,
    /// Empty until the index is read when opened by hash
    pub(super) name: String,
    pub(super) hash: String,
    path: PathBuf,
    index_path: PathBuf,
    index_loaded: bool,
    pub(super) messages: Vec<MessageMetadata>,
}

impl<'a> FileMailbox<'a> {
    pub(super) fn new(store: &'a FileStore, name: String, hash: String) -> Self {
        let path = store
            .mail_path()
            .join(&hash[0..3])
            .join(&hash[0..6])
            .join(&hash);
        let index_path = path.join(INDEX_FILE_NAME);
        Self {
            store,
            name,
            hash,
            path,
            index_path,
            index_loaded: false,
            messages: Vec::new(),
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn raw_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{}.{}", id, RAW_SUFFIX))
    }

    /// Loads the index on first use.
    pub(super) fn load(&mut self) -> Result<()> {
        if !self.index_loaded {
            self.read_index()?;
        }
        Ok(())
    }

    pub(super) fn to_message(&self, meta: &MessageMetadata) -> Message {
        let mut meta = meta.clone();
        if meta.mailbox.is_empty() {
            meta.mailbox = self.name.clone();
        }
        let path = self.raw_path(&meta.id);
        Message::on_disk(meta, path)
    }

    pub(super) fn get_messages(&mut self) -> Result<Vec<Message>> {
        self.load()?;
        Ok(self.messages.iter().map(|m| self.to_message(m)).collect())
    }

    pub(super) fn get_message(&mut self, id: &str) -> Result<Message> {
        self.load()?;
        let found = if id == LATEST_ID {
            self.messages.last()
        } else {
            self.messages.iter().find(|m| m.id == id)
        };
        found
            .map(|m| self.to_message(m))
            .ok_or_else(|| self.not_found(id))
    }

    /// Deletes the message from the index and its raw file from disk.
    pub(super) fn remove_message(&mut self, id: &str) -> Result<MessageMetadata> {
        self.load()?;
        let pos = self
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| self.not_found(id))?;
        let removed = self.messages.remove(pos);

        self.write_index()?;
        self.store.emit_deleted(&removed);

        if !self.messages.is_empty() {
            // Otherwise write_index removed the whole directory
            let raw = self.raw_path(&removed.id);
            debug!(path = ?raw, "Deleting file");
            if let Err(e) = fs::remove_file(&raw) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(removed)
    }

    /// Deletes every message. Returns what was removed.
    pub(super) fn purge(&mut self) -> Result<Vec<MessageMetadata>> {
        self.load()?;
        let removed = std::mem::take(&mut self.messages);
        self.write_index()?;
        Ok(removed)
    }

    pub(super) fn not_found(&self, id: &str) -> MailError {
        MailError::NotFound(format!("message {} in mailbox {:?}", id, self.name))
    }

    fn read_index(&mut self) -> Result<()> {
        self.messages.clear();
        let data = match fs::read(&self.index_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Missing mailboxes are empty
                debug!(path = ?self.index_path, "Index does not yet exist");
                self.index_loaded = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let index: IndexFile =
            serde_json::from_slice(&data).map_err(|e| MailError::CorruptIndex {
                path: self.index_path.clone(),
                reason: e.to_string(),
            })?;

        if self.name.is_empty() {
            self.name = index.mailbox;
        }
        self.messages = index.messages;
        self.index_loaded = true;
        Ok(())
    }

    /// Replaces the index on disk, or removes the mailbox once it is empty.
    ///
    /// The new index is written next to the old one and renamed over it, so
    /// a crash leaves either the old or the new index, never a partial one.
    pub(super) fn write_index(&mut self) -> Result<()> {
        if self.messages.is_empty() {
            debug!(path = ?self.path, "Removing mailbox");
            return self.remove_dir();
        }

        self.create_dir()?;
        let index = IndexFile {
            mailbox: self.name.clone(),
            messages: self.messages.clone(),
        };
        let data = serde_json::to_vec(&index)?;

        let tmp_path = self.index_path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)?;
        if let Err(e) = fs::rename(&tmp_path, &self.index_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    pub(super) fn create_dir(&self) -> Result<()> {
        if !self.path.is_dir() {
            fs::create_dir_all(&self.path).map_err(|e| {
                error!(path = ?self.path, "Failed to create directory: {}", e);
                MailError::Io(e)
            })?;
        }
        Ok(())
    }

    /// Removes the mailbox directory and any shard directories left empty.
    fn remove_dir(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(level2) = self.path.parent() {
            if remove_dir_if_empty(level2) {
                if let Some(level1) = level2.parent() {
                    remove_dir_if_empty(level1);
                }
            }
        }
        Ok(())
    }
}

/// Removes `path` if it has no entries. Returns true if it was removed.
fn remove_dir_if_empty(path: &Path) -> bool {
    let empty = match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    if !empty {
        return false;
    }
    debug!(path = ?path, "Removing dir");
    match fs::remove_dir(path) {
        Ok(()) => true,
        Err(e) => {
            // Another mailbox may have just been created under it
            debug!(path = ?path, "Failed to remove: {}", e);
            false
        }
    }
}
