use crate::storage::Message;
use std::collections::BTreeSet;

/// A mailbox as it was when the client logged in.
///
/// Message numbers are 1-based and stay stable for the whole session.
/// Deletions are only recorded here; storage is untouched until
/// [`pending_deletes`](Self::pending_deletes) is committed.
#[derive(Debug, Default)]
pub struct Snapshot {
    messages: Vec<Message>,
    deleted: BTreeSet<usize>,
}

impl Snapshot {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            deleted: BTreeSet::new(),
        }
    }

    /// Messages in the snapshot, deleted ones included
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of messages not marked for deletion
    pub fn count(&self) -> usize {
        self.messages.len() - self.deleted.len()
    }

    /// Total size of the messages not marked for deletion
    pub fn size(&self) -> u64 {
        self.retained().map(|(_, m)| m.size()).sum()
    }

    pub fn get(&self, number: usize) -> Option<&Message> {
        number.checked_sub(1).and_then(|i| self.messages.get(i))
    }

    pub fn is_deleted(&self, number: usize) -> bool {
        self.deleted.contains(&number)
    }

    /// Marks a message for deletion. False if it was already marked or
    /// does not exist.
    pub fn delete(&mut self, number: usize) -> bool {
        if self.get(number).is_none() {
            return false;
        }
        self.deleted.insert(number)
    }

    /// Unmarks every message
    pub fn reset(&mut self) {
        self.deleted.clear();
    }

    /// Messages not marked for deletion, with their numbers
    pub fn retained(&self) -> impl Iterator<Item = (usize, &Message)> {
        self.messages
            .iter()
            .enumerate()
            .map(|(i, m)| (i + 1, m))
            .filter(|(n, _)| !self.deleted.contains(n))
    }

    pub fn pending_deletes(&self) -> impl Iterator<Item = &Message> {
        self.deleted.iter().filter_map(|&n| self.get(n))
    }
}
