//! In-memory message store
//!
//! Ids are per-mailbox sequence numbers. An optional global size limit
//! evicts the oldest messages across all mailboxes once the total size of
//! stored sources exceeds it.

use super::{Message, Store, LATEST_ID};
use crate::error::{MailError, Result};
use crate::extension::ExtensionHost;
use crate::message::{Delivery, MessageMetadata};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

struct MemMessage {
    meta: MessageMetadata,
    source: Arc<[u8]>,
}

#[derive(Default)]
struct MemMailbox {
    last: u64,
    messages: BTreeMap<u64, MemMessage>,
}

impl MemMailbox {
    fn to_messages(&self) -> Vec<Message> {
        self.messages
            .values()
            .map(|m| Message::in_memory(m.meta.clone(), Arc::clone(&m.source)))
            .collect()
    }
}

/// Tracks stored sizes in insertion order.
struct SizeEnforcer {
    max: u64,
    current: u64,
    queue: VecDeque<(String, u64, u64)>,
}

impl SizeEnforcer {
    fn forget(&mut self, mailbox: &str, key: u64) {
        let mut freed = 0;
        self.queue.retain(|(mb, k, size)| {
            if mb == mailbox && *k == key {
                freed += size;
                false
            } else {
                true
            }
        });
        self.current -= freed;
    }

    fn forget_mailbox(&mut self, mailbox: &str) {
        let mut freed = 0;
        self.queue.retain(|(mb, _, size)| {
            if mb == mailbox {
                freed += size;
                false
            } else {
                true
            }
        });
        self.current -= freed;
    }
}

/// Keeps all messages in process memory.
///
/// Locks are always taken in the order size enforcer, mailbox table,
/// mailbox. The mailbox table lock is only held long enough to look up a
/// mailbox.
pub struct MemoryStore {
    mailboxes: Mutex<HashMap<String, Arc<RwLock<MemMailbox>>>>,
    message_cap: usize,
    enforcer: Option<Mutex<SizeEnforcer>>,
    extensions: Arc<ExtensionHost>,
}

impl MemoryStore {
    /// `message_cap` and `max_total_bytes` are disabled when zero.
    pub fn new(message_cap: usize, max_total_bytes: u64, extensions: Arc<ExtensionHost>) -> Self {
        let enforcer = (max_total_bytes > 0).then(|| {
            Mutex::new(SizeEnforcer {
                max: max_total_bytes,
                current: 0,
                queue: VecDeque::new(),
            })
        });
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            message_cap,
            enforcer,
            extensions,
        }
    }

    /// Total size of stored sources, when a size limit is configured.
    pub fn total_size(&self) -> Option<u64> {
        self.enforcer.as_ref().map(|e| lock(e).current)
    }

    fn lookup(&self, mailbox: &str) -> Option<Arc<RwLock<MemMailbox>>> {
        lock(&self.mailboxes).get(mailbox).cloned()
    }

    fn lookup_or_create(&self, mailbox: &str) -> Arc<RwLock<MemMailbox>> {
        Arc::clone(lock(&self.mailboxes).entry(mailbox.to_string()).or_default())
    }

    fn lock_enforcer(&self) -> Option<MutexGuard<'_, SizeEnforcer>> {
        self.enforcer.as_ref().map(lock)
    }

    fn emit_deleted(&self, meta: MessageMetadata) {
        self.extensions.events.after_message_deleted.emit(meta);
    }

    /// Evicts globally oldest messages until the size limit holds again.
    fn enforce_size(&self, enforcer: &mut SizeEnforcer) {
        while enforcer.current > enforcer.max {
            let Some((mailbox, key, size)) = enforcer.queue.pop_front() else {
                break;
            };
            enforcer.current -= size;
            let Some(mb) = self.lookup(&mailbox) else {
                continue;
            };
            let removed = mb
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .messages
                .remove(&key);
            if let Some(removed) = removed {
                info!(mailbox = %mailbox, id = %removed.meta.id, "Store over size limit, evicted message");
                self.emit_deleted(removed.meta);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_key(mailbox: &str, id: &str) -> Result<u64> {
    id.parse().map_err(|_| not_found(mailbox, id))
}

fn not_found(mailbox: &str, id: &str) -> MailError {
    MailError::NotFound(format!("message {} in mailbox {:?}", id, mailbox))
}

impl Store for MemoryStore {
    fn add_message(&self, delivery: Delivery) -> Result<String> {
        let mut enforcer = self.lock_enforcer();
        let Delivery { mut meta, source } = delivery;
        let mailbox = meta.mailbox.clone();
        let size = source.len() as u64;

        let key = {
            let mb = self.lookup_or_create(&mailbox);
            let mut mb = mb.write().unwrap_or_else(PoisonError::into_inner);

            if self.message_cap > 0 {
                while mb.messages.len() >= self.message_cap {
                    let Some((key, oldest)) = mb.messages.pop_first() else {
                        break;
                    };
                    info!(mailbox = %mailbox, cap = self.message_cap, "Mailbox over configured message cap");
                    if let Some(enforcer) = enforcer.as_mut() {
                        enforcer.forget(&mailbox, key);
                    }
                    self.emit_deleted(oldest.meta);
                }
            }

            mb.last += 1;
            let key = mb.last;
            meta.id = key.to_string();
            meta.size = size;
            meta.seen = false;
            mb.messages.insert(
                key,
                MemMessage {
                    meta,
                    source: source.into(),
                },
            );
            key
        };

        if let Some(enforcer) = enforcer.as_mut() {
            enforcer.queue.push_back((mailbox.clone(), key, size));
            enforcer.current += size;
            self.enforce_size(enforcer);
        }

        debug!(mailbox = %mailbox, id = key, "Message stored");
        Ok(key.to_string())
    }

    fn get_message(&self, mailbox: &str, id: &str) -> Result<Message> {
        let mb = self.lookup(mailbox).ok_or_else(|| not_found(mailbox, id))?;
        let mb = mb.read().unwrap_or_else(PoisonError::into_inner);
        let found = if id == LATEST_ID {
            mb.messages.values().next_back()
        } else {
            mb.messages.get(&parse_key(mailbox, id)?)
        };
        found
            .map(|m| Message::in_memory(m.meta.clone(), Arc::clone(&m.source)))
            .ok_or_else(|| not_found(mailbox, id))
    }

    fn get_messages(&self, mailbox: &str) -> Result<Vec<Message>> {
        Ok(self
            .lookup(mailbox)
            .map(|mb| mb.read().unwrap_or_else(PoisonError::into_inner).to_messages())
            .unwrap_or_default())
    }

    fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let key = parse_key(mailbox, id)?;
        let mb = self.lookup(mailbox).ok_or_else(|| not_found(mailbox, id))?;
        let mut mb = mb.write().unwrap_or_else(PoisonError::into_inner);
        let message = mb
            .messages
            .get_mut(&key)
            .ok_or_else(|| not_found(mailbox, id))?;
        message.meta.seen = true;
        Ok(())
    }

    fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let key = parse_key(mailbox, id)?;
        let mut enforcer = self.lock_enforcer();
        let mb = self.lookup(mailbox).ok_or_else(|| not_found(mailbox, id))?;
        let removed = mb
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .remove(&key)
            .ok_or_else(|| not_found(mailbox, id))?;

        if let Some(enforcer) = enforcer.as_mut() {
            enforcer.forget(mailbox, key);
        }
        self.emit_deleted(removed.meta);
        Ok(())
    }

    fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let mut enforcer = self.lock_enforcer();
        let Some(mb) = self.lookup(mailbox) else {
            return Ok(());
        };
        let removed = std::mem::take(&mut mb.write().unwrap_or_else(PoisonError::into_inner).messages);

        if let Some(enforcer) = enforcer.as_mut() {
            enforcer.forget_mailbox(mailbox);
        }
        for message in removed.into_values() {
            self.emit_deleted(message.meta);
        }
        Ok(())
    }

    fn visit_mailboxes(&self, visitor: &mut dyn FnMut(&[Message]) -> bool) -> Result<()> {
        let mut mailboxes: Vec<(String, Arc<RwLock<MemMailbox>>)> = {
            let mut table = lock(&self.mailboxes);
            // Nobody else holds a handle on an unreferenced empty mailbox
            table.retain(|_, mb| {
                Arc::strong_count(mb) > 1
                    || !mb.read().unwrap_or_else(PoisonError::into_inner).messages.is_empty()
            });
            table
                .iter()
                .map(|(name, mb)| (name.clone(), Arc::clone(mb)))
                .collect()
        };
        mailboxes.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, mb) in mailboxes {
            let messages = mb.read().unwrap_or_else(PoisonError::into_inner).to_messages();
            if messages.is_empty() {
                continue;
            }
            if !visitor(&messages) {
                break;
            }
        }
        Ok(())
    }
}
