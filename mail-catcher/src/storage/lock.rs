use std::sync::RwLock;

/// Number of locks; indexed by the first three hex digits of a mailbox hash
pub const LOCK_TABLE_SIZE: usize = 4096;

/// Fixed-size table of reader/writer locks shared by all mailboxes.
///
/// Mailboxes whose hashes share a three digit prefix share a lock. That only
/// ever serializes more than necessary.
pub struct HashLockTable {
    locks: Box<[RwLock<()>]>,
}

impl Default for HashLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashLockTable {
    pub fn new() -> Self {
        Self {
            locks: (0..LOCK_TABLE_SIZE).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Lock guarding the mailbox with the given hex hash.
    pub fn get(&self, hash: &str) -> &RwLock<()> {
        &self.locks[Self::index(hash)]
    }

    fn index(hash: &str) -> usize {
        hash.get(..3)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_from_prefix() {
        assert_eq!(HashLockTable::index("000abc"), 0);
        assert_eq!(HashLockTable::index("fff123"), 4095);
        assert_eq!(HashLockTable::index("a1b"), 0xa1b);
        assert_eq!(HashLockTable::index("zz"), 0);
    }

    #[test]
    fn test_shared_prefix_shares_lock() {
        let table = HashLockTable::new();
        assert!(std::ptr::eq(table.get("abc111"), table.get("abc999")));
        assert!(!std::ptr::eq(table.get("abc111"), table.get("abd111")));
    }
}
