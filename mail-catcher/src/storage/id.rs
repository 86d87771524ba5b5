use crate::error::{MailError, Result};
use chrono::{DateTime, Utc};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{debug, error};

/// Sequence numbers wrap after this many ids
const SEQUENCE_MODULUS: u32 = 10_000;

/// Source of message ids.
pub trait IdGenerator: Send + Sync {
    /// Returns a new id for a message received at `date`.
    fn next_id(&self, date: DateTime<Utc>) -> Result<String>;
}

/// Generates `YYYYMMDDTHHMMSS-NNNN` ids.
///
/// A dedicated thread feeds a rotating 0000..9999 sequence through a small
/// bounded channel, so ids received within the same second stay unique and
/// sort by receipt order.
pub struct SequenceIdGenerator {
    sequence: Mutex<Receiver<u32>>,
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceIdGenerator {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(10);
        let spawned = thread::Builder::new()
            .name("message-id-sequence".to_string())
            .spawn(move || {
                let mut n = 0;
                while tx.send(n).is_ok() {
                    n = (n + 1) % SEQUENCE_MODULUS;
                }
                debug!("Message id sequence stopped");
            });
        if let Err(e) = spawned {
            // next_id reports the closed channel
            error!("Failed to start message id sequence: {}", e);
        }

        Self {
            sequence: Mutex::new(rx),
        }
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn next_id(&self, date: DateTime<Utc>) -> Result<String> {
        let n = self
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .map_err(|_| MailError::Storage("message id sequence stopped".to_string()))?;
        Ok(format_id(date, n))
    }
}

/// Formats an id from its timestamp prefix and sequence number.
pub fn format_id(date: DateTime<Utc>, sequence: u32) -> String {
    format!("{}-{:04}", date.format("%Y%m%dT%H%M%S"), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_id() {
        let date = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_id(date, 42), "20240309T070501-0042");
    }

    #[test]
    fn test_ids_unique_within_second() {
        let ids = SequenceIdGenerator::new();
        let date = Utc::now();
        let generated: Vec<String> = (0..100).map(|_| ids.next_id(date).unwrap()).collect();

        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(sorted, generated);
        sorted.dedup();
        assert_eq!(sorted.len(), 100);
    }

    #[test]
    fn test_sequence_wraps() {
        let ids = SequenceIdGenerator::new();
        let date = Utc::now();
        let mut last = String::new();
        for _ in 0..SEQUENCE_MODULUS + 1 {
            last = ids.next_id(date).unwrap();
        }
        assert!(last.ends_with("-0000"));
    }
}
