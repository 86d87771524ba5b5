//! Extension points
//!
//! "Before" events run synchronously inside the SMTP session and may change
//! its outcome; the first listener returning a result decides. "After"
//! events are delivered asynchronously once the change they describe has
//! been committed to storage. All of them go through one [`EventQueue`], so a
//! deletion is never handled before the store it follows.

pub mod async_broker;
pub mod broker;
pub mod types;

pub use async_broker::{AsyncEventBroker, EventQueue};
pub use broker::EventBroker;
pub use types::{SmtpResponse, SmtpSessionInfo};

use crate::message::{InboundMessage, MessageMetadata};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// All event types exposed to extensions
pub struct Events {
    pub before_mail_from_accepted: EventBroker<SmtpSessionInfo, SmtpResponse>,
    pub before_rcpt_to_accepted: EventBroker<SmtpSessionInfo, SmtpResponse>,
    /// A result replaces the inbound message, including its destination mailboxes
    pub before_message_stored: EventBroker<InboundMessage, InboundMessage>,
    pub after_message_stored: AsyncEventBroker<MessageMetadata>,
    pub after_message_deleted: AsyncEventBroker<MessageMetadata>,
}

pub struct ExtensionHost {
    pub events: Events,
    queue: Arc<EventQueue>,
}

impl Default for ExtensionHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionHost {
    pub fn new() -> Self {
        let queue = Arc::new(EventQueue::new());
        Self {
            events: Events {
                before_mail_from_accepted: EventBroker::new(),
                before_rcpt_to_accepted: EventBroker::new(),
                before_message_stored: EventBroker::new(),
                after_message_stored: AsyncEventBroker::new(
                    "after_message_stored",
                    Arc::clone(&queue),
                ),
                after_message_deleted: AsyncEventBroker::new(
                    "after_message_deleted",
                    Arc::clone(&queue),
                ),
            },
            queue,
        }
    }

    /// Starts the worker behind the asynchronous events. Returns `None` if
    /// it is already running.
    pub fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.queue.start(cancel)
    }

    /// Waits until all queued "after" events have been handled.
    pub async fn sync(&self) {
        self.queue.sync().await;
    }
}
