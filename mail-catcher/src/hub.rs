//! Event hub
//!
//! Fans out "message stored" and "message deleted" notifications to
//! listeners and keeps a short history of recent messages so late
//! subscribers can catch up.
//!
//! All state is owned by a single [`HubWorker`] task which drains a bounded
//! queue of [`Op`]s; [`Hub`] handles only send to that queue. A listener
//! added while messages are being dispatched therefore receives the full
//! history first, then every later event, each exactly once.

use crate::error::{MailError, Result};
use crate::extension::ExtensionHost;
use crate::message::MessageMetadata;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives hub events. Returning an error unsubscribes the listener.
pub trait Listener: Send + Sync {
    fn receive(&self, message: &MessageMetadata) -> Result<()>;

    fn delete(&self, mailbox: &str, id: &str) -> Result<()>;
}

pub type ListenerId = u64;

/// An event as seen by a channel listener
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Stored(MessageMetadata),
    Deleted { mailbox: String, id: String },
}

/// Forwards events into a channel until its receiver is dropped.
impl Listener for mpsc::UnboundedSender<HubEvent> {
    fn receive(&self, message: &MessageMetadata) -> Result<()> {
        self.send(HubEvent::Stored(message.clone()))
            .map_err(|_| MailError::Shutdown)
    }

    fn delete(&self, mailbox: &str, id: &str) -> Result<()> {
        self.send(HubEvent::Deleted {
            mailbox: mailbox.to_string(),
            id: id.to_string(),
        })
        .map_err(|_| MailError::Shutdown)
    }
}

enum Op {
    Dispatch(MessageMetadata),
    Delete { mailbox: String, id: String },
    AddListener { id: ListenerId, listener: Arc<dyn Listener> },
    RemoveListener(ListenerId),
    Sync(oneshot::Sender<()>),
}

/// Cloneable handle on the hub.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<Op>,
    next_id: Arc<AtomicU64>,
}

/// Owner of the hub state. Run it with [`HubWorker::run`].
pub struct HubWorker {
    rx: mpsc::Receiver<Op>,
    capacity: usize,
    history: VecDeque<MessageMetadata>,
    listeners: BTreeMap<ListenerId, Arc<dyn Listener>>,
}

impl Hub {
    /// Creates a hub keeping up to `history` recent messages. At most
    /// `queue_capacity` operations wait for the worker before senders block.
    pub fn new(history: usize, queue_capacity: usize) -> (Hub, HubWorker) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let hub = Hub {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let worker = HubWorker {
            rx,
            capacity: history,
            history: VecDeque::with_capacity(history),
            listeners: BTreeMap::new(),
        };
        (hub, worker)
    }

    async fn send(&self, op: Op) -> Result<()> {
        self.tx.send(op).await.map_err(|_| MailError::Shutdown)
    }

    /// Records a stored message and passes it to every listener.
    pub async fn dispatch(&self, message: MessageMetadata) -> Result<()> {
        self.send(Op::Dispatch(message)).await
    }

    /// Forgets a deleted message and tells every listener.
    pub async fn delete(&self, mailbox: &str, id: &str) -> Result<()> {
        self.send(Op::Delete {
            mailbox: mailbox.to_string(),
            id: id.to_string(),
        })
        .await
    }

    /// Subscribes `listener`. It is first replayed the current history.
    pub async fn add_listener(&self, listener: Arc<dyn Listener>) -> Result<ListenerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Op::AddListener { id, listener }).await?;
        Ok(id)
    }

    pub async fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.send(Op::RemoveListener(id)).await
    }

    /// Waits until every operation queued before this call has been applied.
    pub async fn sync(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Op::Sync(done_tx)).await?;
        done_rx.await.map_err(|_| MailError::Shutdown)
    }

    /// Feeds the hub from the extension host's "after" events. Both kinds
    /// share the host's ordered queue, and each delivery waits for room in
    /// the hub queue before the next one starts.
    pub fn register(&self, extensions: &ExtensionHost) {
        let hub = self.clone();
        extensions
            .events
            .after_message_stored
            .add_listener("hub", move |meta: MessageMetadata| {
                let hub = hub.clone();
                async move {
                    if hub.dispatch(meta).await.is_err() {
                        debug!("Hub stopped, dropping stored event");
                    }
                }
                .boxed()
            });

        let hub = self.clone();
        extensions
            .events
            .after_message_deleted
            .add_listener("hub", move |meta: MessageMetadata| {
                let hub = hub.clone();
                async move {
                    if hub.delete(&meta.mailbox, &meta.id).await.is_err() {
                        debug!("Hub stopped, dropping deleted event");
                    }
                }
                .boxed()
            });
    }
}

impl HubWorker {
    /// Applies queued operations until cancelled or every [`Hub`] is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(history = self.capacity, "Event hub started");
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => break,
                op = self.rx.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            self.apply(op);
        }
        info!("Event hub stopped");
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Dispatch(message) => {
                if self.capacity > 0 {
                    if self.history.len() == self.capacity {
                        self.history.pop_front();
                    }
                    self.history.push_back(message.clone());
                }
                self.listeners
                    .retain(|id, listener| notify(*id, || listener.receive(&message)));
            }
            Op::Delete { mailbox, id } => {
                self.history
                    .retain(|m| !(m.mailbox == mailbox && m.id == id));
                self.listeners
                    .retain(|lid, listener| notify(*lid, || listener.delete(&mailbox, &id)));
            }
            Op::AddListener { id, listener } => {
                let caught_up = self
                    .history
                    .iter()
                    .all(|message| notify(id, || listener.receive(message)));
                if caught_up {
                    debug!(listener = id, replayed = self.history.len(), "Listener added");
                    self.listeners.insert(id, listener);
                }
            }
            Op::RemoveListener(id) => {
                if self.listeners.remove(&id).is_some() {
                    debug!(listener = id, "Listener removed");
                }
            }
            Op::Sync(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Runs one listener callback. Returns false if the listener must be dropped.
fn notify<F>(id: ListenerId, call: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(listener = id, "Listener failed, removing: {}", e);
            false
        }
        Err(_) => {
            warn!(listener = id, "Listener panicked, removing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Address;
    use chrono::Utc;
    use std::sync::Mutex;

    fn meta(mailbox: &str, id: &str) -> MessageMetadata {
        MessageMetadata {
            mailbox: mailbox.to_string(),
            id: id.to_string(),
            from: Address::new("a@example.com"),
            to: vec![Address::new(format!("{}@example.com", mailbox))],
            date: Utc::now(),
            subject: format!("message {}", id),
            size: 10,
            seen: false,
        }
    }

    fn start(history: usize) -> (Hub, CancellationToken) {
        let (hub, worker) = Hub::new(history, 8);
        let cancel = CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));
        (hub, cancel)
    }

    fn ids(events: &[HubEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                HubEvent::Stored(m) => m.id.clone(),
                HubEvent::Deleted { id, .. } => format!("-{}", id),
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_new_listener_gets_history_then_live_events() {
        let (hub, _cancel) = start(3);
        for id in ["1", "2", "3", "4"] {
            hub.dispatch(meta("box", id)).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        hub.dispatch(meta("box", "5")).await.unwrap();
        hub.sync().await.unwrap();

        assert_eq!(ids(&drain(&mut rx)), vec!["2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_delivered_exactly_once() {
        let (hub, _cancel) = start(100);
        let sender = hub.clone();
        let producer = tokio::spawn(async move {
            for n in 0..50 {
                sender.dispatch(meta("box", &n.to_string())).await.unwrap();
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        producer.await.unwrap();
        hub.sync().await.unwrap();

        let expected: Vec<String> = (0..50).map(|n| n.to_string()).collect();
        assert_eq!(ids(&drain(&mut rx)), expected);
    }

    #[tokio::test]
    async fn test_zero_history_still_delivers() {
        let (hub, _cancel) = start(0);
        hub.dispatch(meta("box", "old")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        hub.dispatch(meta("box", "new")).await.unwrap();
        hub.sync().await.unwrap();

        assert_eq!(ids(&drain(&mut rx)), vec!["new"]);
    }

    #[tokio::test]
    async fn test_removed_listener_gets_nothing() {
        let (hub, _cancel) = start(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.add_listener(Arc::new(tx)).await.unwrap();
        hub.dispatch(meta("box", "1")).await.unwrap();
        hub.remove_listener(id).await.unwrap();
        hub.dispatch(meta("box", "2")).await.unwrap();
        hub.sync().await.unwrap();

        assert_eq!(ids(&drain(&mut rx)), vec!["1"]);
    }

    #[tokio::test]
    async fn test_delete_forgets_history_and_notifies() {
        let (hub, _cancel) = start(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        hub.dispatch(meta("box", "1")).await.unwrap();
        hub.dispatch(meta("box", "2")).await.unwrap();
        hub.delete("box", "1").await.unwrap();
        hub.sync().await.unwrap();
        assert_eq!(ids(&drain(&mut rx)), vec!["1", "2", "-1"]);

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(late_tx)).await.unwrap();
        hub.sync().await.unwrap();
        assert_eq!(ids(&drain(&mut late_rx)), vec!["2"]);
    }

    struct Counting {
        calls: Mutex<usize>,
        fail_after: usize,
        panic: bool,
    }

    impl Counting {
        fn new(fail_after: usize, panic: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                fail_after,
                panic,
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Listener for Counting {
        fn receive(&self, _: &MessageMetadata) -> Result<()> {
            let calls = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if calls > self.fail_after {
                if self.panic {
                    panic!("listener blew up");
                }
                return Err(MailError::Storage("listener failed".to_string()));
            }
            Ok(())
        }

        fn delete(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_listener_is_not_called_again() {
        let (hub, _cancel) = start(5);
        let failing = Counting::new(1, false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(failing.clone()).await.unwrap();
        hub.add_listener(Arc::new(tx)).await.unwrap();

        for id in ["1", "2", "3"] {
            hub.dispatch(meta("box", id)).await.unwrap();
        }
        hub.sync().await.unwrap();

        assert_eq!(failing.calls(), 2);
        assert_eq!(ids(&drain(&mut rx)), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_hub() {
        let (hub, _cancel) = start(5);
        let panicking = Counting::new(0, true);
        hub.add_listener(panicking.clone()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();

        hub.dispatch(meta("box", "1")).await.unwrap();
        hub.dispatch(meta("box", "2")).await.unwrap();
        hub.sync().await.unwrap();

        assert_eq!(panicking.calls(), 1);
        assert_eq!(ids(&drain(&mut rx)), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_unsubscribes() {
        let (hub, _cancel) = start(5);
        let (tx, rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        drop(rx);
        hub.dispatch(meta("box", "1")).await.unwrap();
        hub.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_hub_reports_shutdown() {
        let (hub, worker) = Hub::new(5, 8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
        assert!(matches!(
            hub.dispatch(meta("box", "1")).await,
            Err(MailError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_register_forwards_extension_events() {
        let extensions = ExtensionHost::new();
        let (hub, _cancel) = start(5);
        hub.register(&extensions);
        let _workers = extensions.start(CancellationToken::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        extensions.events.after_message_stored.emit(meta("box", "7"));
        extensions.events.after_message_deleted.emit(meta("box", "7"));
        extensions.sync().await;
        hub.sync().await.unwrap();

        assert_eq!(ids(&drain(&mut rx)), vec!["7", "-7"]);
    }

    #[tokio::test]
    async fn test_delete_behind_slow_extension_is_applied_last() {
        let extensions = ExtensionHost::new();
        extensions
            .events
            .after_message_stored
            .add_listener("slow", |_: MessageMetadata| {
                tokio::time::sleep(std::time::Duration::from_millis(50)).boxed()
            });
        let (hub, _cancel) = start(5);
        hub.register(&extensions);
        let _workers = extensions.start(CancellationToken::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(tx)).await.unwrap();
        extensions.events.after_message_stored.emit(meta("box", "1"));
        extensions.events.after_message_deleted.emit(meta("box", "1"));
        extensions.sync().await;
        hub.sync().await.unwrap();
        assert_eq!(ids(&drain(&mut rx)), vec!["1", "-1"]);

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        hub.add_listener(Arc::new(late_tx)).await.unwrap();
        hub.sync().await.unwrap();
        assert!(drain(&mut late_rx).is_empty());
    }
}
