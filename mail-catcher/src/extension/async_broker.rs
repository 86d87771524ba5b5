use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

enum Job {
    Run(BoxFuture<'static, ()>),
    Sync(oneshot::Sender<()>),
}

/// Ordered queue shared by every [`AsyncEventBroker`] of an extension host.
///
/// A single worker runs queued deliveries one at a time, so events emitted on
/// different brokers are still handled in the order they were emitted.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn push(&self, delivery: BoxFuture<'static, ()>) -> bool {
        self.tx.send(Job::Run(delivery)).is_ok()
    }

    /// Waits until every delivery queued before this call has completed.
    pub async fn sync(&self) {
        if self.rx.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            // Worker not started, nothing will ever drain the queue
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Sync(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Spawns the worker. Returns `None` if it was already started.
    pub fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()?;

        Some(tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                match job {
                    Job::Run(delivery) => delivery.await,
                    Job::Sync(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Event worker stopped");
        }))
    }
}

/// Asynchronous event broker.
///
/// `emit` never blocks. The delivery is appended to the host's [`EventQueue`]
/// and, when its turn comes, each listener runs to completion in
/// registration order before the next queued delivery starts.
pub struct AsyncEventBroker<E> {
    name: &'static str,
    listeners: Arc<RwLock<Vec<(String, Handler<E>)>>>,
    queue: Arc<EventQueue>,
}

impl<E: Clone + Send + Sync + 'static> AsyncEventBroker<E> {
    pub fn new(name: &'static str, queue: Arc<EventQueue>) -> Self {
        Self {
            name,
            listeners: Arc::new(RwLock::new(Vec::new())),
            queue,
        }
    }

    /// Queues the event for delivery. Dropped when nobody listens.
    pub fn emit(&self, event: E) {
        if self.listener_count() == 0 {
            return;
        }

        let listeners = Arc::clone(&self.listeners);
        let name = self.name;
        let delivery = async move {
            let handlers: Vec<(String, Handler<E>)> = listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for (listener, handler) in handlers {
                let outcome = AssertUnwindSafe(async { handler(event.clone()).await })
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!(broker = name, listener = %listener, "Event listener panicked");
                }
            }
        }
        .boxed();

        if !self.queue.push(delivery) {
            debug!(broker = self.name, "Event worker stopped, dropping event");
        }
    }

    /// Registers the named listener, replacing one with the same name.
    pub fn add_listener<F>(&self, name: &str, handler: F)
    where
        F: Fn(E) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|(n, _)| n != name);
        listeners.push((name.to_string(), Arc::new(handler)));
    }

    pub fn remove_listener(&self, name: &str) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|(n, _)| n != name);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broker<E: Clone + Send + Sync + 'static>() -> (AsyncEventBroker<E>, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new());
        (AsyncEventBroker::new("test", Arc::clone(&queue)), queue)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (broker, queue) = broker::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        broker.add_listener("collect", move |n| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::task::yield_now().await;
                sink.lock().unwrap().push(n);
            }
            .boxed()
        });

        let _worker = queue.start(CancellationToken::new()).unwrap();
        for n in 0..10 {
            broker.emit(n);
        }
        queue.sync().await;

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_brokers_sharing_a_queue_keep_emission_order() {
        let queue = Arc::new(EventQueue::new());
        let first = AsyncEventBroker::<u32>::new("first", Arc::clone(&queue));
        let second = AsyncEventBroker::<u32>::new("second", Arc::clone(&queue));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        first.add_listener("slow", move |n| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                sink.lock().unwrap().push(format!("first {}", n));
            }
            .boxed()
        });
        let sink = Arc::clone(&seen);
        second.add_listener("fast", move |n| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().unwrap().push(format!("second {}", n)) }.boxed()
        });

        let _worker = queue.start(CancellationToken::new()).unwrap();
        first.emit(1);
        second.emit(1);
        queue.sync().await;

        assert_eq!(*seen.lock().unwrap(), vec!["first 1", "second 1"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_worker() {
        let (broker, queue) = broker::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));

        broker.add_listener("bad", |n| {
            async move {
                if n == 1 {
                    panic!("listener failure");
                }
            }
            .boxed()
        });
        let sink = Arc::clone(&seen);
        broker.add_listener("good", move |n| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().unwrap().push(n) }.boxed()
        });

        let _worker = queue.start(CancellationToken::new()).unwrap();
        broker.emit(1);
        broker.emit(2);
        queue.sync().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let queue = EventQueue::new();
        assert!(queue.start(CancellationToken::new()).is_some());
        assert!(queue.start(CancellationToken::new()).is_none());
    }
}
