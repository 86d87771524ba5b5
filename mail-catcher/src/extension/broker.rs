use std::sync::{Arc, PoisonError, RwLock};

type Handler<E, R> = Arc<dyn Fn(&E) -> Option<R> + Send + Sync>;

/// Synchronous event broker.
///
/// Listeners run in registration order until one returns `Some`; that result
/// is handed back to the emitter and the remaining listeners are skipped.
pub struct EventBroker<E, R> {
    listeners: RwLock<Vec<(String, Handler<E, R>)>>,
}

impl<E, R> Default for EventBroker<E, R> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E, R> EventBroker<E, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: &E) -> Option<R> {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        listeners.iter().find_map(|(_, handler)| handler(event))
    }

    /// Registers the named listener, replacing one with the same name.
    pub fn add_listener<F>(&self, name: &str, handler: F)
    where
        F: Fn(&E) -> Option<R> + Send + Sync + 'static,
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

    #[test]
    fn test_first_result_wins() {
        let broker: EventBroker<u32, &'static str> = EventBroker::new();
        broker.add_listener("none", |_| None);
        broker.add_listener("even", |n| (n % 2 == 0).then_some("even"));
        broker.add_listener("any", |_| Some("any"));

        assert_eq!(broker.emit(&2), Some("even"));
        assert_eq!(broker.emit(&3), Some("any"));
    }

    #[test]
    fn test_no_listeners() {
        let broker: EventBroker<u32, bool> = EventBroker::new();
        assert_eq!(broker.emit(&1), None);
    }

    #[test]
    fn test_replace_and_remove() {
        let broker: EventBroker<u32, u32> = EventBroker::new();
        broker.add_listener("a", |_| Some(1));
        broker.add_listener("a", |_| Some(2));
        assert_eq!(broker.listener_count(), 1);
        assert_eq!(broker.emit(&0), Some(2));

        broker.remove_listener("a");
        assert_eq!(broker.emit(&0), None);
    }
}
