//! Observable state values.
//!
//! A [`StateChannel`] holds the latest value of some piece of component
//! state and broadcasts every change.  A new subscriber first receives the
//! current value and then each later change in order.  The snapshot and the
//! broadcast registration happen under the same lock, so no update falls
//! between them and none is seen twice.
//!
//! Only the owning component holds the [`StateChannel`]; everyone else gets
//! a read-only [`StateObserver`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

struct StateInner<T> {
    current: Mutex<T>,
    sender: broadcast::Sender<T>,
}

impl<T: Clone> StateInner<T> {
    fn lock(&self) -> MutexGuard<'_, T> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self) -> T {
        self.lock().clone()
    }

    fn subscribe(self: &Arc<Self>) -> StateReceiver<T> {
        let guard = self.lock();
        let receiver = self.sender.subscribe();
        StateReceiver {
            pending: Some(guard.clone()),
            receiver,
            inner: Arc::clone(self),
        }
    }
}

/// Writable state cell owned by a single component.
pub struct StateChannel<T> {
    inner: Arc<StateInner<T>>,
}

impl<T> StateChannel<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Create a channel holding `initial`.  `capacity` bounds how many
    /// unread changes a slow subscriber may accumulate.
    pub fn new(initial: T, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(StateInner {
                current: Mutex::new(initial),
                sender,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.get()
    }

    /// Store `value` and broadcast it.  Returns `false` (and broadcasts
    /// nothing) when the value is unchanged.
    pub fn set(&self, value: T) -> bool {
        self.update(|_| Some(value)).is_some()
    }

    /// Atomically compute a new value from the current one.
    ///
    /// `f` returns `None` to leave the state alone.  Returns the new value
    /// when the state actually changed.
    pub fn update<F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let mut guard = self.inner.lock();
        let next = f(&guard)?;
        if *guard == next {
            return None;
        }
        *guard = next.clone();
        // Nobody listening is fine.
        let _ = self.inner.sender.send(next.clone());
        Some(next)
    }

    pub fn subscribe(&self) -> StateReceiver<T> {
        self.inner.subscribe()
    }

    /// Read-only handle for other components.
    pub fn observer(&self) -> StateObserver<T> {
        StateObserver {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only view of a [`StateChannel`].
pub struct StateObserver<T> {
    inner: Arc<StateInner<T>>,
}

impl<T: Clone> Clone for StateObserver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> StateObserver<T> {
    pub fn get(&self) -> T {
        self.inner.get()
    }

    pub fn subscribe(&self) -> StateReceiver<T> {
        self.inner.subscribe()
    }
}

/// Latest value followed by every later change.
pub struct StateReceiver<T> {
    pending: Option<T>,
    receiver: broadcast::Receiver<T>,
    inner: Arc<StateInner<T>>,
}

impl<T: Clone + Send + 'static> StateReceiver<T> {
    /// Next value: the snapshot on the first call, then each change.
    ///
    /// A receiver that lagged behind jumps to the current value.
    pub async fn next(&mut self) -> T {
        if let Some(value) = self.pending.take() {
            return value;
        }
        match self.receiver.recv().await {
            Ok(value) => value,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "state receiver lagged, jumping to latest value");
                self.receiver = self.receiver.resubscribe();
                self.inner.get()
            }
            // The receiver keeps the sender alive through `inner`.
            Err(RecvError::Closed) => self.inner.get(),
        }
    }

    /// Wait until a value satisfying `predicate` is observed and return it.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> T
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let value = self.next().await;
            if predicate(&value) {
                return value;
            }
        }
    }

    /// Drain everything already delivered without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values: Vec<T> = self.pending.take().into_iter().collect();
        while let Ok(value) = self.receiver.try_recv() {
            values.push(value);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Amber,
        Green,
    }

    #[tokio::test]
    async fn new_subscriber_sees_current_value_first() {
        let state = StateChannel::new(Light::Red, 8);
        state.set(Light::Green);

        let mut rx = state.subscribe();
        assert_eq!(rx.next().await, Light::Green);
    }

    #[tokio::test]
    async fn every_change_is_delivered_in_order() {
        let state = StateChannel::new(Light::Red, 8);
        let mut rx = state.observer().subscribe();

        state.set(Light::Amber);
        state.set(Light::Green);
        state.set(Light::Red);

        assert_eq!(
            rx.drain(),
            vec![Light::Red, Light::Amber, Light::Green, Light::Red]
        );
    }

    #[test]
    fn unchanged_value_is_not_broadcast() {
        let state = StateChannel::new(Light::Red, 8);
        let mut rx = state.subscribe();

        assert!(!state.set(Light::Red));
        assert_eq!(rx.drain(), vec![Light::Red]);
    }

    #[test]
    fn update_is_conditional() {
        let state = StateChannel::new(Light::Red, 8);

        let changed = state.update(|current| (*current == Light::Green).then_some(Light::Amber));
        assert_eq!(changed, None);
        assert_eq!(state.get(), Light::Red);

        let changed = state.update(|current| (*current == Light::Red).then_some(Light::Green));
        assert_eq!(changed, Some(Light::Green));
        assert_eq!(state.observer().get(), Light::Green);
    }

    #[tokio::test]
    async fn wait_for_skips_until_match() {
        let state = StateChannel::new(Light::Red, 8);
        let mut rx = state.subscribe();

        let waiter = tokio::spawn(async move { rx.wait_for(|l| *l == Light::Green).await });
        state.set(Light::Amber);
        state.set(Light::Green);

        assert_eq!(waiter.await.unwrap(), Light::Green);
    }
}
