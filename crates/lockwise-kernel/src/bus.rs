//! Process-wide action bus.
//!
//! The bus is a publish/subscribe channel built on top of
//! [`tokio::sync::broadcast`].  Every Lockwise component talks to the others
//! by publishing [`Action`]s here; nothing shares mutable fields.
//!
//! Actions are wrapped in [`Arc`] so that broadcasting to multiple
//! subscribers does not clone the payload.  Delivery is at-most-once: an
//! action published while nobody is subscribed is gone, and there is no
//! replay.  Each subscriber sees actions in publish order.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use lockwise_kernel::{Action, ActionBus, ActionKind, LifecycleAction};
//! # async fn example() {
//! let bus = ActionBus::new(256);
//! let mut lifecycle = bus.subscribe_kinds(&[ActionKind::Lifecycle]);
//!
//! bus.publish(Action::Lifecycle(LifecycleAction::Foreground));
//!
//! let action = lifecycle.next().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

use crate::action::{Action, ActionKind};

type Filter = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Action bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct ActionBus {
    inner: Arc<ActionBusInner>,
}

struct ActionBusInner {
    sender: broadcast::Sender<Arc<Action>>,
}

impl ActionBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` actions behind skips
    /// the overflow and logs how many actions it missed.  `capacity` is
    /// clamped to the range the channel supports (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.clamp(1, usize::MAX / 2));
        Self {
            inner: Arc::new(ActionBusInner { sender }),
        }
    }

    /// Publish an action to all current subscribers.
    ///
    /// Never blocks on subscriber work.  Returns the number of receivers
    /// that will observe the action; with no subscribers the action is
    /// dropped and `0` is returned.
    pub fn publish(&self, action: Action) -> usize {
        #[cfg(debug_assertions)]
        if let Action::Error(err) = &action {
            tracing::error!(context = %err.context, error = %err.error, "error action published");
        }

        let kind = action.kind();
        match self.inner.sender.send(Arc::new(action)) {
            Ok(n) => {
                tracing::trace!(?kind, receivers = n, "action published");
                n
            }
            Err(_) => {
                // No active receivers -- common during startup and shutdown.
                tracing::trace!(?kind, "action published but no active receivers");
                0
            }
        }
    }

    /// Subscribe to every future action.
    ///
    /// Actions published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> Subscription {
        tracing::trace!("new bus subscriber created");
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to actions whose kind is one of `kinds`.
    pub fn subscribe_kinds(&self, kinds: &[ActionKind]) -> Subscription {
        let kinds = kinds.to_vec();
        self.subscribe_where(move |action| kinds.contains(&action.kind()))
    }

    /// Subscribe to actions accepted by `predicate`.
    pub fn subscribe_where<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        tracing::trace!("new filtered bus subscriber created");
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter: Some(Arc::new(predicate)),
        }
    }

    /// Return the current number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live, ordered view of the bus.
///
/// Dropping the subscription is the only way to cancel it.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Action>>,
    filter: Option<Filter>,
}

impl Subscription {
    /// Wait for the next matching action.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn next(&mut self) -> Option<Arc<Action>> {
        loop {
            match self.receiver.recv().await {
                Ok(action) if self.accepts(&action) => return Some(action),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "bus subscriber lagged, actions dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next matching action that is already queued, if any.
    pub fn try_next(&mut self) -> Option<Arc<Action>> {
        loop {
            match self.receiver.try_recv() {
                Ok(action) if self.accepts(&action) => return Some(action),
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "bus subscriber lagged, actions dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a [`Stream`] of actions.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Action>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|action| (action, subscription))
        })
    }

    fn accepts(&self, action: &Action) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(action))
    }
}

// ---------------------------------------------------------------------------
// Listener handle
// ---------------------------------------------------------------------------

/// Owns a spawned subscriber task and aborts it when dropped.
///
/// Components return one of these from their `listen` methods; the owner
/// keeps it for as long as the component should react to the bus.
#[must_use = "dropping a ListenerHandle stops the listener"]
pub struct ListenerHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        tracing::debug!(listener = name, "listener started");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!(listener = self.name, "listener released");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::action::{DataStoreAction, LifecycleAction};
    use crate::error::LockwiseError;
    use crate::model::LockState;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = ActionBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(Action::Lifecycle(LifecycleAction::Startup));
        assert_eq!(receivers, 1);

        let received = rx.next().await.expect("should receive action");
        assert_eq!(*received, Action::Lifecycle(LifecycleAction::Startup));
    }

    #[tokio::test]
    async fn multiple_subscribers_share_payload() {
        let bus = ActionBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Action::DataStore(DataStoreAction::Lock));

        let a1 = rx1.next().await.expect("rx1");
        let a2 = rx2.next().await.expect("rx2");
        assert!(Arc::ptr_eq(&a1, &a2));
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let bus = ActionBus::new(0);
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(Action::UserInteraction), 1);
        assert_eq!(rx.next().await.as_deref(), Some(&Action::UserInteraction));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_dropped() {
        let bus = ActionBus::new(16);
        assert_eq!(bus.publish(Action::UserInteraction), 0);

        // A late subscriber does not see the earlier action.
        let mut rx = bus.subscribe();
        assert!(rx.try_next().is_none());
    }

    #[tokio::test]
    async fn delivery_preserves_publish_order() {
        let bus = ActionBus::new(64);
        let mut rx = bus.subscribe();

        for build in 0..20u32 {
            bus.publish(Action::Lifecycle(LifecycleAction::Upgrade {
                from: build,
                to: build + 1,
            }));
        }

        for build in 0..20u32 {
            let action = rx.next().await.unwrap();
            assert_eq!(
                *action,
                Action::Lifecycle(LifecycleAction::Upgrade {
                    from: build,
                    to: build + 1
                })
            );
        }
    }

    #[tokio::test]
    async fn kind_filter_skips_other_actions() {
        let bus = ActionBus::new(16);
        let mut errors = bus.subscribe_kinds(&[ActionKind::Error]);

        bus.publish(Action::UserInteraction);
        bus.publish(Action::LockStateChanged(LockState::Unlocked));
        bus.publish(Action::error(LockwiseError::NotUnlocked, "list"));

        let action = errors.next().await.unwrap();
        match action.as_ref() {
            Action::Error(err) => {
                assert_eq!(err.error, LockwiseError::NotUnlocked);
                assert_eq!(err.context, "list");
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(errors.try_next().is_none());
    }

    #[tokio::test]
    async fn predicate_filter() {
        let bus = ActionBus::new(16);
        let mut locks = bus.subscribe_where(|action| {
            matches!(action, Action::LockStateChanged(LockState::Locked))
        });

        bus.publish(Action::LockStateChanged(LockState::Unlocked));
        bus.publish(Action::LockStateChanged(LockState::Locked));

        let action = locks.next().await.unwrap();
        assert_eq!(*action, Action::LockStateChanged(LockState::Locked));
    }

    #[tokio::test]
    async fn subscriber_count_tracks_drops() {
        let bus = ActionBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);

        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe_kinds(&[ActionKind::Lifecycle]);
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_overflow() {
        let bus = ActionBus::new(2);
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            bus.publish(Action::UserInteraction);
        }
        bus.publish(Action::DataStore(DataStoreAction::Lock));

        // The subscriber recovers and still sees the newest action last.
        let mut last = None;
        while let Some(action) = rx.try_next() {
            last = Some(action);
        }
        assert_eq!(
            last.as_deref(),
            Some(&Action::DataStore(DataStoreAction::Lock))
        );
    }

    #[tokio::test]
    async fn subscription_as_stream() {
        let bus = ActionBus::new(16);
        let stream = bus.subscribe_kinds(&[ActionKind::Lifecycle]).into_stream();
        tokio::pin!(stream);

        bus.publish(Action::Lifecycle(LifecycleAction::Background));
        bus.publish(Action::UserInteraction);
        bus.publish(Action::Lifecycle(LifecycleAction::Foreground));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(*first, Action::Lifecycle(LifecycleAction::Background));
        assert_eq!(*second, Action::Lifecycle(LifecycleAction::Foreground));
    }

    #[tokio::test]
    async fn dropping_listener_handle_aborts_task() {
        let bus = ActionBus::new(16);
        let mut rx = bus.subscribe();
        let handle = ListenerHandle::new(
            "test",
            tokio::spawn(async move { while rx.next().await.is_some() {} }),
        );
        assert_eq!(bus.subscriber_count(), 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
