//! Integration tests for the lockwise-kernel crate.
//!
//! These tests exercise the action bus, state channels and listener handles
//! together the way the session components use them.

use std::sync::Arc;
use std::time::Duration;

use lockwise_kernel::{
    Action, ActionBus, ActionKind, DataStoreAction, LifecycleAction, ListenerHandle, LockState,
    LockwiseError, StateChannel,
};

// ═══════════════════════════════════════════════════════════════════════
//  Bus-driven state machine
// ═══════════════════════════════════════════════════════════════════════

/// A toy component that flips a lock state in response to bus commands and
/// reports transitions back on the bus.
fn spawn_toy_store(bus: &ActionBus, state: Arc<StateChannel<LockState>>) -> ListenerHandle {
    let mut commands = bus.subscribe_kinds(&[ActionKind::DataStore]);
    let bus = bus.clone();
    ListenerHandle::new(
        "toy-store",
        tokio::spawn(async move {
            while let Some(action) = commands.next().await {
                let next = match action.as_ref() {
                    Action::DataStore(DataStoreAction::Lock) => LockState::Locked,
                    Action::DataStore(DataStoreAction::Unlock { .. }) => LockState::Unlocked,
                    _ => continue,
                };
                if state.set(next) {
                    bus.publish(Action::LockStateChanged(next));
                }
            }
        }),
    )
}

#[tokio::test]
async fn commands_round_trip_through_the_bus() {
    let bus = ActionBus::new(64);
    let state = Arc::new(StateChannel::new(LockState::Locked, 16));
    let _store = spawn_toy_store(&bus, Arc::clone(&state));
    let mut changes = bus.subscribe_kinds(&[ActionKind::LockState]);
    let mut observed = state.observer().subscribe();

    bus.publish(Action::DataStore(DataStoreAction::Unlock { key: None }));
    bus.publish(Action::DataStore(DataStoreAction::Lock));

    assert_eq!(
        *changes.next().await.unwrap(),
        Action::LockStateChanged(LockState::Unlocked)
    );
    assert_eq!(
        *changes.next().await.unwrap(),
        Action::LockStateChanged(LockState::Locked)
    );

    assert_eq!(observed.next().await, LockState::Locked);
    assert_eq!(observed.next().await, LockState::Unlocked);
    assert_eq!(observed.next().await, LockState::Locked);
}

#[tokio::test]
async fn redundant_command_emits_nothing() {
    let bus = ActionBus::new(64);
    let state = Arc::new(StateChannel::new(LockState::Locked, 16));
    let _store = spawn_toy_store(&bus, Arc::clone(&state));
    let mut changes = bus.subscribe_kinds(&[ActionKind::LockState]);

    bus.publish(Action::DataStore(DataStoreAction::Lock));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(changes.try_next().is_none());
    assert_eq!(state.get(), LockState::Locked);
}

#[tokio::test]
async fn dropped_listener_stops_reacting() {
    let bus = ActionBus::new(64);
    let state = Arc::new(StateChannel::new(LockState::Locked, 16));
    let store = spawn_toy_store(&bus, Arc::clone(&state));
    assert_eq!(store.name(), "toy-store");

    drop(store);
    tokio::time::sleep(Duration::from_millis(20)).await;

    bus.publish(Action::DataStore(DataStoreAction::Unlock { key: None }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.get(), LockState::Locked);
}

// ═══════════════════════════════════════════════════════════════════════
//  Independent subscribers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn independent_subscribers_see_same_order() {
    let bus = ActionBus::new(64);
    let mut all = bus.subscribe();
    let mut lifecycle = bus.subscribe_kinds(&[ActionKind::Lifecycle]);

    bus.publish(Action::Lifecycle(LifecycleAction::Startup));
    bus.publish(Action::error(
        LockwiseError::StorageUnavailable {
            reason: "offline".into(),
        },
        "open",
    ));
    bus.publish(Action::Lifecycle(LifecycleAction::Foreground));

    assert_eq!(
        *all.next().await.unwrap(),
        Action::Lifecycle(LifecycleAction::Startup)
    );
    assert!(matches!(
        all.next().await.unwrap().as_ref(),
        Action::Error(err) if err.error.is_retryable()
    ));
    assert_eq!(
        *all.next().await.unwrap(),
        Action::Lifecycle(LifecycleAction::Foreground)
    );

    assert_eq!(
        *lifecycle.next().await.unwrap(),
        Action::Lifecycle(LifecycleAction::Startup)
    );
    assert_eq!(
        *lifecycle.next().await.unwrap(),
        Action::Lifecycle(LifecycleAction::Foreground)
    );
}
