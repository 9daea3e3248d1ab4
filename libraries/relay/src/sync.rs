//! Cross-context signal routing.
//!
//! One context's write has to become visible in every other context's
//! in-memory view. Two signal sources feed the coordinator: storage-change
//! notifications from the local area, and an explicit broadcast message sent
//! after a successful write. Either way the coordinator does the same thing:
//! map the changed storage key to a store id, debounce, and tell the affected
//! view to re-hydrate itself. It never reads or writes domain data; the view's
//! own `refresh_from_storage` is the whole re-hydration.
//!
//! Views are held weakly. The coordinator never owns a view and never tears
//! one down; a context that goes away just stops upgrading.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::LocalBoxFuture;

use crate::storage::{Area, ChangeListenerKey, StorageArea, StorageChange, StorageError};
use crate::time::Clock;

/// Default debounce window. Tunable; several rapid writes to the same store
/// (say, a burst of episode increments) should cost one re-read, not one per
/// write.
pub const DEBOUNCE_WINDOW_MS: i64 = 600;

/// The one message shape recognized across contexts. Serialized form matches
/// the wire format the contexts exchange: `{"type": "STATE_CHANGED",
/// "storageKey": "..."}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    #[serde(rename = "STATE_CHANGED", rename_all = "camelCase")]
    StateChanged { storage_key: String },
}

/// Sends a [`ContextMessage`] to every other context, best-effort.
pub trait Broadcaster {
    fn broadcast(&self, message: &ContextMessage);
}

/// Drops messages. For contexts that have nobody to tell (tests, one-shot
/// scripts).
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _message: &ContextMessage) {}
}

impl<F: Fn(&ContextMessage)> Broadcaster for F {
    fn broadcast(&self, message: &ContextMessage) {
        self(message)
    }
}

/// The one capability a synchronized view must offer: throw away in-memory
/// state and rebuild it from the store. Boxed future so views of different
/// concrete types can live in one registry.
pub trait RefreshFromStorage {
    fn refresh_from_storage(&self) -> LocalBoxFuture<'_, Result<(), StorageError>>;
}

pub struct SyncCoordinator {
    clock: Rc<dyn Clock>,
    window: TimeDelta,
    key_to_store: RefCell<HashMap<String, String>>,
    views: RefCell<HashMap<String, Weak<dyn RefreshFromStorage>>>,
    /// Store id -> deadline of the burst currently being coalesced.
    pending: RefCell<HashMap<String, DateTime<Utc>>>,
}

impl SyncCoordinator {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self::with_window(clock, TimeDelta::milliseconds(DEBOUNCE_WINDOW_MS))
    }

    pub fn with_window(clock: Rc<dyn Clock>, window: TimeDelta) -> Self {
        Self {
            clock,
            window,
            key_to_store: RefCell::new(HashMap::new()),
            views: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
        }
    }

    /// Declares that a storage key belongs to a store. Unmapped keys are
    /// ignored by both signal paths.
    pub fn map_key(&self, storage_key: impl Into<String>, store_id: impl Into<String>) {
        self.key_to_store
            .borrow_mut()
            .insert(storage_key.into(), store_id.into());
    }

    /// Registers a live view under a store id. Idempotent; the last
    /// registration for an id wins, which is what a hot-reloaded context
    /// needs.
    pub fn register(&self, store_id: impl Into<String>, view: Weak<dyn RefreshFromStorage>) {
        self.views.borrow_mut().insert(store_id.into(), view);
    }

    /// Feed for storage-change notifications. Only the local area is ours.
    pub fn handle_storage_change(&self, change: &StorageChange) {
        if change.area != Area::Local {
            return;
        }
        self.signal(&change.key);
    }

    /// Feed for cross-context messages.
    pub fn handle_message(&self, message: &ContextMessage) {
        let ContextMessage::StateChanged { storage_key } = message;
        self.signal(storage_key);
    }

    fn signal(&self, storage_key: &str) {
        let Some(store_id) = self.key_to_store.borrow().get(storage_key).cloned() else {
            return;
        };
        let deadline = self.clock.now() + self.window;
        // First signal of a burst opens the window; later ones coalesce into
        // the existing deadline.
        self.pending.borrow_mut().entry(store_id).or_insert(deadline);
    }

    /// Store ids whose debounce window has elapsed.
    pub fn due_stores(&self) -> Vec<String> {
        let now = self.clock.now();
        self.pending
            .borrow()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(store_id, _)| store_id.clone())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Re-hydrates every view whose window has elapsed. Returns how many
    /// refresh calls were made. Several store ids can be registered to one
    /// view; when more than one of them comes due, the view refreshes once.
    /// A refresh failure is logged and swallowed so one broken view cannot
    /// block the others; a dead weak reference is dropped from the registry.
    pub async fn flush(&self) -> usize {
        let due = self.due_stores();
        let mut targets: Vec<(String, Rc<dyn RefreshFromStorage>)> =
            Vec::with_capacity(due.len());
        {
            let mut pending = self.pending.borrow_mut();
            let mut views = self.views.borrow_mut();
            for store_id in due {
                pending.remove(&store_id);
                let live = views.get(&store_id).and_then(Weak::upgrade);
                match live {
                    Some(view) => {
                        if !targets.iter().any(|(_, seen)| Rc::ptr_eq(seen, &view)) {
                            targets.push((store_id, view));
                        }
                    }
                    None => {
                        log::debug!("no live view for store `{store_id}`, dropping signal");
                        views.remove(&store_id);
                    }
                }
            }
        }

        // Borrows are released before any await.
        let mut refreshed = 0;
        for (store_id, view) in targets {
            match view.refresh_from_storage().await {
                Ok(()) => refreshed += 1,
                Err(error) => {
                    log::error!("re-hydration of store `{store_id}` failed: {error}");
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Convenience wiring: forwards every change from `area` into this
    /// coordinator.
    pub fn attach_to_area(self: &Rc<Self>, area: &impl StorageArea) -> ChangeListenerKey {
        let coordinator = Rc::downgrade(self);
        area.subscribe(move |change| {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.handle_storage_change(change);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use futures::FutureExt;
    use futures::executor::block_on;
    use std::cell::Cell;

    struct CountingView {
        refreshes: Cell<u32>,
        fail: Cell<bool>,
    }

    impl CountingView {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                refreshes: Cell::new(0),
                fail: Cell::new(false),
            })
        }
    }

    impl RefreshFromStorage for CountingView {
        fn refresh_from_storage(&self) -> LocalBoxFuture<'_, Result<(), StorageError>> {
            async {
                self.refreshes.set(self.refreshes.get() + 1);
                if self.fail.get() {
                    Err(StorageError::Unavailable("broken view".into()))
                } else {
                    Ok(())
                }
            }
            .boxed_local()
        }
    }

    fn weak(view: &Rc<CountingView>) -> Weak<dyn RefreshFromStorage> {
        Rc::downgrade(&(view.clone() as Rc<dyn RefreshFromStorage>))
    }

    fn setup() -> (Rc<ManualClock>, SyncCoordinator) {
        let clock = Rc::new(ManualClock::new(Utc::now()));
        let coordinator = SyncCoordinator::new(clock.clone());
        coordinator.map_key("progress", "watching");
        coordinator.map_key("plan", "planned");
        (clock, coordinator)
    }

    #[test]
    fn test_burst_of_signals_coalesces_into_one_refresh() {
        let (clock, coordinator) = setup();
        let view = CountingView::new();
        coordinator.register("watching", weak(&view));

        for _ in 0..5 {
            coordinator.handle_message(&ContextMessage::StateChanged {
                storage_key: "progress".into(),
            });
            clock.advance(TimeDelta::milliseconds(50));
        }
        assert_eq!(coordinator.pending_len(), 1);

        clock.advance(TimeDelta::milliseconds(600));
        assert_eq!(block_on(coordinator.flush()), 1);
        assert_eq!(view.refreshes.get(), 1);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[test]
    fn test_nothing_is_due_inside_the_window() {
        let (clock, coordinator) = setup();
        let view = CountingView::new();
        coordinator.register("watching", weak(&view));

        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        clock.advance(TimeDelta::milliseconds(100));
        assert_eq!(block_on(coordinator.flush()), 0);
        assert_eq!(view.refreshes.get(), 0);
    }

    #[test]
    fn test_non_local_areas_and_unknown_keys_are_ignored() {
        let (clock, coordinator) = setup();
        let view = CountingView::new();
        coordinator.register("watching", weak(&view));

        coordinator.handle_storage_change(&StorageChange {
            key: "progress".into(),
            old_value: None,
            new_value: None,
            area: Area::Sync,
        });
        coordinator.handle_storage_change(&StorageChange {
            key: "somebody-elses-key".into(),
            old_value: None,
            new_value: None,
            area: Area::Local,
        });
        clock.advance(TimeDelta::milliseconds(1000));
        assert_eq!(block_on(coordinator.flush()), 0);
    }

    #[test]
    fn test_separate_stores_debounce_separately() {
        let (clock, coordinator) = setup();
        let watching = CountingView::new();
        let planned = CountingView::new();
        coordinator.register("watching", weak(&watching));
        coordinator.register("planned", weak(&planned));

        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "plan".into(),
        });
        clock.advance(TimeDelta::milliseconds(700));

        assert_eq!(block_on(coordinator.flush()), 2);
        assert_eq!(watching.refreshes.get(), 1);
        assert_eq!(planned.refreshes.get(), 1);
    }

    #[test]
    fn test_one_view_under_several_store_ids_refreshes_once() {
        let (clock, coordinator) = setup();
        let view = CountingView::new();
        coordinator.register("watching", weak(&view));
        coordinator.register("planned", weak(&view));

        // A promotion touches both keys in one commit.
        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "plan".into(),
        });
        clock.advance(TimeDelta::milliseconds(700));

        assert_eq!(block_on(coordinator.flush()), 1);
        assert_eq!(view.refreshes.get(), 1);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[test]
    fn test_last_registration_wins() {
        let (clock, coordinator) = setup();
        let stale = CountingView::new();
        let fresh = CountingView::new();
        coordinator.register("watching", weak(&stale));
        coordinator.register("watching", weak(&fresh));

        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        clock.advance(TimeDelta::milliseconds(700));
        block_on(coordinator.flush());

        assert_eq!(stale.refreshes.get(), 0);
        assert_eq!(fresh.refreshes.get(), 1);
    }

    #[test]
    fn test_one_broken_view_does_not_block_the_rest() {
        let (clock, coordinator) = setup();
        let broken = CountingView::new();
        broken.fail.set(true);
        let healthy = CountingView::new();
        coordinator.register("watching", weak(&broken));
        coordinator.register("planned", weak(&healthy));

        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "plan".into(),
        });
        clock.advance(TimeDelta::milliseconds(700));
        block_on(coordinator.flush());

        assert_eq!(healthy.refreshes.get(), 1);
    }

    #[test]
    fn test_dead_views_are_dropped_silently() {
        let (clock, coordinator) = setup();
        let view = CountingView::new();
        coordinator.register("watching", weak(&view));
        drop(view);

        coordinator.handle_message(&ContextMessage::StateChanged {
            storage_key: "progress".into(),
        });
        clock.advance(TimeDelta::milliseconds(700));
        assert_eq!(block_on(coordinator.flush()), 0);
    }

    #[test]
    fn test_message_wire_format() {
        let message = ContextMessage::StateChanged {
            storage_key: "progress".into(),
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({"type": "STATE_CHANGED", "storageKey": "progress"})
        );
        assert_eq!(
            serde_json::from_value::<ContextMessage>(wire).unwrap(),
            message
        );
    }
}
