//! Bounded undo history.
//!
//! Every committed mutation can leave behind a restore closure. The stack
//! keeps the ten most recent; older ones fall off the front silently. Undo is
//! single-shot per entry: popping an entry consumes it whether or not its
//! restore succeeds.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

/// Default capacity. Tunable; nothing load-bearing about ten.
pub const MAX_UNDO: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    #[error("snapshot could not be restored")]
    Snapshot(#[from] serde_json::Error),
}

pub struct UndoEntry {
    pub store_id: String,
    pub action_name: String,
    pub description: String,
    restore: Box<dyn FnOnce() -> Result<(), UndoError>>,
}

impl UndoEntry {
    pub fn new(
        store_id: impl Into<String>,
        action_name: impl Into<String>,
        description: impl Into<String>,
        restore: impl FnOnce() -> Result<(), UndoError> + 'static,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            action_name: action_name.into(),
            description: description.into(),
            restore: Box::new(restore),
        }
    }
}

/// Bounded stack of restore closures. One per context; construct it disabled
/// to gate the feature off entirely (registration becomes a no-op).
pub struct UndoStack {
    enabled: Cell<bool>,
    capacity: usize,
    entries: RefCell<VecDeque<UndoEntry>>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::with_capacity(MAX_UNDO)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            enabled: Cell::new(true),
            capacity,
            entries: RefCell::new(VecDeque::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// Appends an entry, evicting the oldest once over capacity. No-op while
    /// disabled.
    pub fn register(&self, entry: UndoEntry) {
        if !self.enabled.get() {
            return;
        }
        let mut entries = self.entries.borrow_mut();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Pops and runs the most recent restore closure. Returns `false` when
    /// disabled, empty, or when the restore itself fails; a failed restore is
    /// still consumed.
    pub fn undo_last(&self) -> bool {
        if !self.enabled.get() {
            return false;
        }
        let Some(entry) = self.entries.borrow_mut().pop_back() else {
            return false;
        };
        match (entry.restore)() {
            Ok(()) => {
                log::debug!("undid `{}` on {}", entry.action_name, entry.store_id);
                true
            }
            Err(error) => {
                log::error!(
                    "undo of `{}` on {} failed: {error}",
                    entry.action_name,
                    entry.store_id
                );
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Registered action names, oldest first. Introspection for diagnostics.
    pub fn action_names(&self) -> Vec<String> {
        self.entries
            .borrow()
            .iter()
            .map(|entry| entry.action_name.clone())
            .collect()
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A store whose whole serializable state can be captured and put back.
pub trait Snapshot {
    fn snapshot(&self) -> Value;
    fn restore(&self, snapshot: Value) -> Result<(), serde_json::Error>;
}

/// Wraps tracked actions and auto-registers undo entries from before/after
/// snapshots. Actions that change nothing, and actions not on the allow-list,
/// leave no entry; the stack never fills up with no-ops or irreversible
/// operations.
pub struct UndoObserver {
    stack: Rc<UndoStack>,
    undoable: &'static [&'static str],
}

impl UndoObserver {
    pub fn new(stack: Rc<UndoStack>, undoable: &'static [&'static str]) -> Self {
        Self { stack, undoable }
    }

    pub fn stack(&self) -> &Rc<UndoStack> {
        &self.stack
    }

    pub async fn track<S, F, Fut, T>(
        &self,
        store_id: &str,
        action_name: &str,
        description: &str,
        store: Rc<S>,
        action: F,
    ) -> T
    where
        S: Snapshot + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.track_if(store_id, action_name, description, store, action, |_| true)
            .await
    }

    /// Like [`track`](Self::track), with an extra gate inspecting the action's
    /// output. Registration needs the gate to pass as well as a real snapshot
    /// change; an action whose mutation is only provisional (queued for later
    /// persistence, say) can decline to leave an entry.
    pub async fn track_if<S, F, Fut, T, P>(
        &self,
        store_id: &str,
        action_name: &str,
        description: &str,
        store: Rc<S>,
        action: F,
        committed: P,
    ) -> T
    where
        S: Snapshot + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        P: FnOnce(&T) -> bool,
    {
        let before = store.snapshot();
        let output = action().await;

        let undoable = self.undoable.iter().any(|name| *name == action_name);
        if undoable && committed(&output) && store.snapshot() != before {
            let restore_to = store.clone();
            self.stack.register(UndoEntry::new(
                store_id,
                action_name,
                description,
                move || Ok(restore_to.restore(before)?),
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;

    fn noop_entry(name: &str) -> UndoEntry {
        UndoEntry::new("store", name, name, || Ok(()))
    }

    #[test]
    fn test_capacity_keeps_the_ten_most_recent() {
        let stack = UndoStack::new();
        for i in 0..12 {
            stack.register(noop_entry(&format!("act-{i}")));
        }
        assert_eq!(stack.len(), 10);
        let expected: Vec<String> = (2..12).map(|i| format!("act-{i}")).collect();
        assert_eq!(stack.action_names(), expected);
    }

    #[test]
    fn test_undo_pops_newest_first() {
        let stack = UndoStack::new();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();
        for name in ["first", "second"] {
            let order = order.clone();
            stack.register(UndoEntry::new("store", name, name, move || {
                order.borrow_mut().push(name);
                Ok(())
            }));
        }

        assert!(stack.undo_last());
        assert!(stack.undo_last());
        assert_eq!(*order.borrow(), vec!["second", "first"]);
    }

    #[test]
    fn test_empty_and_disabled_stacks_refuse_quietly() {
        let stack = UndoStack::new();
        assert!(!stack.undo_last());

        stack.set_enabled(false);
        stack.register(noop_entry("ignored"));
        assert!(stack.is_empty());
        assert!(!stack.undo_last());
    }

    #[test]
    fn test_failed_restore_is_consumed() {
        let stack = UndoStack::new();
        stack.register(UndoEntry::new("store", "bad", "bad", || {
            // Force a deserialization failure through the snapshot error path.
            let err = serde_json::from_value::<u32>(json!("nope")).unwrap_err();
            Err(UndoError::Snapshot(err))
        }));

        assert!(!stack.undo_last());
        assert!(stack.is_empty());
    }

    struct JsonCell {
        value: RefCell<Value>,
    }

    impl Snapshot for JsonCell {
        fn snapshot(&self) -> Value {
            self.value.borrow().clone()
        }
        fn restore(&self, snapshot: Value) -> Result<(), serde_json::Error> {
            *self.value.borrow_mut() = snapshot;
            Ok(())
        }
    }

    #[test]
    fn test_observer_registers_only_real_changes_on_the_allow_list() {
        let stack = Rc::new(UndoStack::new());
        let observer = UndoObserver::new(stack.clone(), &["tracked"]);
        let cell = Rc::new(JsonCell {
            value: RefCell::new(json!(0)),
        });

        block_on(async {
            // On the allow-list, but a no-op: nothing registered.
            observer
                .track("store", "tracked", "noop", cell.clone(), || async {})
                .await;
            assert_eq!(stack.len(), 0);

            // Real change, not on the allow-list: nothing registered.
            let target = cell.clone();
            observer
                .track("store", "untracked", "mutate", cell.clone(), || async move {
                    *target.value.borrow_mut() = json!(1);
                })
                .await;
            assert_eq!(stack.len(), 0);

            // Real change on the allow-list: registered, and undo restores.
            let target = cell.clone();
            observer
                .track("store", "tracked", "mutate", cell.clone(), || async move {
                    *target.value.borrow_mut() = json!(2);
                })
                .await;
        });

        assert_eq!(stack.len(), 1);
        assert!(stack.undo_last());
        assert_eq!(*cell.value.borrow(), json!(1));
    }

    #[test]
    fn test_gated_tracking_skips_uncommitted_changes() {
        let stack = Rc::new(UndoStack::new());
        let observer = UndoObserver::new(stack.clone(), &["tracked"]);
        let cell = Rc::new(JsonCell {
            value: RefCell::new(json!(0)),
        });

        block_on(async {
            // The state changed, but the gate reports the change didn't stick.
            let target = cell.clone();
            observer
                .track_if(
                    "store",
                    "tracked",
                    "mutate",
                    cell.clone(),
                    || async move {
                        *target.value.borrow_mut() = json!(1);
                        false
                    },
                    |committed| *committed,
                )
                .await;
        });

        assert!(stack.is_empty());
    }
}
