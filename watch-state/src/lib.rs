//! Per-item watch state, shared by every extension context.
//!
//! Four contexts (background page, popup, options dashboard, injected
//! content scripts) read and write the same storage area with no transactions
//! and no direct channel between them beyond storage-change notifications and
//! best-effort messages. This crate is the domain layer on top of `relay`:
//! the status model, the transition validator, the typed repositories, the
//! per-context in-memory view, and the action entry points the UI calls.
//!
//! The division of labor: `relay` knows how to execute optimistically, roll
//! back, undo, queue offline work, and route re-hydration signals; this crate
//! knows what a watch list *is*.

pub mod actions;
pub mod repo;
pub mod status;
pub mod validator;
pub mod view;

pub use actions::{ActionOutcome, ItemRef, UNDOABLE_ACTIONS, WatchActions};
pub use repo::{
    HIDDEN_KEY, HIDDEN_STORE, PLAN_KEY, PLANNED_STORE, PROGRESS_KEY, Repositories, WATCHING_STORE,
    WatchError,
};
pub use status::{Plan, Progress, Status, StatusFlags};
pub use validator::{ALL_ACTIONS, Action, Verdict, available_actions, validate};
pub use view::WatchView;

use std::rc::Rc;

use relay::storage::StorageArea;
use relay::sync::{RefreshFromStorage, SyncCoordinator};

/// Wires a view into a coordinator: maps the three storage keys to their
/// store ids and registers the view (weakly) under each. The coordinator
/// collapses same-view targets, so an action touching several keys still
/// costs one re-hydration per flush.
pub fn wire_sync<A: StorageArea + 'static>(
    coordinator: &SyncCoordinator,
    view: &Rc<WatchView<A>>,
) {
    coordinator.map_key(PROGRESS_KEY, WATCHING_STORE);
    coordinator.map_key(PLAN_KEY, PLANNED_STORE);
    coordinator.map_key(HIDDEN_KEY, HIDDEN_STORE);

    let weak = Rc::downgrade(&(view.clone() as Rc<dyn RefreshFromStorage>));
    for store_id in [WATCHING_STORE, PLANNED_STORE, HIDDEN_STORE] {
        coordinator.register(store_id, weak.clone());
    }
}
