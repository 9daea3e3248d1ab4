//! This is a library for keeping several independent execution contexts that
//! share one key-value store in agreement about what that store contains.
//! It was created for the watch-state tracker, so it doesn't include much that
//! was not needed for that project.
//!
//! The model:
//! 1. Every context (background page, popup, dashboard, injected script) keeps
//!    its own in-memory view of the store. The store itself is the only source
//!    of truth; a view is always allowed to be thrown away and rebuilt.
//! 2. A user action is expressed as a command with three phases: an optimistic
//!    apply that mutates the local view immediately, an async `run` that does
//!    the actual persistence, and a rollback that restores the pre-optimistic
//!    view if persistence fails. Rollback is unconditional on every failure
//!    path, so a view is never left holding a guess that didn't stick.
//! 3. Committed mutations can be undone: a bounded stack of restore closures
//!    records the most recent ones and replays the newest on request.
//! 4. Actions taken while offline are queued and replayed, in order, once
//!    connectivity comes back.
//! 5. When one context writes, every other context hears about it (through
//!    storage-change notifications or an explicit broadcast message) and is
//!    told to re-hydrate its view from the store. Bursts of writes are
//!    debounced so a view re-reads once, not once per write.
//!
//! There is no server-side coordination and no transaction log here. The model
//! is single-origin, best-effort, last-writer-wins.

pub mod offline;
pub mod runner;
pub mod storage;
pub mod sync;
pub mod time;
pub mod undo;

pub use offline::{
    AlwaysOnline, Connectivity, Enqueued, OfflineQueue, QueuedAction, Queueable, ReplayError,
    ReplayHandler, ReplayReport, ScriptedConnectivity,
};
pub use runner::{
    ActionRunner, Command, ExecutionResult, Notifier, NullNotifier, RetryPolicy, RunReport,
};
pub use storage::{Area, ChangeListenerKey, MemoryArea, StorageArea, StorageChange, StorageError};
pub use sync::{
    Broadcaster, ContextMessage, DEBOUNCE_WINDOW_MS, NullBroadcaster, RefreshFromStorage,
    SyncCoordinator,
};
pub use time::{Clock, ManualClock, NoopSleeper, Sleeper, SystemClock};
pub use undo::{MAX_UNDO, Snapshot, UndoEntry, UndoError, UndoObserver, UndoStack};
