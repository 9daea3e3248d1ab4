//! Deferred execution for actions taken while offline.
//!
//! The queue fronts the [`ActionRunner`]: online, an enqueue is just an
//! execute. Offline, the command's optimistic phase still runs (so the view
//! reflects the intent immediately), and what's left is a serialized
//! descriptor that can be replayed once connectivity returns. Replay is FIFO
//! and per-entry: one failure doesn't abort the batch, it just keeps that
//! entry queued.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

use crate::runner::{ActionRunner, Command, ExecutionResult};

/// Reports whether the environment currently has connectivity.
pub trait Connectivity {
    fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Test double whose answer is scripted from outside.
pub struct ScriptedConnectivity {
    online: std::cell::Cell<bool>,
}

impl ScriptedConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: std::cell::Cell::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }
}

impl Connectivity for ScriptedConnectivity {
    fn is_online(&self) -> bool {
        self.online.get()
    }
}

/// A command that can outlive its context: enough data to rebuild and re-run
/// it later.
pub trait Queueable {
    fn kind(&self) -> String;
    fn payload(&self) -> Value;
}

/// One deferred action. Owned by the queue until its replay succeeds.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueuedAction {
    pub kind: String,
    pub payload: Value,
    pub optimistic_applied: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("queued payload for `{kind}` could not be rebuilt")]
    BadPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Rebuilds a queued descriptor into something executable. The handler runs
/// the persistence phase only; the optimistic phase already happened when the
/// action was queued.
pub trait ReplayHandler {
    async fn replay(&self, action: &QueuedAction) -> Result<ExecutionResult, ReplayError>;
}

#[derive(Debug)]
pub struct ReplayReport {
    pub kind: String,
    pub result: ExecutionResult,
}

/// What came of an enqueue: the command either ran against storage, or was
/// deferred until connectivity returns. A deferred success is provisional —
/// nothing has been written yet, so callers must not treat it as a committed
/// mutation (no broadcast, no undo entry) until the replay lands it.
#[derive(Debug)]
pub enum Enqueued {
    Ran(ExecutionResult),
    Deferred(ExecutionResult),
}

impl Enqueued {
    pub fn was_deferred(&self) -> bool {
        matches!(self, Enqueued::Deferred(_))
    }

    pub fn result(&self) -> &ExecutionResult {
        match self {
            Enqueued::Ran(result) | Enqueued::Deferred(result) => result,
        }
    }

    pub fn into_result(self) -> ExecutionResult {
        match self {
            Enqueued::Ran(result) | Enqueued::Deferred(result) => result,
        }
    }
}

pub struct OfflineQueue {
    connectivity: Rc<dyn Connectivity>,
    queue: RefCell<VecDeque<QueuedAction>>,
}

impl OfflineQueue {
    pub fn new(connectivity: Rc<dyn Connectivity>) -> Self {
        Self {
            connectivity,
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Online: executes immediately through the runner. Offline: applies the
    /// optimistic phase, queues the descriptor, and reports an optimistic
    /// success without waiting for persistence. The two outcomes are
    /// distinguished so callers can hold off on committed-mutation side
    /// effects while the entry is still queued.
    pub async fn enqueue<C>(&self, runner: &ActionRunner, mut command: C) -> Enqueued
    where
        C: Command + Queueable,
    {
        if self.connectivity.is_online() {
            return Enqueued::Ran(runner.execute(command).await);
        }

        command.optimistic_apply();
        self.queue.borrow_mut().push_back(QueuedAction {
            kind: command.kind(),
            payload: command.payload(),
            optimistic_applied: true,
        });
        Enqueued::Deferred(ExecutionResult::success("Saved; will sync when back online"))
    }

    /// Replays every queued action in FIFO order. Entries that succeed are
    /// discarded; entries that fail transiently stay queued for the next
    /// pass; entries that can't be rebuilt at all are dropped with an error
    /// log, since they would never succeed.
    pub async fn replay_pending<H: ReplayHandler>(&self, handler: &H) -> Vec<ReplayReport> {
        let drained: Vec<QueuedAction> = {
            let mut queue = self.queue.borrow_mut();
            queue.drain(..).collect()
        };

        let mut reports = Vec::with_capacity(drained.len());
        for action in drained {
            // The queue borrow is released while the handler runs.
            match handler.replay(&action).await {
                Ok(result) => {
                    if !result.success {
                        self.queue.borrow_mut().push_back(action.clone());
                    }
                    reports.push(ReplayReport {
                        kind: action.kind,
                        result,
                    });
                }
                Err(error) => {
                    log::error!("dropping unreplayable action: {error}");
                    reports.push(ReplayReport {
                        kind: action.kind,
                        result: ExecutionResult::failure(error.to_string()),
                    });
                }
            }
        }
        reports
    }

    /// Read-only look at what is waiting. Does not mutate queue state.
    pub fn queued_descriptors(&self) -> Vec<QueuedAction> {
        self.queue.borrow().iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.borrow().len()
    }
}
