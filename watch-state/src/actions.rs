//! The action surface.
//!
//! One entry point per user action. Each follows the same path: read the
//! item's status fresh from the store, ask the validator, then hand a command
//! to the offline queue / runner pair. The command mutates the local view
//! optimistically, persists through the repositories, and rolls the view back
//! if persistence fails. Committed changes register an undo entry and
//! broadcast a `STATE_CHANGED` message so other contexts re-hydrate.

use std::rc::Rc;

use chrono::Utc;
use relay::offline::{Enqueued, OfflineQueue, QueuedAction, Queueable, ReplayError, ReplayHandler};
use relay::runner::{ActionRunner, Command, ExecutionResult, Notifier, RetryPolicy, RunReport};
use relay::storage::StorageArea;
use relay::sync::{Broadcaster, ContextMessage};
use relay::time::Sleeper;
use relay::undo::{UndoObserver, UndoStack};
use serde_json::Value;

use crate::repo::{
    HIDDEN_KEY, HIDDEN_STORE, PLAN_KEY, PLANNED_STORE, PROGRESS_KEY, Repositories, WATCHING_STORE,
    WatchError,
};
use crate::status::{Plan, Progress, Status, StatusFlags};
use crate::validator::{Action, validate};
use crate::view::WatchView;

/// Actions whose committed effect is worth an undo entry. Episode updates are
/// deliberately absent: a burst of increments would flush everything else out
/// of the ten-slot stack.
pub const UNDOABLE_ACTIONS: &[&str] = &[
    "add-to-plan",
    "remove-from-plan",
    "start-watching",
    "stop-watching",
    "hide",
    "unhide",
    "clear-all-hidden",
];

/// Identity of an item as scraped from the page. Enough to create plan and
/// progress records.
#[derive(Debug, Clone)]
pub struct ItemRef {
    pub item_id: String,
    pub title: String,
    pub slug: String,
}

/// What every entry point returns. Failures arrive here as values; entry
/// points never panic and never leak storage errors.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    pub new_status: Option<StatusFlags>,
    pub error: Option<String>,
}

impl ActionOutcome {
    fn denial(reason: String) -> Self {
        Self {
            success: false,
            error: Some(reason.clone()),
            message: reason,
            new_status: None,
        }
    }
}

/// The persistence payload of one action. Self-contained and serializable so
/// it can sit in the offline queue and be replayed later by a context that no
/// longer has the original closure environment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum Op {
    AddToPlan { plan: Plan },
    RemoveFromPlan { item_id: String },
    StartWatching { progress: Progress, removes_plan: bool },
    UpdateEpisode {
        item_id: String,
        episode: u32,
        episode_ref: String,
        at: chrono::DateTime<Utc>,
    },
    StopWatching { item_id: String },
    Hide { item_id: String },
    Unhide { item_id: String },
    ClearHidden,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::AddToPlan { .. } => "add-to-plan",
            Op::RemoveFromPlan { .. } => "remove-from-plan",
            Op::StartWatching { .. } => "start-watching",
            Op::UpdateEpisode { .. } => "update-episode",
            Op::StopWatching { .. } => "stop-watching",
            Op::Hide { .. } => "hide",
            Op::Unhide { .. } => "unhide",
            Op::ClearHidden => "clear-all-hidden",
        }
    }

    fn item_id(&self) -> Option<&str> {
        match self {
            Op::AddToPlan { plan } => Some(&plan.item_id),
            Op::StartWatching { progress, .. } => Some(&progress.item_id),
            Op::RemoveFromPlan { item_id }
            | Op::UpdateEpisode { item_id, .. }
            | Op::StopWatching { item_id }
            | Op::Hide { item_id }
            | Op::Unhide { item_id } => Some(item_id),
            Op::ClearHidden => None,
        }
    }

    /// Store the undo entry is filed under.
    fn primary_store(&self) -> &'static str {
        match self {
            Op::AddToPlan { .. } | Op::RemoveFromPlan { .. } => PLANNED_STORE,
            Op::StartWatching { .. } | Op::UpdateEpisode { .. } | Op::StopWatching { .. } => {
                WATCHING_STORE
            }
            Op::Hide { .. } | Op::Unhide { .. } | Op::ClearHidden => HIDDEN_STORE,
        }
    }

    /// Storage keys this op touches; one broadcast goes out per key.
    fn storage_keys(&self) -> Vec<&'static str> {
        match self {
            Op::AddToPlan { .. } | Op::RemoveFromPlan { .. } => vec![PLAN_KEY],
            Op::StartWatching { removes_plan, .. } => {
                if *removes_plan {
                    vec![PROGRESS_KEY, PLAN_KEY]
                } else {
                    vec![PROGRESS_KEY]
                }
            }
            Op::UpdateEpisode { .. } | Op::StopWatching { .. } => vec![PROGRESS_KEY],
            Op::Hide { .. } | Op::Unhide { .. } | Op::ClearHidden => vec![HIDDEN_KEY],
        }
    }

    fn success_message(&self) -> String {
        match self {
            Op::AddToPlan { plan } => format!("\"{}\" planned to watch", plan.title),
            Op::RemoveFromPlan { .. } => "Removed from plan".to_string(),
            Op::StartWatching { progress, .. } => format!(
                "Watching \"{}\" — Episode {}",
                progress.title, progress.current_episode
            ),
            Op::UpdateEpisode { episode, .. } => format!("Progress saved: Episode {episode}"),
            Op::StopWatching { .. } => "Stopped watching".to_string(),
            Op::Hide { .. } => "Item hidden".to_string(),
            Op::Unhide { .. } => "Item restored".to_string(),
            Op::ClearHidden => "All hidden items restored".to_string(),
        }
    }

    fn apply_to_view<A: StorageArea>(&self, view: &WatchView<A>) {
        match self {
            Op::AddToPlan { plan } => view.set_plan(plan.clone()),
            Op::RemoveFromPlan { item_id } => view.remove_plan(item_id),
            Op::StartWatching {
                progress,
                removes_plan,
            } => {
                if *removes_plan {
                    view.remove_plan(&progress.item_id);
                }
                view.set_progress(progress.clone());
            }
            Op::UpdateEpisode {
                item_id,
                episode,
                episode_ref,
                at,
            } => view.update_progress(item_id, *episode, episode_ref, *at),
            Op::StopWatching { item_id } => view.remove_progress(item_id),
            Op::Hide { item_id } => view.hide(item_id),
            Op::Unhide { item_id } => view.unhide(item_id),
            Op::ClearHidden => view.clear_hidden(),
        }
    }

    async fn persist<A: StorageArea>(&self, repos: &Repositories<A>) -> Result<(), WatchError> {
        match self {
            Op::AddToPlan { plan } => repos.upsert_plan(plan.clone()).await?,
            Op::RemoveFromPlan { item_id } => repos.remove_plan(item_id).await?,
            Op::StartWatching {
                progress,
                removes_plan,
            } => {
                // Plan record goes first so a failure between the two writes
                // leaves the item Clean rather than double-booked.
                if *removes_plan {
                    repos.remove_plan(&progress.item_id).await?;
                }
                repos.upsert_progress(progress.clone()).await?;
            }
            Op::UpdateEpisode {
                item_id,
                episode,
                episode_ref,
                at,
            } => repos.update_progress(item_id, *episode, episode_ref, *at).await?,
            Op::StopWatching { item_id } => repos.remove_progress(item_id).await?,
            Op::Hide { item_id } => repos.hide(item_id).await?,
            Op::Unhide { item_id } => repos.unhide(item_id).await?,
            Op::ClearHidden => repos.clear_hidden().await?,
        }
        Ok(())
    }
}

/// One op bound to this context's view and repositories, in the shape the
/// runner drives.
struct WatchCommand<A: StorageArea> {
    op: Op,
    view: Rc<WatchView<A>>,
    pre_image: Option<crate::view::ViewSnapshot>,
    /// Replayed commands skip the optimistic phase; it already ran when the
    /// action was queued.
    replay: bool,
}

impl<A: StorageArea> Command for WatchCommand<A> {
    type Error = WatchError;

    fn optimistic_apply(&mut self) {
        if self.replay {
            return;
        }
        self.pre_image = Some(self.view.capture());
        self.op.apply_to_view(&self.view);
    }

    fn rollback(&mut self) {
        if let Some(pre_image) = self.pre_image.take() {
            self.view.restore_snapshot(pre_image);
        }
    }

    async fn run(&mut self) -> Result<RunReport, WatchError> {
        self.op.persist(self.view.repos()).await?;
        Ok(RunReport::success(self.op.success_message()))
    }
}

impl<A: StorageArea> Queueable for WatchCommand<A> {
    fn kind(&self) -> String {
        self.op.name().to_string()
    }

    fn payload(&self) -> Value {
        // Op is plain data; serializing it cannot fail.
        serde_json::to_value(&self.op).unwrap_or(Value::Null)
    }
}

pub struct WatchActions<A: StorageArea + 'static> {
    view: Rc<WatchView<A>>,
    runner: ActionRunner,
    offline: OfflineQueue,
    undo: UndoObserver,
    broadcaster: Rc<dyn Broadcaster>,
    notifier: Rc<dyn Notifier>,
}

impl<A: StorageArea + 'static> WatchActions<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        area: Rc<A>,
        retry: RetryPolicy,
        sleeper: Rc<dyn Sleeper>,
        notifier: Rc<dyn Notifier>,
        connectivity: Rc<dyn relay::offline::Connectivity>,
        broadcaster: Rc<dyn Broadcaster>,
        undo_stack: Rc<UndoStack>,
    ) -> Self {
        let view = Rc::new(WatchView::new(Repositories::new(area)));
        Self {
            view,
            runner: ActionRunner::new(retry, sleeper, notifier.clone()),
            offline: OfflineQueue::new(connectivity),
            undo: UndoObserver::new(undo_stack, UNDOABLE_ACTIONS),
            broadcaster,
            notifier,
        }
    }

    pub fn view(&self) -> &Rc<WatchView<A>> {
        &self.view
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn undo_stack(&self) -> &Rc<UndoStack> {
        self.undo.stack()
    }

    /// Status fresh from the store, not from the local view.
    pub async fn status(&self, item_id: &str) -> Result<Status, WatchError> {
        Ok(self.view.repos().status(item_id).await?)
    }

    pub async fn add_to_plan(&self, item: ItemRef) -> ActionOutcome {
        let Some(status) = self.fresh_status(&item.item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::AddToPlan) {
            return denial;
        }
        self.dispatch(Op::AddToPlan {
            plan: Plan {
                item_id: item.item_id,
                title: item.title,
                slug: item.slug,
                added_at: Utc::now(),
            },
        })
        .await
    }

    pub async fn remove_from_plan(&self, item_id: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::RemoveFromPlan) {
            return denial;
        }
        self.dispatch(Op::RemoveFromPlan {
            item_id: item_id.to_string(),
        })
        .await
    }

    /// Starts watching at `episode`. If the item was planned, the plan record
    /// is removed in the same commit, exactly as the validator flags it.
    pub async fn start_watching(&self, item: ItemRef, episode: u32, episode_ref: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(&item.item_id).await else {
            return self.status_unavailable();
        };
        let verdict = validate(&status, Action::AddToWatch);
        if !verdict.allowed {
            return self.deny(verdict.reason);
        }
        self.dispatch(Op::StartWatching {
            progress: Progress {
                item_id: item.item_id,
                title: item.title,
                slug: item.slug,
                current_episode: episode,
                episode_ref: episode_ref.to_string(),
                last_watched_at: Utc::now(),
                total_episodes: None,
            },
            removes_plan: verdict.removes_from_plan,
        })
        .await
    }

    pub async fn update_episode(&self, item_id: &str, episode: u32, episode_ref: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::UpdateEpisode) {
            return denial;
        }
        self.dispatch(Op::UpdateEpisode {
            item_id: item_id.to_string(),
            episode,
            episode_ref: episode_ref.to_string(),
            at: Utc::now(),
        })
        .await
    }

    pub async fn stop_watching(&self, item_id: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::RemoveFromWatch) {
            return denial;
        }
        self.dispatch(Op::StopWatching {
            item_id: item_id.to_string(),
        })
        .await
    }

    pub async fn hide(&self, item_id: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::Hide) {
            return denial;
        }
        self.dispatch(Op::Hide {
            item_id: item_id.to_string(),
        })
        .await
    }

    pub async fn unhide(&self, item_id: &str) -> ActionOutcome {
        let Some(status) = self.fresh_status(item_id).await else {
            return self.status_unavailable();
        };
        if let Some(denial) = self.check(&status, Action::Unhide) {
            return denial;
        }
        self.dispatch(Op::Unhide {
            item_id: item_id.to_string(),
        })
        .await
    }

    /// Bulk restore. Not one of the validator's per-item actions; always
    /// legal.
    pub async fn clear_all_hidden(&self) -> ActionOutcome {
        self.dispatch(Op::ClearHidden).await
    }

    /// Replays everything deferred while offline. Call on the
    /// offline-to-online transition.
    pub async fn replay_offline(&self) -> Vec<relay::offline::ReplayReport> {
        self.offline.replay_pending(self).await
    }

    async fn fresh_status(&self, item_id: &str) -> Option<Status> {
        match self.view.repos().status(item_id).await {
            Ok(status) => Some(status),
            Err(error) => {
                log::error!("could not read status: {error}");
                None
            }
        }
    }

    fn status_unavailable(&self) -> ActionOutcome {
        let outcome = ActionOutcome::denial("storage is unavailable".to_string());
        self.notifier.error_toast(&outcome.message);
        outcome
    }

    fn check(&self, status: &Status, action: Action) -> Option<ActionOutcome> {
        let verdict = validate(status, action);
        if verdict.allowed {
            None
        } else {
            Some(self.deny(verdict.reason))
        }
    }

    fn deny(&self, reason: Option<String>) -> ActionOutcome {
        let reason = reason.unwrap_or_else(|| "action not allowed".to_string());
        self.notifier.error_toast(&reason);
        ActionOutcome::denial(reason)
    }

    async fn dispatch(&self, op: Op) -> ActionOutcome {
        let item_id = op.item_id().map(str::to_string);
        let command = WatchCommand {
            op: op.clone(),
            view: self.view.clone(),
            pre_image: None,
            replay: false,
        };

        // A deferred action hasn't written anything yet: no undo entry and no
        // broadcast until the replay lands it. The replay path announces.
        let enqueued = self
            .undo
            .track_if(
                op.primary_store(),
                op.name(),
                &op.success_message(),
                self.view.clone(),
                || self.offline.enqueue(&self.runner, command),
                |enqueued: &Enqueued| !enqueued.was_deferred(),
            )
            .await;

        let deferred = enqueued.was_deferred();
        let result = enqueued.into_result();
        if result.success && !deferred {
            self.announce(&op);
        }
        self.outcome(result, item_id.as_deref())
    }

    fn announce(&self, op: &Op) {
        for key in op.storage_keys() {
            self.broadcaster.broadcast(&ContextMessage::StateChanged {
                storage_key: key.to_string(),
            });
        }
    }

    fn outcome(&self, result: ExecutionResult, item_id: Option<&str>) -> ActionOutcome {
        let new_status = if result.success {
            item_id.map(|id| self.view.status_of(id).flags())
        } else {
            None
        };
        ActionOutcome {
            success: result.success,
            message: result.message,
            new_status,
            error: result.error,
        }
    }
}

impl<A: StorageArea + 'static> ReplayHandler for WatchActions<A> {
    async fn replay(&self, action: &QueuedAction) -> Result<ExecutionResult, ReplayError> {
        let op: Op = serde_json::from_value(action.payload.clone()).map_err(|source| {
            ReplayError::BadPayload {
                kind: action.kind.clone(),
                source,
            }
        })?;
        let command = WatchCommand {
            op: op.clone(),
            view: self.view.clone(),
            pre_image: None,
            replay: true,
        };
        let result = self.runner.execute_prepared(command).await;
        if result.success {
            self.announce(&op);
        }
        Ok(result)
    }
}
