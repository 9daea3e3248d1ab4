//! The per-context in-memory view.
//!
//! Each context keeps one of these. It mirrors the three collections in
//! persistent (`im`) maps, so taking a pre-image for rollback is a pointer
//! copy, not a deep clone. The view is never authoritative: refreshing always
//! overwrites local state with whatever the store reports.
//!
//! Borrow discipline: we never hold a `RefCell` borrow across an `.await`.
//! Reads complete first, then the cells are overwritten.

use std::cell::RefCell;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use relay::storage::{StorageArea, StorageError};
use relay::sync::RefreshFromStorage;
use relay::undo::Snapshot;
use serde_json::Value;

use crate::repo::Repositories;
use crate::status::{Plan, Progress, Status};

pub struct WatchView<A: StorageArea> {
    repos: Repositories<A>,
    progress: RefCell<im::HashMap<String, Progress>>,
    plans: RefCell<im::HashMap<String, Plan>>,
    hidden: RefCell<im::HashSet<String>>,
}

/// Cheap pre-image of the whole view. `im` maps share structure, so holding
/// one of these costs almost nothing.
#[derive(Clone)]
pub struct ViewSnapshot {
    progress: im::HashMap<String, Progress>,
    plans: im::HashMap<String, Plan>,
    hidden: im::HashSet<String>,
}

/// Serializable form of the view, used by the undo observer's before/after
/// diffing.
#[derive(serde::Serialize, serde::Deserialize)]
struct ViewState {
    progress: im::HashMap<String, Progress>,
    plans: im::HashMap<String, Plan>,
    hidden: im::HashSet<String>,
}

impl<A: StorageArea> WatchView<A> {
    pub fn new(repos: Repositories<A>) -> Self {
        Self {
            repos,
            progress: RefCell::new(im::HashMap::new()),
            plans: RefCell::new(im::HashMap::new()),
            hidden: RefCell::new(im::HashSet::new()),
        }
    }

    pub fn repos(&self) -> &Repositories<A> {
        &self.repos
    }

    /// Instantaneous status from local state only. The async twin on
    /// [`Repositories`] is what reads the store.
    pub fn status_of(&self, item_id: &str) -> Status {
        let hidden = self.hidden.borrow().contains(item_id);
        let progress = self.progress.borrow().get(item_id).cloned();
        let plan = self.plans.borrow().get(item_id).cloned();
        Status::classify(progress, plan, hidden)
    }

    pub fn capture(&self) -> ViewSnapshot {
        ViewSnapshot {
            progress: self.progress.borrow().clone(),
            plans: self.plans.borrow().clone(),
            hidden: self.hidden.borrow().clone(),
        }
    }

    pub fn restore_snapshot(&self, snapshot: ViewSnapshot) {
        *self.progress.borrow_mut() = snapshot.progress;
        *self.plans.borrow_mut() = snapshot.plans;
        *self.hidden.borrow_mut() = snapshot.hidden;
    }

    pub fn set_progress(&self, progress: Progress) {
        self.progress
            .borrow_mut()
            .insert(progress.item_id.clone(), progress);
    }

    pub fn remove_progress(&self, item_id: &str) {
        self.progress.borrow_mut().remove(item_id);
    }

    pub fn update_progress(
        &self,
        item_id: &str,
        episode: u32,
        episode_ref: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        let mut progress = self.progress.borrow_mut();
        if let Some(record) = progress.get_mut(item_id) {
            record.current_episode = episode;
            record.episode_ref = episode_ref.to_string();
            record.last_watched_at = at;
        }
    }

    pub fn set_plan(&self, plan: Plan) {
        self.plans.borrow_mut().insert(plan.item_id.clone(), plan);
    }

    pub fn remove_plan(&self, item_id: &str) {
        self.plans.borrow_mut().remove(item_id);
    }

    pub fn hide(&self, item_id: &str) {
        self.hidden.borrow_mut().insert(item_id.to_string());
    }

    pub fn unhide(&self, item_id: &str) {
        self.hidden.borrow_mut().remove(item_id);
    }

    pub fn clear_hidden(&self) {
        self.hidden.borrow_mut().clear();
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.borrow().len()
    }
}

impl<A: StorageArea> RefreshFromStorage for WatchView<A> {
    fn refresh_from_storage(&self) -> LocalBoxFuture<'_, Result<(), StorageError>> {
        async move {
            let progress = self.repos.progress_map().await?;
            let plans = self.repos.plan_map().await?;
            let hidden = self.repos.hidden_ids().await?;

            *self.progress.borrow_mut() = progress.into_iter().collect();
            *self.plans.borrow_mut() = plans.into_iter().collect();
            *self.hidden.borrow_mut() = hidden.into_iter().collect();
            Ok(())
        }
        .boxed_local()
    }
}

impl<A: StorageArea> Snapshot for WatchView<A> {
    fn snapshot(&self) -> Value {
        let state = ViewState {
            progress: self.progress.borrow().clone(),
            plans: self.plans.borrow().clone(),
            hidden: self.hidden.borrow().clone(),
        };
        // Serializing plain data into a Value cannot fail.
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    fn restore(&self, snapshot: Value) -> Result<(), serde_json::Error> {
        let state: ViewState = serde_json::from_value(snapshot)?;
        *self.progress.borrow_mut() = state.progress;
        *self.plans.borrow_mut() = state.plans;
        *self.hidden.borrow_mut() = state.hidden;
        Ok(())
    }
}
