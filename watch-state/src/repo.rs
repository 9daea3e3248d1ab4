//! Typed wrappers over the shared storage area.
//!
//! Three independent collections, each under a fixed key: the progress map,
//! the plan map, and the hidden-id set. Nothing here is clever; the point is
//! that every context reads and writes the same keys with the same shapes,
//! and that status is always computed fresh from all three.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use relay::storage::{StorageArea, StorageError};
use serde_json::Value;

use crate::status::{Plan, Progress, Status};

pub const PROGRESS_KEY: &str = "watch.progress";
pub const PLAN_KEY: &str = "watch.plan";
pub const HIDDEN_KEY: &str = "watch.hidden";

/// Store ids the sync layer routes signals by. One per collection.
pub const WATCHING_STORE: &str = "watching";
pub const PLANNED_STORE: &str = "planned";
pub const HIDDEN_STORE: &str = "hidden";

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no progress record for item `{0}`")]
    MissingProgress(String),
}

pub struct Repositories<A: StorageArea> {
    area: Rc<A>,
}

impl<A: StorageArea> Clone for Repositories<A> {
    fn clone(&self) -> Self {
        Self {
            area: self.area.clone(),
        }
    }
}

impl<A: StorageArea> Repositories<A> {
    pub fn new(area: Rc<A>) -> Self {
        Self { area }
    }

    pub fn area(&self) -> &Rc<A> {
        &self.area
    }

    async fn read_map<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<BTreeMap<String, T>, StorageError> {
        match self.area.get(key).await? {
            None => Ok(BTreeMap::new()),
            Some(value) => serde_json::from_value(value).map_err(|source| {
                log::error!("corrupt record under `{key}`: {source}");
                StorageError::Corrupt {
                    key: key.to_string(),
                    source,
                }
            }),
        }
    }

    async fn write_map<T: serde::Serialize>(
        &self,
        key: &str,
        map: &BTreeMap<String, T>,
    ) -> Result<(), StorageError> {
        // An empty collection is stored as an absent key, matching what a
        // fresh profile looks like.
        if map.is_empty() {
            self.area.remove(key).await
        } else {
            let value = serde_json::to_value(map).map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            })?;
            self.area.set(key, value).await
        }
    }

    pub async fn progress_map(&self) -> Result<BTreeMap<String, Progress>, StorageError> {
        self.read_map(PROGRESS_KEY).await
    }

    pub async fn plan_map(&self) -> Result<BTreeMap<String, Plan>, StorageError> {
        self.read_map(PLAN_KEY).await
    }

    pub async fn hidden_ids(&self) -> Result<BTreeSet<String>, StorageError> {
        match self.area.get(HIDDEN_KEY).await? {
            None => Ok(BTreeSet::new()),
            Some(value) => serde_json::from_value(value).map_err(|source| {
                log::error!("corrupt record under `{HIDDEN_KEY}`: {source}");
                StorageError::Corrupt {
                    key: HIDDEN_KEY.to_string(),
                    source,
                }
            }),
        }
    }

    pub async fn upsert_progress(&self, progress: Progress) -> Result<(), StorageError> {
        let mut map = self.progress_map().await?;
        map.insert(progress.item_id.clone(), progress);
        self.write_map(PROGRESS_KEY, &map).await
    }

    pub async fn remove_progress(&self, item_id: &str) -> Result<(), StorageError> {
        let mut map = self.progress_map().await?;
        map.remove(item_id);
        self.write_map(PROGRESS_KEY, &map).await
    }

    pub async fn update_progress(
        &self,
        item_id: &str,
        episode: u32,
        episode_ref: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), WatchError> {
        let mut map = self.progress_map().await?;
        let Some(progress) = map.get_mut(item_id) else {
            return Err(WatchError::MissingProgress(item_id.to_string()));
        };
        progress.current_episode = episode;
        progress.episode_ref = episode_ref.to_string();
        progress.last_watched_at = at;
        self.write_map(PROGRESS_KEY, &map).await?;
        Ok(())
    }

    pub async fn upsert_plan(&self, plan: Plan) -> Result<(), StorageError> {
        let mut map = self.plan_map().await?;
        map.insert(plan.item_id.clone(), plan);
        self.write_map(PLAN_KEY, &map).await
    }

    pub async fn remove_plan(&self, item_id: &str) -> Result<(), StorageError> {
        let mut map = self.plan_map().await?;
        map.remove(item_id);
        self.write_map(PLAN_KEY, &map).await
    }

    pub async fn hide(&self, item_id: &str) -> Result<(), StorageError> {
        let mut ids = self.hidden_ids().await?;
        ids.insert(item_id.to_string());
        self.write_hidden(&ids).await
    }

    pub async fn unhide(&self, item_id: &str) -> Result<(), StorageError> {
        let mut ids = self.hidden_ids().await?;
        ids.remove(item_id);
        self.write_hidden(&ids).await
    }

    pub async fn clear_hidden(&self) -> Result<(), StorageError> {
        self.area.remove(HIDDEN_KEY).await
    }

    async fn write_hidden(&self, ids: &BTreeSet<String>) -> Result<(), StorageError> {
        if ids.is_empty() {
            self.area.remove(HIDDEN_KEY).await
        } else {
            let value: Value = serde_json::to_value(ids).map_err(|source| StorageError::Corrupt {
                key: HIDDEN_KEY.to_string(),
                source,
            })?;
            self.area.set(HIDDEN_KEY, value).await
        }
    }

    /// Computes the item's status fresh from all three collections, ranked
    /// Hidden > Watching > Planned > Clean.
    pub async fn status(&self, item_id: &str) -> Result<Status, StorageError> {
        let hidden = self.hidden_ids().await?.contains(item_id);
        let progress = self.progress_map().await?.remove(item_id);
        let plan = self.plan_map().await?.remove(item_id);
        Ok(Status::classify(progress, plan, hidden))
    }
}
