//! The status model.
//!
//! An item is in exactly one of four states. Internally that's a tagged
//! variant, so an invalid combination (planned *and* hidden, say) cannot even
//! be represented; the overlapping boolean-flag view that older callers
//! expect is derived at the query boundary and nowhere else.

use chrono::{DateTime, Utc};

/// A progress record: the item is being watched.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    pub item_id: String,
    pub title: String,
    pub slug: String,
    pub current_episode: u32,
    /// Opaque reference to the episode page, kept verbatim for the UI. Not
    /// interpreted here.
    pub episode_ref: String,
    pub last_watched_at: DateTime<Utc>,
    pub total_episodes: Option<u32>,
}

/// A plan record: the item is queued to watch later.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Plan {
    pub item_id: String,
    pub title: String,
    pub slug: String,
    pub added_at: DateTime<Utc>,
}

/// Where an item stands. Always computed fresh from the underlying
/// collections; never persisted in this shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Clean,
    Planned(Plan),
    Watching(Progress),
    Hidden,
}

impl Status {
    /// Collapses the three raw collections into one state. The store can
    /// transiently disagree with itself (a write in flight), so membership is
    /// ranked: Hidden > Watching > Planned > Clean.
    pub fn classify(progress: Option<Progress>, plan: Option<Plan>, hidden: bool) -> Self {
        if hidden {
            Status::Hidden
        } else if let Some(progress) = progress {
            Status::Watching(progress)
        } else if let Some(plan) = plan {
            Status::Planned(plan)
        } else {
            Status::Clean
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, Status::Watching(_))
    }

    pub fn is_planned(&self) -> bool {
        matches!(self, Status::Planned(_))
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Status::Hidden)
    }

    /// The boolean-flag view for callers that predate the tagged variant.
    pub fn flags(&self) -> StatusFlags {
        StatusFlags {
            is_tracked: self.is_tracked(),
            is_planned: self.is_planned(),
            is_hidden: self.is_hidden(),
            progress: match self {
                Status::Watching(progress) => Some(progress.clone()),
                _ => None,
            },
            plan: match self {
                Status::Planned(plan) => Some(plan.clone()),
                _ => None,
            },
        }
    }

    /// Human-readable label for the UI.
    pub fn describe(&self) -> String {
        match self {
            Status::Clean => "Not in List".to_string(),
            Status::Planned(_) => "Planned to Watch".to_string(),
            Status::Watching(progress) => {
                format!("Watching — Episode {}", progress.current_episode)
            }
            Status::Hidden => "Hidden".to_string(),
        }
    }
}

/// Flag-shaped view of a [`Status`]. At most one flag is ever set; the enum
/// it is derived from guarantees that.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusFlags {
    pub is_tracked: bool,
    pub is_planned: bool,
    pub is_hidden: bool,
    pub progress: Option<Progress>,
    pub plan: Option<Plan>,
}
