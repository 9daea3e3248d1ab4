//! The transition table.
//!
//! Pure functions only: given where an item stands and what the user wants to
//! do, say yes or no, and flag the side effects the caller must honor when
//! committing. No I/O, no errors, same answer every time.

use crate::status::Status;

/// The seven things a user can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    AddToPlan,
    RemoveFromPlan,
    AddToWatch,
    RemoveFromWatch,
    UpdateEpisode,
    Hide,
    Unhide,
}

pub const ALL_ACTIONS: [Action; 7] = [
    Action::AddToPlan,
    Action::RemoveFromPlan,
    Action::AddToWatch,
    Action::RemoveFromWatch,
    Action::UpdateEpisode,
    Action::Hide,
    Action::Unhide,
];

/// The validator's answer. `removes_from_plan` means the caller must delete
/// the plan record in the same commit; `requires_episode_input` means the
/// caller has to supply a starting episode before running the action.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub removes_from_plan: bool,
    pub requires_episode_input: bool,
}

impl Verdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            removes_from_plan: false,
            requires_episode_input: false,
        }
    }

    fn allow_with(removes_from_plan: bool, requires_episode_input: bool) -> Self {
        Self {
            allowed: true,
            reason: None,
            removes_from_plan,
            requires_episode_input,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            removes_from_plan: false,
            requires_episode_input: false,
        }
    }
}

/// The full transition table.
pub fn validate(status: &Status, action: Action) -> Verdict {
    match status {
        Status::Hidden => match action {
            Action::Unhide => Verdict::allow(),
            Action::AddToPlan => Verdict::deny("cannot add a hidden item to the plan"),
            Action::AddToWatch => Verdict::deny("cannot start watching a hidden item"),
            Action::RemoveFromPlan => Verdict::deny("hidden item is not in the plan"),
            Action::RemoveFromWatch | Action::UpdateEpisode => {
                Verdict::deny("hidden item is not being watched")
            }
            Action::Hide => Verdict::deny("item is already hidden"),
        },
        Status::Watching(_) => match action {
            Action::RemoveFromWatch | Action::UpdateEpisode => Verdict::allow(),
            Action::AddToPlan => Verdict::deny("cannot add to plan while watching"),
            Action::Hide => Verdict::deny("cannot hide an item while watching"),
            Action::AddToWatch => Verdict::deny("already watching this item"),
            Action::RemoveFromPlan => Verdict::deny("item is not in the plan"),
            Action::Unhide => Verdict::deny("item is not hidden"),
        },
        Status::Planned(_) => match action {
            Action::RemoveFromPlan => Verdict::allow(),
            // Promotion: the plan record must go away in the same commit, and
            // the caller owes us a starting episode.
            Action::AddToWatch => Verdict::allow_with(true, true),
            Action::AddToPlan => Verdict::deny("item is already in the plan"),
            Action::Hide => Verdict::deny("cannot hide a planned item"),
            Action::RemoveFromWatch | Action::UpdateEpisode => {
                Verdict::deny("item is not being watched")
            }
            Action::Unhide => Verdict::deny("item is not hidden"),
        },
        Status::Clean => match action {
            Action::AddToPlan | Action::Hide => Verdict::allow(),
            Action::AddToWatch => Verdict::allow_with(false, true),
            Action::RemoveFromPlan => Verdict::deny("item is not in the plan"),
            Action::RemoveFromWatch | Action::UpdateEpisode => {
                Verdict::deny("item is not being watched")
            }
            Action::Unhide => Verdict::deny("item is not hidden"),
        },
    }
}

/// Every action the current state admits, in declaration order. Drives UI
/// affordances off the same table as [`validate`].
pub fn available_actions(status: &Status) -> Vec<Action> {
    ALL_ACTIONS
        .into_iter()
        .filter(|action| validate(status, *action).allowed)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::fixtures::{plan, progress};

    fn all_states() -> [Status; 4] {
        [
            Status::Clean,
            Status::Planned(plan("a")),
            Status::Watching(progress("a", 5)),
            Status::Hidden,
        ]
    }

    #[test]
    fn test_every_pair_is_deterministic_and_total() {
        for status in all_states() {
            for action in ALL_ACTIONS {
                let first = validate(&status, action);
                let second = validate(&status, action);
                assert_eq!(first, second, "{status:?} / {action:?} not deterministic");
                if !first.allowed {
                    assert!(
                        first.reason.is_some(),
                        "denial without a reason for {status:?} / {action:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_clean_allows_plan_watch_hide_only() {
        assert_eq!(
            available_actions(&Status::Clean),
            vec![Action::AddToPlan, Action::AddToWatch, Action::Hide]
        );
        let verdict = validate(&Status::Clean, Action::AddToPlan);
        assert!(verdict.allowed);
        assert!(!verdict.removes_from_plan);

        let verdict = validate(&Status::Clean, Action::AddToWatch);
        assert!(verdict.requires_episode_input);
    }

    #[test]
    fn test_planned_promotion_flags_plan_removal() {
        let status = Status::Planned(plan("a"));
        let verdict = validate(&status, Action::AddToWatch);
        assert!(verdict.allowed);
        assert!(verdict.removes_from_plan);
        assert!(verdict.requires_episode_input);

        assert_eq!(
            available_actions(&status),
            vec![Action::RemoveFromPlan, Action::AddToWatch]
        );
    }

    #[test]
    fn test_watching_denies_hide_with_a_pointed_reason() {
        let status = Status::Watching(progress("a", 5));
        let verdict = validate(&status, Action::Hide);
        assert!(!verdict.allowed);
        assert!(verdict.reason.as_deref().unwrap().contains("while watching"));

        assert_eq!(
            available_actions(&status),
            vec![Action::RemoveFromWatch, Action::UpdateEpisode]
        );
    }

    #[test]
    fn test_hidden_admits_only_unhide() {
        assert_eq!(available_actions(&Status::Hidden), vec![Action::Unhide]);
        for action in ALL_ACTIONS {
            let verdict = validate(&Status::Hidden, action);
            assert_eq!(verdict.allowed, action == Action::Unhide);
        }
    }

    #[test]
    fn test_validator_gated_sequences_keep_one_flag_at_most() {
        // Walk every allowed action from every reachable state a few plies
        // deep, applying the nominal effect, and check the exclusivity
        // invariant at each step.
        fn apply(status: &Status, action: Action) -> Status {
            match action {
                Action::AddToPlan => Status::Planned(plan("a")),
                Action::RemoveFromPlan => Status::Clean,
                Action::AddToWatch => Status::Watching(progress("a", 1)),
                Action::RemoveFromWatch => Status::Clean,
                Action::UpdateEpisode => match status {
                    Status::Watching(p) => {
                        let mut p = p.clone();
                        p.current_episode += 1;
                        Status::Watching(p)
                    }
                    _ => unreachable!("validator admitted UpdateEpisode off Watching"),
                },
                Action::Hide => Status::Hidden,
                Action::Unhide => Status::Clean,
            }
        }

        let mut frontier = vec![Status::Clean];
        for _ in 0..4 {
            let mut next = Vec::new();
            for status in &frontier {
                for action in ALL_ACTIONS {
                    if validate(status, action).allowed {
                        let after = apply(status, action);
                        let flags = after.flags();
                        let set = [flags.is_tracked, flags.is_planned, flags.is_hidden]
                            .iter()
                            .filter(|flag| **flag)
                            .count();
                        assert!(set <= 1);
                        next.push(after);
                    }
                }
            }
            frontier = next;
        }
    }
}
