//! Execution lifecycle state machine
//!
//! A pure, stateless decision table over [`ExecutionStatus`]. No I/O, no
//! clock — every other module asks this one "is this move legal" and
//! "what happened last time" before touching the store.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`crate::domain::execution::WorkflowExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Retrying,
        ExecutionStatus::Cancelled,
    ];

    /// States with no outgoing transitions.
    fn terminal_states() -> &'static [ExecutionStatus] {
        &[ExecutionStatus::Completed, ExecutionStatus::Cancelled]
    }

    /// States from which a retry is legal to schedule.
    fn retryable_states() -> &'static [ExecutionStatus] {
        &[ExecutionStatus::Failed]
    }

    fn valid_targets(self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Completed, Failed, Cancelled],
            Failed => &[Retrying, Cancelled],
            Retrying => &[Running, Failed, Cancelled],
            Completed => &[],
            Cancelled => &[],
        }
    }

    /// True if no legal transition leads out of this state.
    ///
    /// `Failed` is not terminal here — it can still move to `Retrying` —
    /// even though callers that have exhausted `retry_count` treat it as
    /// terminal for routing purposes. That distinction lives in the
    /// execution service, not the state machine.
    pub fn is_terminal(self) -> bool {
        Self::terminal_states().contains(&self)
    }

    /// True if this state accepts a retry transition.
    pub fn can_retry(self) -> bool {
        Self::retryable_states().contains(&self)
    }
}

/// Illegal transition attempted between two [`ExecutionStatus`] values.
#[derive(Debug, thiserror::Error)]
#[error("cannot transition from {from:?} to {to:?}")]
pub struct InvalidTransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// True if `from -> to` appears in the transition table.
pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    from.valid_targets().contains(&to)
}

/// `can_transition`, raising [`InvalidTransitionError`] on an illegal move.
pub fn validate(from: ExecutionStatus, to: ExecutionStatus) -> Result<(), InvalidTransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(InvalidTransitionError { from, to })
    }
}

/// All states reachable from `from` in exactly one legal transition.
pub fn valid_transitions(from: ExecutionStatus) -> &'static [ExecutionStatus] {
    from.valid_targets()
}

/// Shortest sequence of legal transitions from `from` to `to`, inclusive of
/// both endpoints. `None` if `to` is unreachable. `[from]` if `from == to`.
///
/// Used for diagnostics only — nothing in the orchestrator depends on the
/// path, only on whether one exists.
pub fn path(from: ExecutionStatus, to: ExecutionStatus) -> Option<Vec<ExecutionStatus>> {
    if from == to {
        return Some(vec![from]);
    }

    let mut visited: HashSet<ExecutionStatus> = HashSet::new();
    visited.insert(from);
    let mut queue: VecDeque<Vec<ExecutionStatus>> = VecDeque::new();
    queue.push_back(vec![from]);

    while let Some(current_path) = queue.pop_front() {
        let tail = *current_path.last().expect("path is never empty");
        for &next in tail.valid_targets() {
            if next == to {
                let mut found = current_path.clone();
                found.push(next);
                return Some(found);
            }
            if visited.insert(next) {
                let mut extended = current_path.clone();
                extended.push(next);
                queue.push_back(extended);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn legal_transitions_match_table() {
        let legal = [
            (Pending, Running),
            (Pending, Cancelled),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
            (Failed, Retrying),
            (Failed, Cancelled),
            (Retrying, Running),
            (Retrying, Failed),
            (Retrying, Cancelled),
        ];
        for &(from, to) in &legal {
            assert!(can_transition(from, to), "{from:?} -> {to:?} should be legal");
            assert!(validate(from, to).is_ok());
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        for &from in ExecutionStatus::ALL.iter() {
            for &to in ExecutionStatus::ALL.iter() {
                let expected_legal = matches!(
                    (from, to),
                    (Pending, Running)
                        | (Pending, Cancelled)
                        | (Running, Completed)
                        | (Running, Failed)
                        | (Running, Cancelled)
                        | (Failed, Retrying)
                        | (Failed, Cancelled)
                        | (Retrying, Running)
                        | (Retrying, Failed)
                        | (Retrying, Cancelled)
                );
                assert_eq!(can_transition(from, to), expected_legal, "{from:?} -> {to:?}");
                assert_eq!(validate(from, to).is_ok(), expected_legal);
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn only_failed_can_retry() {
        assert!(Failed.can_retry());
        for &s in ExecutionStatus::ALL.iter() {
            if s != Failed {
                assert!(!s.can_retry());
            }
        }
    }

    #[test]
    fn path_same_state_is_single_element() {
        assert_eq!(path(Running, Running), Some(vec![Running]));
    }

    #[test]
    fn path_to_terminal_state_is_found() {
        let found = path(Pending, Completed).expect("should be reachable");
        assert_eq!(found.first(), Some(&Pending));
        assert_eq!(found.last(), Some(&Completed));
        for pair in found.windows(2) {
            assert!(can_transition(pair[0], pair[1]));
        }
    }

    #[test]
    fn path_from_terminal_state_is_none() {
        assert_eq!(path(Completed, Running), None);
        assert_eq!(path(Cancelled, Pending), None);
    }

    #[test]
    fn path_is_shortest() {
        // Pending -> Running -> Failed is the only route; length 3.
        let found = path(Pending, Failed).unwrap();
        assert_eq!(found, vec![Pending, Running, Failed]);
    }
}
