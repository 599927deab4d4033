//! Per-step run state machine.

use serde::{Deserialize, Serialize};

/// Where a single step's run is in
/// `PENDING → PREREQS_CHECKED → BACKED_UP → MUTATING → VALIDATING → {COMMITTED | ROLLED_BACK}`.
///
/// Failures before a snapshot exists end in `ABORTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    PrereqsChecked,
    BackedUp,
    Mutating,
    Validating,
    Committed,
    RolledBack,
    Aborted,
}

impl RunState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::RolledBack | RunState::Aborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, PrereqsChecked)
                | (Pending, Aborted)
                | (PrereqsChecked, BackedUp)
                | (PrereqsChecked, Aborted)
                | (BackedUp, Mutating)
                | (Mutating, Validating)
                | (Mutating, RolledBack)
                | (Validating, Committed)
                | (Validating, RolledBack)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "PENDING"),
            RunState::PrereqsChecked => write!(f, "PREREQS_CHECKED"),
            RunState::BackedUp => write!(f, "BACKED_UP"),
            RunState::Mutating => write!(f, "MUTATING"),
            RunState::Validating => write!(f, "VALIDATING"),
            RunState::Committed => write!(f, "COMMITTED"),
            RunState::RolledBack => write!(f, "ROLLED_BACK"),
            RunState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            RunState::Pending,
            RunState::PrereqsChecked,
            RunState::BackedUp,
            RunState::Mutating,
            RunState::Validating,
            RunState::Committed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(RunState::Committed.is_terminal());
    }

    #[test]
    fn test_no_rollback_without_backup() {
        assert!(!RunState::PrereqsChecked.can_transition_to(RunState::RolledBack));
        assert!(!RunState::BackedUp.can_transition_to(RunState::Aborted));
        assert!(!RunState::Committed.can_transition_to(RunState::RolledBack));
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&RunState::PrereqsChecked).unwrap();
        assert_eq!(json, "\"PREREQS_CHECKED\"");
    }
}
