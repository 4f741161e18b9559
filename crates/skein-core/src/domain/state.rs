//! Queue state machine held by the broker, one entry per active queue.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::{Action, ActionKey};

/// When a paused queue may be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeAt {
    /// A retry timer is armed for this instant.
    At(DateTime<Utc>),

    /// No timer. Only an explicit restart resumes the queue.
    Indefinite,
}

/// Per-queue state.
///
/// State transitions:
/// - (idle) -> Processing -> (idle)
/// - (idle) -> Processing -> Paused -> (idle)
///
/// Idle is the absence of an entry in the state table, so it has no variant.
/// A pause always carries the action that failed, which keeps "paused with
/// nothing to retry" unrepresentable.
pub enum QueueState<A> {
    /// This action is handed to the handler; completion pending.
    Processing(Arc<A>),

    /// The handler reported failure for this action.
    Paused { action: Arc<A>, resume_at: ResumeAt },
}

impl<A: Action> QueueState<A> {
    pub fn action(&self) -> &Arc<A> {
        match self {
            QueueState::Processing(action) => action,
            QueueState::Paused { action, .. } => action,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, QueueState::Processing(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, QueueState::Paused { .. })
    }

    /// Does this state refer to `action` (by identity)?
    pub fn tracks(&self, action: &A) -> bool {
        self.action().is_same_action(action)
    }

    pub fn tracks_key(&self, key: &ActionKey) -> bool {
        let action = self.action();
        action.key() == key.key() && action.collection() == key.collection()
    }

    pub fn snapshot(&self) -> QueueStateSnapshot {
        match self {
            QueueState::Processing(action) => QueueStateSnapshot::Processing {
                action: action.action_key(),
            },
            QueueState::Paused { action, resume_at } => QueueStateSnapshot::Paused {
                action: action.action_key(),
                resume_at: *resume_at,
            },
        }
    }
}

impl<A> Clone for QueueState<A> {
    fn clone(&self) -> Self {
        match self {
            QueueState::Processing(action) => QueueState::Processing(Arc::clone(action)),
            QueueState::Paused { action, resume_at } => QueueState::Paused {
                action: Arc::clone(action),
                resume_at: *resume_at,
            },
        }
    }
}

impl<A: Action> fmt::Debug for QueueState<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// Owned, payload-free view of a [`QueueState`] for callers and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStateSnapshot {
    Processing { action: ActionKey },
    Paused { action: ActionKey, resume_at: ResumeAt },
}

impl QueueStateSnapshot {
    pub fn action(&self) -> &ActionKey {
        match self {
            QueueStateSnapshot::Processing { action } => action,
            QueueStateSnapshot::Paused { action, .. } => action,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, QueueStateSnapshot::Processing { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, QueueStateSnapshot::Paused { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::testing::TestAction;
    use chrono::TimeZone;

    #[test]
    fn state_tracks_by_identity() {
        let action = Arc::new(TestAction::new("a", "q", 1));
        let state = QueueState::Processing(Arc::clone(&action));

        let same_key = TestAction::new("a", "q", 99).labelled("edited");
        let other = TestAction::new("b", "q", 1);

        assert!(state.tracks(&same_key));
        assert!(!state.tracks(&other));
        assert!(state.tracks_key(&ActionKey::new("actions", "a")));
    }

    #[test]
    fn snapshot_keeps_resume_time() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let state = QueueState::Paused {
            action: Arc::new(TestAction::new("a", "q", 1)),
            resume_at: ResumeAt::At(at),
        };

        let snapshot = state.snapshot();
        assert!(snapshot.is_paused());
        assert_eq!(snapshot.action(), &ActionKey::new("actions", "a"));
        assert_eq!(
            snapshot,
            QueueStateSnapshot::Paused {
                action: ActionKey::new("actions", "a"),
                resume_at: ResumeAt::At(at),
            }
        );
    }

    #[test]
    fn snapshot_serializes_with_state_tag() {
        let snapshot = QueueStateSnapshot::Processing {
            action: ActionKey::new("outbox", "7"),
        };
        let v = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["state"], "processing");
        assert_eq!(v["action"]["key"], "7");
    }
}
