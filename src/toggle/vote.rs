//! Vote state machine

use serde::{Deserialize, Serialize};

pub use crate::store::VoteKind;

/// Vote of one actor on one target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteState {
    #[default]
    NoVote,
    Upvoted,
    Downvoted,
}

impl VoteState {
    /// Repeating the current vote clears it, the other kind switches
    pub fn apply(self, action: VoteKind) -> Self {
        match (self, action) {
            (Self::Upvoted, VoteKind::Up) | (Self::Downvoted, VoteKind::Down) => Self::NoVote,
            (_, VoteKind::Up) => Self::Upvoted,
            (_, VoteKind::Down) => Self::Downvoted,
        }
    }

    pub fn kind(self) -> Option<VoteKind> {
        match self {
            Self::NoVote => None,
            Self::Upvoted => Some(VoteKind::Up),
            Self::Downvoted => Some(VoteKind::Down),
        }
    }
}

impl From<Option<VoteKind>> for VoteState {
    fn from(kind: Option<VoteKind>) -> Self {
        match kind {
            None => Self::NoVote,
            Some(VoteKind::Up) => Self::Upvoted,
            Some(VoteKind::Down) => Self::Downvoted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use VoteKind::{Down, Up};
        use VoteState::{Downvoted, NoVote, Upvoted};

        let table = [
            (NoVote, Up, Upvoted),
            (Upvoted, Up, NoVote),
            (Upvoted, Down, Downvoted),
            (NoVote, Down, Downvoted),
            (Downvoted, Down, NoVote),
            (Downvoted, Up, Upvoted),
        ];
        for (from, action, to) in table {
            assert_eq!(from.apply(action), to, "{:?} + {:?}", from, action);
        }
    }

    #[test]
    fn test_kind_round_trip() {
        for state in [VoteState::NoVote, VoteState::Upvoted, VoteState::Downvoted] {
            assert_eq!(VoteState::from(state.kind()), state);
        }
    }
}
