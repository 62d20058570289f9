//! 裁判侧比赛状态机
//!
//! ```text
//! CREATED → AWAITING_PLAYERS_READY → INVITED → AWAITING_MOVES → RESOLVING → ROUND_COMPLETE
//!                                        │            ↑                          │
//!                                        │            └──────── 下一小局 ─────────┤
//!                                        └→ [MATCH_FORFEITED]                    └→ [MATCH_COMPLETE]
//! 任意非终止状态 → [MATCH_CANCELLED]
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    Created,
    AwaitingPlayersReady,
    Invited,
    AwaitingMoves,
    Resolving,
    /// 一小局结束
    RoundComplete,
    MatchComplete,
    MatchCancelled,
    MatchForfeited,
}

impl MatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchState::MatchComplete | MatchState::MatchCancelled | MatchState::MatchForfeited
        )
    }

    pub fn can_transition_to(&self, next: MatchState) -> bool {
        use MatchState::*;
        if self.is_terminal() {
            return false;
        }
        if next == MatchCancelled {
            return true;
        }
        matches!(
            (self, next),
            (Created, AwaitingPlayersReady)
                | (AwaitingPlayersReady, Invited)
                | (Invited, AwaitingMoves)
                | (Invited, MatchForfeited)
                | (AwaitingMoves, Resolving)
                | (Resolving, RoundComplete)
                | (RoundComplete, AwaitingMoves)
                | (RoundComplete, MatchComplete)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            MatchState::Created,
            MatchState::AwaitingPlayersReady,
            MatchState::Invited,
            MatchState::AwaitingMoves,
            MatchState::Resolving,
            MatchState::RoundComplete,
            MatchState::AwaitingMoves,
            MatchState::Resolving,
            MatchState::RoundComplete,
            MatchState::MatchComplete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for state in [
            MatchState::Created,
            MatchState::Invited,
            MatchState::AwaitingMoves,
            MatchState::RoundComplete,
        ] {
            assert!(state.can_transition_to(MatchState::MatchCancelled));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for state in [
            MatchState::MatchComplete,
            MatchState::MatchCancelled,
            MatchState::MatchForfeited,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(MatchState::MatchCancelled));
            assert!(!state.can_transition_to(MatchState::AwaitingMoves));
        }
        assert!(!MatchState::AwaitingMoves.can_transition_to(MatchState::MatchForfeited));
        assert!(!MatchState::Created.can_transition_to(MatchState::AwaitingMoves));
    }
}
