//! 奇偶和：双方各出 1..=5，和为奇数时 0 号座位（odd）赢，偶数时 1 号座位（even）赢

use super::{Game, Move, RoundOutcome};

const MIN_MOVE: i64 = 1;
const MAX_MOVE: i64 = 5;

#[derive(Debug, Clone, Default)]
pub struct ParityGame {
    rounds_to_win: Option<u32>,
}

impl ParityGame {
    pub fn new() -> Self {
        Self::default()
    }

    /// 先赢 n 小局者提前获胜
    pub fn first_to(n: u32) -> Self {
        Self {
            rounds_to_win: Some(n),
        }
    }

    fn value(mv: &Move) -> Option<i64> {
        mv.as_i64().filter(|v| (MIN_MOVE..=MAX_MOVE).contains(v))
    }
}

impl Game for ParityGame {
    fn name(&self) -> &str {
        "parity"
    }

    fn validate(&self, mv: &Move) -> bool {
        Self::value(mv).is_some()
    }

    fn resolve(&self, moves: &[Option<Move>]) -> RoundOutcome {
        let a = moves.first().and_then(|m| m.as_ref()).and_then(Self::value);
        let b = moves.get(1).and_then(|m| m.as_ref()).and_then(Self::value);
        match (a, b) {
            (Some(a), Some(b)) if (a + b) % 2 == 1 => RoundOutcome::Winner(0),
            (Some(_), Some(_)) => RoundOutcome::Winner(1),
            // 缺席只输掉这一小局
            (Some(_), None) => RoundOutcome::Winner(0),
            (None, Some(_)) => RoundOutcome::Winner(1),
            (None, None) => RoundOutcome::Draw,
        }
    }

    fn rounds_to_win(&self) -> Option<u32> {
        self.rounds_to_win
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_range() {
        let game = ParityGame::new();
        assert!(game.validate(&json!(1)));
        assert!(game.validate(&json!(5)));
        assert!(!game.validate(&json!(0)));
        assert!(!game.validate(&json!(6)));
        assert!(!game.validate(&json!("3")));
        assert!(!game.validate(&json!(2.5)));
    }

    #[test]
    fn test_resolve_parity() {
        let game = ParityGame::new();
        assert_eq!(game.resolve(&[Some(json!(1)), Some(json!(2))]), RoundOutcome::Winner(0));
        assert_eq!(game.resolve(&[Some(json!(2)), Some(json!(2))]), RoundOutcome::Winner(1));
    }

    #[test]
    fn test_resolve_missing_moves() {
        let game = ParityGame::new();
        assert_eq!(game.resolve(&[None, Some(json!(2))]), RoundOutcome::Winner(1));
        assert_eq!(game.resolve(&[Some(json!(4)), None]), RoundOutcome::Winner(0));
        assert_eq!(game.resolve(&[None, None]), RoundOutcome::Draw);
    }

    #[test]
    fn test_first_to() {
        assert_eq!(ParityGame::first_to(2).rounds_to_win(), Some(2));
        assert_eq!(ParityGame::new().rounds_to_win(), None);
    }
}
