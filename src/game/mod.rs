//! 游戏规则抽象
//!
//! 具体规则不属于编排核心：裁判只通过 Game trait 的 validate / resolve / rounds_to_win 使用它。
//! GameRegistry 按名称注册，比赛构造时解析一次，之后不再按调用重新查找。

mod parity;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::LeagueError;

pub use parity::ParityGame;

/// 落子值由具体游戏解释
pub type Move = serde_json::Value;

/// 单小局结果；Winner 为 moves 中的座位下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    Winner(usize),
    Draw,
}

/// 游戏 trait：合法性校验、小局裁决、提前获胜条件
pub trait Game: Send + Sync {
    /// 注册名（MATCH_ASSIGNMENT.game / 玩家 capabilities 中使用）
    fn name(&self) -> &str;

    /// 落子是否在游戏声明的合法范围内
    fn validate(&self, mv: &Move) -> bool;

    /// 裁决一小局；`None` 表示该座位在期限内没有落子，缺席如何计分由游戏决定
    fn resolve(&self, moves: &[Option<Move>]) -> RoundOutcome;

    /// 先赢到该小局数即提前结束；None 表示打满配置的局数
    fn rounds_to_win(&self) -> Option<u32>;
}

/// 游戏注册表：按名称存储 Arc<dyn Game>
#[derive(Default, Clone)]
pub struct GameRegistry {
    games: HashMap<String, Arc<dyn Game>>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置游戏（parity）
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ParityGame::new());
        registry
    }

    pub fn register(&mut self, game: impl Game + 'static) {
        let name = game.name().to_string();
        self.games.insert(name, Arc::new(game));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Game>> {
        self.games.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Game>, LeagueError> {
        self.get(name)
            .ok_or_else(|| LeagueError::UnknownGame(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.games.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDraw;

    impl Game for AlwaysDraw {
        fn name(&self) -> &str {
            "draw"
        }

        fn validate(&self, _mv: &Move) -> bool {
            true
        }

        fn resolve(&self, _moves: &[Option<Move>]) -> RoundOutcome {
            RoundOutcome::Draw
        }

        fn rounds_to_win(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn test_registry_resolves_by_name() {
        let mut registry = GameRegistry::with_builtin();
        registry.register(AlwaysDraw);
        assert_eq!(registry.names(), vec!["draw".to_string(), "parity".to_string()]);
        assert_eq!(registry.resolve("parity").unwrap().name(), "parity");
        assert!(matches!(
            registry.resolve("chess"),
            Err(LeagueError::UnknownGame(name)) if name == "chess"
        ));
    }
}
