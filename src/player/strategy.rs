//! 落子策略
//!
//! 所有策略实现 Strategy trait（name / decide），由 StrategyRegistry 按名构造；
//! 玩家构造时解析一次，之后每次落子直接调用。

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde_json::json;

use crate::core::error::LeagueError;
use crate::game::Move;
use crate::protocol::MatchView;

/// 策略 trait：根据比赛状态给出下一步落子
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, view: &MatchView) -> Move;
}

/// 每次都出同一个值
#[derive(Debug, Clone)]
pub struct FixedStrategy {
    value: i64,
}

impl FixedStrategy {
    pub fn new(value: i64) -> Self {
        Self { value }
    }
}

impl Strategy for FixedStrategy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn decide(&self, _view: &MatchView) -> Move {
        json!(self.value)
    }
}

/// 闭区间内均匀随机
#[derive(Debug, Clone)]
pub struct RandomStrategy {
    min: i64,
    max: i64,
}

impl RandomStrategy {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    fn decide(&self, _view: &MatchView) -> Move {
        json!(rand::rng().random_range(self.min..=self.max))
    }
}

/// 按小局序号循环出一组值（无内部状态，同一局重复决策结果相同）
#[derive(Debug, Clone)]
pub struct CycleStrategy {
    values: Vec<i64>,
}

impl CycleStrategy {
    pub fn new(values: Vec<i64>) -> Self {
        Self { values }
    }
}

impl Strategy for CycleStrategy {
    fn name(&self) -> &str {
        "cycle"
    }

    fn decide(&self, view: &MatchView) -> Move {
        if self.values.is_empty() {
            return json!(1);
        }
        let index = view.game_round.saturating_sub(1) as usize % self.values.len();
        json!(self.values[index])
    }
}

/// 由可选参数构造策略（`fixed:3` 中的 `3`）
pub type StrategyFactory = Arc<dyn Fn(Option<&str>) -> Result<Arc<dyn Strategy>, String> + Send + Sync>;

/// 策略注册表：名称 -> 构造函数
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置：`fixed[:n]`、`random[:min-max]`、`cycle[:a,b,c]`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("fixed", |arg| {
            let value = arg.map(parse_int).transpose()?.unwrap_or(3);
            Ok(Arc::new(FixedStrategy::new(value)) as Arc<dyn Strategy>)
        });
        registry.register("random", |arg| {
            let (min, max) = match arg {
                Some(range) => {
                    let (lo, hi) = range
                        .split_once('-')
                        .ok_or_else(|| format!("expected min-max, got '{range}'"))?;
                    (parse_int(lo)?, parse_int(hi)?)
                }
                None => (1, 5),
            };
            Ok(Arc::new(RandomStrategy::new(min, max)) as Arc<dyn Strategy>)
        });
        registry.register("cycle", |arg| {
            let values = match arg {
                Some(list) => list.split(',').map(parse_int).collect::<Result<Vec<_>, _>>()?,
                None => vec![1, 2, 3, 4, 5],
            };
            if values.is_empty() {
                return Err("cycle needs at least one value".into());
            }
            Ok(Arc::new(CycleStrategy::new(values)) as Arc<dyn Strategy>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn Strategy>, String> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// 解析 `name` 或 `name:arg`
    pub fn resolve(&self, spec: &str) -> Result<Arc<dyn Strategy>, LeagueError> {
        let (name, arg) = match spec.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (spec.trim(), None),
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LeagueError::UnknownStrategy(spec.to_string()))?;
        factory(arg).map_err(|reason| LeagueError::UnknownStrategy(format!("{spec}: {reason}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("'{s}' is not an integer: {e}"))
}
