//! 玩家侧协作者：策略与玩家 Agent

pub mod agent;
pub mod strategy;

pub use agent::{PlayerAgent, PlayerSettings};
pub use strategy::{CycleStrategy, FixedStrategy, RandomStrategy, Strategy, StrategyFactory, StrategyRegistry};
