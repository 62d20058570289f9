//! League - 多智能体循环赛编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connection**: 出站调用：超时、重试退避、按 endpoint 熔断
//! - **core**: 错误分类与恢复、优雅关闭
//! - **events**: 进程内事件总线（模式订阅 + 有界历史）
//! - **game**: 可插拔游戏规则（内置 parity）
//! - **league**: League Manager：注册、赛程、轮次推进、结果与积分榜
//! - **observability**: 日志初始化
//! - **player**: 玩家 Agent 与落子策略
//! - **protocol**: 版本化消息信封、payload 与校验
//! - **referee**: 裁判 Agent 与比赛状态机
//! - **registry**: 服务注册、心跳与健康扫描
//! - **transport**: 传输抽象（进程内 / HTTP）

pub mod config;
pub mod connection;
pub mod core;
pub mod events;
pub mod game;
pub mod league;
pub mod observability;
pub mod player;
pub mod protocol;
pub mod referee;
pub mod registry;
pub mod transport;

pub use crate::core::error::LeagueError;
pub use league::{LeagueManager, TournamentDriver};
