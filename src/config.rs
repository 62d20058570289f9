//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LEAGUE__*` 覆盖（双下划线表示嵌套，如 `LEAGUE__REFEREE__MOVE_TIMEOUT_MS=500`）。
//! 所有阈值（失败次数、冷却时间、超时）都是参数，逻辑里不写死。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub league: LeagueSection,
    pub referee: RefereeSection,
    pub resilience: ResilienceSection,
    pub registry: RegistrySection,
    pub events: EventsSection,
    pub node: NodeSection,
}

/// [league] 段：联赛身份、容量、积分规则、比赛超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeagueSection {
    pub league_id: String,
    /// GameRegistry 中的游戏名
    pub game: String,
    pub max_players: usize,
    pub max_referees: usize,
    pub points_for_win: u32,
    pub points_for_draw: u32,
    pub points_for_loss: u32,
    /// 单轮等待全部比赛结束的上限；超时的比赛被标记待对账
    pub match_timeout_secs: u64,
    /// 无裁判时重新推进轮次的间隔
    pub round_retry_secs: u64,
}

impl Default for LeagueSection {
    fn default() -> Self {
        Self {
            league_id: "league-1".to_string(),
            game: "parity".to_string(),
            max_players: 64,
            max_referees: 16,
            points_for_win: 3,
            points_for_draw: 1,
            points_for_loss: 0,
            match_timeout_secs: 120,
            round_retry_secs: 2,
        }
    }
}

impl LeagueSection {
    pub fn match_timeout(&self) -> Duration {
        Duration::from_secs(self.match_timeout_secs)
    }

    pub fn round_retry(&self) -> Duration {
        Duration::from_secs(self.round_retry_secs)
    }
}

/// [referee] 段：每场小局数与各等待点的截止时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefereeSection {
    pub rounds_per_match: u32,
    pub invite_timeout_ms: u64,
    pub move_timeout_ms: u64,
}

impl Default for RefereeSection {
    fn default() -> Self {
        Self {
            rounds_per_match: 5,
            invite_timeout_ms: 5_000,
            move_timeout_ms: 30_000,
        }
    }
}

impl RefereeSection {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

/// [resilience] 段：熔断与重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// 连续失败多少次后熔断
    pub failure_threshold: u32,
    /// OPEN 持续时间（固定，不做指数增长）
    pub cooldown_ms: u64,
    /// 含首次调用在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    /// 单次尝试超时
    pub call_timeout_ms: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_ms: 100,
            call_timeout_ms: 10_000,
        }
    }
}

/// [registry] 段：心跳与健康扫描
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// 超过此时间没有心跳即标记为不健康
    pub heartbeat_timeout_secs: u64,
    /// 不健康超过此时间后删除
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    /// Agent 侧发送心跳的间隔
    pub heartbeat_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            grace_period_secs: 300,
            sweep_interval_secs: 10,
            heartbeat_interval_secs: 10,
        }
    }
}

/// [events] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// 保留的历史事件条数，超出时淘汰最旧的
    pub history_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

/// [node] 段：独立进程部署时的角色与地址（league-node 二进制使用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// league_manager / referee / player
    pub role: String,
    pub bind_addr: String,
    /// 本节点对外公布的 endpoint；为空时由 bind_addr 推导
    pub public_endpoint: Option<String>,
    /// League Manager 的 endpoint（referee / player 使用）
    pub league_endpoint: String,
    /// player 使用的策略名
    pub strategy: String,
    pub display_name: Option<String>,
    /// league_manager 在此数量的选手注册后自动开赛
    pub expected_players: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            role: "league_manager".to_string(),
            bind_addr: "127.0.0.1:8000".to_string(),
            public_endpoint: None,
            league_endpoint: "http://127.0.0.1:8000/league".to_string(),
            strategy: "random".to_string(),
            display_name: None,
            expected_players: 4,
        }
    }
}

/// 从 config 目录加载配置，环境变量 LEAGUE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LEAGUE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LEAGUE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
