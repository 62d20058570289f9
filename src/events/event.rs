//! 联赛事件：不可变，发布后只追加到历史

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// 事件类型常量
pub mod types {
    pub const LEAGUE_STARTED: &str = "league.started";
    pub const PLAYER_REGISTERED: &str = "player.registered";
    pub const REFEREE_REGISTERED: &str = "referee.registered";
    /// 主动注销或注册表过期
    pub const AGENT_DEREGISTERED: &str = "agent.deregistered";
    pub const ROUND_STARTED: &str = "round.started";
    pub const MATCH_ASSIGNED: &str = "match.assigned";
    /// 裁判侧比赛状态机迁移
    pub const MATCH_STATE_CHANGED: &str = "match.state_changed";
    pub const MATCH_COMPLETED: &str = "match.completed";
    /// 比赛被隔离待对账
    pub const MATCH_FLAGGED: &str = "match.flagged";
    pub const ROUND_COMPLETED: &str = "round.completed";
    pub const STANDINGS_UPDATED: &str = "standings.updated";
    pub const LEAGUE_COMPLETED: &str = "league.completed";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            event_type: event_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// 订阅模式匹配：`*` 匹配全部，`match.*` 匹配前缀，其余精确匹配
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) => self
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => self.event_type == pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        let ev = Event::new(types::MATCH_COMPLETED, "league_manager", json!({ "match_id": "R1M1" }));
        assert!(ev.matches("*"));
        assert!(ev.matches("match.completed"));
        assert!(ev.matches("match.*"));
        assert!(!ev.matches("match"));
        assert!(!ev.matches("matches.*"));
        assert!(!ev.matches("round.completed"));
    }
}
