//! 各消息类型的 payload 结构
//!
//! payload 校验 = 无宽松转换地反序列化为对应结构体（未知字段同样拒绝）。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::message::{AgentKind, MessageType};
use crate::core::error::ProtocolViolation;
use crate::league::standings::StandingRow;

/// ERROR 消息的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolViolation,
    InvalidMove,
    LateMove,
    RegistrationRejected,
    ResultConflict,
    UnknownMatch,
    UnknownAgent,
    InvalidState,
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub kind: AgentKind,
    pub endpoint: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// 支持的游戏类型
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterResponse {
    pub agent_id: String,
    /// 同一身份的重复注册：返回已有 id，不重复计数
    #[serde(default)]
    pub deduplicated: bool,
}

/// 比赛参与方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Participant {
    pub player_id: String,
    pub endpoint: String,
}

/// League Manager → Referee：分配一场比赛
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchAssignment {
    pub match_id: String,
    pub round_id: u32,
    pub game: String,
    pub player_a: Participant,
    pub player_b: Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameInvite {
    pub match_id: String,
    pub game: String,
    pub player_id: String,
    pub opponent_id: String,
    /// 0 = player_a，1 = player_b（由游戏解释，如 parity 中 0 号为 odd）
    pub seat: usize,
    pub game_rounds: u32,
    pub reply_deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameJoinAck {
    pub match_id: String,
    pub player_id: String,
    pub accepted: bool,
}

/// 玩家做决策时看到的比赛状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchView {
    pub match_id: String,
    pub game: String,
    pub player_id: String,
    pub opponent_id: String,
    pub seat: usize,
    /// 从 1 开始
    pub game_round: u32,
    pub game_rounds: u32,
    pub my_score: u32,
    pub opponent_score: u32,
    /// 对手历史落子（缺席为 null）
    #[serde(default)]
    pub opponent_moves: Vec<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveRequest {
    pub view: MatchView,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveResult {
    pub match_id: String,
    pub player_id: String,
    pub game_round: u32,
    pub value: serde_json::Value,
}

/// 比赛结局
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Win { winner: String },
    Draw,
    /// 未在期限内接受邀请；winner 为 None 表示双方均缺席
    Forfeit {
        winner: Option<String>,
        absent: Vec<String>,
    },
    Cancelled { reason: String },
}

/// 一场比赛的最终结果；上报一次后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchResult {
    pub match_id: String,
    pub player_a: String,
    pub player_b: String,
    pub outcome: MatchOutcome,
    /// player_id -> 赢下的小局数
    pub scores: BTreeMap<String, u32>,
    pub game_rounds_played: u32,
}

impl MatchResult {
    pub fn winner(&self) -> Option<&str> {
        match &self.outcome {
            MatchOutcome::Win { winner } => Some(winner),
            MatchOutcome::Forfeit { winner, .. } => winner.as_deref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Cancelled { .. })
    }

    pub fn involves(&self, player_id: &str) -> bool {
        self.player_a == player_id || self.player_b == player_id
    }

    /// 胜者与缺席者都必须是本场的两名选手
    pub fn names_only_its_players(&self) -> bool {
        match &self.outcome {
            MatchOutcome::Win { winner } => self.involves(winner),
            MatchOutcome::Forfeit { winner, absent } => {
                !absent.is_empty()
                    && absent.iter().all(|p| self.involves(p))
                    && winner.as_deref().map_or(true, |w| self.involves(w) && !absent.iter().any(|p| p == w))
            }
            MatchOutcome::Draw | MatchOutcome::Cancelled { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameEnd {
    pub result: MatchResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchResultReport {
    pub referee_id: String,
    pub round_id: u32,
    pub result: MatchResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StandingsUpdate {
    pub round_id: u32,
    pub standings: Vec<StandingRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ack {
    #[serde(default)]
    pub detail: Option<String>,
}

impl Ack {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub reason: String,
    #[serde(default)]
    pub retryable: bool,
}

/// 按消息类型校验 payload 结构
pub fn check_payload(
    message_type: MessageType,
    payload: &serde_json::Value,
) -> Result<(), ProtocolViolation> {
    fn parse<T: serde::de::DeserializeOwned>(
        message_type: MessageType,
        payload: &serde_json::Value,
    ) -> Result<(), ProtocolViolation> {
        serde_json::from_value::<T>(payload.clone())
            .map(|_| ())
            .map_err(|e| ProtocolViolation::InvalidPayload {
                message_type,
                reason: e.to_string(),
            })
    }

    match message_type {
        MessageType::RegisterRequest => parse::<RegisterRequest>(message_type, payload),
        MessageType::RegisterResponse => parse::<RegisterResponse>(message_type, payload),
        MessageType::MatchAssignment => parse::<MatchAssignment>(message_type, payload),
        MessageType::GameInvite => parse::<GameInvite>(message_type, payload),
        MessageType::GameJoinAck => parse::<GameJoinAck>(message_type, payload),
        MessageType::MoveRequest => parse::<MoveRequest>(message_type, payload),
        MessageType::MoveResult => parse::<MoveResult>(message_type, payload),
        MessageType::GameEnd => parse::<GameEnd>(message_type, payload),
        MessageType::MatchResult => parse::<MatchResultReport>(message_type, payload),
        MessageType::StandingsUpdate => parse::<StandingsUpdate>(message_type, payload),
        MessageType::Heartbeat => parse::<Heartbeat>(message_type, payload),
        MessageType::Ack => parse::<Ack>(message_type, payload),
        MessageType::Error => parse::<ErrorPayload>(message_type, payload),
    }
}
