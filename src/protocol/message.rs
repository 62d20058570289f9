//! 协议信封：版本、消息类型、发送方与不可变的 ProtocolMessage

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::ProtocolViolation;

/// 唯一支持的协议版本字面量；其它任何值都直接拒绝
pub const PROTOCOL_VERSION: &str = "league.v1";

/// 消息类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    RegisterRequest,
    RegisterResponse,
    MatchAssignment,
    GameInvite,
    GameJoinAck,
    MoveRequest,
    MoveResult,
    GameEnd,
    MatchResult,
    StandingsUpdate,
    Heartbeat,
    Ack,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::RegisterRequest,
        MessageType::RegisterResponse,
        MessageType::MatchAssignment,
        MessageType::GameInvite,
        MessageType::GameJoinAck,
        MessageType::MoveRequest,
        MessageType::MoveResult,
        MessageType::GameEnd,
        MessageType::MatchResult,
        MessageType::StandingsUpdate,
        MessageType::Heartbeat,
        MessageType::Ack,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RegisterRequest => "REGISTER_REQUEST",
            MessageType::RegisterResponse => "REGISTER_RESPONSE",
            MessageType::MatchAssignment => "MATCH_ASSIGNMENT",
            MessageType::GameInvite => "GAME_INVITE",
            MessageType::GameJoinAck => "GAME_JOIN_ACK",
            MessageType::MoveRequest => "MOVE_REQUEST",
            MessageType::MoveResult => "MOVE_RESULT",
            MessageType::GameEnd => "GAME_END",
            MessageType::MatchResult => "MATCH_RESULT",
            MessageType::StandingsUpdate => "STANDINGS_UPDATE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
        }
    }

    /// 属于某场比赛的消息必须携带 match_id 与 round_id
    pub fn requires_match(&self) -> bool {
        matches!(
            self,
            MessageType::MatchAssignment
                | MessageType::GameInvite
                | MessageType::GameJoinAck
                | MessageType::MoveRequest
                | MessageType::MoveResult
                | MessageType::GameEnd
                | MessageType::MatchResult
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolViolation::UnknownMessageType(s.to_string()))
    }
}

/// Agent 类型（注册记录 / 服务记录共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    LeagueManager,
    Referee,
    Player,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::LeagueManager => write!(f, "league_manager"),
            AgentKind::Referee => write!(f, "referee"),
            AgentKind::Player => write!(f, "player"),
        }
    }
}

/// 发送方身份：`league_manager` | `referee:<id>` | `player:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sender {
    LeagueManager,
    Referee(String),
    Player(String),
}

impl Sender {
    pub fn kind(&self) -> AgentKind {
        match self {
            Sender::LeagueManager => AgentKind::LeagueManager,
            Sender::Referee(_) => AgentKind::Referee,
            Sender::Player(_) => AgentKind::Player,
        }
    }

    /// Referee / Player 的 id；League Manager 没有 id
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Sender::LeagueManager => None,
            Sender::Referee(id) | Sender::Player(id) => Some(id),
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::LeagueManager => write!(f, "league_manager"),
            Sender::Referee(id) => write!(f, "referee:{id}"),
            Sender::Player(id) => write!(f, "player:{id}"),
        }
    }
}

impl FromStr for Sender {
    type Err = ProtocolViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ProtocolViolation::InvalidField {
            field: "sender",
            reason: format!("{reason}: '{s}'"),
        };
        if s == "league_manager" {
            return Ok(Sender::LeagueManager);
        }
        let (prefix, id) = s.split_once(':').ok_or_else(|| invalid("unknown sender"))?;
        if id.is_empty() {
            return Err(invalid("empty agent id"));
        }
        match prefix {
            "referee" => Ok(Sender::Referee(id.to_string())),
            "player" => Ok(Sender::Player(id.to_string())),
            _ => Err(invalid("unknown sender kind")),
        }
    }
}

impl TryFrom<String> for Sender {
    type Error = ProtocolViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Sender> for String {
    fn from(value: Sender) -> Self {
        value.to_string()
    }
}

/// 协议信封。构造后不可变：字段私有，只读访问。
///
/// 只实现 Serialize：入站消息必须经过 `codec::decode` 逐字段校验。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolMessage {
    protocol_version: String,
    message_type: MessageType,
    league_id: String,
    round_id: Option<u32>,
    match_id: Option<String>,
    conversation_id: Uuid,
    sender: Sender,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}

impl ProtocolMessage {
    /// 新建消息：新的 conversation_id、当前时间戳
    pub fn new(
        message_type: MessageType,
        league_id: impl Into<String>,
        sender: Sender,
        payload: impl Serialize,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_type,
            league_id: league_id.into(),
            round_id: None,
            match_id: None,
            conversation_id: Uuid::new_v4(),
            sender,
            timestamp: Utc::now(),
            payload: to_payload(payload),
        }
    }

    /// 解码器使用：所有字段已逐一校验
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        protocol_version: String,
        message_type: MessageType,
        league_id: String,
        round_id: Option<u32>,
        match_id: Option<String>,
        conversation_id: Uuid,
        sender: Sender,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol_version,
            message_type,
            league_id,
            round_id,
            match_id,
            conversation_id,
            sender,
            timestamp,
            payload,
        }
    }

    pub fn with_round(mut self, round_id: u32) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn with_match(mut self, match_id: impl Into<String>) -> Self {
        self.match_id = Some(match_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// 构造回复：沿用请求的 conversation_id / league_id / round_id / match_id
    pub fn reply(&self, message_type: MessageType, sender: Sender, payload: impl Serialize) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_type,
            league_id: self.league_id.clone(),
            round_id: self.round_id,
            match_id: self.match_id.clone(),
            conversation_id: self.conversation_id,
            sender,
            timestamp: Utc::now(),
            payload: to_payload(payload),
        }
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn league_id(&self) -> &str {
        &self.league_id
    }

    pub fn round_id(&self) -> Option<u32> {
        self.round_id
    }

    pub fn match_id(&self) -> Option<&str> {
        self.match_id.as_deref()
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// 将 payload 解析为具体类型；不做任何宽松转换
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolViolation> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolViolation::InvalidPayload {
            message_type: self.message_type,
            reason: e.to_string(),
        })
    }
}

fn to_payload(payload: impl Serialize) -> serde_json::Value {
    // 本地结构体序列化为 JSON 不会失败；失败时退化为空对象，会在校验阶段被拒绝
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip_names() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, serde_json::Value::String(t.as_str().to_string()));
        }
        assert!("MOVE".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_sender_parse() {
        assert_eq!("league_manager".parse::<Sender>().unwrap(), Sender::LeagueManager);
        assert_eq!(
            "referee:R01".parse::<Sender>().unwrap(),
            Sender::Referee("R01".into())
        );
        assert_eq!("player:P03".parse::<Sender>().unwrap().agent_id(), Some("P03"));
        assert!("player:".parse::<Sender>().is_err());
        assert!("spectator:x".parse::<Sender>().is_err());
        assert!("referee".parse::<Sender>().is_err());
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let req = ProtocolMessage::new(
            MessageType::GameInvite,
            "league-1",
            Sender::Referee("R01".into()),
            serde_json::json!({}),
        )
        .with_round(2)
        .with_match("R2M1");
        let resp = req.reply(
            MessageType::GameJoinAck,
            Sender::Player("P01".into()),
            serde_json::json!({}),
        );
        assert_eq!(resp.conversation_id(), req.conversation_id());
        assert_eq!(resp.match_id(), Some("R2M1"));
        assert_eq!(resp.round_id(), Some(2));
        assert_eq!(resp.protocol_version(), PROTOCOL_VERSION);
    }
}
