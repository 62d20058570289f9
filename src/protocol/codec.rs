//! 编解码与校验
//!
//! 解码按固定顺序逐字段检查，返回第一个失败原因：
//! 1. protocol_version 必须与 [`PROTOCOL_VERSION`] 完全相等
//! 2. 信封字段齐全且类型正确（round_id / match_id 允许为 null 但不能缺失）
//! 3. message_type 属于封闭枚举
//! 4. payload 结构校验；若注入了 Game，MOVE_RESULT 的落子交给 `Game::validate`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::message::{MessageType, ProtocolMessage, Sender, PROTOCOL_VERSION};
use super::payload::{check_payload, MoveResult};
use crate::core::error::ProtocolViolation;
use crate::game::Game;

/// 序列化为线上字节
pub fn encode(message: &ProtocolMessage) -> Vec<u8> {
    // ProtocolMessage 的所有字段都可序列化，不会失败
    serde_json::to_vec(message).unwrap_or_default()
}

/// 从字节解码并完成结构校验（不含游戏相关校验）
pub fn decode(bytes: &[u8]) -> Result<ProtocolMessage, ProtocolViolation> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolViolation::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolViolation::Malformed("envelope is not a JSON object".into()))?;

    let version = required_str(obj, "protocol_version")?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolViolation::UnsupportedVersion {
            found: version.to_string(),
        });
    }

    let message_type: MessageType = required_str(obj, "message_type")?.parse()?;

    let league_id = required_str(obj, "league_id")?;
    if league_id.is_empty() {
        return Err(invalid("league_id", "must not be empty"));
    }

    let round_id = match required(obj, "round_id")? {
        Value::Null => None,
        Value::Number(n) => {
            let n = n
                .as_u64()
                .ok_or_else(|| invalid("round_id", "must be a non-negative integer"))?;
            Some(u32::try_from(n).map_err(|_| invalid("round_id", "out of range"))?)
        }
        _ => return Err(invalid("round_id", "must be an integer or null")),
    };

    let match_id = match required(obj, "match_id")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        _ => return Err(invalid("match_id", "must be a string or null")),
    };

    let conversation_id = Uuid::parse_str(required_str(obj, "conversation_id")?)
        .map_err(|e| invalid("conversation_id", &e.to_string()))?;

    let sender: Sender = required_str(obj, "sender")?.parse()?;

    let timestamp = DateTime::parse_from_rfc3339(required_str(obj, "timestamp")?)
        .map_err(|e| invalid("timestamp", &e.to_string()))?
        .with_timezone(&Utc);

    let payload = required(obj, "payload")?;
    if !payload.is_object() {
        return Err(invalid("payload", "must be a JSON object"));
    }

    let message = ProtocolMessage::from_parts(
        version.to_string(),
        message_type,
        league_id.to_string(),
        round_id,
        match_id,
        conversation_id,
        sender,
        timestamp,
        payload.clone(),
    );
    Validator::new().validate(&message)?;
    Ok(message)
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, ProtocolViolation> {
    obj.get(field).ok_or(ProtocolViolation::MissingField(field))
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ProtocolViolation> {
    required(obj, field)?
        .as_str()
        .ok_or_else(|| invalid(field, "must be a string"))
}

fn invalid(field: &'static str, reason: &str) -> ProtocolViolation {
    ProtocolViolation::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

/// 消息校验器；可注入 Game 以检查落子合法性
#[derive(Clone, Default)]
pub struct Validator {
    game: Option<Arc<dyn Game>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_game(game: Arc<dyn Game>) -> Self {
        Self { game: Some(game) }
    }

    /// 校验一条已构造的消息；任何一条规则失败都不得继续处理该消息
    pub fn validate(&self, message: &ProtocolMessage) -> Result<(), ProtocolViolation> {
        if message.protocol_version() != PROTOCOL_VERSION {
            return Err(ProtocolViolation::UnsupportedVersion {
                found: message.protocol_version().to_string(),
            });
        }
        if message.league_id().is_empty() {
            return Err(invalid("league_id", "must not be empty"));
        }
        let message_type = message.message_type();
        if message_type.requires_match() {
            if message.match_id().is_none() {
                return Err(invalid("match_id", &format!("required for {message_type}")));
            }
            if message.round_id().is_none() {
                return Err(invalid("round_id", &format!("required for {message_type}")));
            }
        }
        check_payload(message_type, message.payload())?;

        if let (MessageType::MoveResult, Some(game)) = (message_type, &self.game) {
            let mv: MoveResult = message.payload_as()?;
            if Some(mv.match_id.as_str()) != message.match_id() {
                return Err(invalid("match_id", "payload and envelope disagree"));
            }
            if !game.validate(&mv.value) {
                return Err(ProtocolViolation::IllegalMove(format!(
                    "{} is not a legal {} move",
                    mv.value,
                    game.name()
                )));
            }
        }
        Ok(())
    }
}

/// 便捷函数：不带游戏规则的校验
pub fn validate(message: &ProtocolMessage) -> Result<(), ProtocolViolation> {
    Validator::new().validate(message)
}
