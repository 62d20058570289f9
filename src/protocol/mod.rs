//! 协议层：版本化信封、消息类型、payload 与编解码校验
//!
//! 这是一份约束性契约：任何字段缺失、版本不符或 payload 不合规的消息都以 ProtocolViolation 拒绝，
//! 需要回复的场景回复 ERROR，绝不做"尽力而为"的解析。

pub mod codec;
pub mod message;
pub mod payload;

pub use crate::core::error::ProtocolViolation;
pub use codec::{decode, encode, validate, Validator};
pub use message::{AgentKind, MessageType, ProtocolMessage, Sender, PROTOCOL_VERSION};
pub use payload::{
    Ack, ErrorCode, ErrorPayload, GameEnd, GameInvite, GameJoinAck, Heartbeat, MatchAssignment,
    MatchOutcome, MatchResult, MatchResultReport, MatchView, MoveRequest, MoveResult, Participant,
    RegisterRequest, RegisterResponse, StandingsUpdate,
};
