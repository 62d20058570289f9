//! 传输层：点对点请求/响应
//!
//! - `Transport`：出站，发送编码后的字节并取回响应字节（HTTP POST 为参考实现）
//! - `MessageHandler`：入站，每个 Agent 实现一个；`dispatch` 负责解码校验与 ERROR 回复

mod http;
mod memory;

use async_trait::async_trait;
use tracing::warn;

use crate::core::error::TransportError;
use crate::protocol::{
    decode, encode, ErrorCode, ErrorPayload, MessageType, ProtocolMessage, Sender,
};

pub use http::HttpTransport;
#[cfg(feature = "http-server")]
pub use http::{serve, LEAGUE_PATH};
pub use memory::InMemoryTransport;

/// 出站传输
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// 入站消息处理器：每个 Agent 一个
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 回复 ERROR 时使用的联赛 id
    fn league_id(&self) -> String;

    /// 本 Agent 的发送方身份
    fn sender(&self) -> Sender;

    /// 处理一条已通过结构校验的消息，返回响应
    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage;
}

/// 服务端入口：解码 + 校验，违规时回复 PROTOCOL_VIOLATION，不交给 handler
pub async fn dispatch(handler: &dyn MessageHandler, body: &[u8]) -> Vec<u8> {
    let response = match decode(body) {
        Ok(message) => handler.handle(message).await,
        Err(violation) => {
            warn!(sender = %handler.sender(), "Rejected inbound message: {}", violation);
            ProtocolMessage::new(
                MessageType::Error,
                handler.league_id(),
                handler.sender(),
                ErrorPayload {
                    code: ErrorCode::ProtocolViolation,
                    reason: violation.to_string(),
                    retryable: false,
                },
            )
        }
    };
    encode(&response)
}

/// 针对某条请求构造 ERROR 回复
pub fn error_reply(
    request: &ProtocolMessage,
    sender: Sender,
    code: ErrorCode,
    reason: impl Into<String>,
) -> ProtocolMessage {
    request.reply(
        MessageType::Error,
        sender,
        ErrorPayload {
            code,
            reason: reason.into(),
            retryable: false,
        },
    )
}
