//! Agent 侧注册握手：向 League Manager 发送 REGISTER_REQUEST

use crate::connection::ConnectionManager;
use crate::core::error::LeagueError;
use crate::protocol::{
    AgentKind, MessageType, ProtocolMessage, RegisterRequest, RegisterResponse, Sender,
};

/// 注册请求参数
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub league_id: String,
    pub kind: AgentKind,
    pub endpoint: String,
    pub display_name: Option<String>,
    pub capabilities: Vec<String>,
}

/// 注册并返回 League Manager 分配的 id
///
/// 注册前还没有 id，发送方使用 display_name（缺省为 `unregistered`）。
pub async fn register_with_league(
    connection: &ConnectionManager,
    league_endpoint: &str,
    enrollment: Enrollment,
) -> Result<RegisterResponse, LeagueError> {
    let provisional = enrollment
        .display_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unregistered".to_string());
    let sender = match enrollment.kind {
        AgentKind::Referee => Sender::Referee(provisional),
        _ => Sender::Player(provisional),
    };
    let request = ProtocolMessage::new(
        MessageType::RegisterRequest,
        enrollment.league_id,
        sender,
        RegisterRequest {
            kind: enrollment.kind,
            endpoint: enrollment.endpoint,
            display_name: enrollment.display_name,
            capabilities: enrollment.capabilities,
        },
    );
    let response = connection
        .call_expecting(league_endpoint, &request, MessageType::RegisterResponse)
        .await?;
    Ok(response.payload_as()?)
}
