//! League Manager 的入站协议处理：REGISTER_REQUEST / MATCH_RESULT / HEARTBEAT

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::manager::{LeagueManager, ReportOutcome};
use crate::core::error::{LeagueError, ProtocolViolation, RecoveryAction};
use crate::core::recovery::RecoveryEngine;
use crate::protocol::{
    Ack, AgentKind, ErrorCode, ErrorPayload, Heartbeat, MatchResultReport, MessageType,
    ProtocolMessage, RegisterRequest, RegisterResponse, Sender,
};
use crate::transport::MessageHandler;

pub struct LeagueService {
    manager: Arc<LeagueManager>,
    recovery: RecoveryEngine,
}

impl LeagueService {
    pub fn new(manager: Arc<LeagueManager>) -> Self {
        Self {
            manager,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn manager(&self) -> &Arc<LeagueManager> {
        &self.manager
    }

    async fn on_register(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, LeagueError> {
        let request: RegisterRequest = message.payload_as()?;
        if request.kind == AgentKind::LeagueManager || request.kind != message.sender().kind() {
            return Err(ProtocolViolation::InvalidField {
                field: "sender",
                reason: format!("sender {} cannot register as {}", message.sender(), request.kind),
            }
            .into());
        }
        let registered = self
            .manager
            .register(
                request.kind,
                &request.endpoint,
                request.display_name,
                request.capabilities,
            )
            .await?;
        Ok(message.reply(
            MessageType::RegisterResponse,
            Sender::LeagueManager,
            RegisterResponse {
                agent_id: registered.agent_id,
                deduplicated: registered.deduplicated,
            },
        ))
    }

    async fn on_match_result(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, LeagueError> {
        let report: MatchResultReport = message.payload_as()?;
        let Sender::Referee(referee_id) = message.sender() else {
            return Err(ProtocolViolation::InvalidField {
                field: "sender",
                reason: "match results must come from a referee".into(),
            }
            .into());
        };
        if referee_id != &report.referee_id || message.match_id() != Some(report.result.match_id.as_str()) {
            return Err(ProtocolViolation::InvalidField {
                field: "payload",
                reason: "report disagrees with envelope".into(),
            }
            .into());
        }
        let outcome = self
            .manager
            .report_match_result(Some(referee_id), report.result)
            .await?;
        let ack = match outcome {
            ReportOutcome::Recorded => Ack::default(),
            ReportOutcome::Duplicate => Ack::with_detail("duplicate"),
        };
        Ok(message.reply(MessageType::Ack, Sender::LeagueManager, ack))
    }

    async fn on_heartbeat(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, LeagueError> {
        let heartbeat: Heartbeat = message.payload_as()?;
        if message.sender().agent_id() != Some(heartbeat.agent_id.as_str()) {
            return Err(ProtocolViolation::InvalidField {
                field: "sender",
                reason: "heartbeat agent id disagrees with sender".into(),
            }
            .into());
        }
        self.manager.heartbeat(&heartbeat.agent_id).await?;
        Ok(message.reply(MessageType::Ack, Sender::LeagueManager, Ack::default()))
    }

    fn error_response(&self, message: &ProtocolMessage, err: &LeagueError) -> ProtocolMessage {
        let code = match self.recovery.handle(err) {
            RecoveryAction::RespondError(code) => code,
            _ => err.error_code(),
        };
        warn!(
            message_type = %message.message_type(),
            sender = %message.sender(),
            "Request rejected: {}", err
        );
        message.reply(
            MessageType::Error,
            Sender::LeagueManager,
            ErrorPayload {
                code,
                reason: err.to_string(),
                retryable: err.is_retryable(),
            },
        )
    }
}

#[async_trait]
impl MessageHandler for LeagueService {
    fn league_id(&self) -> String {
        self.manager.league_id().to_string()
    }

    fn sender(&self) -> Sender {
        Sender::LeagueManager
    }

    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
        debug!(message_type = %message.message_type(), sender = %message.sender(), "Inbound");
        if message.league_id() != self.manager.league_id() {
            return crate::transport::error_reply(
                &message,
                Sender::LeagueManager,
                ErrorCode::InvalidState,
                format!("unknown league '{}'", message.league_id()),
            );
        }
        let result = match message.message_type() {
            MessageType::RegisterRequest => self.on_register(&message).await,
            MessageType::MatchResult => self.on_match_result(&message).await,
            MessageType::Heartbeat => self.on_heartbeat(&message).await,
            other => {
                return crate::transport::error_reply(
                    &message,
                    Sender::LeagueManager,
                    ErrorCode::Unsupported,
                    format!("league manager does not accept {other}"),
                )
            }
        };
        result.unwrap_or_else(|e| self.error_response(&message, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BreakerConfig, ConnectionManager, RetryPolicy};
    use crate::events::EventBus;
    use crate::league::manager::LeagueSettings;
    use crate::league::standings::PointsTable;
    use crate::registry::{RegistryConfig, ServiceRegistry};
    use crate::transport::InMemoryTransport;
    use std::time::Duration;

    fn service(max_players: usize) -> LeagueService {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            heartbeat_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
        }));
        let connection = Arc::new(ConnectionManager::with_policy(
            Arc::new(InMemoryTransport::new()),
            RetryPolicy::none(),
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
            },
            Duration::from_secs(1),
        ));
        let settings = LeagueSettings {
            league_id: "league-1".into(),
            game: "parity".into(),
            max_players,
            max_referees: 2,
            points: PointsTable::default(),
        };
        LeagueService::new(Arc::new(LeagueManager::new(
            settings,
            registry,
            connection,
            EventBus::new(10),
        )))
    }

    fn register(endpoint: &str) -> ProtocolMessage {
        ProtocolMessage::new(
            MessageType::RegisterRequest,
            "league-1",
            Sender::Player("new".into()),
            RegisterRequest {
                kind: AgentKind::Player,
                endpoint: endpoint.into(),
                display_name: None,
                capabilities: vec!["parity".into()],
            },
        )
    }

    #[tokio::test]
    async fn test_register_request_round_trip() {
        let svc = service(4);
        let request = register("mem://p1");
        let reply = svc.handle(request.clone()).await;
        assert_eq!(reply.message_type(), MessageType::RegisterResponse);
        assert_eq!(reply.conversation_id(), request.conversation_id());
        let body: RegisterResponse = reply.payload_as().unwrap();
        assert_eq!(body.agent_id, "P01");
        assert!(!body.deduplicated);

        // 网络重试同一身份：去重，不重复计数
        let body: RegisterResponse = svc.handle(register("mem://p1")).await.payload_as().unwrap();
        assert!(body.deduplicated);
        assert_eq!(svc.manager().players().await.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_error_reply() {
        let svc = service(1);
        svc.handle(register("mem://p1")).await;
        let reply = svc.handle(register("mem://p2")).await;
        assert_eq!(reply.message_type(), MessageType::Error);
        let err: ErrorPayload = reply.payload_as().unwrap();
        assert_eq!(err.code, ErrorCode::RegistrationRejected);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_agent() {
        let svc = service(4);
        let hb = ProtocolMessage::new(
            MessageType::Heartbeat,
            "league-1",
            Sender::Player("P07".into()),
            Heartbeat {
                agent_id: "P07".into(),
            },
        );
        let err: ErrorPayload = svc.handle(hb).await.payload_as().unwrap();
        assert_eq!(err.code, ErrorCode::UnknownAgent);
    }

    #[tokio::test]
    async fn test_unsupported_message_type_and_foreign_league() {
        let svc = service(4);
        let standings = ProtocolMessage::new(
            MessageType::Ack,
            "league-1",
            Sender::Player("P01".into()),
            Ack::default(),
        );
        let err: ErrorPayload = svc.handle(standings).await.payload_as().unwrap();
        assert_eq!(err.code, ErrorCode::Unsupported);

        let foreign = ProtocolMessage::new(
            MessageType::Heartbeat,
            "league-2",
            Sender::Player("P01".into()),
            Heartbeat {
                agent_id: "P01".into(),
            },
        );
        let err: ErrorPayload = svc.handle(foreign).await.payload_as().unwrap();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_player_cannot_register_as_referee() {
        let svc = service(4);
        let msg = ProtocolMessage::new(
            MessageType::RegisterRequest,
            "league-1",
            Sender::Player("new".into()),
            RegisterRequest {
                kind: AgentKind::Referee,
                endpoint: "mem://r1".into(),
                display_name: None,
                capabilities: vec![],
            },
        );
        let err: ErrorPayload = svc.handle(msg).await.payload_as().unwrap();
        assert_eq!(err.code, ErrorCode::ProtocolViolation);
    }
}
