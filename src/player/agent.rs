//! 玩家 Agent：接受邀请、按策略落子、接收比赛结果与积分榜

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::Strategy;
use crate::connection::ConnectionManager;
use crate::core::error::LeagueError;
use crate::protocol::{
    Ack, AgentKind, ErrorCode, ErrorPayload, GameEnd, GameInvite, GameJoinAck, MatchResult,
    MatchView, MessageType, MoveRequest, MoveResult, ProtocolMessage, Sender, StandingsUpdate,
};
use crate::registry::{register_with_league, spawn_heartbeat, Enrollment};
use crate::transport::{error_reply, MessageHandler};

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub league_id: String,
    /// 本 Agent 对外可达的 endpoint
    pub endpoint: String,
    pub display_name: Option<String>,
    /// 支持的游戏
    pub games: Vec<String>,
}

pub struct PlayerAgent {
    settings: PlayerSettings,
    strategy: Arc<dyn Strategy>,
    connection: Arc<ConnectionManager>,
    agent_id: RwLock<Option<String>>,
    responsive: AtomicBool,
    /// 在这些联赛轮次中不回应邀请与落子请求
    silent_rounds: Mutex<HashSet<u32>>,
    /// match_id -> 最近一次落子请求看到的状态（用于非法落子后重新提交）
    views: Mutex<HashMap<String, MatchView>>,
    results: Mutex<Vec<MatchResult>>,
    standings: Mutex<Option<StandingsUpdate>>,
}

impl PlayerAgent {
    pub fn new(settings: PlayerSettings, strategy: Arc<dyn Strategy>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            settings,
            strategy,
            connection,
            agent_id: RwLock::new(None),
            responsive: AtomicBool::new(true),
            silent_rounds: Mutex::new(HashSet::new()),
            views: Mutex::new(HashMap::new()),
            results: Mutex::new(Vec::new()),
            standings: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> Option<String> {
        self.agent_id.read().ok().and_then(|id| id.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// 整体不回应（模拟失联）
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    /// 在指定联赛轮次中不回应
    pub fn silence_round(&self, round: u32) {
        if let Ok(mut rounds) = self.silent_rounds.lock() {
            rounds.insert(round);
        }
    }

    /// 收到的 GAME_END 结果
    pub fn results(&self) -> Vec<MatchResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 最近一次 STANDINGS_UPDATE
    pub fn last_standings(&self) -> Option<StandingsUpdate> {
        self.standings.lock().ok().and_then(|s| s.clone())
    }

    /// 向 League Manager 注册，返回分配的 player id
    pub async fn register(&self, league_endpoint: &str) -> Result<String, LeagueError> {
        let response = register_with_league(
            &self.connection,
            league_endpoint,
            Enrollment {
                league_id: self.settings.league_id.clone(),
                kind: AgentKind::Player,
                endpoint: self.settings.endpoint.clone(),
                display_name: self.settings.display_name.clone(),
                capabilities: self.settings.games.clone(),
            },
        )
        .await?;
        if let Ok(mut id) = self.agent_id.write() {
            *id = Some(response.agent_id.clone());
        }
        info!(
            player_id = %response.agent_id,
            deduplicated = response.deduplicated,
            strategy = self.strategy.name(),
            "Player registered"
        );
        Ok(response.agent_id)
    }

    /// 注册之后才能发心跳
    pub fn spawn_heartbeat(
        &self,
        league_endpoint: &str,
        interval: Duration,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let id = self.agent_id()?;
        Some(spawn_heartbeat(
            Arc::clone(&self.connection),
            league_endpoint.to_string(),
            self.settings.league_id.clone(),
            Sender::Player(id),
            interval,
            token,
        ))
    }

    fn is_silent(&self, message: &ProtocolMessage) -> bool {
        if !self.responsive.load(Ordering::SeqCst) {
            return true;
        }
        message.round_id().is_some_and(|round| {
            self.silent_rounds
                .lock()
                .map(|rounds| rounds.contains(&round))
                .unwrap_or(false)
        })
    }

    fn move_reply(&self, request: &ProtocolMessage, view: &MatchView) -> ProtocolMessage {
        let value = self.strategy.decide(view);
        debug!(match_id = %view.match_id, game_round = view.game_round, value = %value, "Move decided");
        request.reply(
            MessageType::MoveResult,
            self.sender(),
            MoveResult {
                match_id: view.match_id.clone(),
                player_id: view.player_id.clone(),
                game_round: view.game_round,
                value,
            },
        )
    }

    fn on_invite(&self, message: &ProtocolMessage) -> ProtocolMessage {
        let invite: GameInvite = match message.payload_as() {
            Ok(invite) => invite,
            Err(e) => return error_reply(message, self.sender(), ErrorCode::ProtocolViolation, e.to_string()),
        };
        let accepted = self.settings.games.is_empty() || self.settings.games.contains(&invite.game);
        if !accepted {
            warn!(match_id = %invite.match_id, game = %invite.game, "Declining invite for unsupported game");
        }
        message.reply(
            MessageType::GameJoinAck,
            self.sender(),
            GameJoinAck {
                match_id: invite.match_id,
                player_id: invite.player_id,
                accepted,
            },
        )
    }

    fn on_move_request(&self, message: &ProtocolMessage) -> ProtocolMessage {
        let request: MoveRequest = match message.payload_as() {
            Ok(request) => request,
            Err(e) => return error_reply(message, self.sender(), ErrorCode::ProtocolViolation, e.to_string()),
        };
        let reply = self.move_reply(message, &request.view);
        if let Ok(mut views) = self.views.lock() {
            views.insert(request.view.match_id.clone(), request.view);
        }
        reply
    }

    /// 裁判以 ERROR INVALID_MOVE 拒绝落子：基于同一状态重新决策
    fn on_error(&self, message: &ProtocolMessage) -> ProtocolMessage {
        let payload: Option<ErrorPayload> = message.payload_as().ok();
        let view = message
            .match_id()
            .and_then(|id| self.views.lock().ok().and_then(|views| views.get(id).cloned()));
        match (payload, view) {
            (Some(err), Some(view)) if err.code == ErrorCode::InvalidMove => {
                warn!(match_id = %view.match_id, reason = %err.reason, "Move rejected, resubmitting");
                self.move_reply(message, &view)
            }
            (Some(err), _) => {
                debug!(code = ?err.code, reason = %err.reason, "Error notification");
                message.reply(MessageType::Ack, self.sender(), Ack::default())
            }
            (None, _) => error_reply(message, self.sender(), ErrorCode::ProtocolViolation, "malformed error payload"),
        }
    }

    fn on_game_end(&self, message: &ProtocolMessage) -> ProtocolMessage {
        match message.payload_as::<GameEnd>() {
            Ok(end) => {
                info!(match_id = %end.result.match_id, outcome = ?end.result.outcome, "Match ended");
                if let Ok(mut views) = self.views.lock() {
                    views.remove(&end.result.match_id);
                }
                if let Ok(mut results) = self.results.lock() {
                    results.push(end.result);
                }
                message.reply(MessageType::Ack, self.sender(), Ack::default())
            }
            Err(e) => error_reply(message, self.sender(), ErrorCode::ProtocolViolation, e.to_string()),
        }
    }

    fn on_standings(&self, message: &ProtocolMessage) -> ProtocolMessage {
        match message.payload_as::<StandingsUpdate>() {
            Ok(update) => {
                debug!(round = update.round_id, "Standings received");
                if let Ok(mut standings) = self.standings.lock() {
                    *standings = Some(update);
                }
                message.reply(MessageType::Ack, self.sender(), Ack::default())
            }
            Err(e) => error_reply(message, self.sender(), ErrorCode::ProtocolViolation, e.to_string()),
        }
    }
}

#[async_trait]
impl MessageHandler for PlayerAgent {
    fn league_id(&self) -> String {
        self.settings.league_id.clone()
    }

    fn sender(&self) -> Sender {
        Sender::Player(self.agent_id().unwrap_or_else(|| "unregistered".to_string()))
    }

    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
        match message.message_type() {
            MessageType::GameInvite | MessageType::MoveRequest if self.is_silent(&message) => {
                debug!(message_type = %message.message_type(), "Staying silent");
                // 不回应：由对端的期限处理
                std::future::pending::<ProtocolMessage>().await
            }
            MessageType::GameInvite => self.on_invite(&message),
            MessageType::MoveRequest => self.on_move_request(&message),
            MessageType::Error => self.on_error(&message),
            MessageType::GameEnd => self.on_game_end(&message),
            MessageType::StandingsUpdate => self.on_standings(&message),
            other => error_reply(
                &message,
                self.sender(),
                ErrorCode::Unsupported,
                format!("player does not accept {other}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BreakerConfig, RetryPolicy};
    use crate::player::strategy::FixedStrategy;
    use crate::transport::InMemoryTransport;

    fn player(games: Vec<String>) -> PlayerAgent {
        let connection = Arc::new(ConnectionManager::with_policy(
            Arc::new(InMemoryTransport::new()),
            RetryPolicy::none(),
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
            },
            Duration::from_secs(1),
        ));
        PlayerAgent::new(
            PlayerSettings {
                league_id: "league-1".into(),
                endpoint: "mem://p1".into(),
                display_name: Some("alice".into()),
                games,
            },
            Arc::new(FixedStrategy::new(4)),
            connection,
        )
    }

    fn invite(game: &str) -> ProtocolMessage {
        ProtocolMessage::new(
            MessageType::GameInvite,
            "league-1",
            Sender::Referee("REF01".into()),
            GameInvite {
                match_id: "R1M1".into(),
                game: game.into(),
                player_id: "P01".into(),
                opponent_id: "P02".into(),
                seat: 0,
                game_rounds: 3,
                reply_deadline_ms: 1000,
            },
        )
        .with_round(1)
        .with_match("R1M1")
    }

    fn move_request() -> ProtocolMessage {
        ProtocolMessage::new(
            MessageType::MoveRequest,
            "league-1",
            Sender::Referee("REF01".into()),
            MoveRequest {
                view: MatchView {
                    match_id: "R1M1".into(),
                    game: "parity".into(),
                    player_id: "P01".into(),
                    opponent_id: "P02".into(),
                    seat: 0,
                    game_round: 2,
                    game_rounds: 3,
                    my_score: 1,
                    opponent_score: 0,
                    opponent_moves: vec![Some(serde_json::json!(3))],
                },
                deadline_ms: 1000,
            },
        )
        .with_round(1)
        .with_match("R1M1")
    }

    #[tokio::test]
    async fn test_accepts_supported_game_only() {
        let p = player(vec!["parity".into()]);
        let ack: GameJoinAck = p.handle(invite("parity")).await.payload_as().unwrap();
        assert!(ack.accepted);
        let ack: GameJoinAck = p.handle(invite("chess")).await.payload_as().unwrap();
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn test_move_request_answered_with_strategy() {
        let p = player(vec![]);
        let reply = p.handle(move_request()).await;
        assert_eq!(reply.message_type(), MessageType::MoveResult);
        let mv: MoveResult = reply.payload_as().unwrap();
        assert_eq!((mv.game_round, mv.value), (2, serde_json::json!(4)));
    }

    #[tokio::test]
    async fn test_invalid_move_error_triggers_resubmission() {
        let p = player(vec![]);
        p.handle(move_request()).await;
        let rejection = error_reply(
            &move_request(),
            Sender::Referee("REF01".into()),
            ErrorCode::InvalidMove,
            "out of range",
        );
        let reply = p.handle(rejection).await;
        assert_eq!(reply.message_type(), MessageType::MoveResult);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_round_never_answers() {
        let p = player(vec![]);
        p.silence_round(1);
        let outcome = tokio::time::timeout(Duration::from_secs(5), p.handle(invite("parity"))).await;
        assert!(outcome.is_err());

        let round2 = invite("parity").with_round(2);
        assert!(tokio::time::timeout(Duration::from_secs(5), p.handle(round2)).await.is_ok());
    }
}
