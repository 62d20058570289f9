//! 裁判 Agent：接受比赛分配，每场比赛一个任务，上报结果并保留审计记录

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::inbox::{MoveInbox, PushRejection};
use super::runner::{MatchContext, MatchRunner};
use super::state::MatchState;
use crate::config::RefereeSection;
use crate::connection::ConnectionManager;
use crate::core::error::{LeagueError, RecoveryAction};
use crate::core::recovery::RecoveryEngine;
use crate::events::EventBus;
use crate::game::GameRegistry;
use crate::protocol::{
    Ack, AgentKind, ErrorCode, ErrorPayload, GameEnd, MatchAssignment, MatchResult, MatchResultReport,
    MessageType, MoveResult, ProtocolMessage, Sender,
};
use crate::registry::{register_with_league, spawn_heartbeat, Enrollment};
use crate::transport::{error_reply, MessageHandler};

#[derive(Debug, Clone)]
pub struct RefereeSettings {
    pub league_id: String,
    pub endpoint: String,
    pub display_name: Option<String>,
    pub game_rounds: u32,
    pub invite_timeout: Duration,
    pub move_timeout: Duration,
}

impl RefereeSettings {
    pub fn from_config(league_id: &str, endpoint: &str, cfg: &RefereeSection) -> Self {
        Self {
            league_id: league_id.to_string(),
            endpoint: endpoint.to_string(),
            display_name: None,
            game_rounds: cfg.rounds_per_match,
            invite_timeout: cfg.invite_timeout(),
            move_timeout: cfg.move_timeout(),
        }
    }
}

struct ActiveMatch {
    token: CancellationToken,
    state: watch::Receiver<MatchState>,
    handle: Option<JoinHandle<()>>,
}

/// 上报失败、等待对账的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReport {
    pub round_id: u32,
    pub result: MatchResult,
}

pub struct RefereeAgent {
    me: Weak<RefereeAgent>,
    settings: RefereeSettings,
    games: GameRegistry,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    recovery: RecoveryEngine,
    inbox: Arc<MoveInbox>,
    referee_id: RwLock<Option<String>>,
    league_endpoint: RwLock<Option<String>>,
    active: Mutex<HashMap<String, ActiveMatch>>,
    /// 终止后的比赛：只读审计
    finished: Mutex<HashMap<String, (MatchState, MatchResult)>>,
    pending_reports: Mutex<Vec<PendingReport>>,
    token: CancellationToken,
}

impl RefereeAgent {
    pub fn new(
        settings: RefereeSettings,
        games: GameRegistry,
        connection: Arc<ConnectionManager>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            games,
            connection,
            events,
            recovery: RecoveryEngine::new(),
            inbox: Arc::new(MoveInbox::new()),
            referee_id: RwLock::new(None),
            league_endpoint: RwLock::new(None),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            pending_reports: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        })
    }

    pub fn referee_id(&self) -> Option<String> {
        self.referee_id.read().ok().and_then(|id| id.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// 注册到 League Manager，并记住上报地址
    pub async fn register(&self, league_endpoint: &str) -> Result<String, LeagueError> {
        let response = register_with_league(
            &self.connection,
            league_endpoint,
            Enrollment {
                league_id: self.settings.league_id.clone(),
                kind: AgentKind::Referee,
                endpoint: self.settings.endpoint.clone(),
                display_name: self.settings.display_name.clone(),
                capabilities: self.games.names(),
            },
        )
        .await?;
        if let Ok(mut id) = self.referee_id.write() {
            *id = Some(response.agent_id.clone());
        }
        self.set_league_endpoint(league_endpoint);
        info!(referee_id = %response.agent_id, deduplicated = response.deduplicated, "Referee registered");
        Ok(response.agent_id)
    }

    pub fn set_league_endpoint(&self, league_endpoint: &str) {
        if let Ok(mut endpoint) = self.league_endpoint.write() {
            *endpoint = Some(league_endpoint.to_string());
        }
    }

    pub fn spawn_heartbeat(&self, interval: Duration, token: CancellationToken) -> Option<JoinHandle<()>> {
        let id = self.referee_id()?;
        let league_endpoint = self.league_endpoint.read().ok().and_then(|e| e.clone())?;
        Some(spawn_heartbeat(
            Arc::clone(&self.connection),
            league_endpoint,
            self.settings.league_id.clone(),
            Sender::Referee(id),
            interval,
            token,
        ))
    }

    /// 某场比赛当前（或最终）状态
    pub fn match_state(&self, match_id: &str) -> Option<MatchState> {
        if let Some(state) = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(match_id).map(|m| *m.state.borrow()))
        {
            return Some(state);
        }
        self.finished
            .lock()
            .ok()
            .and_then(|finished| finished.get(match_id).map(|(state, _)| *state))
    }

    /// 已终止比赛的结果（审计用，不再变化）
    pub fn finished_result(&self, match_id: &str) -> Option<MatchResult> {
        self.finished
            .lock()
            .ok()
            .and_then(|finished| finished.get(match_id).map(|(_, result)| result.clone()))
    }

    pub fn active_matches(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn pending_reconciliation(&self) -> Vec<PendingReport> {
        self.pending_reports.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// 取消一场比赛并等待任务（含上报）结束
    ///
    /// 返回比赛是否最终落在 MATCH_CANCELLED；已经决出结果的比赛不受影响，返回 false。
    pub async fn cancel_match(&self, match_id: &str) -> bool {
        let entry = self.active.lock().ok().and_then(|mut active| active.remove(match_id));
        let Some(mut entry) = entry else {
            return false;
        };
        info!(match_id, "Cancelling match");
        entry.token.cancel();
        if let Some(handle) = entry.handle.take() {
            if let Err(e) = handle.await {
                error!(match_id, "Match task failed: {}", e);
            }
        }
        self.match_state(match_id) == Some(MatchState::MatchCancelled)
    }

    /// 取消全部进行中的比赛并等待任务退出
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .active
            .lock()
            .map(|mut active| active.drain().filter_map(|(_, mut m)| m.handle.take()).collect())
            .unwrap_or_default();
        join_all(handles).await;
    }

    /// 重新上报待对账的结果，返回成功数
    pub async fn reconcile(&self) -> usize {
        let pending = self
            .pending_reports
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default();
        let mut delivered = 0;
        for report in pending {
            if self.report(report.round_id, report.result).await {
                delivered += 1;
            }
        }
        delivered
    }

    fn on_assignment(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, LeagueError> {
        let assignment: MatchAssignment = message.payload_as()?;
        let game = self.games.resolve(&assignment.game)?;
        if assignment.player_a.player_id == assignment.player_b.player_id {
            return Err(LeagueError::InvalidState(format!(
                "match {} pairs a player with itself",
                assignment.match_id
            )));
        }
        let Some(me) = self.me.upgrade() else {
            return Err(LeagueError::InvalidState("referee is shutting down".into()));
        };

        let mut active = self
            .active
            .lock()
            .map_err(|_| LeagueError::InvalidState("referee state poisoned".into()))?;
        let already_known = active.contains_key(&assignment.match_id)
            || self
                .finished
                .lock()
                .map(|f| f.contains_key(&assignment.match_id))
                .unwrap_or(false);
        if already_known {
            debug!(match_id = %assignment.match_id, "Assignment already accepted");
            return Ok(message.reply(MessageType::Ack, self.sender(), Ack::with_detail("already assigned")));
        }

        let ctx_endpoints = [
            assignment.player_a.endpoint.clone(),
            assignment.player_b.endpoint.clone(),
        ];
        let token = self.token.child_token();
        let (state_tx, state_rx) = watch::channel(MatchState::Created);
        let ctx = MatchContext {
            league_id: self.settings.league_id.clone(),
            referee: self.sender(),
            round_id: assignment.round_id,
            match_id: assignment.match_id.clone(),
            game,
            players: [assignment.player_a, assignment.player_b],
            game_rounds: self.settings.game_rounds,
            invite_timeout: self.settings.invite_timeout,
            move_timeout: self.settings.move_timeout,
        };
        let runner = MatchRunner::new(
            ctx,
            Arc::clone(&self.connection),
            self.events.clone(),
            Arc::clone(&self.inbox),
            state_tx,
            token.clone(),
        );
        let round_id = assignment.round_id;
        let endpoints = ctx_endpoints.to_vec();
        let handle = tokio::spawn(async move {
            let (result, state) = runner.run().await;
            me.finish_match(round_id, endpoints, result, state).await;
        });
        active.insert(
            assignment.match_id.clone(),
            ActiveMatch {
                token,
                state: state_rx,
                handle: Some(handle),
            },
        );
        info!(match_id = %assignment.match_id, round = round_id, "Match accepted");
        Ok(message.reply(MessageType::Ack, self.sender(), Ack::default()))
    }

    fn on_pushed_move(&self, message: &ProtocolMessage) -> ProtocolMessage {
        let mv: MoveResult = match message.payload_as() {
            Ok(mv) => mv,
            Err(e) => return error_reply(message, self.sender(), ErrorCode::ProtocolViolation, e.to_string()),
        };
        if message.sender().agent_id() != Some(mv.player_id.as_str()) {
            return error_reply(message, self.sender(), ErrorCode::ProtocolViolation, "move sender mismatch");
        }
        match self.inbox.push(&mv) {
            Ok(()) => message.reply(MessageType::Ack, self.sender(), Ack::default()),
            Err(PushRejection::Late) => error_reply(
                message,
                self.sender(),
                ErrorCode::LateMove,
                format!("no open move window for {} round {}", mv.match_id, mv.game_round),
            ),
            // 窗口仍然打开，可在期限内重新提交
            Err(PushRejection::Invalid(reason)) => message.reply(
                MessageType::Error,
                self.sender(),
                ErrorPayload {
                    code: ErrorCode::InvalidMove,
                    reason,
                    retryable: true,
                },
            ),
        }
    }

    /// 终止后：归档、通知双方、上报
    async fn finish_match(&self, round_id: u32, endpoints: Vec<String>, result: MatchResult, state: MatchState) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&result.match_id);
        }
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(result.match_id.clone(), (state, result.clone()));
        }
        self.notify_players(round_id, &endpoints, &result).await;
        self.report(round_id, result).await;
    }

    /// GAME_END 尽力而为；每个玩家最多等待一个邀请期限
    async fn notify_players(&self, round_id: u32, endpoints: &[String], result: &MatchResult) {
        let message = ProtocolMessage::new(
            MessageType::GameEnd,
            self.settings.league_id.clone(),
            self.sender(),
            GameEnd { result: result.clone() },
        )
        .with_round(round_id)
        .with_match(result.match_id.clone());

        let sends = endpoints.iter().map(|endpoint| {
            let message = &message;
            async move {
                let call = self.connection.call_expecting(endpoint, message, MessageType::Ack);
                match tokio::time::timeout(self.settings.invite_timeout, call).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!(endpoint = %endpoint, "GAME_END not delivered: {}", e),
                    Err(_) => debug!(endpoint = %endpoint, "GAME_END timed out"),
                }
            }
        });
        join_all(sends).await;
    }

    /// 上报结果；失败按恢复动作处理，不静默丢弃
    async fn report(&self, round_id: u32, result: MatchResult) -> bool {
        let Some(league_endpoint) = self.league_endpoint.read().ok().and_then(|e| e.clone()) else {
            error!(match_id = %result.match_id, "No league endpoint, result kept for reconciliation");
            self.queue_reconciliation(round_id, result);
            return false;
        };
        let message = ProtocolMessage::new(
            MessageType::MatchResult,
            self.settings.league_id.clone(),
            self.sender(),
            MatchResultReport {
                referee_id: self.referee_id().unwrap_or_default(),
                round_id,
                result: result.clone(),
            },
        )
        .with_round(round_id)
        .with_match(result.match_id.clone());

        let err = match self
            .connection
            .call_expecting(&league_endpoint, &message, MessageType::Ack)
            .await
        {
            Ok(_) => {
                debug!(match_id = %result.match_id, "Result reported");
                return true;
            }
            Err(e) => LeagueError::from(e),
        };

        match self.recovery.handle(&err) {
            RecoveryAction::Reconcile | RecoveryAction::BackOff | RecoveryAction::Retry => {
                error!(match_id = %result.match_id, "Result report failed, queued for reconciliation: {}", err);
                self.queue_reconciliation(round_id, result);
            }
            RecoveryAction::RespondError(ErrorCode::ResultConflict) | RecoveryAction::Escalate => {
                error!(match_id = %result.match_id, "Result conflicts with the recorded one: {}", err);
            }
            action => {
                warn!(match_id = %result.match_id, action = ?action, "Result report rejected: {}", err);
            }
        }
        false
    }

    fn queue_reconciliation(&self, round_id: u32, result: MatchResult) {
        if let Ok(mut pending) = self.pending_reports.lock() {
            pending.push(PendingReport { round_id, result });
        }
    }
}

#[async_trait]
impl MessageHandler for RefereeAgent {
    fn league_id(&self) -> String {
        self.settings.league_id.clone()
    }

    fn sender(&self) -> Sender {
        Sender::Referee(self.referee_id().unwrap_or_else(|| "unregistered".to_string()))
    }

    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
        match message.message_type() {
            MessageType::MatchAssignment => self
                .on_assignment(&message)
                .unwrap_or_else(|e| error_reply(&message, self.sender(), e.error_code(), e.to_string())),
            MessageType::MoveResult => self.on_pushed_move(&message),
            other => error_reply(
                &message,
                self.sender(),
                ErrorCode::Unsupported,
                format!("referee does not accept {other}"),
            ),
        }
    }
}
