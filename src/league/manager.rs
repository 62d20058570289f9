//! League Manager：注册、排程、轮次推进、结果折叠与积分榜
//!
//! 所有对 League 聚合的修改都在同一把锁内完成（轮次推进与结果折叠互斥）；
//! 网络调用（分配比赛、广播积分榜）一律在释放锁之后进行。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::model::{League, LeagueStatus, Match, MatchStatus, Registration, RoundStatus, Slot};
use super::schedule::build_schedule;
use super::standings::{PointsTable, StandingRow, StandingsTable};
use crate::config::LeagueSection;
use crate::connection::ConnectionManager;
use crate::core::error::{ConnectionError, LeagueError, RegistrationError, RegistryError};
use crate::events::{types, Event, EventBus};
use crate::protocol::{
    AgentKind, MatchAssignment, MatchResult, MessageType, Participant, ProtocolMessage, Sender,
    StandingsUpdate,
};
use crate::registry::ServiceRegistry;

const SOURCE: &str = "league_manager";

/// 联赛参数
#[derive(Debug, Clone)]
pub struct LeagueSettings {
    pub league_id: String,
    pub game: String,
    pub max_players: usize,
    pub max_referees: usize,
    pub points: PointsTable,
}

impl LeagueSettings {
    pub fn from_config(cfg: &LeagueSection) -> Self {
        Self {
            league_id: cfg.league_id.clone(),
            game: cfg.game.clone(),
            max_players: cfg.max_players,
            max_referees: cfg.max_referees,
            points: PointsTable::from_config(cfg),
        }
    }
}

/// 注册结果；同一身份重复注册返回已有 id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub agent_id: String,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Recorded,
    /// 与已记录结果完全相同的重复上报，无任何影响
    Duplicate,
}

/// 联赛进度（watch 通道推送）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeagueProgress {
    pub status: LeagueStatus,
    pub active_round: Option<u32>,
    pub completed_rounds: u32,
    pub total_rounds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchSnapshot {
    pub match_id: String,
    pub player_a: String,
    pub player_b: String,
    pub referee: Option<String>,
    pub status: MatchStatus,
    pub result: Option<MatchResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSnapshot {
    pub round_number: u32,
    pub status: RoundStatus,
    pub matches: Vec<MatchSnapshot>,
}

impl RoundSnapshot {
    pub fn bye(&self) -> Option<&str> {
        self.matches
            .iter()
            .find(|m| m.player_b == super::model::BYE)
            .map(|m| m.player_a.as_str())
    }
}

/// 释放锁之后要发出的 MATCH_ASSIGNMENT
struct PendingAssignment {
    match_id: String,
    referee_id: String,
    endpoint: String,
    message: ProtocolMessage,
}

/// 释放锁之后要广播的 STANDINGS_UPDATE
struct StandingsBroadcast {
    endpoints: Vec<String>,
    message: ProtocolMessage,
}

pub struct LeagueManager {
    settings: LeagueSettings,
    league: Mutex<League>,
    registry: Arc<ServiceRegistry>,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    progress: watch::Sender<LeagueProgress>,
}

impl LeagueManager {
    pub fn new(
        settings: LeagueSettings,
        registry: Arc<ServiceRegistry>,
        connection: Arc<ConnectionManager>,
        events: EventBus,
    ) -> Self {
        let (progress, _) = watch::channel(LeagueProgress {
            status: LeagueStatus::Forming,
            active_round: None,
            completed_rounds: 0,
            total_rounds: 0,
        });
        let league = League::new(settings.league_id.clone(), settings.points);
        Self {
            settings,
            league: Mutex::new(league),
            registry,
            connection,
            events,
            progress,
        }
    }

    pub fn league_id(&self) -> &str {
        &self.settings.league_id
    }

    pub fn game(&self) -> &str {
        &self.settings.game
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<LeagueProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> LeagueProgress {
        self.progress.borrow().clone()
    }

    /// 注册 Player / Referee
    ///
    /// 身份 = (kind, endpoint)。Player 只能在 FORMING 阶段加入，Referee 在 FORMING 或 RUNNING 阶段均可。
    pub async fn register(
        &self,
        kind: AgentKind,
        endpoint: &str,
        display_name: Option<String>,
        capabilities: Vec<String>,
    ) -> Result<Registered, LeagueError> {
        let mut league = self.league.lock().await;

        if let Some(existing) = league.registration(kind, endpoint) {
            let agent_id = existing.id.clone();
            debug!(agent_id = %agent_id, endpoint, "Duplicate registration deduplicated");
            // 注册表记录可能已过期删除：补回，不改变 id
            if self.registry.get(&agent_id).await.is_none() {
                self.registry.register(kind, agent_id.clone(), endpoint).await?;
            } else {
                self.registry.heartbeat(&agent_id).await?;
            }
            return Ok(Registered {
                agent_id,
                deduplicated: true,
            });
        }

        let accepting = match kind {
            AgentKind::Player => league.status == LeagueStatus::Forming,
            AgentKind::Referee => league.status != LeagueStatus::Complete,
            AgentKind::LeagueManager => {
                return Err(RegistrationError::Rejected("league manager cannot register".into()).into())
            }
        };
        if !accepting {
            return Err(RegistrationError::NotAccepting {
                kind,
                status: format!("{:?}", league.status).to_uppercase(),
            }
            .into());
        }
        if !capabilities.is_empty() && !capabilities.iter().any(|c| c == &self.settings.game) {
            return Err(RegistrationError::Rejected(format!(
                "{kind} does not support game '{}'",
                self.settings.game
            ))
            .into());
        }

        let (count, max) = match kind {
            AgentKind::Player => (league.players.len(), self.settings.max_players),
            _ => (league.referees.len(), self.settings.max_referees),
        };
        if count >= max {
            return Err(RegistrationError::CapacityExceeded { kind, max }.into());
        }

        let agent_id = league.issue_id(kind);
        self.registry.register(kind, agent_id.clone(), endpoint).await?;

        let registration = Registration {
            id: agent_id.clone(),
            kind,
            endpoint: endpoint.to_string(),
            display_name,
            capabilities,
            registered_at: Utc::now(),
        };
        let event_type = match kind {
            AgentKind::Player => types::PLAYER_REGISTERED,
            _ => types::REFEREE_REGISTERED,
        };
        self.events.publish(Event::new(event_type, SOURCE, &registration));
        match kind {
            AgentKind::Player => league.players.push(registration),
            _ => league.referees.push(registration),
        }
        info!(agent_id = %agent_id, %kind, endpoint, "Agent registered");

        Ok(Registered {
            agent_id,
            deduplicated: false,
        })
    }

    /// 主动注销
    ///
    /// Player 只能在 FORMING 阶段注销（排程一旦生成，缺席由比赛期限处理）；Referee 任何阶段都可注销，
    /// 已分配给它的比赛保留，由超时隔离兜底。
    pub async fn deregister(&self, agent_id: &str) -> Result<Registration, LeagueError> {
        let mut league = self.league.lock().await;
        let kind = if league.player(agent_id).is_some() {
            AgentKind::Player
        } else if league.referees.iter().any(|r| r.id == agent_id) {
            AgentKind::Referee
        } else {
            return Err(RegistryError::NotFound(agent_id.to_string()).into());
        };
        if kind == AgentKind::Player && league.status != LeagueStatus::Forming {
            return Err(LeagueError::InvalidState(format!(
                "player {agent_id} cannot leave a {:?} league",
                league.status
            )));
        }
        let registration = self.drop_registration(&mut league, agent_id, "deregistered")?;
        // 注册表记录可能已被扫描删除
        let _ = self.registry.unregister(agent_id).await;
        Ok(registration)
    }

    /// 注册表已删除（心跳过期超过宽限期）的 Referee，以及 FORMING 阶段的 Player，从联赛中移除
    pub async fn prune_expired(&self) -> Vec<String> {
        let mut league = self.league.lock().await;
        let known: HashSet<String> = self
            .registry
            .all()
            .await
            .into_iter()
            .map(|r| r.service_id)
            .collect();
        let forming = league.status == LeagueStatus::Forming;
        let expired: Vec<String> = league
            .referees
            .iter()
            .chain(league.players.iter().filter(|_| forming))
            .filter(|r| !known.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            let _ = self.drop_registration(&mut league, id, "registry expired");
        }
        expired
    }

    fn drop_registration(&self, league: &mut League, agent_id: &str, reason: &str) -> Result<Registration, LeagueError> {
        let registration = league
            .remove_registration(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        info!(agent_id, kind = %registration.kind, reason, "Agent removed from league");
        self.events.publish(Event::new(
            types::AGENT_DEREGISTERED,
            SOURCE,
            json!({ "agent_id": agent_id, "kind": registration.kind, "reason": reason }),
        ));
        Ok(registration)
    }

    /// 心跳：刷新注册表健康状态
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), LeagueError> {
        Ok(self.registry.heartbeat(agent_id).await?)
    }

    /// FORMING -> RUNNING：按注册顺序生成排程
    pub async fn start(&self) -> Result<u32, LeagueError> {
        let mut league = self.league.lock().await;
        if league.status != LeagueStatus::Forming {
            return Err(LeagueError::InvalidState(format!(
                "league already {:?}",
                league.status
            )));
        }
        if league.players.len() < 2 {
            return Err(LeagueError::InvalidState(format!(
                "need at least 2 players, have {}",
                league.players.len()
            )));
        }

        let ids = league.player_ids();
        league.standings = StandingsTable::new(&ids, self.settings.points);
        league.install_schedule(build_schedule(&ids));
        league.status = LeagueStatus::Running;
        let rounds = league.rounds.len() as u32;

        info!(league_id = %league.id, players = ids.len(), rounds, "League started");
        self.events.publish(Event::new(
            types::LEAGUE_STARTED,
            SOURCE,
            json!({ "league_id": league.id, "players": ids, "rounds": rounds }),
        ));
        self.publish_progress(&league);
        Ok(rounds)
    }

    /// 推进到下一轮
    ///
    /// 只有当前没有未完成的 ACTIVE 轮次时才允许；没有健康裁判时轮次保持 PENDING 并返回 `NoReferees`。
    pub async fn advance_round(&self) -> Result<u32, LeagueError> {
        let (round_number, assignments, broadcast) = {
            let mut league = self.league.lock().await;
            match league.status {
                LeagueStatus::Running => {}
                status => {
                    return Err(LeagueError::InvalidState(format!(
                        "cannot advance round while league is {status:?}"
                    )))
                }
            }
            if let Some(active) = league.active_round() {
                return Err(LeagueError::InvalidState(format!(
                    "round {} is still active",
                    active.round_number
                )));
            }
            let Some(round) = league.next_pending_round() else {
                return Err(LeagueError::InvalidState("no pending rounds".into()));
            };
            let round_number = round.round_number;
            let match_ids = round.match_ids.clone();

            let real: Vec<String> = match_ids
                .iter()
                .filter(|id| league.matches.get(*id).is_some_and(|m| !m.is_bye()))
                .cloned()
                .collect();

            let referees = self.available_referees(&league, &HashSet::new()).await;
            if !real.is_empty() && referees.is_empty() {
                warn!(round = round_number, "No healthy referees, round stays pending");
                return Err(LeagueError::NoReferees { round: round_number });
            }

            // 最少负载分配；负载相同按注册顺序
            let mut load: Vec<(Registration, usize)> = referees
                .into_iter()
                .map(|r| {
                    let l = league.referee_load(&r.id);
                    (r, l)
                })
                .collect();
            let now = Instant::now();
            let mut assignments = Vec::with_capacity(real.len());
            for id in &real {
                let Some(slot) = load.iter_mut().min_by_key(|(_, l)| *l) else {
                    break;
                };
                slot.1 += 1;
                let referee = slot.0.clone();
                let Some(m) = league.matches.get_mut(id) else {
                    continue;
                };
                m.assigned_referee_id = Some(referee.id.clone());
                m.status = MatchStatus::Assigned;
                m.assigned_at = Some(now);
                let m = m.clone();
                self.events.publish(Event::new(
                    types::MATCH_ASSIGNED,
                    SOURCE,
                    json!({ "match_id": m.match_id, "round": round_number, "referee": referee.id }),
                ));
                if let Some(message) = self.assignment_message(&league, &m) {
                    assignments.push(PendingAssignment {
                        match_id: m.match_id.clone(),
                        referee_id: referee.id.clone(),
                        endpoint: referee.endpoint.clone(),
                        message,
                    });
                }
            }

            // 轮空在激活时直接了结，不经过裁判，也不影响积分榜
            for id in &match_ids {
                if let Some(m) = league.matches.get_mut(id) {
                    if m.is_bye() {
                        m.status = MatchStatus::Complete;
                        debug!(match_id = %id, player = %m.player_a, "Bye settled");
                    }
                }
            }

            if let Some(round) = league.round_mut(round_number) {
                round.status = RoundStatus::Active;
            }
            info!(round = round_number, matches = real.len(), "Round started");
            self.events.publish(Event::new(
                types::ROUND_STARTED,
                SOURCE,
                json!({ "round": round_number, "matches": match_ids }),
            ));
            let broadcast = self.settle_round_if_done(&mut league, round_number);
            self.publish_progress(&league);
            (round_number, assignments, broadcast)
        };

        join_all(assignments.into_iter().map(|a| self.deliver_assignment(a))).await;
        if let Some(b) = broadcast {
            self.broadcast_standings(b);
        }
        Ok(round_number)
    }

    /// 上报比赛结果（幂等）
    ///
    /// 相同结果的重复上报为无操作；不同结果返回 `ResultConflict`，积分榜不变。
    pub async fn report_match_result(
        &self,
        referee_id: Option<&str>,
        result: MatchResult,
    ) -> Result<ReportOutcome, LeagueError> {
        let broadcast = {
            let mut league = self.league.lock().await;
            let m = league
                .matches
                .get(&result.match_id)
                .ok_or_else(|| LeagueError::UnknownMatch(result.match_id.clone()))?;

            if let Some(existing) = &m.result {
                if *existing == result {
                    debug!(match_id = %result.match_id, "Duplicate result ignored");
                    return Ok(ReportOutcome::Duplicate);
                }
                error!(match_id = %result.match_id, "Conflicting result reported, keeping the original");
                return Err(LeagueError::ResultConflict {
                    match_id: result.match_id.clone(),
                });
            }
            if league.status == LeagueStatus::Complete {
                return Err(LeagueError::InvalidState("league is complete".into()));
            }
            if m.is_bye() || m.status == MatchStatus::Pending {
                return Err(LeagueError::InvalidState(format!(
                    "match {} is not awaiting a result",
                    m.match_id
                )));
            }
            if !m.same_players(&result) {
                return Err(LeagueError::InvalidState(format!(
                    "result players do not match {}",
                    m.match_id
                )));
            }
            if !result.names_only_its_players() {
                warn!(match_id = %result.match_id, outcome = ?result.outcome, "Result names a player outside the match");
                return Err(LeagueError::InvalidState(format!(
                    "result outcome for {} names a player outside the match",
                    m.match_id
                )));
            }
            if let (Some(reporter), Some(assigned)) = (referee_id, m.assigned_referee_id.as_deref()) {
                if reporter != assigned {
                    return Err(LeagueError::InvalidState(format!(
                        "match {} is assigned to {assigned}, not {reporter}",
                        m.match_id
                    )));
                }
            }

            let round = m.round;
            let reconciled = m.status == MatchStatus::NeedsReconciliation;
            if let Some(m) = league.matches.get_mut(&result.match_id) {
                m.result = Some(result.clone());
                m.status = MatchStatus::Complete;
                m.flag_reason = None;
            }
            league.standings.apply(&result);
            league.results.push(result.clone());

            if reconciled {
                info!(match_id = %result.match_id, "Flagged match reconciled");
            } else {
                info!(match_id = %result.match_id, outcome = ?result.outcome, "Match result recorded");
            }
            self.events.publish(Event::new(types::MATCH_COMPLETED, SOURCE, &result));

            let broadcast = if reconciled && league.round_settled(round) && self.round_is_complete(&league, round) {
                // 轮次早已结束：只刷新积分榜
                Some(self.standings_changed(&league, round))
            } else {
                self.settle_round_if_done(&mut league, round)
            };
            self.publish_progress(&league);
            broadcast
        };

        if let Some(b) = broadcast {
            self.broadcast_standings(b);
        }
        Ok(ReportOutcome::Recorded)
    }

    /// 隔离一场比赛：标记待对账，计入轮次完成，联赛继续推进
    pub async fn flag_match(&self, match_id: &str, reason: impl Into<String>) -> Result<(), LeagueError> {
        let broadcast = {
            let mut league = self.league.lock().await;
            let round = self.flag_locked(&mut league, match_id, reason.into())?;
            let broadcast = self.settle_round_if_done(&mut league, round);
            self.publish_progress(&league);
            broadcast
        };
        if let Some(b) = broadcast {
            self.broadcast_standings(b);
        }
        Ok(())
    }

    /// 隔离当前轮次中分配时间超过 `max_age` 仍未了结的比赛，返回被隔离的 match_id
    pub async fn flag_overdue_matches(&self, max_age: Duration) -> Vec<String> {
        let (flagged, broadcast) = {
            let mut league = self.league.lock().await;
            let Some(active) = league.active_round() else {
                return Vec::new();
            };
            let round = active.round_number;
            let overdue: Vec<String> = active
                .match_ids
                .iter()
                .filter(|id| {
                    league.matches.get(*id).is_some_and(|m| {
                        m.status == MatchStatus::Assigned
                            && m.assigned_at.is_some_and(|at| at.elapsed() >= max_age)
                    })
                })
                .cloned()
                .collect();
            for id in &overdue {
                let _ = self.flag_locked(&mut league, id, "match overdue".to_string());
            }
            let broadcast = if overdue.is_empty() {
                None
            } else {
                self.settle_round_if_done(&mut league, round)
            };
            self.publish_progress(&league);
            (overdue, broadcast)
        };
        if let Some(b) = broadcast {
            self.broadcast_standings(b);
        }
        flagged
    }

    /// 当前积分榜
    pub async fn standings(&self) -> Vec<StandingRow> {
        let league = self.league.lock().await;
        Self::with_flags(&league, league.standings.ranked(&league.results))
    }

    /// 从完整结果日志重算的积分榜（与 `standings()` 必须一致）
    pub async fn standings_from_log(&self) -> Vec<StandingRow> {
        let league = self.league.lock().await;
        let table = StandingsTable::from_results(&league.player_ids(), self.settings.points, &league.results);
        Self::with_flags(&league, table.ranked(&league.results))
    }

    pub async fn status(&self) -> LeagueStatus {
        self.league.lock().await.status
    }

    pub async fn players(&self) -> Vec<Registration> {
        self.league.lock().await.players.clone()
    }

    pub async fn referees(&self) -> Vec<Registration> {
        self.league.lock().await.referees.clone()
    }

    pub async fn match_status(&self, match_id: &str) -> Option<MatchStatus> {
        self.league.lock().await.matches.get(match_id).map(|m| m.status)
    }

    pub async fn rounds(&self) -> Vec<RoundSnapshot> {
        let league = self.league.lock().await;
        league
            .rounds
            .iter()
            .map(|r| RoundSnapshot {
                round_number: r.round_number,
                status: r.status,
                matches: r
                    .match_ids
                    .iter()
                    .filter_map(|id| league.matches.get(id))
                    .map(|m| MatchSnapshot {
                        match_id: m.match_id.clone(),
                        player_a: m.player_a.clone(),
                        player_b: m.player_b.player_id().to_string(),
                        referee: m.assigned_referee_id.clone(),
                        status: m.status,
                        result: m.result.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// 等待第 `round` 轮完成（或联赛结束）；超时返回 false
    pub async fn wait_for_round(&self, round: u32, timeout: Duration) -> bool {
        let mut rx = self.progress.subscribe();
        let done = rx.wait_for(|p| p.completed_rounds >= round || p.status == LeagueStatus::Complete);
        let done = matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(_)));
        done
    }

    async fn available_referees(&self, league: &League, exclude: &HashSet<String>) -> Vec<Registration> {
        let healthy: HashSet<String> = self
            .registry
            .find(AgentKind::Referee)
            .await
            .into_iter()
            .map(|r| r.service_id)
            .collect();
        league
            .referees
            .iter()
            .filter(|r| healthy.contains(&r.id) && !exclude.contains(&r.id))
            .cloned()
            .collect()
    }

    fn assignment_message(&self, league: &League, m: &Match) -> Option<ProtocolMessage> {
        let Slot::Player(b) = &m.player_b else {
            return None;
        };
        let participant = |id: &str| {
            league.player(id).map(|p| Participant {
                player_id: p.id.clone(),
                endpoint: p.endpoint.clone(),
            })
        };
        let payload = MatchAssignment {
            match_id: m.match_id.clone(),
            round_id: m.round,
            game: self.settings.game.clone(),
            player_a: participant(&m.player_a)?,
            player_b: participant(b)?,
        };
        Some(
            ProtocolMessage::new(MessageType::MatchAssignment, league.id.clone(), Sender::LeagueManager, payload)
                .with_round(m.round)
                .with_match(m.match_id.clone()),
        )
    }

    /// 发送 MATCH_ASSIGNMENT；失败时换一个健康裁判重试，全部失败则隔离该比赛
    async fn deliver_assignment(&self, first: PendingAssignment) {
        let mut tried = HashSet::new();
        let mut current = first;
        loop {
            tried.insert(current.referee_id.clone());
            let err = match self
                .connection
                .call_expecting(&current.endpoint, &current.message, MessageType::Ack)
                .await
            {
                Ok(_) => {
                    debug!(match_id = %current.match_id, referee = %current.referee_id, "Assignment accepted");
                    return;
                }
                Err(e) => e,
            };
            warn!(
                match_id = %current.match_id,
                referee = %current.referee_id,
                "Assignment failed: {}", err
            );
            if matches!(err, ConnectionError::CallFailed { .. } | ConnectionError::CircuitOpen { .. }) {
                let _ = self.registry.mark_unhealthy(&current.referee_id).await;
            }

            match self.reassign(&current.match_id, &tried).await {
                Some(next) => current = next,
                None => {
                    let _ = self
                        .flag_match(&current.match_id, format!("assignment failed: {err}"))
                        .await;
                    return;
                }
            }
        }
    }

    async fn reassign(&self, match_id: &str, tried: &HashSet<String>) -> Option<PendingAssignment> {
        let mut league = self.league.lock().await;
        let referee = self
            .available_referees(&league, tried)
            .await
            .into_iter()
            .min_by_key(|r| league.referee_load(&r.id))?;
        let m = league.matches.get_mut(match_id)?;
        if m.status != MatchStatus::Assigned {
            return None;
        }
        m.assigned_referee_id = Some(referee.id.clone());
        m.assigned_at = Some(Instant::now());
        let m = m.clone();
        info!(match_id, referee = %referee.id, "Match reassigned");
        self.events.publish(Event::new(
            types::MATCH_ASSIGNED,
            SOURCE,
            json!({ "match_id": match_id, "round": m.round, "referee": referee.id, "reassigned": true }),
        ));
        let message = self.assignment_message(&league, &m)?;
        Some(PendingAssignment {
            match_id: match_id.to_string(),
            referee_id: referee.id,
            endpoint: referee.endpoint,
            message,
        })
    }

    fn flag_locked(&self, league: &mut League, match_id: &str, reason: String) -> Result<u32, LeagueError> {
        let m = league
            .matches
            .get_mut(match_id)
            .ok_or_else(|| LeagueError::UnknownMatch(match_id.to_string()))?;
        if m.status != MatchStatus::Assigned {
            return Err(LeagueError::InvalidState(format!(
                "match {match_id} is {:?}, only assigned matches can be flagged",
                m.status
            )));
        }
        m.status = MatchStatus::NeedsReconciliation;
        m.flag_reason = Some(reason.clone());
        error!(match_id, reason = %reason, "Match flagged for reconciliation");
        self.events.publish(Event::new(
            types::MATCH_FLAGGED,
            SOURCE,
            json!({ "match_id": match_id, "reason": reason }),
        ));
        Ok(m.round)
    }

    fn round_is_complete(&self, league: &League, round: u32) -> bool {
        league
            .rounds
            .iter()
            .any(|r| r.round_number == round && r.status == RoundStatus::Complete)
    }

    /// 活跃轮次全部了结时：轮次 COMPLETE，发布积分榜；最后一轮则联赛 COMPLETE
    fn settle_round_if_done(&self, league: &mut League, round: u32) -> Option<StandingsBroadcast> {
        let is_active = league
            .rounds
            .iter()
            .any(|r| r.round_number == round && r.status == RoundStatus::Active);
        if !is_active || !league.round_settled(round) {
            return None;
        }
        if let Some(r) = league.round_mut(round) {
            r.status = RoundStatus::Complete;
        }
        info!(round, "Round complete");
        self.events.publish(Event::new(types::ROUND_COMPLETED, SOURCE, json!({ "round": round })));
        let broadcast = self.standings_changed(league, round);

        if league.rounds.iter().all(|r| r.status == RoundStatus::Complete) {
            league.status = LeagueStatus::Complete;
            info!(league_id = %league.id, "League complete");
            self.events.publish(Event::new(
                types::LEAGUE_COMPLETED,
                SOURCE,
                json!({ "league_id": league.id, "standings": broadcast.message.payload()["standings"] }),
            ));
        }
        Some(broadcast)
    }

    fn standings_changed(&self, league: &League, round: u32) -> StandingsBroadcast {
        let standings = Self::with_flags(league, league.standings.ranked(&league.results));
        self.events.publish(Event::new(
            types::STANDINGS_UPDATED,
            SOURCE,
            json!({ "round": round, "standings": standings }),
        ));
        let message = ProtocolMessage::new(
            MessageType::StandingsUpdate,
            league.id.clone(),
            Sender::LeagueManager,
            StandingsUpdate {
                round_id: round,
                standings,
            },
        )
        .with_round(round);
        StandingsBroadcast {
            endpoints: league.players.iter().map(|p| p.endpoint.clone()).collect(),
            message,
        }
    }

    /// 尽力而为：后台发送，不阻塞结果上报
    fn broadcast_standings(&self, broadcast: StandingsBroadcast) {
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            let StandingsBroadcast { endpoints, message } = broadcast;
            let sends = endpoints.iter().map(|endpoint| {
                let connection = Arc::clone(&connection);
                let message = message.clone();
                async move {
                    if let Err(e) = connection
                        .call_expecting(endpoint, &message, MessageType::Ack)
                        .await
                    {
                        debug!(endpoint = %endpoint, "Standings update not delivered: {}", e);
                    }
                }
            });
            join_all(sends).await;
        });
    }

    fn with_flags(league: &League, mut rows: Vec<StandingRow>) -> Vec<StandingRow> {
        let flagged = league.flagged_counts();
        for row in &mut rows {
            row.flagged = flagged.get(&row.player_id).copied().unwrap_or(0);
        }
        rows
    }

    fn publish_progress(&self, league: &League) {
        self.progress.send_replace(LeagueProgress {
            status: league.status,
            active_round: league.active_round().map(|r| r.round_number),
            completed_rounds: league.completed_rounds(),
            total_rounds: league.rounds.len() as u32,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BreakerConfig, RetryPolicy};
    use crate::protocol::{Ack, MatchOutcome};
    use crate::registry::RegistryConfig;
    use crate::transport::{InMemoryTransport, MessageHandler};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// 只回 ACK 的裁判桩
    struct AckReferee;

    #[async_trait]
    impl MessageHandler for AckReferee {
        fn league_id(&self) -> String {
            "league-1".into()
        }

        fn sender(&self) -> Sender {
            Sender::Referee("stub".into())
        }

        async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
            message.reply(MessageType::Ack, self.sender(), Ack::default())
        }
    }

    fn settings(max_players: usize) -> LeagueSettings {
        LeagueSettings {
            league_id: "league-1".into(),
            game: "parity".into(),
            max_players,
            max_referees: 4,
            points: PointsTable::default(),
        }
    }

    fn manager_with(transport: Arc<InMemoryTransport>, max_players: usize) -> LeagueManager {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            heartbeat_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
        }));
        let connection = Arc::new(ConnectionManager::with_policy(
            transport,
            RetryPolicy::none(),
            BreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(30),
            },
            Duration::from_secs(1),
        ));
        LeagueManager::new(settings(max_players), registry, connection, EventBus::new(100))
    }

    async fn running_league(players: usize) -> (LeagueManager, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.bind("mem://ref1", Arc::new(AckReferee));
        let lm = manager_with(transport.clone(), 16);
        for i in 1..=players {
            lm.register(AgentKind::Player, &format!("mem://p{i}"), None, vec![])
                .await
                .unwrap();
        }
        lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        lm.start().await.unwrap();
        (lm, transport)
    }

    fn win(match_id: &str, a: &str, b: &str, winner: &str) -> MatchResult {
        MatchResult {
            match_id: match_id.into(),
            player_a: a.into(),
            player_b: b.into(),
            outcome: MatchOutcome::Win { winner: winner.into() },
            scores: BTreeMap::from([(a.to_string(), 3), (b.to_string(), 0)]),
            game_rounds_played: 3,
        }
    }

    #[tokio::test]
    async fn test_register_assigns_ids_and_dedups_identity() {
        let lm = manager_with(Arc::new(InMemoryTransport::new()), 2);
        let first = lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        assert_eq!(first, Registered { agent_id: "P01".into(), deduplicated: false });

        let again = lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        assert_eq!(again, Registered { agent_id: "P01".into(), deduplicated: true });
        assert_eq!(lm.players().await.len(), 1);

        lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        let err = lm.register(AgentKind::Player, "mem://p3", None, vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            LeagueError::Registration(RegistrationError::CapacityExceeded { max: 2, .. })
        ));

        let referee = lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        assert_eq!(referee.agent_id, "REF01");
    }

    #[tokio::test]
    async fn test_register_rejects_unsupported_game_and_late_players() {
        let lm = manager_with(Arc::new(InMemoryTransport::new()), 8);
        let err = lm
            .register(AgentKind::Player, "mem://p1", None, vec!["chess".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, LeagueError::Registration(RegistrationError::Rejected(_))));

        lm.register(AgentKind::Player, "mem://p1", None, vec!["parity".into()]).await.unwrap();
        lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        lm.start().await.unwrap();

        let err = lm.register(AgentKind::Player, "mem://p3", None, vec![]).await.unwrap_err();
        assert!(matches!(err, LeagueError::Registration(RegistrationError::NotAccepting { .. })));
        // 裁判在 RUNNING 阶段仍可加入
        assert!(lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_deregister_frees_slot_without_reusing_ids() {
        let lm = manager_with(Arc::new(InMemoryTransport::new()), 3);
        for i in 1..=3 {
            lm.register(AgentKind::Player, &format!("mem://p{i}"), None, vec![]).await.unwrap();
        }
        let removed = lm.deregister("P02").await.unwrap();
        assert_eq!(removed.endpoint, "mem://p2");
        assert!(lm.registry().get("P02").await.is_none());

        // 名额空出；编号不复用，同一 endpoint 重新注册得到新身份
        let again = lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        assert_eq!(again, Registered { agent_id: "P04".into(), deduplicated: false });
        let ids: Vec<String> = lm.players().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["P01", "P03", "P04"]);

        assert_eq!(
            lm.deregister("P99").await.unwrap_err(),
            LeagueError::Registry(RegistryError::NotFound("P99".into()))
        );

        lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        lm.start().await.unwrap();
        assert!(matches!(lm.deregister("P01").await, Err(LeagueError::InvalidState(_))));
        // 裁判在 RUNNING 阶段可以离开
        assert_eq!(lm.deregister("REF01").await.unwrap().kind, AgentKind::Referee);
        assert!(lm.referees().await.is_empty());

        lm.events().flush().await;
        assert_eq!(lm.events().history_matching(types::AGENT_DEREGISTERED).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_expiry_drops_registrations() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.bind("mem://ref1", Arc::new(AckReferee));
        transport.bind("mem://ref2", Arc::new(AckReferee));
        let lm = manager_with(transport, 8);
        for i in 1..=3 {
            lm.register(AgentKind::Player, &format!("mem://p{i}"), None, vec![]).await.unwrap();
        }
        lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        lm.register(AgentKind::Referee, "mem://ref2", None, vec![]).await.unwrap();

        // P03 与 REF01 停止心跳：先被标记不健康，宽限期过后被删除
        for wait in [31, 301] {
            tokio::time::advance(Duration::from_secs(wait)).await;
            for id in ["P01", "P02", "REF02"] {
                lm.heartbeat(id).await.unwrap();
            }
            lm.registry().sweep().await;
        }
        assert!(lm.registry().get("REF01").await.is_none());

        assert_eq!(lm.prune_expired().await, vec!["REF01", "P03"]);
        assert!(lm.prune_expired().await.is_empty());
        assert_eq!(lm.players().await.len(), 2);

        assert_eq!(lm.start().await.unwrap(), 1);
        lm.advance_round().await.unwrap();
        assert_eq!(lm.rounds().await[0].matches[0].referee.as_deref(), Some("REF02"));
    }

    #[tokio::test]
    async fn test_start_requires_two_players() {
        let lm = manager_with(Arc::new(InMemoryTransport::new()), 8);
        lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        assert!(matches!(lm.start().await, Err(LeagueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_no_referees_keeps_round_pending() {
        let lm = manager_with(Arc::new(InMemoryTransport::new()), 8);
        lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        lm.start().await.unwrap();

        let err = lm.advance_round().await.unwrap_err();
        assert_eq!(err, LeagueError::NoReferees { round: 1 });
        assert!(err.is_retryable());
        assert_eq!(lm.rounds().await[0].status, RoundStatus::Pending);
    }

    #[tokio::test]
    async fn test_only_one_active_round() {
        let (lm, _t) = running_league(4).await;
        assert_eq!(lm.advance_round().await.unwrap(), 1);
        assert!(matches!(lm.advance_round().await, Err(LeagueError::InvalidState(_))));
        assert_eq!(lm.match_status("R1M1").await, Some(MatchStatus::Assigned));
        // 轮次未完成：等待超时
        assert!(!lm.wait_for_round(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_report_is_idempotent_and_conflicts_are_rejected() {
        let (lm, _t) = running_league(4).await;
        lm.advance_round().await.unwrap();

        let result = win("R1M1", "P01", "P04", "P01");
        assert_eq!(
            lm.report_match_result(Some("REF01"), result.clone()).await.unwrap(),
            ReportOutcome::Recorded
        );
        let before = lm.standings().await;

        assert_eq!(
            lm.report_match_result(Some("REF01"), result).await.unwrap(),
            ReportOutcome::Duplicate
        );
        assert_eq!(lm.standings().await, before);

        let conflicting = win("R1M1", "P01", "P04", "P04");
        assert_eq!(
            lm.report_match_result(Some("REF01"), conflicting).await.unwrap_err(),
            LeagueError::ResultConflict { match_id: "R1M1".into() }
        );
        assert_eq!(lm.standings().await, before);
        assert_eq!(lm.standings().await, lm.standings_from_log().await);
    }

    #[tokio::test]
    async fn test_report_validation() {
        let (lm, _t) = running_league(4).await;
        assert!(matches!(
            lm.report_match_result(None, win("R9M9", "P01", "P02", "P01")).await,
            Err(LeagueError::UnknownMatch(_))
        ));
        // 尚未分配
        assert!(matches!(
            lm.report_match_result(None, win("R1M1", "P01", "P04", "P01")).await,
            Err(LeagueError::InvalidState(_))
        ));
        lm.advance_round().await.unwrap();
        assert!(matches!(
            lm.report_match_result(None, win("R1M1", "P01", "P02", "P01")).await,
            Err(LeagueError::InvalidState(_))
        ));
        assert!(matches!(
            lm.report_match_result(Some("REF09"), win("R1M1", "P01", "P04", "P01")).await,
            Err(LeagueError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_result_naming_an_outsider_is_rejected() {
        let (lm, _t) = running_league(4).await;
        lm.advance_round().await.unwrap();

        let err = lm
            .report_match_result(Some("REF01"), win("R1M1", "P01", "P04", "P99"))
            .await
            .unwrap_err();
        assert!(matches!(err, LeagueError::InvalidState(_)));

        let mut forfeit = win("R1M1", "P01", "P04", "P01");
        forfeit.outcome = MatchOutcome::Forfeit {
            winner: Some("P01".into()),
            absent: vec!["P02".into()],
        };
        assert!(matches!(
            lm.report_match_result(Some("REF01"), forfeit).await,
            Err(LeagueError::InvalidState(_))
        ));

        assert_eq!(lm.match_status("R1M1").await, Some(MatchStatus::Assigned));
        assert!(lm.standings().await.iter().all(|row| row.points == 0 && row.played == 0));

        // 合法结果仍可上报
        assert_eq!(
            lm.report_match_result(Some("REF01"), win("R1M1", "P01", "P04", "P04")).await.unwrap(),
            ReportOutcome::Recorded
        );
    }

    #[tokio::test]
    async fn test_round_completion_and_league_completion() {
        let (lm, _t) = running_league(2).await;
        assert_eq!(lm.progress().total_rounds, 1);
        lm.advance_round().await.unwrap();
        lm.report_match_result(Some("REF01"), win("R1M1", "P01", "P02", "P02"))
            .await
            .unwrap();
        assert_eq!(lm.status().await, LeagueStatus::Complete);
        assert!(lm.wait_for_round(1, Duration::from_millis(10)).await);

        let standings = lm.standings().await;
        assert_eq!(standings[0].player_id, "P02");
        assert_eq!(standings[0].points, 3);

        lm.events().flush().await;
        assert_eq!(lm.events().history_matching(types::LEAGUE_COMPLETED).len(), 1);
        assert!(matches!(lm.advance_round().await, Err(LeagueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_byes_settle_at_activation() {
        let (lm, _t) = running_league(3).await;
        lm.advance_round().await.unwrap();
        let rounds = lm.rounds().await;
        let round1 = &rounds[0];
        assert_eq!(round1.bye(), Some("P01"));
        assert_eq!(round1.matches[1].status, MatchStatus::Complete);
        assert!(round1.matches[1].result.is_none());

        lm.report_match_result(Some("REF01"), win("R1M1", "P02", "P03", "P02"))
            .await
            .unwrap();
        assert_eq!(lm.rounds().await[0].status, RoundStatus::Complete);
        let standings = lm.standings().await;
        let p01 = standings.iter().find(|r| r.player_id == "P01").unwrap();
        assert_eq!(p01.played, 0);
    }

    #[tokio::test]
    async fn test_flagged_match_isolated_then_reconciled() {
        let (lm, _t) = running_league(4).await;
        lm.advance_round().await.unwrap();
        lm.report_match_result(Some("REF01"), win("R1M1", "P01", "P04", "P01"))
            .await
            .unwrap();
        lm.flag_match("R1M2", "report failed").await.unwrap();

        // 被隔离的比赛计入轮次完成，联赛继续推进
        assert_eq!(lm.rounds().await[0].status, RoundStatus::Complete);
        let standings = lm.standings().await;
        let p02 = standings.iter().find(|r| r.player_id == "P02").unwrap();
        assert_eq!((p02.played, p02.flagged), (0, 1));
        assert_eq!(lm.advance_round().await.unwrap(), 2);

        // 迟到的上报完成对账
        lm.report_match_result(Some("REF01"), win("R1M2", "P02", "P03", "P03"))
            .await
            .unwrap();
        assert_eq!(lm.match_status("R1M2").await, Some(MatchStatus::Complete));
        let p03 = lm
            .standings()
            .await
            .into_iter()
            .find(|r| r.player_id == "P03")
            .unwrap();
        assert_eq!((p03.points, p03.flagged), (3, 0));
        assert_eq!(lm.standings().await, lm.standings_from_log().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flag_overdue_matches() {
        let (lm, _t) = running_league(4).await;
        lm.advance_round().await.unwrap();
        assert!(lm.flag_overdue_matches(Duration::from_secs(60)).await.is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let flagged = lm.flag_overdue_matches(Duration::from_secs(60)).await;
        assert_eq!(flagged, vec!["R1M1", "R1M2"]);
        assert_eq!(lm.progress().completed_rounds, 1);
    }

    #[tokio::test]
    async fn test_failed_assignment_moves_to_another_referee() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.bind("mem://ref2", Arc::new(AckReferee));
        let lm = manager_with(transport.clone(), 8);
        lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        // REF01 没有绑定 endpoint：不可达
        lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        lm.register(AgentKind::Referee, "mem://ref2", None, vec![]).await.unwrap();
        lm.start().await.unwrap();
        lm.advance_round().await.unwrap();

        let rounds = lm.rounds().await;
        assert_eq!(rounds[0].matches[0].referee.as_deref(), Some("REF02"));
        assert_eq!(rounds[0].matches[0].status, MatchStatus::Assigned);
        assert!(lm.registry().find(AgentKind::Referee).await.iter().all(|r| r.service_id != "REF01"));
    }

    #[tokio::test]
    async fn test_assignment_with_no_reachable_referee_flags_match() {
        let transport = Arc::new(InMemoryTransport::new());
        let lm = manager_with(transport, 8);
        lm.register(AgentKind::Player, "mem://p1", None, vec![]).await.unwrap();
        lm.register(AgentKind::Player, "mem://p2", None, vec![]).await.unwrap();
        lm.register(AgentKind::Referee, "mem://ref1", None, vec![]).await.unwrap();
        lm.start().await.unwrap();
        lm.advance_round().await.unwrap();
        assert_eq!(lm.match_status("R1M1").await, Some(MatchStatus::NeedsReconciliation));
        assert_eq!(lm.status().await, LeagueStatus::Complete);
    }
}
