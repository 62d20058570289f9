//! 单场比赛的执行：邀请、逐小局并发收集落子、裁决、计分
//!
//! 每个阻塞点都有期限：邀请超时即判负，落子超时只丢该小局；取消在任意状态都落到 MATCH_CANCELLED。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::inbox::MoveInbox;
use super::state::MatchState;
use crate::connection::ConnectionManager;
use crate::events::{types, Event, EventBus};
use crate::game::{Game, Move, RoundOutcome};
use crate::protocol::{
    ErrorCode, ErrorPayload, GameInvite, GameJoinAck, MatchOutcome, MatchResult, MatchView,
    MessageType, MoveRequest, MoveResult, Participant, ProtocolMessage, Sender, Validator,
};

/// 一场比赛的静态参数
#[derive(Clone)]
pub struct MatchContext {
    pub league_id: String,
    pub referee: Sender,
    pub round_id: u32,
    pub match_id: String,
    pub game: Arc<dyn Game>,
    /// 座位 0 / 1
    pub players: [Participant; 2],
    pub game_rounds: u32,
    pub invite_timeout: Duration,
    pub move_timeout: Duration,
}

pub struct MatchRunner {
    ctx: MatchContext,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    inbox: Arc<MoveInbox>,
    state: watch::Sender<MatchState>,
    token: CancellationToken,
    validator: Validator,
    scores: [u32; 2],
    history: Vec<[Option<Move>; 2]>,
}

impl MatchRunner {
    pub fn new(
        ctx: MatchContext,
        connection: Arc<ConnectionManager>,
        events: EventBus,
        inbox: Arc<MoveInbox>,
        state: watch::Sender<MatchState>,
        token: CancellationToken,
    ) -> Self {
        let validator = Validator::with_game(Arc::clone(&ctx.game));
        Self {
            ctx,
            validator,
            connection,
            events,
            inbox,
            state,
            token,
            scores: [0, 0],
            history: Vec::new(),
        }
    }

    /// 运行到终止状态，返回结果与终止状态
    pub async fn run(mut self) -> (MatchResult, MatchState) {
        info!(match_id = %self.ctx.match_id, a = %self.ctx.players[0].player_id, b = %self.ctx.players[1].player_id, "Match started");
        self.transition(MatchState::AwaitingPlayersReady);
        if self.ctx.players[0].player_id == self.ctx.players[1].player_id {
            return self.cancel("a player cannot play against itself");
        }

        self.transition(MatchState::Invited);
        let accepted = tokio::select! {
            biased;
            _ = self.token.cancelled() => return self.cancel("cancelled during invitation"),
            accepted = async { tokio::join!(self.invite(0), self.invite(1)) } => accepted,
        };
        match accepted {
            (true, true) => {}
            (true, false) => return self.forfeit(Some(0), vec![1]),
            (false, true) => return self.forfeit(Some(1), vec![0]),
            (false, false) => return self.forfeit(None, vec![0, 1]),
        }

        for game_round in 1..=self.ctx.game_rounds {
            self.transition(MatchState::AwaitingMoves);
            let deadline = Instant::now() + self.ctx.move_timeout;
            let (a, b) = tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.cancel("cancelled while awaiting moves"),
                moves = async {
                    tokio::join!(
                        self.collect_move(0, game_round, deadline),
                        self.collect_move(1, game_round, deadline)
                    )
                } => moves,
            };

            self.transition(MatchState::Resolving);
            let moves = [a, b];
            match self.ctx.game.resolve(&moves) {
                RoundOutcome::Winner(seat) if seat < 2 => self.scores[seat] += 1,
                RoundOutcome::Winner(seat) => error!(match_id = %self.ctx.match_id, seat, "Game returned an invalid seat"),
                RoundOutcome::Draw => {}
            }
            self.history.push(moves);
            debug!(match_id = %self.ctx.match_id, game_round, scores = ?self.scores, "Game round resolved");
            self.transition(MatchState::RoundComplete);

            if self.early_winner().is_some() {
                break;
            }
        }

        self.complete()
    }

    fn early_winner(&self) -> Option<usize> {
        let target = self.ctx.game.rounds_to_win()?;
        self.scores.iter().position(|&s| s >= target)
    }

    fn transition(&self, next: MatchState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            error!(match_id = %self.ctx.match_id, from = ?current, to = ?next, "Illegal match state transition");
            return;
        }
        self.state.send_replace(next);
        self.events.publish(Event::new(
            types::MATCH_STATE_CHANGED,
            self.ctx.referee.to_string(),
            json!({ "match_id": self.ctx.match_id, "from": current, "to": next }),
        ));
    }

    fn message(&self, message_type: MessageType, payload: impl serde::Serialize) -> ProtocolMessage {
        ProtocolMessage::new(message_type, self.ctx.league_id.clone(), self.ctx.referee.clone(), payload)
            .with_round(self.ctx.round_id)
            .with_match(self.ctx.match_id.clone())
    }

    async fn invite(&self, seat: usize) -> bool {
        let player = &self.ctx.players[seat];
        let opponent = &self.ctx.players[1 - seat];
        let request = self.message(
            MessageType::GameInvite,
            GameInvite {
                match_id: self.ctx.match_id.clone(),
                game: self.ctx.game.name().to_string(),
                player_id: player.player_id.clone(),
                opponent_id: opponent.player_id.clone(),
                seat,
                game_rounds: self.ctx.game_rounds,
                reply_deadline_ms: self.ctx.invite_timeout.as_millis() as u64,
            },
        );
        let call = self
            .connection
            .call_expecting(&player.endpoint, &request, MessageType::GameJoinAck);
        match tokio::time::timeout(self.ctx.invite_timeout, call).await {
            Ok(Ok(reply)) => match reply.payload_as::<GameJoinAck>() {
                Ok(ack) if ack.accepted && ack.player_id == player.player_id => true,
                Ok(_) => {
                    warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, "Invite declined");
                    false
                }
                Err(e) => {
                    warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, "Bad invite reply: {}", e);
                    false
                }
            },
            Ok(Err(e)) => {
                warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, "Invite failed: {}", e);
                false
            }
            Err(_) => {
                warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, "Invite not accepted before deadline");
                false
            }
        }
    }

    fn view(&self, seat: usize, game_round: u32) -> MatchView {
        MatchView {
            match_id: self.ctx.match_id.clone(),
            game: self.ctx.game.name().to_string(),
            player_id: self.ctx.players[seat].player_id.clone(),
            opponent_id: self.ctx.players[1 - seat].player_id.clone(),
            seat,
            game_round,
            game_rounds: self.ctx.game_rounds,
            my_score: self.scores[seat],
            opponent_score: self.scores[1 - seat],
            opponent_moves: self.history.iter().map(|m| m[1 - seat].clone()).collect(),
        }
    }

    /// 收集一名玩家本小局的落子
    ///
    /// 同步回复 MOVE_RESULT 或先回 ACK 再推送均可；非法落子以 ERROR INVALID_MOVE 退回，玩家可在期限内重交。
    /// 期限到达仍无合法落子则返回 None。
    async fn collect_move(&self, seat: usize, game_round: u32, deadline: Instant) -> Option<Move> {
        let player = &self.ctx.players[seat];
        let mut window = self
            .inbox
            .open(&self.ctx.match_id, &player.player_id, game_round, Arc::clone(&self.ctx.game));

        let mut next_request = Some(self.message(
            MessageType::MoveRequest,
            MoveRequest {
                view: self.view(seat, game_round),
                deadline_ms: self.ctx.move_timeout.as_millis() as u64,
            },
        ));

        while let Some(request) = next_request.take() {
            let reply = match tokio::time::timeout_at(deadline, self.connection.call(&player.endpoint, &request)).await {
                Err(_) => {
                    warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, game_round, "Move deadline missed");
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, "Move request failed: {}", e);
                    break;
                }
                Ok(Ok(reply)) => reply,
            };
            if reply.message_type() != MessageType::MoveResult {
                // ACK：等待推送
                break;
            }
            match self.check_move(&reply, seat, game_round) {
                Ok(mv) => return Some(mv),
                Err(reason) => {
                    warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, reason = %reason, "Invalid move rejected");
                    next_request = Some(self.message(
                        MessageType::Error,
                        ErrorPayload {
                            code: ErrorCode::InvalidMove,
                            reason,
                            retryable: true,
                        },
                    ));
                }
            }
        }

        match tokio::time::timeout_at(deadline, window.recv()).await {
            Ok(Some(mv)) => Some(mv),
            _ => {
                warn!(match_id = %self.ctx.match_id, player_id = %player.player_id, game_round, "Move deadline missed");
                None
            }
        }
    }

    fn check_move(&self, reply: &ProtocolMessage, seat: usize, game_round: u32) -> Result<Move, String> {
        self.validator.validate(reply).map_err(|e| e.to_string())?;
        let mv: MoveResult = reply.payload_as().map_err(|e| e.to_string())?;
        if mv.player_id != self.ctx.players[seat].player_id || mv.match_id != self.ctx.match_id {
            return Err("move is for a different player or match".into());
        }
        if mv.game_round != game_round {
            return Err(format!("move is for game round {}, expected {game_round}", mv.game_round));
        }
        Ok(mv.value)
    }

    fn scores_map(&self) -> BTreeMap<String, u32> {
        BTreeMap::from([
            (self.ctx.players[0].player_id.clone(), self.scores[0]),
            (self.ctx.players[1].player_id.clone(), self.scores[1]),
        ])
    }

    fn result(&self, outcome: MatchOutcome) -> MatchResult {
        MatchResult {
            match_id: self.ctx.match_id.clone(),
            player_a: self.ctx.players[0].player_id.clone(),
            player_b: self.ctx.players[1].player_id.clone(),
            outcome,
            scores: self.scores_map(),
            game_rounds_played: self.history.len() as u32,
        }
    }

    fn complete(&self) -> (MatchResult, MatchState) {
        let outcome = match self.scores[0].cmp(&self.scores[1]) {
            std::cmp::Ordering::Greater => MatchOutcome::Win {
                winner: self.ctx.players[0].player_id.clone(),
            },
            std::cmp::Ordering::Less => MatchOutcome::Win {
                winner: self.ctx.players[1].player_id.clone(),
            },
            std::cmp::Ordering::Equal => MatchOutcome::Draw,
        };
        self.transition(MatchState::MatchComplete);
        info!(match_id = %self.ctx.match_id, scores = ?self.scores, outcome = ?outcome, "Match complete");
        (self.result(outcome), MatchState::MatchComplete)
    }

    fn forfeit(&self, winner: Option<usize>, absent: Vec<usize>) -> (MatchResult, MatchState) {
        let outcome = MatchOutcome::Forfeit {
            winner: winner.map(|seat| self.ctx.players[seat].player_id.clone()),
            absent: absent
                .iter()
                .map(|&seat| self.ctx.players[seat].player_id.clone())
                .collect(),
        };
        self.transition(MatchState::MatchForfeited);
        warn!(match_id = %self.ctx.match_id, outcome = ?outcome, "Match forfeited");
        (self.result(outcome), MatchState::MatchForfeited)
    }

    fn cancel(&self, reason: &str) -> (MatchResult, MatchState) {
        self.transition(MatchState::MatchCancelled);
        warn!(match_id = %self.ctx.match_id, reason, "Match cancelled");
        (
            self.result(MatchOutcome::Cancelled {
                reason: reason.to_string(),
            }),
            MatchState::MatchCancelled,
        )
    }
}
