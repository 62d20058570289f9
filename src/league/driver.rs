//! 联赛驱动循环：推进轮次、等待完成、超时隔离，直到联赛结束

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::manager::LeagueManager;
use super::model::LeagueStatus;
use super::standings::StandingRow;
use crate::config::LeagueSection;
use crate::core::error::{LeagueError, RecoveryAction};
use crate::core::recovery::RecoveryEngine;

pub struct TournamentDriver {
    manager: Arc<LeagueManager>,
    recovery: RecoveryEngine,
    match_timeout: Duration,
    round_retry: Duration,
}

impl TournamentDriver {
    pub fn new(manager: Arc<LeagueManager>, cfg: &LeagueSection) -> Self {
        Self::with_timing(manager, cfg.match_timeout(), cfg.round_retry())
    }

    pub fn with_timing(manager: Arc<LeagueManager>, match_timeout: Duration, round_retry: Duration) -> Self {
        Self {
            manager,
            recovery: RecoveryEngine::new(),
            match_timeout,
            round_retry,
        }
    }

    /// 运行到联赛 COMPLETE，返回最终积分榜
    ///
    /// 每次推进前先移除注册表已过期的注册；联赛仍在 FORMING 时先 `start()`。没有裁判或熔断打开时等待 `round_retry` 后重试；
    /// 一轮超过 `match_timeout` 未完成时，隔离其中未了结的比赛并继续。
    pub async fn run(&self, token: CancellationToken) -> Result<Vec<StandingRow>, LeagueError> {
        loop {
            self.manager.prune_expired().await;
            match self.manager.status().await {
                LeagueStatus::Complete => break,
                LeagueStatus::Forming => {
                    self.manager.start().await?;
                }
                LeagueStatus::Running => {}
            }

            let round = match self.manager.advance_round().await {
                Ok(round) => round,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::RetryLater | RecoveryAction::BackOff => {
                        warn!(retry_in_ms = self.round_retry.as_millis() as u64, "Cannot advance round: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => return Err(cancelled()),
                            _ = tokio::time::sleep(self.round_retry) => continue,
                        }
                    }
                    _ => return Err(e),
                },
            };

            let completed = tokio::select! {
                _ = token.cancelled() => return Err(cancelled()),
                done = self.manager.wait_for_round(round, self.match_timeout) => done,
            };
            if !completed {
                let flagged = self.manager.flag_overdue_matches(Duration::ZERO).await;
                warn!(round, flagged = ?flagged, "Round timed out, unfinished matches flagged");
            }
        }

        let standings = self.manager.standings().await;
        info!(league_id = %self.manager.league_id(), "Tournament finished");
        Ok(standings)
    }
}

fn cancelled() -> LeagueError {
    LeagueError::InvalidState("tournament cancelled".into())
}
