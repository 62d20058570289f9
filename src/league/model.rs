//! 联赛聚合：League / Round / Match / 注册记录
//!
//! 只由 LeagueManager 在一把锁内修改；`COMPLETE` 之后不可变。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::schedule::RoundPlan;
use super::standings::{PointsTable, StandingsTable};
use crate::protocol::{AgentKind, MatchResult};

pub const BYE: &str = "BYE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeagueStatus {
    Forming,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    Pending,
    Active,
    Complete,
}

/// League 侧的比赛状态（裁判侧的细粒度状态机见 referee::MatchState）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Pending,
    Assigned,
    Complete,
    /// 上报失败或超时，被隔离待对账；计入轮次完成，但不计入已完成比赛
    NeedsReconciliation,
}

impl MatchStatus {
    /// 对轮次完成而言是否已经了结
    pub fn is_settled(&self) -> bool {
        matches!(self, MatchStatus::Complete | MatchStatus::NeedsReconciliation)
    }
}

/// 对阵位置：真实选手或轮空占位
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Player(String),
    Bye,
}

impl Slot {
    pub fn player_id(&self) -> &str {
        match self {
            Slot::Player(id) => id,
            Slot::Bye => BYE,
        }
    }
}

/// `R{round}M{index}`，index 从 1 开始
pub fn match_id(round: u32, index: usize) -> String {
    format!("R{round}M{index}")
}

#[derive(Debug, Clone)]
pub struct Match {
    pub match_id: String,
    pub round: u32,
    pub player_a: String,
    pub player_b: Slot,
    pub assigned_referee_id: Option<String>,
    pub status: MatchStatus,
    /// 设置一次后不可变
    pub result: Option<MatchResult>,
    pub assigned_at: Option<Instant>,
    pub flag_reason: Option<String>,
}

impl Match {
    pub fn is_bye(&self) -> bool {
        self.player_b == Slot::Bye
    }

    /// 结果中的选手必须与对阵一致
    pub fn same_players(&self, result: &MatchResult) -> bool {
        match &self.player_b {
            Slot::Player(b) => result.player_a == self.player_a && &result.player_b == b,
            Slot::Bye => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Round {
    pub round_number: u32,
    pub match_ids: Vec<String>,
    pub status: RoundStatus,
}

/// 注册记录（Player 或 Referee）
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub id: String,
    pub kind: AgentKind,
    pub endpoint: String,
    pub display_name: Option<String>,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

pub struct League {
    pub id: String,
    pub status: LeagueStatus,
    pub rounds: Vec<Round>,
    pub matches: HashMap<String, Match>,
    pub players: Vec<Registration>,
    pub referees: Vec<Registration>,
    /// 已发放的 Player / Referee 编号；注销后不复用
    issued: (usize, usize),
    /// 已完成比赛的结果日志；积分榜可由它完整重算
    pub results: Vec<MatchResult>,
    pub standings: StandingsTable,
}

impl League {
    pub fn new(id: impl Into<String>, points: PointsTable) -> Self {
        Self {
            id: id.into(),
            status: LeagueStatus::Forming,
            rounds: Vec::new(),
            matches: HashMap::new(),
            players: Vec::new(),
            referees: Vec::new(),
            issued: (0, 0),
            results: Vec::new(),
            standings: StandingsTable::new(&[], points),
        }
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }

    pub fn registration(&self, kind: AgentKind, endpoint: &str) -> Option<&Registration> {
        let list = match kind {
            AgentKind::Player => &self.players,
            AgentKind::Referee => &self.referees,
            AgentKind::LeagueManager => return None,
        };
        list.iter().find(|r| r.endpoint == endpoint)
    }

    pub fn player(&self, id: &str) -> Option<&Registration> {
        self.players.iter().find(|p| p.id == id)
    }

    /// 下一个 agent id：P01、P02…… / REF01、REF02……
    pub fn issue_id(&mut self, kind: AgentKind) -> String {
        match kind {
            AgentKind::Player => {
                self.issued.0 += 1;
                format!("P{:02}", self.issued.0)
            }
            _ => {
                self.issued.1 += 1;
                format!("REF{:02}", self.issued.1)
            }
        }
    }

    pub fn remove_registration(&mut self, agent_id: &str) -> Option<Registration> {
        if let Some(i) = self.players.iter().position(|p| p.id == agent_id) {
            return Some(self.players.remove(i));
        }
        let i = self.referees.iter().position(|r| r.id == agent_id)?;
        Some(self.referees.remove(i))
    }

    /// 用排程填充轮次与比赛
    pub fn install_schedule(&mut self, plans: Vec<RoundPlan>) {
        for plan in plans {
            let mut match_ids = Vec::with_capacity(plan.pairings.len());
            for (index, (a, b)) in plan.pairings.into_iter().enumerate() {
                let id = match_id(plan.round_number, index + 1);
                self.matches.insert(
                    id.clone(),
                    Match {
                        match_id: id.clone(),
                        round: plan.round_number,
                        player_a: a,
                        player_b: b,
                        assigned_referee_id: None,
                        status: MatchStatus::Pending,
                        result: None,
                        assigned_at: None,
                        flag_reason: None,
                    },
                );
                match_ids.push(id);
            }
            self.rounds.push(Round {
                round_number: plan.round_number,
                match_ids,
                status: RoundStatus::Pending,
            });
        }
    }

    /// 当前 ACTIVE 的轮次（同一时刻至多一个）
    pub fn active_round(&self) -> Option<&Round> {
        self.rounds.iter().find(|r| r.status == RoundStatus::Active)
    }

    pub fn next_pending_round(&self) -> Option<&Round> {
        self.rounds.iter().find(|r| r.status == RoundStatus::Pending)
    }

    pub fn round_mut(&mut self, number: u32) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.round_number == number)
    }

    pub fn round_settled(&self, number: u32) -> bool {
        self.rounds
            .iter()
            .find(|r| r.round_number == number)
            .is_some_and(|r| {
                r.match_ids
                    .iter()
                    .all(|id| self.matches.get(id).is_some_and(|m| m.status.is_settled()))
            })
    }

    pub fn completed_rounds(&self) -> u32 {
        self.rounds
            .iter()
            .filter(|r| r.status == RoundStatus::Complete)
            .count() as u32
    }

    /// 某裁判手上尚未了结的比赛数
    pub fn referee_load(&self, referee_id: &str) -> usize {
        self.matches
            .values()
            .filter(|m| {
                m.status == MatchStatus::Assigned && m.assigned_referee_id.as_deref() == Some(referee_id)
            })
            .count()
    }

    /// 每个选手当前被隔离的比赛数
    pub fn flagged_counts(&self) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for m in self
            .matches
            .values()
            .filter(|m| m.status == MatchStatus::NeedsReconciliation)
        {
            *counts.entry(m.player_a.clone()).or_default() += 1;
            if let Slot::Player(b) = &m.player_b {
                *counts.entry(b.clone()).or_default() += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::league::schedule::build_schedule;

    #[test]
    fn test_install_schedule_ids_and_byes() {
        let mut league = League::new("league-1", PointsTable::default());
        let players: Vec<String> = (1..=3).map(|i| format!("P{i:02}")).collect();
        league.install_schedule(build_schedule(&players));

        assert_eq!(league.rounds.len(), 3);
        let round1 = &league.rounds[0];
        assert_eq!(round1.match_ids, vec!["R1M1", "R1M2"]);
        assert!(league.matches["R1M2"].is_bye());
        assert!(!league.matches["R1M1"].is_bye());
        assert_eq!(league.matches["R1M2"].player_b.player_id(), BYE);
        assert!(league.active_round().is_none());
        assert_eq!(league.next_pending_round().unwrap().round_number, 1);
    }

    #[test]
    fn test_round_settled() {
        let mut league = League::new("league-1", PointsTable::default());
        let players: Vec<String> = (1..=4).map(|i| format!("P{i:02}")).collect();
        league.install_schedule(build_schedule(&players));
        assert!(!league.round_settled(1));
        league.matches.get_mut("R1M1").unwrap().status = MatchStatus::Complete;
        league.matches.get_mut("R1M2").unwrap().status = MatchStatus::NeedsReconciliation;
        assert!(league.round_settled(1));
        assert_eq!(league.flagged_counts().get("P02"), Some(&1));
    }
}
