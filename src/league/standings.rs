//! 积分榜：对已完成比赛结果的纯折叠
//!
//! `StandingsTable::apply` 是增量形式，`StandingsTable::from_results` 是从完整结果日志重算；
//! 两者对同一组结果必须得到相同的积分榜。
//!
//! 排名规则（完全确定）：积分降序 → 同分组内决胜 → 注册顺序。
//! 同分两人看直接交手胜者；三人及以上看组内互相交手的积分（小联赛）。

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::LeagueSection;
use crate::protocol::{MatchOutcome, MatchResult};

/// 积分规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointsTable {
    pub win: u32,
    pub draw: u32,
    pub loss: u32,
}

impl Default for PointsTable {
    fn default() -> Self {
        Self {
            win: 3,
            draw: 1,
            loss: 0,
        }
    }
}

impl PointsTable {
    pub fn from_config(cfg: &LeagueSection) -> Self {
        Self {
            win: cfg.points_for_win,
            draw: cfg.points_for_draw,
            loss: cfg.points_for_loss,
        }
    }
}

/// 单个选手的累计战绩
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingsRecord {
    pub played: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points: u32,
}

/// 对外发布的一行积分榜
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StandingRow {
    pub rank: u32,
    pub player_id: String,
    pub played: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points: u32,
    /// 该选手待对账（被隔离）的比赛数
    #[serde(default)]
    pub flagged: u32,
}

/// 一场结果对双方的影响：(选手, 胜/平/负)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Win,
    Draw,
    Loss,
}

/// 取消的比赛不计入；双方缺席的弃权记双负；胜者不在本场的结果不计入
fn verdicts(result: &MatchResult) -> Option<[(&str, Verdict); 2]> {
    let a = result.player_a.as_str();
    let b = result.player_b.as_str();
    let of = |winner: &str| {
        if winner == a {
            Some([(a, Verdict::Win), (b, Verdict::Loss)])
        } else if winner == b {
            Some([(a, Verdict::Loss), (b, Verdict::Win)])
        } else {
            None
        }
    };
    match &result.outcome {
        MatchOutcome::Win { winner } => of(winner),
        MatchOutcome::Forfeit {
            winner: Some(winner),
            ..
        } => of(winner),
        MatchOutcome::Forfeit { winner: None, .. } => Some([(a, Verdict::Loss), (b, Verdict::Loss)]),
        MatchOutcome::Draw => Some([(a, Verdict::Draw), (b, Verdict::Draw)]),
        MatchOutcome::Cancelled { .. } => None,
    }
}

#[derive(Debug, Clone)]
pub struct StandingsTable {
    points: PointsTable,
    /// 注册顺序，最终决胜依据
    order: Vec<String>,
    records: HashMap<String, StandingsRecord>,
}

impl StandingsTable {
    pub fn new(players: &[String], points: PointsTable) -> Self {
        Self {
            points,
            order: players.to_vec(),
            records: players
                .iter()
                .map(|p| (p.clone(), StandingsRecord::default()))
                .collect(),
        }
    }

    /// 从完整结果日志重算
    pub fn from_results<'a>(
        players: &[String],
        points: PointsTable,
        results: impl IntoIterator<Item = &'a MatchResult>,
    ) -> Self {
        let mut table = Self::new(players, points);
        for result in results {
            table.apply(result);
        }
        table
    }

    /// 把一场结果折叠进积分榜（每场结果只能调用一次，幂等性由调用方保证）
    pub fn apply(&mut self, result: &MatchResult) {
        let Some(verdicts) = verdicts(result) else {
            return;
        };
        for (player, verdict) in verdicts {
            if !self.records.contains_key(player) {
                self.order.push(player.to_string());
            }
            let record = self.records.entry(player.to_string()).or_default();
            record.played += 1;
            match verdict {
                Verdict::Win => {
                    record.wins += 1;
                    record.points += self.points.win;
                }
                Verdict::Draw => {
                    record.draws += 1;
                    record.points += self.points.draw;
                }
                Verdict::Loss => {
                    record.losses += 1;
                    record.points += self.points.loss;
                }
            }
        }
    }

    pub fn record(&self, player_id: &str) -> Option<StandingsRecord> {
        self.records.get(player_id).copied()
    }

    /// 战绩快照（按注册顺序），用于比较增量结果与重算结果
    pub fn records(&self) -> Vec<(String, StandingsRecord)> {
        self.order
            .iter()
            .map(|p| (p.clone(), self.records.get(p).copied().unwrap_or_default()))
            .collect()
    }

    /// 带决胜规则的排名；`results` 为完整结果日志（用于直接交手判断）
    pub fn ranked(&self, results: &[MatchResult]) -> Vec<StandingRow> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect();

        let mut players: Vec<&str> = self.order.iter().map(String::as_str).collect();
        players.sort_by_key(|p| (Reverse(self.points_of(p)), position[*p]));

        // 同分分组后组内决胜
        let mut ordered = Vec::with_capacity(players.len());
        let mut start = 0;
        while start < players.len() {
            let points = self.points_of(players[start]);
            let end = players[start..]
                .iter()
                .position(|p| self.points_of(p) != points)
                .map_or(players.len(), |offset| start + offset);
            let mut group = players[start..end].to_vec();
            if group.len() > 1 {
                self.break_ties(&mut group, results, &position);
            }
            ordered.extend(group);
            start = end;
        }

        ordered
            .into_iter()
            .enumerate()
            .map(|(i, player)| {
                let r = self.records.get(player).copied().unwrap_or_default();
                StandingRow {
                    rank: i as u32 + 1,
                    player_id: player.to_string(),
                    played: r.played,
                    wins: r.wins,
                    draws: r.draws,
                    losses: r.losses,
                    points: r.points,
                    flagged: 0,
                }
            })
            .collect()
    }

    fn points_of(&self, player: &str) -> u32 {
        self.records.get(player).map_or(0, |r| r.points)
    }

    fn break_ties(&self, group: &mut [&str], results: &[MatchResult], position: &HashMap<&str, usize>) {
        let in_group = |p: &str| group.iter().any(|g| *g == p);
        let mini = {
            let mut mini: HashMap<&str, u32> = HashMap::new();
            for result in results
                .iter()
                .filter(|r| in_group(&r.player_a) && in_group(&r.player_b))
            {
                if let Some(verdicts) = verdicts(result) {
                    for (player, verdict) in verdicts {
                        let points = match verdict {
                            Verdict::Win => self.points.win,
                            Verdict::Draw => self.points.draw,
                            Verdict::Loss => self.points.loss,
                        };
                        *mini.entry(player).or_default() += points;
                    }
                }
            }
            mini
        };
        // 两人同分时组内积分即直接交手结果；未交手或平局则组内积分相同，回落到注册顺序
        group.sort_by_key(|p| (Reverse(mini.get(*p).copied().unwrap_or(0)), position[*p]));
    }
}
