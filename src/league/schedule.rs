//! 循环赛排程：圆圈法（polygon method）
//!
//! 人数为奇数时补一个 BYE 占位，使算法总在偶数上运行；固定第一个位置，其余位置每轮顺时针旋转一格。
//! n 为偶数时 n-1 轮，奇数时 n 轮（每轮一个轮空）；每对真实选手恰好相遇一次。

use super::model::Slot;

/// 一轮的对阵；轮空（若有）排在最后
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    pub round_number: u32,
    pub pairings: Vec<(String, Slot)>,
}

impl RoundPlan {
    pub fn real_matches(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairings.iter().filter_map(|(a, b)| match b {
            Slot::Player(b) => Some((a.as_str(), b.as_str())),
            Slot::Bye => None,
        })
    }

    pub fn bye(&self) -> Option<&str> {
        self.pairings
            .iter()
            .find(|(_, b)| *b == Slot::Bye)
            .map(|(a, _)| a.as_str())
    }
}

/// 生成完整排程；少于 2 名选手时为空
pub fn build_schedule(player_ids: &[String]) -> Vec<RoundPlan> {
    if player_ids.len() < 2 {
        return Vec::new();
    }
    let mut slots: Vec<Slot> = player_ids.iter().cloned().map(Slot::Player).collect();
    if slots.len() % 2 == 1 {
        slots.push(Slot::Bye);
    }
    let n = slots.len();

    let mut rounds = Vec::with_capacity(n - 1);
    for round in 0..n - 1 {
        let mut matches = Vec::with_capacity(n / 2);
        let mut bye = None;
        for i in 0..n / 2 {
            let (mut home, mut away) = (&slots[i], &slots[n - 1 - i]);
            // 固定位置的选手交替主客，避免总坐 0 号座位
            if i == 0 && round % 2 == 1 {
                std::mem::swap(&mut home, &mut away);
            }
            match (home, away) {
                (Slot::Player(a), Slot::Player(_)) => matches.push((a.clone(), away.clone())),
                (Slot::Player(a), Slot::Bye) | (Slot::Bye, Slot::Player(a)) => bye = Some(a.clone()),
                (Slot::Bye, Slot::Bye) => {}
            }
        }
        if let Some(player) = bye {
            matches.push((player, Slot::Bye));
        }
        rounds.push(RoundPlan {
            round_number: round as u32 + 1,
            pairings: matches,
        });
        // 旋转除第一个以外的位置
        slots[1..].rotate_right(1);
    }
    rounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn players(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("P{i:02}")).collect()
    }

    #[test]
    fn test_round_and_match_counts() {
        for n in 2..=12 {
            let schedule = build_schedule(&players(n));
            let expected_rounds = if n % 2 == 0 { n - 1 } else { n };
            assert_eq!(schedule.len(), expected_rounds, "n = {n}");
            for round in &schedule {
                assert_eq!(round.real_matches().count(), n / 2, "n = {n}");
                assert_eq!(round.bye().is_some(), n % 2 == 1);
            }
        }
    }

    #[test]
    fn test_every_pair_exactly_once_no_self_play() {
        for n in 2..=12 {
            let ids = players(n);
            let mut seen: HashSet<(String, String)> = HashSet::new();
            for round in build_schedule(&ids) {
                for (a, b) in round.real_matches() {
                    assert_ne!(a, b);
                    let key = if a < b {
                        (a.to_string(), b.to_string())
                    } else {
                        (b.to_string(), a.to_string())
                    };
                    assert!(seen.insert(key), "pair repeated for n = {n}");
                }
            }
            assert_eq!(seen.len(), n * (n - 1) / 2, "n = {n}");
        }
    }

    #[test]
    fn test_each_round_partitions_players() {
        for n in 2..=12 {
            let ids = players(n);
            for round in build_schedule(&ids) {
                let mut present: Vec<&str> = Vec::new();
                for (a, b) in &round.pairings {
                    present.push(a);
                    if let Slot::Player(b) = b {
                        present.push(b);
                    }
                }
                present.sort();
                let mut expected: Vec<&str> = ids.iter().map(String::as_str).collect();
                expected.sort();
                assert_eq!(present, expected, "n = {n}, round {}", round.round_number);
            }
        }
    }

    #[test]
    fn test_byes_balanced() {
        for n in (3..=11).step_by(2) {
            let mut byes: HashMap<String, usize> = HashMap::new();
            for round in build_schedule(&players(n)) {
                *byes.entry(round.bye().unwrap().to_string()).or_default() += 1;
            }
            assert_eq!(byes.len(), n);
            assert!(byes.values().all(|&c| c == 1), "n = {n}: {byes:?}");
        }
    }

    #[test]
    fn test_four_player_layout() {
        let schedule = build_schedule(&players(4));
        let layout: Vec<Vec<(&str, &str)>> = schedule.iter().map(|r| r.real_matches().collect()).collect();
        assert_eq!(
            layout,
            vec![
                vec![("P01", "P04"), ("P02", "P03")],
                vec![("P03", "P01"), ("P04", "P02")],
                vec![("P01", "P02"), ("P03", "P04")],
            ]
        );
    }

    #[test]
    fn test_too_few_players() {
        assert!(build_schedule(&players(0)).is_empty());
        assert!(build_schedule(&players(1)).is_empty());
    }
}
