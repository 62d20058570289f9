//! League Manager：联赛聚合、循环赛排程、积分榜、轮次生命周期与入站服务

pub mod driver;
pub mod manager;
pub mod model;
pub mod schedule;
pub mod service;
pub mod standings;

pub use driver::TournamentDriver;
pub use manager::{
    LeagueManager, LeagueProgress, LeagueSettings, MatchSnapshot, Registered, ReportOutcome,
    RoundSnapshot,
};
pub use model::{League, LeagueStatus, MatchStatus, Registration, RoundStatus, Slot, BYE};
pub use schedule::{build_schedule, RoundPlan};
pub use service::LeagueService;
pub use standings::{PointsTable, StandingRow, StandingsRecord, StandingsTable};
