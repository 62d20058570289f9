//! 裁判侧：比赛状态机、落子收件箱、单场比赛执行与裁判 Agent

pub mod agent;
pub mod inbox;
pub mod runner;
pub mod state;

pub use agent::{PendingReport, RefereeAgent, RefereeSettings};
pub use inbox::{MoveInbox, MoveWindow, PushRejection};
pub use runner::{MatchContext, MatchRunner};
pub use state::MatchState;
