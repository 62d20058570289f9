//! 核心层：错误分类与恢复、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::{ConnectionError, LeagueError, ProtocolViolation, RecoveryAction, TransportError};
pub use recovery::RecoveryEngine;
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
