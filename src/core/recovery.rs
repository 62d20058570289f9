//! 错误恢复引擎
//!
//! 根据 LeagueError 类型返回 RecoveryAction，供裁判上报、联赛推进与服务端回复决定是重试、退避、对账还是上报人工。

use crate::core::error::{ConnectionError, LeagueError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &LeagueError) -> RecoveryAction {
        match err {
            LeagueError::Connection(ConnectionError::CircuitOpen { .. }) => RecoveryAction::BackOff,
            LeagueError::Connection(ConnectionError::CallFailed { .. }) => RecoveryAction::Reconcile,
            LeagueError::Connection(ConnectionError::Rejected { code, .. }) => {
                RecoveryAction::RespondError(*code)
            }
            LeagueError::Connection(ConnectionError::Protocol { .. })
            | LeagueError::Protocol(_)
            | LeagueError::Registration(_)
            | LeagueError::UnknownMatch(_)
            | LeagueError::InvalidState(_)
            | LeagueError::Registry(_) => RecoveryAction::RespondError(err.error_code()),
            LeagueError::NoReferees { .. } => RecoveryAction::RetryLater,
            LeagueError::ResultConflict { .. } => RecoveryAction::Escalate,
            LeagueError::UnknownGame(_)
            | LeagueError::UnknownStrategy(_)
            | LeagueError::Config(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ProtocolViolation, RegistrationError, TransportError};
    use crate::protocol::{AgentKind, ErrorCode};

    #[test]
    fn test_recovery_call_failed_reconciles() {
        let engine = RecoveryEngine::new();
        let err = LeagueError::Connection(ConnectionError::CallFailed {
            endpoint: "mem://league".into(),
            attempts: 3,
            last: TransportError::Unreachable("mem://league".into()),
        });
        assert_eq!(engine.handle(&err), RecoveryAction::Reconcile);
    }

    #[test]
    fn test_recovery_circuit_open_backs_off() {
        let engine = RecoveryEngine::new();
        let err = LeagueError::Connection(ConnectionError::CircuitOpen {
            endpoint: "mem://p1".into(),
        });
        assert_eq!(engine.handle(&err), RecoveryAction::BackOff);
    }

    #[test]
    fn test_recovery_protocol_violation_responds_error() {
        let engine = RecoveryEngine::new();
        let err = LeagueError::Protocol(ProtocolViolation::MissingField("sender"));
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::RespondError(ErrorCode::ProtocolViolation)
        );
    }

    #[test]
    fn test_recovery_registration_rejected() {
        let engine = RecoveryEngine::new();
        let err = LeagueError::Registration(RegistrationError::CapacityExceeded {
            kind: AgentKind::Player,
            max: 4,
        });
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::RespondError(ErrorCode::RegistrationRejected)
        );
    }

    #[test]
    fn test_recovery_conflict_escalates() {
        let engine = RecoveryEngine::new();
        let err = LeagueError::ResultConflict {
            match_id: "R2M1".into(),
        };
        assert_eq!(engine.handle(&err), RecoveryAction::Escalate);
    }

    #[test]
    fn test_recovery_no_referees_retries_later() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&LeagueError::NoReferees { round: 2 }),
            RecoveryAction::RetryLater
        );
    }
}
