//! 联赛错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 LeagueError 决定 Retry / BackOff / RespondError / Reconcile / Escalate 等。
//! 分类是重试包装器的唯一依据：只有 `is_transient()` 的失败才会被重试。

use thiserror::Error;

use crate::protocol::{AgentKind, ErrorCode, MessageType};

/// 协议违规：解码或校验失败的第一个原因；永不重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {found}")]
    UnsupportedVersion { found: String },

    #[error("Missing envelope field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid {message_type} payload: {reason}")]
    InvalidPayload {
        message_type: MessageType,
        reason: String,
    },

    /// Game.validate 拒绝的落子
    #[error("Illegal move: {0}")]
    IllegalMove(String),
}

/// 传输层失败（网络 / 超时），是唯一会被判定为瞬时的一类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out after {after_ms}ms calling {endpoint}")]
    Timeout { endpoint: String, after_ms: u64 },

    #[error("HTTP status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// 4xx 说明请求本身有问题，重试没有意义
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => *status >= 500,
            _ => true,
        }
    }
}

/// ConnectionManager 对外暴露的失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// 熔断打开期间快速失败，调用方应退避而不是忙等重试
    #[error("Circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },

    /// 重试耗尽，附带最后一次底层错误
    #[error("Call to {endpoint} failed after {attempts} attempt(s): {last}")]
    CallFailed {
        endpoint: String,
        attempts: u32,
        last: TransportError,
    },

    /// 对端回复无法通过协议校验
    #[error("Protocol violation in response from {endpoint}: {violation}")]
    Protocol {
        endpoint: String,
        violation: ProtocolViolation,
    },

    /// 对端以 ERROR 明确拒绝（应用层拒绝，如联赛已满）
    #[error("Rejected by {endpoint} ({code:?}): {reason}")]
    Rejected {
        endpoint: String,
        code: ErrorCode,
        reason: String,
    },
}

/// 注册失败：容量 / 状态 / 身份冲突；不会自动重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("League is not accepting {kind} registrations (status: {status})")]
    NotAccepting { kind: AgentKind, status: String },

    #[error("Capacity exceeded: at most {max} {kind}(s)")]
    CapacityExceeded { kind: AgentKind, max: usize },

    #[error("Endpoint {endpoint} is already registered as {existing}")]
    AlreadyRegistered { endpoint: String, existing: String },

    #[error("Registration rejected: {0}")]
    Rejected(String),
}

/// Service Registry 的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Service id already registered: {0}")]
    Duplicate(String),

    #[error("Service not found: {0}")]
    NotFound(String),
}

/// 联赛编排过程中可能出现的错误（§7 分类）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LeagueError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// 同一场比赛收到不同结果：只能人工处理，绝不静默覆盖
    #[error("Result conflict for match {match_id}")]
    ResultConflict { match_id: String },

    /// 没有健康的裁判：轮次保持 PENDING，容量空出后可重试
    #[error("No healthy referees available for round {round}")]
    NoReferees { round: u32 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown match: {0}")]
    UnknownMatch(String),

    #[error("Unknown game: {0}")]
    UnknownGame(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl LeagueError {
    /// 是否为瞬时失败（网络 / 超时）
    pub fn is_transient(&self) -> bool {
        matches!(self, LeagueError::Connection(ConnectionError::CallFailed { last, .. }) if last.is_transient())
    }

    /// 调用方稍后重试是否有意义
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeagueError::NoReferees { .. }
                | LeagueError::Connection(ConnectionError::CircuitOpen { .. })
        ) || self.is_transient()
    }

    /// 回复 ERROR 消息时使用的错误码
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LeagueError::Protocol(ProtocolViolation::IllegalMove(_)) => ErrorCode::InvalidMove,
            LeagueError::Protocol(_) => ErrorCode::ProtocolViolation,
            LeagueError::Registration(_) => ErrorCode::RegistrationRejected,
            LeagueError::ResultConflict { .. } => ErrorCode::ResultConflict,
            LeagueError::UnknownMatch(_) => ErrorCode::UnknownMatch,
            LeagueError::InvalidState(_) => ErrorCode::InvalidState,
            LeagueError::Registry(RegistryError::NotFound(_)) => ErrorCode::UnknownAgent,
            LeagueError::UnknownGame(_) => ErrorCode::Unsupported,
            _ => ErrorCode::Internal,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 瞬时失败：按退避策略重试
    Retry,
    /// 熔断打开：等待冷却窗口后再试
    BackOff,
    /// 容量不足（无裁判）：保持现状，稍后重新推进
    RetryLater,
    /// 回复 ERROR 给请求方，不再处理
    RespondError(ErrorCode),
    /// 结果上报失败：标记待对账，不静默丢弃
    Reconcile,
    /// 需要人工处理（结果冲突）
    Escalate,
    /// 终止当前操作
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_classification() {
        let server = TransportError::Status {
            endpoint: "http://p1".into(),
            status: 503,
        };
        let client = TransportError::Status {
            endpoint: "http://p1".into(),
            status: 404,
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(TransportError::Unreachable("mem://x".into()).is_transient());
    }

    #[test]
    fn test_league_error_retryable() {
        assert!(LeagueError::NoReferees { round: 1 }.is_retryable());
        assert!(!LeagueError::ResultConflict {
            match_id: "R1M1".into()
        }
        .is_retryable());
        let failed = LeagueError::Connection(ConnectionError::CallFailed {
            endpoint: "mem://lm".into(),
            attempts: 3,
            last: TransportError::Io("reset".into()),
        });
        assert!(failed.is_transient());
    }

    #[test]
    fn test_error_codes() {
        let err = LeagueError::Protocol(ProtocolViolation::IllegalMove("7".into()));
        assert_eq!(err.error_code(), ErrorCode::InvalidMove);
        let err = LeagueError::ResultConflict {
            match_id: "R1M1".into(),
        };
        assert_eq!(err.error_code(), ErrorCode::ResultConflict);
    }
}
