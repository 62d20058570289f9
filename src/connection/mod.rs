//! 弹性出站通信：按目的地熔断 + 指数退避重试

mod breaker;
mod manager;
mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use manager::ConnectionManager;
pub use retry::RetryPolicy;
