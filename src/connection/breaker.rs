//! 单个目的地的熔断器
//!
//! CLOSED --(连续 N 次失败)--> OPEN --(冷却结束)--> HALF_OPEN --(探测成功)--> CLOSED
//!                                 ^                    |
//!                                 +----(探测失败)-------+
//!
//! 冷却窗口固定，不随重复熔断增长。

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl BreakerConfig {
    pub fn from_config(cfg: &ResilienceSection) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            cooldown: Duration::from_millis(cfg.cooldown_ms),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// HALF_OPEN 下唯一探测调用的开始时间
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// 是否放行一次调用；OPEN 冷却结束后转入 HALF_OPEN 并只放行一个探测
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.cooldown);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.trial_started = Some(now);
                }
                cooled
            }
            BreakerState::HalfOpen => match self.trial_started {
                // 探测被调用方放弃（future 被丢弃）时，冷却一个窗口后允许新的探测
                Some(started) if now.duration_since(started) < self.config.cooldown => false,
                _ => {
                    self.trial_started = Some(now);
                    true
                }
            },
        }
    }

    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_started = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            BreakerState::HalfOpen => {
                self.consecutive_failures += 1;
                self.trip(now);
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
    }
}
