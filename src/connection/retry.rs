//! 指数退避 + 抖动
//!
//! `delay(attempt) = min(base * 2^attempt + jitter, max_delay)`，
//! 其中 jitter ∈ [0, min(jitter_ms, base * 2^attempt)]，保证延迟随 attempt 单调不减。

use std::time::Duration;

use rand::Rng;

use crate::config::ResilienceSection;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
        }
    }

    pub fn from_config(cfg: &ResilienceSection) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            Duration::from_millis(cfg.jitter_ms),
        )
    }

    /// 不重试：只尝试一次
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// 含首次调用在内的最大尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// 第 `attempt` 次（从 0 开始）失败后的等待时间，随机抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::rng().random::<f64>())
    }

    /// `sample` ∈ [0, 1]，决定抖动落在上界的哪个位置
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exp_ms = self.exponential_ms(attempt);
        let jitter_cap = (self.jitter.as_millis() as u64).min(exp_ms);
        let jitter_ms = (jitter_cap as f64 * sample.clamp(0.0, 1.0)).round() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(exp_ms.saturating_add(jitter_ms).min(max_ms))
    }

    fn exponential_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        (self.base_delay.as_millis() as u64).saturating_mul(factor)
    }
}
