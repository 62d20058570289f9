//! ConnectionManager：所有出站调用的弹性包装
//!
//! 调用流程：先查熔断器 -> 放行则发起一次尝试（带单次超时）-> 瞬时失败计入熔断并按退避重试，
//! 重试耗尽返回 `CallFailed`（附最后一次底层错误）。
//! 对端有回复即视为可达：ERROR 回复是 `Rejected`，无法解码的回复是 `Protocol`，两者都不重试也不计入熔断。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use super::retry::RetryPolicy;
use crate::config::ResilienceSection;
use crate::core::error::{ConnectionError, ProtocolViolation, TransportError};
use crate::protocol::{decode, encode, ErrorPayload, MessageType, ProtocolMessage};
use crate::transport::Transport;

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    breaker_config: BreakerConfig,
    call_timeout: Duration,
    /// 每个目的地一个熔断器，互不共享；锁不跨 await 持有
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, cfg: &ResilienceSection) -> Self {
        Self::with_policy(
            transport,
            RetryPolicy::from_config(cfg),
            BreakerConfig::from_config(cfg),
            Duration::from_millis(cfg.call_timeout_ms),
        )
    }

    pub fn with_policy(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        breaker_config: BreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            breaker_config,
            call_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// 当前熔断状态；从未调用过的目的地视为 CLOSED
    pub fn breaker_state(&self, endpoint: &str) -> BreakerState {
        self.breakers
            .lock()
            .ok()
            .and_then(|map| map.get(endpoint).map(|b| b.state()))
            .unwrap_or(BreakerState::Closed)
    }

    /// 发送请求并返回经过校验的响应
    pub async fn call(
        &self,
        endpoint: &str,
        request: &ProtocolMessage,
    ) -> Result<ProtocolMessage, ConnectionError> {
        let body = encode(request);
        let mut attempts = 0u32;

        loop {
            if !self.acquire(endpoint) {
                debug!(endpoint, "Circuit open, failing fast");
                return Err(ConnectionError::CircuitOpen {
                    endpoint: endpoint.to_string(),
                });
            }
            attempts += 1;

            let outcome = match tokio::time::timeout(
                self.call_timeout,
                self.transport.send(endpoint, body.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    endpoint: endpoint.to_string(),
                    after_ms: self.call_timeout.as_millis() as u64,
                }),
            };

            let err = match outcome {
                Ok(bytes) => {
                    self.record(endpoint, true);
                    return Self::interpret(endpoint, request, &bytes);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                // 对端可达，只是拒绝了请求
                self.record(endpoint, true);
                return Err(ConnectionError::CallFailed {
                    endpoint: endpoint.to_string(),
                    attempts,
                    last: err,
                });
            }

            self.record(endpoint, false);
            if attempts >= self.policy.max_attempts() {
                warn!(endpoint, attempts, "Call failed, retries exhausted: {}", err);
                return Err(ConnectionError::CallFailed {
                    endpoint: endpoint.to_string(),
                    attempts,
                    last: err,
                });
            }

            let delay = self.policy.delay_for(attempts - 1);
            debug!(endpoint, attempts, delay_ms = delay.as_millis() as u64, "Transient failure, retrying: {}", err);
            tokio::time::sleep(delay).await;
        }
    }

    /// 发送请求并要求响应为指定类型（如通知类消息期望 ACK）
    pub async fn call_expecting(
        &self,
        endpoint: &str,
        request: &ProtocolMessage,
        expected: MessageType,
    ) -> Result<ProtocolMessage, ConnectionError> {
        let response = self.call(endpoint, request).await?;
        if response.message_type() != expected {
            return Err(ConnectionError::Protocol {
                endpoint: endpoint.to_string(),
                violation: ProtocolViolation::InvalidField {
                    field: "message_type",
                    reason: format!("expected {expected}, got {}", response.message_type()),
                },
            });
        }
        Ok(response)
    }

    fn interpret(
        endpoint: &str,
        request: &ProtocolMessage,
        bytes: &[u8],
    ) -> Result<ProtocolMessage, ConnectionError> {
        let protocol = |violation| ConnectionError::Protocol {
            endpoint: endpoint.to_string(),
            violation,
        };
        let response = decode(bytes).map_err(protocol)?;

        if response.message_type() == MessageType::Error {
            let payload: ErrorPayload = response.payload_as().map_err(protocol)?;
            return Err(ConnectionError::Rejected {
                endpoint: endpoint.to_string(),
                code: payload.code,
                reason: payload.reason,
            });
        }
        if response.conversation_id() != request.conversation_id() {
            return Err(protocol(ProtocolViolation::InvalidField {
                field: "conversation_id",
                reason: "response does not correlate with request".into(),
            }));
        }
        Ok(response)
    }

    fn acquire(&self, endpoint: &str) -> bool {
        let Ok(mut map) = self.breakers.lock() else {
            return true;
        };
        map.entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
            .try_acquire(Instant::now())
    }

    fn record(&self, endpoint: &str, reachable: bool) {
        let Ok(mut map) = self.breakers.lock() else {
            return;
        };
        if let Some(breaker) = map.get_mut(endpoint) {
            let before = breaker.state();
            if reachable {
                breaker.on_success();
            } else {
                breaker.on_failure(Instant::now());
            }
            let after = breaker.state();
            if before != after {
                match after {
                    BreakerState::Open => warn!(endpoint, "Circuit opened"),
                    _ => debug!(endpoint, ?before, ?after, "Circuit state changed"),
                }
            }
        }
    }
}
